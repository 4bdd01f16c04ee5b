// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! This module provides integration with OpenTelemetry for distributed tracing.
//! Trace context travels in the message headers: it is injected on every outgoing
//! message and extracted when a message is processed, where a consumer span is
//! opened for the duration of the processing.
//!
//! Everything here is plugged in as a [`ProcessorMiddleware`], so the rest of the
//! runtime never depends on OpenTelemetry.

use crate::{
    errors::BoxError,
    message::Message,
    processor::{Processor, ProcessorMiddleware},
    publisher::Publisher,
};
use async_trait::async_trait;
use opentelemetry::{
    global::{self, BoxedSpan},
    propagation::{Extractor, Injector},
    trace::{Span, SpanKind, Status, Tracer},
    Context, KeyValue,
};
use serde_json::Value;
use std::{borrow::Cow, collections::HashMap};

const TRACER_NAME: &str = env!("CARGO_PKG_NAME");

/// Writes trace context into message headers.
pub(crate) struct HeaderInjector<'a> {
    headers: &'a mut HashMap<String, Value>,
}

impl<'a> HeaderInjector<'a> {
    pub(crate) fn new(headers: &'a mut HashMap<String, Value>) -> Self {
        Self { headers }
    }
}

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(key.to_lowercase(), Value::String(value));
    }
}

/// Reads trace context from message headers. Only string headers are visible.
pub(crate) struct HeaderExtractor<'a> {
    headers: &'a HashMap<String, Value>,
}

impl<'a> HeaderExtractor<'a> {
    pub(crate) fn new(headers: &'a HashMap<String, Value>) -> Self {
        Self { headers }
    }
}

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(Value::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(String::as_str).collect()
    }
}

/// Injects `cx` into the headers of `message`.
pub fn inject_context(cx: &Context, message: &mut Message) {
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(cx, &mut HeaderInjector::new(&mut message.headers))
    });
}

/// Extracts the trace context carried by `message`.
pub fn extract_context(message: &Message) -> Context {
    global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderExtractor::new(&message.headers))
    })
}

/// Starts a consumer span for `message` as a child of the context it carries.
pub fn new_span(message: &Message, name: &str) -> BoxedSpan {
    let ctx = extract_context(message);
    let tracer = global::tracer(TRACER_NAME);

    tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .with_attributes(vec![
            KeyValue::new("messaging.system", "rabbitmq"),
            KeyValue::new("messaging.operation.id", message.operation_id.clone()),
        ])
        .start_with_context(&tracer, &ctx)
}

/// Middleware propagating OpenTelemetry context through message headers.
#[derive(Debug, Clone, Copy, Default)]
pub struct OtelMiddleware;

#[async_trait]
impl ProcessorMiddleware for OtelMiddleware {
    fn on_publish(&self, message: &mut Message) {
        inject_context(&Context::current(), message);
    }

    async fn on_process(
        &self,
        message: &Message,
        publisher: &dyn Publisher,
        next: &dyn Processor,
    ) -> Result<(), BoxError> {
        let mut span = new_span(message, next.name());
        span.set_attribute(KeyValue::new(
            "messaging.destination.name",
            next.queue_name(),
        ));

        let result = next.process_message(message, publisher).await;
        if let Err(err) = &result {
            span.set_status(Status::error(err.to_string()));
        }

        span.end();
        result
    }

    async fn on_error(
        &self,
        message: &Message,
        publisher: &dyn Publisher,
        error: &BoxError,
        next: &dyn Processor,
    ) -> Result<bool, BoxError> {
        let mut span = new_span(message, "handle_process_error");
        span.set_status(Status::error(error.to_string()));

        let result = next.handle_process_error(message, publisher, error).await;
        if let Ok(handled) = &result {
            span.set_attribute(KeyValue::new("messaging.error.handled", *handled));
        }

        span.end();
        result
    }
}
