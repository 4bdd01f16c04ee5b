// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Processors and Middleware
//!
//! A `Processor` owns the business handling of one queue. The consumer invokes it for
//! every delivery and lets it decide, through `handle_process_error`, whether a failed
//! delivery is acknowledged or requeued.
//!
//! `ProcessorMiddleware` is the cross-cutting hook around processing and publishing.
//! Middleware is composed into a `MiddlewareChain` when the builder is created and
//! wrapped around every processor the consumers run, so the core never depends on a
//! particular tracing backend.

use crate::{
    errors::BoxError,
    message::{Message, MessageType},
    publisher::Publisher,
};
use async_trait::async_trait;
use std::sync::Arc;

/// Handles the messages of a single queue.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Queue this processor consumes.
    fn queue_name(&self) -> String;

    /// Kind of message expected on the queue.
    fn message_type(&self) -> MessageType;

    /// Name used in logs.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Handles a message. Replies can be sent through `publisher`.
    async fn process_message(
        &self,
        message: &Message,
        publisher: &dyn Publisher,
    ) -> Result<(), BoxError>;

    /// Called when `process_message` fails.
    ///
    /// Returning `Ok(true)` declares the error handled and the delivery is
    /// acknowledged; any other outcome requeues the delivery.
    async fn handle_process_error(
        &self,
        message: &Message,
        publisher: &dyn Publisher,
        error: &BoxError,
    ) -> Result<bool, BoxError>;
}

/// Hook wrapped around publishing and processing.
///
/// Every method defaults to passing control through unchanged.
#[async_trait]
pub trait ProcessorMiddleware: Send + Sync {
    /// Called on every outgoing message before it is serialized.
    fn on_publish(&self, _message: &mut Message) {}

    async fn on_process(
        &self,
        message: &Message,
        publisher: &dyn Publisher,
        next: &dyn Processor,
    ) -> Result<(), BoxError> {
        next.process_message(message, publisher).await
    }

    async fn on_error(
        &self,
        message: &Message,
        publisher: &dyn Publisher,
        error: &BoxError,
        next: &dyn Processor,
    ) -> Result<bool, BoxError> {
        next.handle_process_error(message, publisher, error).await
    }
}

/// Ordered list of middleware. The first entry is the outermost layer.
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    layers: Vec<Arc<dyn ProcessorMiddleware>>,
}

impl MiddlewareChain {
    pub fn new() -> MiddlewareChain {
        MiddlewareChain::default()
    }

    /// Adds a layer inside the ones already present.
    pub fn with(mut self, middleware: Arc<dyn ProcessorMiddleware>) -> Self {
        self.layers.push(middleware);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Runs every `on_publish` hook, outermost first.
    pub fn on_publish(&self, message: &mut Message) {
        for layer in &self.layers {
            layer.on_publish(message);
        }
    }

    /// Wraps `processor` in every layer of the chain.
    pub fn wrap(&self, processor: Arc<dyn Processor>) -> Arc<dyn Processor> {
        self.layers.iter().rev().fold(processor, |inner, layer| {
            Arc::new(Wrapped {
                middleware: layer.clone(),
                inner,
            })
        })
    }
}

struct Wrapped {
    middleware: Arc<dyn ProcessorMiddleware>,
    inner: Arc<dyn Processor>,
}

#[async_trait]
impl Processor for Wrapped {
    fn queue_name(&self) -> String {
        self.inner.queue_name()
    }

    fn message_type(&self) -> MessageType {
        self.inner.message_type()
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn process_message(
        &self,
        message: &Message,
        publisher: &dyn Publisher,
    ) -> Result<(), BoxError> {
        self.middleware
            .on_process(message, publisher, self.inner.as_ref())
            .await
    }

    async fn handle_process_error(
        &self,
        message: &Message,
        publisher: &dyn Publisher,
        error: &BoxError,
    ) -> Result<bool, BoxError> {
        self.middleware
            .on_error(message, publisher, error, self.inner.as_ref())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::MockPublisher;
    use std::sync::Mutex;

    struct Recorder {
        calls: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Processor for Recorder {
        fn queue_name(&self) -> String {
            "orders".to_owned()
        }

        fn message_type(&self) -> MessageType {
            MessageType::untyped()
        }

        async fn process_message(&self, _: &Message, _: &dyn Publisher) -> Result<(), BoxError> {
            self.calls.lock().unwrap().push("process".to_owned());
            Err("failed".into())
        }

        async fn handle_process_error(
            &self,
            _: &Message,
            _: &dyn Publisher,
            error: &BoxError,
        ) -> Result<bool, BoxError> {
            self.calls.lock().unwrap().push(format!("error:{}", error));
            Ok(true)
        }
    }

    struct Layer {
        label: &'static str,
        calls: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ProcessorMiddleware for Layer {
        fn on_publish(&self, message: &mut Message) {
            message
                .headers
                .insert(self.label.to_owned(), serde_json::Value::Bool(true));
        }

        async fn on_process(
            &self,
            message: &Message,
            publisher: &dyn Publisher,
            next: &dyn Processor,
        ) -> Result<(), BoxError> {
            self.calls.lock().unwrap().push(self.label.to_owned());
            next.process_message(message, publisher).await
        }
    }

    #[tokio::test]
    async fn chain_runs_outermost_layer_first() {
        let calls = Arc::new(Mutex::new(vec![]));
        let chain = MiddlewareChain::new()
            .with(Arc::new(Layer {
                label: "outer",
                calls: calls.clone(),
            }))
            .with(Arc::new(Layer {
                label: "inner",
                calls: calls.clone(),
            }));

        let processor = chain.wrap(Arc::new(Recorder {
            calls: calls.clone(),
        }));
        let publisher = MockPublisher::new();
        let msg = Message::new();

        let err = processor.process_message(&msg, &publisher).await.unwrap_err();
        let handled = processor
            .handle_process_error(&msg, &publisher, &err)
            .await
            .unwrap();

        assert!(handled);
        assert_eq!(processor.queue_name(), "orders");
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["outer", "inner", "process", "error:failed"]
        );
    }

    #[test]
    fn publish_hooks_decorate_the_message() {
        let calls = Arc::new(Mutex::new(vec![]));
        let chain = MiddlewareChain::new().with(Arc::new(Layer {
            label: "traced",
            calls,
        }));
        let mut msg = Message::new();

        chain.on_publish(&mut msg);

        assert_eq!(msg.headers["traced"], serde_json::Value::Bool(true));
    }
}
