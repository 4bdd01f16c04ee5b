// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messaging Manager
//!
//! Supervises the processors of a service: it registers them into the routing
//! table, instantiates the discovered ones, and runs one consumer per processor.

use crate::{
    builder::Builder,
    consumer::Consumer,
    discovery::{
        discovered_processors, Dependency, ProcessorDescriptor, ProcessorIgnorer, ServiceResolver,
    },
    errors::AmqpError,
    processor::Processor,
};
use std::{any::TypeId, fmt, sync::Arc};
use tracing::{debug, error, info, warn};

/// Why a discovered processor is not registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyRegistered,
    InvalidType,
    Ignored,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::AlreadyRegistered => write!(f, "already registered"),
            SkipReason::InvalidType => write!(f, "not a public concrete type"),
            SkipReason::Ignored => write!(f, "ignored"),
        }
    }
}

struct Registration {
    type_id: TypeId,
    processor: Arc<dyn Processor>,
}

/// Runs a consumer for every registered processor.
pub struct MessagingManager {
    builder: Arc<dyn Builder>,
    processors: Vec<Registration>,
    consumers: Vec<Box<dyn Consumer>>,
    ignorer: Option<Arc<dyn ProcessorIgnorer>>,
    active: bool,
}

impl MessagingManager {
    pub fn new(builder: Arc<dyn Builder>) -> MessagingManager {
        MessagingManager {
            builder,
            processors: vec![],
            consumers: vec![],
            ignorer: None,
            active: false,
        }
    }

    /// Sets the policy excluding discovered processors.
    pub fn with_ignorer(mut self, ignorer: Arc<dyn ProcessorIgnorer>) -> Self {
        self.ignorer = Some(ignorer);
        self
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Registered processors, in registration order.
    pub fn processors(&self) -> impl Iterator<Item = &Arc<dyn Processor>> {
        self.processors.iter().map(|r| &r.processor)
    }

    /// Enables `processor` and maps its queue to its message type.
    pub fn register_processor<P: Processor + 'static>(&mut self, processor: P) -> Result<(), AmqpError> {
        self.register(TypeId::of::<P>(), Arc::new(processor))
    }

    fn register(&mut self, type_id: TypeId, processor: Arc<dyn Processor>) -> Result<(), AmqpError> {
        self.builder
            .routing_table()
            .map(&processor.queue_name(), processor.message_type())?;

        info!(
            processor = processor.name(),
            queue = processor.queue_name(),
            "processor registered"
        );
        self.processors.push(Registration { type_id, processor });
        Ok(())
    }

    /// Registers every processor declared with `processor!`.
    ///
    /// Returns the number of processors registered.
    pub fn load_processors(&mut self, resolver: &dyn ServiceResolver) -> Result<usize, AmqpError> {
        self.load_processors_from(discovered_processors(), resolver)
    }

    /// Registers the processors described by `descriptors`.
    pub fn load_processors_from<'a>(
        &mut self,
        descriptors: impl IntoIterator<Item = &'a ProcessorDescriptor>,
        resolver: &dyn ServiceResolver,
    ) -> Result<usize, AmqpError> {
        let mut loaded = 0;

        for descriptor in descriptors {
            if let Some(reason) = self.skip_reason(descriptor) {
                debug!(processor = descriptor.name(), %reason, "processor skipped");
                continue;
            }

            let Some(processor) = construct(descriptor, resolver) else {
                warn!(
                    processor = descriptor.name(),
                    "no constructor could be satisfied, processor skipped"
                );
                continue;
            };

            self.register((descriptor.type_id)(), processor)?;
            loaded += 1;
        }

        Ok(loaded)
    }

    fn skip_reason(&self, descriptor: &ProcessorDescriptor) -> Option<SkipReason> {
        let type_id = (descriptor.type_id)();

        if self.processors.iter().any(|r| r.type_id == type_id) {
            return Some(SkipReason::AlreadyRegistered);
        }

        if !descriptor.is_instantiable() {
            return Some(SkipReason::InvalidType);
        }

        if self
            .ignorer
            .as_ref()
            .is_some_and(|ignorer| ignorer.should_ignore(descriptor))
        {
            return Some(SkipReason::Ignored);
        }

        None
    }

    /// Starts a consumer per processor. Does nothing when already active.
    ///
    /// A failure stops every consumer already started before being returned.
    pub async fn start(&mut self) -> Result<(), AmqpError> {
        if self.active {
            info!("messaging manager already started");
            return Ok(());
        }

        self.active = true;
        if let Err(err) = self.start_consumers().await {
            error!(error = err.to_string(), "failure to start messaging manager");
            self.stop().await;
            return Err(err);
        }

        info!(consumers = self.consumers.len(), "messaging manager started");
        Ok(())
    }

    async fn start_consumers(&mut self) -> Result<(), AmqpError> {
        for registration in &self.processors {
            let processor = registration.processor.clone();
            let queue = processor.queue_name();

            debug!(processor = processor.name(), queue, "starting consumer");
            let mut consumer = self.builder.build_consumer().await?;
            let started = consumer.start(processor, &queue).await;
            self.consumers.push(consumer);
            started?;
        }

        Ok(())
    }

    /// Stops every consumer. Failures are logged and do not interrupt the shutdown.
    pub async fn stop(&mut self) {
        if !self.active {
            return;
        }

        for mut consumer in self.consumers.drain(..) {
            if let Err(err) = consumer.stop().await {
                error!(error = err.to_string(), "failure to stop consumer");
            }
        }

        self.active = false;
        info!("messaging manager stopped");
    }
}

/// Builds a processor with the first constructor whose parameters all resolve.
fn construct(
    descriptor: &ProcessorDescriptor,
    resolver: &dyn ServiceResolver,
) -> Option<Arc<dyn Processor>> {
    for (index, ctor) in descriptor.constructors.iter().enumerate() {
        let resolved: Option<Vec<Dependency>> = ctor
            .parameters
            .iter()
            .map(|param| {
                resolver
                    .resolve((param.type_id)())
                    .or_else(|| param.default.map(|default| default()))
                    .or_else(|| {
                        debug!(
                            processor = descriptor.name(),
                            parameter = param.name,
                            ty = (param.type_name)(),
                            "unresolved constructor parameter"
                        );
                        None
                    })
            })
            .collect();

        let Some(deps) = resolved else {
            continue;
        };

        match (ctor.invoke)(deps) {
            Ok(processor) => return Some(processor),
            Err(err) => warn!(
                error = err.to_string(),
                processor = descriptor.name(),
                constructor = index,
                "processor constructor failed"
            ),
        }
    }

    None
}
