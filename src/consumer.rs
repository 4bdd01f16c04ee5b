// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! This module provides functionality for consuming and processing messages from RabbitMQ.
//! A consumer subscribes one processor to one queue with a prefetch of a single
//! unacknowledged delivery, so deliveries of a queue are handled one at a time.
//!
//! Acknowledgment policy: a processed delivery is acked; a failed one is acked only
//! when the processor's error hook declares the error handled, and is otherwise
//! negatively acknowledged with requeue. There is no retry cap: a message that always
//! fails and is never declared handled is redelivered indefinitely.

use crate::{
    api_manager::QueueApiManager,
    builder::RoutingTable,
    channel::{AmqpChannel, Delivery, DeliveryStream},
    errors::{AmqpError, BoxError},
    processor::{MiddlewareChain, Processor},
    publisher::Publisher,
};
use async_trait::async_trait;
use futures_util::{FutureExt, StreamExt};
use std::{any::Any, panic::AssertUnwindSafe, sync::Arc};
use tracing::{debug, error, info_span, warn, Instrument};

/// Unacknowledged deliveries a consumer may hold at once
pub const CONSUMER_PREFETCH_COUNT: u16 = 1;
/// Version passed to the routing table when materializing inbound payloads
pub const MESSAGE_VERSION: u32 = 1;

/// Subscribes a processor to a queue.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Starts consuming `queue` with `processor`.
    async fn start(&mut self, processor: Arc<dyn Processor>, queue: &str) -> Result<(), AmqpError>;

    /// Cancels the subscription. Does nothing when not started.
    async fn stop(&mut self) -> Result<(), AmqpError>;
}

/// RabbitMQ implementation of the Consumer trait.
pub struct RabbitMQConsumer {
    channel: Arc<dyn AmqpChannel>,
    publisher: Arc<dyn Publisher>,
    routing: Arc<RoutingTable>,
    manager: Arc<dyn QueueApiManager>,
    middleware: MiddlewareChain,
    consumer_tag: String,
}

impl RabbitMQConsumer {
    /// Creates a new RabbitMQ consumer.
    ///
    /// # Parameters
    /// * `channel` - A channel dedicated to this consumer
    /// * `publisher` - Publisher handed to the processor for replies
    /// * `routing` - Routing table used to materialize inbound messages
    /// * `manager` - Ensures the consumed queue exists
    /// * `middleware` - Hooks wrapped around the processor
    pub fn new(
        channel: Arc<dyn AmqpChannel>,
        publisher: Arc<dyn Publisher>,
        routing: Arc<RoutingTable>,
        manager: Arc<dyn QueueApiManager>,
        middleware: MiddlewareChain,
    ) -> RabbitMQConsumer {
        RabbitMQConsumer {
            channel,
            publisher,
            routing,
            manager,
            middleware,
            consumer_tag: String::new(),
        }
    }

    /// Tag of the active subscription, empty when idle.
    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }
}

#[async_trait]
impl Consumer for RabbitMQConsumer {
    async fn start(&mut self, processor: Arc<dyn Processor>, queue: &str) -> Result<(), AmqpError> {
        if !self.consumer_tag.is_empty() {
            return Err(AmqpError::AlreadyStartedError);
        }

        if queue.is_empty() {
            return Err(AmqpError::InvalidArgumentError("queue".to_owned()));
        }

        self.manager.ensure_queue(queue).await?;
        self.channel.basic_qos(CONSUMER_PREFETCH_COUNT).await?;
        let (tag, deliveries) = self.channel.basic_consume(queue, false).await?;

        let span = info_span!("processor", processor = processor.name(), queue);
        let handler = DeliveryHandler {
            queue: queue.to_owned(),
            processor: self.middleware.wrap(processor),
            publisher: self.publisher.clone(),
            routing: self.routing.clone(),
            channel: self.channel.clone(),
        };

        tokio::spawn(handler.run(deliveries).instrument(span));

        debug!("consumer: {} started on queue: {}", tag, queue);
        self.consumer_tag = tag;
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), AmqpError> {
        if self.consumer_tag.is_empty() {
            return Ok(());
        }

        let tag = std::mem::take(&mut self.consumer_tag);
        debug!("stopping consumer: {}", tag);
        self.channel.basic_cancel(&tag).await
    }
}

/// Everything needed to handle the deliveries of one subscription.
pub(crate) struct DeliveryHandler {
    pub(crate) queue: String,
    pub(crate) processor: Arc<dyn Processor>,
    pub(crate) publisher: Arc<dyn Publisher>,
    pub(crate) routing: Arc<RoutingTable>,
    pub(crate) channel: Arc<dyn AmqpChannel>,
}

impl DeliveryHandler {
    async fn run(self, mut deliveries: DeliveryStream) {
        while let Some(result) = deliveries.next().await {
            match result {
                Ok(delivery) => {
                    if let Err(err) = self.consume(delivery).await {
                        error!(error = err.to_string(), "error consume msg");
                    }
                }
                Err(err) => error!(error = err.to_string(), "errors consume msg"),
            }
        }

        debug!("consumer of queue: {} finished", self.queue);
    }

    /// Handles a single delivery and settles it with ack or nack.
    pub(crate) async fn consume(&self, delivery: Delivery) -> Result<(), AmqpError> {
        let mut message =
            match self
                .routing
                .build_message(&self.queue, MESSAGE_VERSION, &delivery.data)
            {
                Ok(message) => message,
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        "removing message from queue - reason: undecodable payload"
                    );
                    return self.channel.basic_nack(delivery.delivery_tag, false).await;
                }
            };

        if let Some(reply_to) = delivery.reply_to.filter(|r| !r.is_empty()) {
            message.reply_queue = reply_to;
        }

        let publisher = self.publisher.as_ref();
        let outcome = AssertUnwindSafe(self.processor.process_message(&message, publisher))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(panic_error(panic)));

        let err = match outcome {
            Ok(()) => {
                debug!("message successfully processed");
                return self.channel.basic_ack(delivery.delivery_tag).await;
            }
            Err(err) => err,
        };

        warn!(error = err.to_string(), "error whiling handling msg");

        let handled = AssertUnwindSafe(
            self.processor
                .handle_process_error(&message, publisher, &err),
        )
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(panic_error(panic)));

        match handled {
            Ok(true) => {
                debug!("processing error handled");
                self.channel.basic_ack(delivery.delivery_tag).await
            }
            Ok(false) => {
                warn!("processing error not handled, requeuing for latter");
                self.channel.basic_nack(delivery.delivery_tag, true).await
            }
            Err(hook_err) => {
                error!(
                    error = hook_err.to_string(),
                    "error hook failed, requeuing for latter"
                );
                self.channel.basic_nack(delivery.delivery_tag, true).await
            }
        }
    }
}

fn panic_error(panic: Box<dyn Any + Send>) -> BoxError {
    let reason = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_owned());

    AmqpError::ProcessingError(format!("processor panicked: {}", reason)).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        api_manager::MockQueueApiManager,
        channel::MockAmqpChannel,
        message::{Message, MessageType},
        publisher::MockPublisher,
        serializer::{JsonSerializer, Serializer},
    };
    use futures_util::stream;
    use std::sync::Mutex;

    const QUEUE: &str = "orders";
    const TAG: u64 = 42;

    #[derive(Clone, Copy)]
    enum Behavior {
        Succeed,
        Fail { handled: bool },
        FailAndHookFails,
        FailAndHookPanics,
        Panic,
    }

    struct TestProcessor {
        behavior: Behavior,
        seen: Arc<Mutex<Vec<Message>>>,
    }

    #[async_trait]
    impl Processor for TestProcessor {
        fn queue_name(&self) -> String {
            QUEUE.to_owned()
        }

        fn message_type(&self) -> MessageType {
            MessageType::untyped()
        }

        async fn process_message(&self, message: &Message, _: &dyn Publisher) -> Result<(), BoxError> {
            self.seen.lock().unwrap().push(message.clone());
            match self.behavior {
                Behavior::Succeed => Ok(()),
                Behavior::Panic => panic!("processor exploded"),
                _ => Err("failed".into()),
            }
        }

        async fn handle_process_error(
            &self,
            _: &Message,
            _: &dyn Publisher,
            _: &BoxError,
        ) -> Result<bool, BoxError> {
            match self.behavior {
                Behavior::Fail { handled } => Ok(handled),
                Behavior::FailAndHookFails => Err("hook failed".into()),
                Behavior::FailAndHookPanics => panic!("error hook exploded"),
                _ => Ok(false),
            }
        }
    }

    fn routing() -> Arc<RoutingTable> {
        let routing = Arc::new(RoutingTable::new(Arc::new(JsonSerializer)));
        routing.map(QUEUE, MessageType::untyped()).unwrap();
        routing
    }

    fn handler(behavior: Behavior, channel: MockAmqpChannel) -> (DeliveryHandler, Arc<Mutex<Vec<Message>>>) {
        let seen = Arc::new(Mutex::new(vec![]));
        let handler = DeliveryHandler {
            queue: QUEUE.to_owned(),
            processor: Arc::new(TestProcessor {
                behavior,
                seen: seen.clone(),
            }),
            publisher: Arc::new(MockPublisher::new()),
            routing: routing(),
            channel: Arc::new(channel),
        };
        (handler, seen)
    }

    fn delivery(reply_to: Option<&str>) -> Delivery {
        Delivery {
            delivery_tag: TAG,
            data: JsonSerializer.serialize(&Message::new()).unwrap(),
            reply_to: reply_to.map(str::to_owned),
        }
    }

    fn expect_ack(channel: &mut MockAmqpChannel) {
        channel
            .expect_basic_ack()
            .withf(|tag| *tag == TAG)
            .times(1)
            .returning(|_| Ok(()));
        channel.expect_basic_nack().times(0);
    }

    fn expect_requeue(channel: &mut MockAmqpChannel) {
        channel.expect_basic_ack().times(0);
        channel
            .expect_basic_nack()
            .withf(|tag, requeue| *tag == TAG && *requeue)
            .times(1)
            .returning(|_, _| Ok(()));
    }

    #[tokio::test]
    async fn processed_message_is_acked() {
        let mut channel = MockAmqpChannel::new();
        expect_ack(&mut channel);

        let (handler, _) = handler(Behavior::Succeed, channel);
        handler.consume(delivery(None)).await.unwrap();
    }

    #[tokio::test]
    async fn handled_error_is_acked() {
        let mut channel = MockAmqpChannel::new();
        expect_ack(&mut channel);

        let (handler, _) = handler(Behavior::Fail { handled: true }, channel);
        handler.consume(delivery(None)).await.unwrap();
    }

    #[tokio::test]
    async fn unhandled_error_is_requeued() {
        let mut channel = MockAmqpChannel::new();
        expect_requeue(&mut channel);

        let (handler, _) = handler(Behavior::Fail { handled: false }, channel);
        handler.consume(delivery(None)).await.unwrap();
    }

    #[tokio::test]
    async fn failing_error_hook_requeues() {
        let mut channel = MockAmqpChannel::new();
        expect_requeue(&mut channel);

        let (handler, _) = handler(Behavior::FailAndHookFails, channel);
        handler.consume(delivery(None)).await.unwrap();
    }

    #[tokio::test]
    async fn panicking_error_hook_requeues() {
        let mut channel = MockAmqpChannel::new();
        expect_requeue(&mut channel);

        let (handler, _) = handler(Behavior::FailAndHookPanics, channel);
        handler.consume(delivery(None)).await.unwrap();
    }

    #[tokio::test]
    async fn panicking_processor_goes_through_error_hook() {
        let mut channel = MockAmqpChannel::new();
        expect_requeue(&mut channel);

        let (handler, _) = handler(Behavior::Panic, channel);
        handler.consume(delivery(None)).await.unwrap();
    }

    #[tokio::test]
    async fn transport_reply_to_becomes_reply_queue() {
        let mut channel = MockAmqpChannel::new();
        expect_ack(&mut channel);

        let (handler, seen) = handler(Behavior::Succeed, channel);
        handler
            .consume(delivery(Some("amq.gen-reply")))
            .await
            .unwrap();

        assert_eq!(seen.lock().unwrap()[0].reply_queue, "amq.gen-reply");
    }

    #[tokio::test]
    async fn undecodable_payload_is_dropped() {
        let mut channel = MockAmqpChannel::new();
        channel.expect_basic_ack().times(0);
        channel
            .expect_basic_nack()
            .withf(|_, requeue| !*requeue)
            .times(1)
            .returning(|_, _| Ok(()));

        let (handler, seen) = handler(Behavior::Succeed, channel);
        handler
            .consume(Delivery {
                delivery_tag: TAG,
                data: b"garbage".to_vec(),
                reply_to: None,
            })
            .await
            .unwrap();

        assert!(seen.lock().unwrap().is_empty());
    }

    fn consumer(channel: MockAmqpChannel, manager: MockQueueApiManager) -> RabbitMQConsumer {
        RabbitMQConsumer::new(
            Arc::new(channel),
            Arc::new(MockPublisher::new()),
            routing(),
            Arc::new(manager),
            MiddlewareChain::new(),
        )
    }

    fn processor() -> Arc<dyn Processor> {
        Arc::new(TestProcessor {
            behavior: Behavior::Succeed,
            seen: Arc::new(Mutex::new(vec![])),
        })
    }

    #[tokio::test]
    async fn start_subscribes_with_single_prefetch() {
        let mut manager = MockQueueApiManager::new();
        manager
            .expect_ensure_queue()
            .withf(|q| q == QUEUE)
            .times(1)
            .returning(|q| Ok(q.to_owned()));

        let mut channel = MockAmqpChannel::new();
        channel
            .expect_basic_qos()
            .withf(|prefetch| *prefetch == 1)
            .times(1)
            .returning(|_| Ok(()));
        channel
            .expect_basic_consume()
            .withf(|q, no_ack| q == QUEUE && !*no_ack)
            .times(1)
            .returning(|_, _| {
                let deliveries: DeliveryStream = Box::pin(stream::pending());
                Ok(("ctag".to_owned(), deliveries))
            });
        channel
            .expect_basic_cancel()
            .withf(|tag| tag == "ctag")
            .times(1)
            .returning(|_| Ok(()));

        let mut consumer = consumer(channel, manager);
        consumer.start(processor(), QUEUE).await.unwrap();
        assert_eq!(consumer.consumer_tag(), "ctag");

        assert_eq!(
            consumer.start(processor(), QUEUE).await,
            Err(AmqpError::AlreadyStartedError)
        );

        consumer.stop().await.unwrap();
        consumer.stop().await.unwrap();
        assert_eq!(consumer.consumer_tag(), "");
    }

    #[tokio::test]
    async fn empty_queue_name_is_rejected() {
        let mut manager = MockQueueApiManager::new();
        manager.expect_ensure_queue().times(0);

        let mut consumer = consumer(MockAmqpChannel::new(), manager);

        assert_eq!(
            consumer.start(processor(), "").await,
            Err(AmqpError::InvalidArgumentError("queue".to_owned()))
        );
    }

    #[tokio::test]
    async fn stop_when_idle_does_nothing() {
        let mut channel = MockAmqpChannel::new();
        channel.expect_basic_cancel().times(0);

        consumer(channel, MockQueueApiManager::new())
            .stop()
            .await
            .unwrap();
    }
}
