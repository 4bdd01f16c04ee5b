// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! This module provides functionality for publishing messages to RabbitMQ queues,
//! fire-and-forget or request-reply.
//!
//! Request-reply declares a server-named, exclusive reply queue, subscribes to it,
//! publishes the request with `reply-to` pointing at that queue and waits for the
//! first reply. Correlation is by reply queue identity: each call owns its reply
//! queue and only the first reply delivered to it is observed.

use crate::{
    api_manager::QueueApiManager,
    channel::{AmqpChannel, PublishProperties, PERSISTENT_DELIVERY_MODE},
    errors::AmqpError,
    message::{Message, MessageType},
    processor::MiddlewareChain,
    queue::QueueInfo,
    serializer::Serializer,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::{runtime::Handle, sync::oneshot, task::JoinHandle};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Content encoding of every published body
pub const CONTENT_ENCODING: &str = "utf-8";
/// Header telling downstream consumers not to reroute the message to their default queue
pub const AMQP_HEADERS_SEND_TO_DEFAULT_QUEUE: &str = "x-send-to-default-queue";
/// Time `publish_and_wait` waits for a reply unless told otherwise
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_millis(60_000);

/// Publishes messages to the broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publishes `message`.
    ///
    /// Unless `force_destination` is set, a non-empty `reply_queue` on the message
    /// takes precedence over `destination`.
    async fn publish(
        &self,
        message: &Message,
        destination: &str,
        force_destination: bool,
    ) -> Result<(), AmqpError>;

    /// Publishes `message` and waits for a reply of kind `reply_type`.
    ///
    /// Sets `message.reply_to` to the reply queue of the call.
    async fn publish_and_wait(
        &self,
        message: &mut Message,
        destination: &str,
        force_destination: bool,
        reply_type: MessageType,
        timeout: Duration,
    ) -> Result<Message, AmqpError>;
}

/// RabbitMQ implementation of the Publisher trait.
pub struct RabbitMQPublisher {
    channel: Arc<dyn AmqpChannel>,
    serializer: Arc<dyn Serializer>,
    manager: Arc<dyn QueueApiManager>,
    middleware: MiddlewareChain,
}

impl RabbitMQPublisher {
    /// Creates a new RabbitMQ publisher.
    ///
    /// # Parameters
    /// * `channel` - A channel dedicated to this publisher
    /// * `serializer` - Converts messages to bytes
    /// * `manager` - Ensures destination queues exist
    /// * `middleware` - Hooks run on every outgoing message
    ///
    /// # Returns
    /// An Arc-wrapped RabbitMQPublisher instance for thread-safe sharing
    pub fn new(
        channel: Arc<dyn AmqpChannel>,
        serializer: Arc<dyn Serializer>,
        manager: Arc<dyn QueueApiManager>,
        middleware: MiddlewareChain,
    ) -> Arc<RabbitMQPublisher> {
        Arc::new(RabbitMQPublisher {
            channel,
            serializer,
            manager,
            middleware,
        })
    }
}

/// Resolves the queue a message is published to.
pub fn resolve_destination(
    message: &Message,
    destination: &str,
    force_destination: bool,
) -> Result<String, AmqpError> {
    let resolved = if !force_destination && !message.reply_queue.is_empty() {
        &message.reply_queue
    } else {
        destination
    };

    if resolved.is_empty() {
        return Err(AmqpError::DestinationError);
    }

    Ok(resolved.to_owned())
}

#[async_trait]
impl Publisher for RabbitMQPublisher {
    async fn publish(
        &self,
        message: &Message,
        destination: &str,
        force_destination: bool,
    ) -> Result<(), AmqpError> {
        let destination = resolve_destination(message, destination, force_destination)?;
        self.manager.ensure_queue(&destination).await?;

        let mut message = message.clone();
        self.middleware.on_publish(&mut message);

        let properties = self.properties(&message);
        let body = self.serializer.serialize(&message)?;

        debug!("publishing to: {}", destination);
        self.channel
            .basic_publish(&destination, properties, body)
            .await
    }

    async fn publish_and_wait(
        &self,
        message: &mut Message,
        destination: &str,
        force_destination: bool,
        reply_type: MessageType,
        timeout: Duration,
    ) -> Result<Message, AmqpError> {
        let reply_queue = self
            .channel
            .queue_declare("", &QueueInfo::reply_queue())
            .await?;
        message.reply_to = reply_queue.clone();

        let (consumer_tag, mut deliveries) =
            self.channel.basic_consume(&reply_queue, true).await?;

        let (sender, receiver) = oneshot::channel();
        let serializer = self.serializer.clone();
        let listener = tokio::spawn(async move {
            let mut sender = Some(sender);
            while let Some(result) = deliveries.next().await {
                match result {
                    Ok(delivery) => match serializer.deserialize(&reply_type, &delivery.data) {
                        Ok(reply) => match sender.take() {
                            Some(sender) => {
                                let _ = sender.send(reply);
                            }
                            None => warn!("extra reply received, ignoring"),
                        },
                        Err(err) => error!(error = err.to_string(), "invalid reply received"),
                    },
                    Err(err) => error!(error = err.to_string(), "errors consume reply"),
                }
            }
        });

        let subscription = ReplySubscription {
            channel: self.channel.clone(),
            consumer_tag,
            listener,
            armed: true,
        };

        let result = self
            .send_and_receive(message, destination, force_destination, receiver, timeout)
            .await;

        subscription.cancel().await;
        result
    }
}

/// Reply consumer of a pending request.
///
/// Dropping it before `cancel` runs, e.g. when the caller abandons the request,
/// still cancels the consumer from a spawned task.
struct ReplySubscription {
    channel: Arc<dyn AmqpChannel>,
    consumer_tag: String,
    listener: JoinHandle<()>,
    armed: bool,
}

impl ReplySubscription {
    async fn cancel(mut self) {
        self.armed = false;
        self.listener.abort();
        if let Err(err) = self.channel.basic_cancel(&self.consumer_tag).await {
            error!(error = err.to_string(), "failure to cancel reply consumer");
        }
    }
}

impl Drop for ReplySubscription {
    fn drop(&mut self) {
        self.listener.abort();
        if !self.armed {
            return;
        }

        let channel = self.channel.clone();
        let consumer_tag = std::mem::take(&mut self.consumer_tag);
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    debug!("cancelling abandoned reply consumer: {}", consumer_tag);
                    if let Err(err) = channel.basic_cancel(&consumer_tag).await {
                        error!(error = err.to_string(), "failure to cancel reply consumer");
                    }
                });
            }
            Err(_) => warn!(
                consumer_tag = consumer_tag.as_str(),
                "no runtime left to cancel reply consumer"
            ),
        }
    }
}

impl RabbitMQPublisher {
    /// Publishes the request and blocks on the reply slot until `timeout` elapses.
    async fn send_and_receive(
        &self,
        message: &Message,
        destination: &str,
        force_destination: bool,
        receiver: oneshot::Receiver<Message>,
        timeout: Duration,
    ) -> Result<Message, AmqpError> {
        self.publish(message, destination, force_destination).await?;

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(AmqpError::ConsumerError(message.reply_to.clone())),
            Err(_) => {
                warn!("reply message not received in {:?}", timeout);
                Err(AmqpError::TimeoutError(timeout))
            }
        }
    }

    /// Builds the transport properties of `message`.
    fn properties(&self, message: &Message) -> PublishProperties {
        let mut headers = BTreeMap::<String, Value>::default();
        headers.insert(
            AMQP_HEADERS_SEND_TO_DEFAULT_QUEUE.to_owned(),
            Value::from("false"),
        );
        for (key, value) in &message.headers {
            headers.insert(key.clone(), value.clone());
        }

        PublishProperties {
            content_type: JSON_CONTENT_TYPE.to_owned(),
            content_encoding: CONTENT_ENCODING.to_owned(),
            delivery_mode: PERSISTENT_DELIVERY_MODE,
            message_id: Uuid::new_v4().to_string(),
            reply_to: (!message.reply_to.is_empty()).then(|| message.reply_to.clone()),
            headers,
        }
    }
}
