// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel Management
//!
//! This module handles the creation and management of AMQP connections and channels.
//! The `ConnectionFactory`, `AmqpConnection` and `AmqpChannel` traits are the seam
//! between the messaging components and the broker; the lapin-backed types below are
//! the RabbitMQ implementation of that seam.

use crate::{errors::AmqpError, queue::QueueInfo};
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use serde_json::{Map, Value};
use std::{collections::BTreeMap, pin::Pin, sync::Arc};
use tracing::{debug, error};

/// AMQP delivery mode of messages that survive a broker restart
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// A message delivered by the broker to a consumer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub data: Vec<u8>,
    /// Reply-to property of the delivery, if any.
    pub reply_to: Option<String>,
}

/// Stream of deliveries of a single subscription.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, AmqpError>> + Send>>;

/// Transport properties attached to a published message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishProperties {
    pub content_type: String,
    pub content_encoding: String,
    pub delivery_mode: u8,
    pub message_id: String,
    pub reply_to: Option<String>,
    pub headers: BTreeMap<String, Value>,
}

/// Opens connections to the broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn AmqpConnection>, AmqpError>;
}

/// A broker connection multiplexing channels.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// A broker channel. Must not be shared between concurrent call sites.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    /// Declares `queue` and returns the broker-confirmed name.
    ///
    /// An empty name asks the broker to generate one.
    async fn queue_declare(&self, queue: &str, info: &QueueInfo) -> Result<String, AmqpError>;

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    /// Subscribes to `queue` and returns the consumer tag with the delivery stream.
    async fn basic_consume(
        &self,
        queue: &str,
        no_ack: bool,
    ) -> Result<(String, DeliveryStream), AmqpError>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    /// Publishes `body` to `routing_key` through the default exchange.
    async fn basic_publish(
        &self,
        routing_key: &str,
        properties: PublishProperties,
        body: Vec<u8>,
    ) -> Result<(), AmqpError>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;
}

/// Connection factory seeded from an AMQP URI.
pub struct LapinConnectionFactory {
    uri: String,
    connection_name: String,
}

impl LapinConnectionFactory {
    /// Creates a new factory.
    ///
    /// # Parameters
    /// * `uri` - AMQP URI of the broker, credentials included
    /// * `connection_name` - Name shown for the connection in the broker
    pub fn new(uri: &str, connection_name: &str) -> LapinConnectionFactory {
        LapinConnectionFactory {
            uri: uri.to_owned(),
            connection_name: connection_name.to_owned(),
        }
    }
}

#[async_trait]
impl ConnectionFactory for LapinConnectionFactory {
    async fn connect(&self) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name.clone()));

        let conn = match Connection::connect(&self.uri, options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError {})
            }
        }?;
        debug!("amqp connected");

        Ok(Arc::new(LapinConnection { conn }))
    }
}

/// lapin implementation of the `AmqpConnection` trait.
pub struct LapinConnection {
    conn: Connection,
}

#[async_trait]
impl AmqpConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        debug!("creating amqp channel...");
        match self.conn.create_channel().await {
            Ok(channel) => {
                debug!("channel created");
                Ok(Arc::new(LapinChannel { channel }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError {})
            }
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.conn.close(200, "closing").await.map_err(|err| {
            error!(error = err.to_string(), "failure to close the connection");
            AmqpError::ConnectionError
        })
    }
}

/// lapin implementation of the `AmqpChannel` trait.
pub struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    async fn queue_declare(&self, queue: &str, info: &QueueInfo) -> Result<String, AmqpError> {
        debug!("declaring queue: {}", queue);

        match self
            .channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: false,
                    durable: info.durable,
                    exclusive: info.exclusive,
                    auto_delete: info.auto_delete,
                    nowait: false,
                },
                field_table(&info.declare_arguments()),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue, "error to declare the queue");
                Err(AmqpError::DeclareQueueError(queue.to_owned()))
            }
            Ok(declared) => {
                debug!("queue: {} was declared", declared.name());
                Ok(declared.name().to_string())
            }
        }
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn basic_consume(
        &self,
        queue: &str,
        no_ack: bool,
    ) -> Result<(String, DeliveryStream), AmqpError> {
        let consumer = match self
            .channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions {
                    no_local: false,
                    no_ack,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::BindingConsumerError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        let tag = consumer.tag().to_string();
        let deliveries = consumer.map(|result| match result {
            Ok(delivery) => Ok(Delivery {
                delivery_tag: delivery.delivery_tag,
                reply_to: delivery
                    .properties
                    .reply_to()
                    .as_ref()
                    .map(|reply_to| reply_to.to_string()),
                data: delivery.data,
            }),
            Err(err) => Err(AmqpError::ConsumerError(err.to_string())),
        });

        Ok((tag, Box::pin(deliveries)))
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), consumer_tag, "failure to cancel consumer");
                AmqpError::CancelConsumerError(consumer_tag.to_owned())
            })
    }

    async fn basic_publish(
        &self,
        routing_key: &str,
        properties: PublishProperties,
        body: Vec<u8>,
    ) -> Result<(), AmqpError> {
        let mut props = BasicProperties::default()
            .with_content_type(ShortString::from(properties.content_type))
            .with_content_encoding(ShortString::from(properties.content_encoding))
            .with_delivery_mode(properties.delivery_mode)
            .with_message_id(ShortString::from(properties.message_id))
            .with_headers(field_table(&properties.headers.into_iter().collect()));

        if let Some(reply_to) = properties.reply_to {
            props = props.with_reply_to(ShortString::from(reply_to));
        }

        match self
            .channel
            .basic_publish(
                "",
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &body,
                props,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError)
            }
            _ => Ok(()),
        }
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }
}

/// Converts JSON arguments or headers into an AMQP field table.
pub(crate) fn field_table(values: &Map<String, Value>) -> FieldTable {
    let mut btree = BTreeMap::<ShortString, AMQPValue>::default();
    for (key, value) in values {
        btree.insert(ShortString::from(key.clone()), amqp_value(value));
    }
    FieldTable::from(btree)
}

fn amqp_value(value: &Value) -> AMQPValue {
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(v) => AMQPValue::Boolean(*v),
        Value::Number(n) => match n.as_i64() {
            Some(v) => AMQPValue::LongLongInt(v),
            None => AMQPValue::Double(n.as_f64().unwrap_or_default()),
        },
        Value::String(v) => AMQPValue::LongString(LongString::from(v.clone())),
        Value::Array(values) => {
            AMQPValue::FieldArray(FieldArray::from(values.iter().map(amqp_value).collect::<Vec<_>>()))
        }
        Value::Object(map) => AMQPValue::FieldTable(field_table(map)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_values_become_amqp_values() {
        let map = json!({
            "flag": true,
            "count": 3,
            "ratio": 0.5,
            "name": "orders",
            "list": [1, "a"],
            "nested": { "x-max-priority": 5 },
            "empty": null,
        });

        let table = field_table(map.as_object().unwrap());
        let inner = table.inner();

        assert_eq!(inner.get("flag"), Some(&AMQPValue::Boolean(true)));
        assert_eq!(inner.get("count"), Some(&AMQPValue::LongLongInt(3)));
        assert_eq!(inner.get("ratio"), Some(&AMQPValue::Double(0.5)));
        assert_eq!(
            inner.get("name"),
            Some(&AMQPValue::LongString(LongString::from("orders")))
        );
        assert_eq!(inner.get("empty"), Some(&AMQPValue::Void));
        assert!(matches!(inner.get("list"), Some(AMQPValue::FieldArray(_))));
        assert!(matches!(inner.get("nested"), Some(AMQPValue::FieldTable(_))));
    }
}
