// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Messaging Runtime
//!
//! This module provides the error taxonomy shared by every component of the crate.
//! The `AmqpError` enum covers configuration and connectivity failures, broker
//! operations (declare, consume, publish, ack/nack), the management HTTP API,
//! request-reply timeouts and consumer misuse.

use std::time::Duration;
use thiserror::Error;

/// Error type returned by processor code and carried through the error hooks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Represents errors that can occur while publishing, consuming or supervising.
///
/// Connectivity and configuration errors are fatal at construction time. Errors
/// raised while a processor handles a delivery never leave the consumer: they are
/// routed to the processor's error hook instead.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Broker or management URL missing or unusable
    #[error("invalid configuration: {0}")]
    ConfigurationError(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error cancelling a consumer subscription
    #[error("failure to cancel consumer `{0}`")]
    CancelConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error parsing a message payload
    #[error("failure to parse payload: {0}")]
    ParsePayloadError(String),

    /// Error turning a message into bytes
    #[error("failure to serialize message: {0}")]
    SerializationError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// No message type is mapped to the queue
    #[error("no message type mapped to queue `{0}`")]
    NotFoundError(String),

    /// The publish destination resolved to an empty queue name
    #[error("message destination is empty")]
    DestinationError,

    /// No reply arrived on the reply queue in time
    #[error("reply message not received within {0:?}")]
    TimeoutError(Duration),

    /// The management API answered with an unexpected status
    #[error("management api returned status {status}: {body}")]
    HttpProtocolError { status: u16, body: String },

    /// The management API could not be reached
    #[error("failure to call the management api: {0}")]
    HttpRequestError(String),

    /// `start` was called on a consumer that is already subscribed
    #[error("consumer already started")]
    AlreadyStartedError,

    /// A required argument was empty or malformed
    #[error("invalid argument `{0}`")]
    InvalidArgumentError(String),

    /// A processor failed while handling a message
    #[error("failure to process message: {0}")]
    ProcessingError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),
}
