// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messages
//!
//! This module defines the `Message` envelope exchanged through the broker and the
//! `MessageType` descriptor stored in the queue routing table.
//!
//! A message carries correlation data (the operation id triple), free-form headers and
//! custom parameters, reply addressing, and an open business body made of the extra
//! JSON fields of the concrete message kind.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{collections::HashMap, fmt};
use uuid::Uuid;

/// A unit of work or event exchanged through the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: String,
    pub headers: HashMap<String, Value>,
    pub operation_id: String,
    pub parent_operation_id: String,
    pub main_operation_id: String,
    pub custom_params: HashMap<String, String>,
    pub user_id: String,
    pub token: String,
    /// Logical destination a reply to this message should be sent to.
    pub reply_queue: String,
    /// Transport-level reply queue used for request-reply correlation. Set by the publisher.
    pub reply_to: String,
    /// Business fields of the concrete message kind.
    pub body: Map<String, Value>,
}

impl Default for Message {
    fn default() -> Self {
        Message::new()
    }
}

impl Message {
    /// Creates a root message: its own parent and main operation.
    pub fn new() -> Message {
        let operation_id = Uuid::new_v4().to_string();

        Message {
            id: String::new(),
            headers: HashMap::default(),
            parent_operation_id: operation_id.clone(),
            main_operation_id: operation_id.clone(),
            operation_id,
            custom_params: HashMap::default(),
            user_id: String::new(),
            token: String::new(),
            reply_queue: String::new(),
            reply_to: String::new(),
            body: Map::default(),
        }
    }

    /// Creates a message that continues the operation of `parent`.
    ///
    /// The new message keeps the parent's main operation, points its parent operation
    /// at the parent's operation id and copies the parent's custom parameters and
    /// reply queue.
    pub fn from_parent(parent: &Message) -> Message {
        let mut msg = Message::new();
        msg.main_operation_id = parent.main_operation_id.clone();
        msg.parent_operation_id = parent.operation_id.clone();
        msg.reply_queue = parent.reply_queue.clone();
        msg.custom_params = parent.custom_params.clone();
        msg
    }

    /// Replaces the business body with the serialized fields of `body`.
    ///
    /// `body` must serialize to a JSON object.
    pub fn with_body<T: Serialize>(mut self, body: &T) -> Result<Message, serde_json::Error> {
        self.body = match serde_json::to_value(body)? {
            Value::Object(map) => map,
            other => {
                return Err(serde::ser::Error::custom(format!(
                    "message body must be an object, got `{}`",
                    other
                )))
            }
        };
        Ok(self)
    }

    /// Reads the business body as `T`.
    pub fn body<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.body.clone()))
    }

    /// Builds an [`ErrorMessage`] reply for `parent`.
    pub fn error_reply(
        parent: &Message,
        error: &dyn std::error::Error,
        original_queue: &str,
    ) -> Result<Message, serde_json::Error> {
        let original = serde_json::to_value(&parent.body)?;

        Message::from_parent(parent).with_body(&ErrorMessage {
            message: error.to_string(),
            original_message: Some(original),
            original_queue: original_queue.to_owned(),
        })
    }
}

/// Body of the message sent back to a requester when a processor gives up.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ErrorMessage {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub original_message: Option<Value>,
    #[serde(default)]
    pub original_queue: String,
}

/// Describes the concrete message kind expected on a queue.
///
/// Entries of the routing table. Decoding a payload "as" a message type checks that
/// the business body fits the type.
#[derive(Clone, Copy)]
pub struct MessageType {
    name: &'static str,
    check: fn(&Map<String, Value>) -> Result<(), serde_json::Error>,
}

impl MessageType {
    /// The message type whose body is `T`.
    pub fn of<T: DeserializeOwned + 'static>() -> MessageType {
        MessageType {
            name: std::any::type_name::<T>(),
            check: |body| serde_json::from_value::<T>(Value::Object(body.clone())).map(|_| ()),
        }
    }

    /// Accepts any body.
    pub fn untyped() -> MessageType {
        MessageType {
            name: "untyped",
            check: |_| Ok(()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Checks that `body` can be read as this type.
    pub fn check(&self, body: &Map<String, Value>) -> Result<(), serde_json::Error> {
        (self.check)(body)
    }
}

impl fmt::Debug for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MessageType").field(&self.name).finish()
    }
}

impl PartialEq for MessageType {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for MessageType {}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Order {
        number: u32,
    }

    #[test]
    fn new_message_is_its_own_root() {
        let msg = Message::new();

        assert!(!msg.operation_id.is_empty());
        assert_eq!(msg.parent_operation_id, msg.operation_id);
        assert_eq!(msg.main_operation_id, msg.operation_id);
    }

    #[test]
    fn child_message_continues_parent_operation() {
        let mut parent = Message::from_parent(&Message::new());
        parent.reply_queue = "replies".to_owned();
        parent
            .custom_params
            .insert("tenant".to_owned(), "acme".to_owned());

        let mut child = Message::from_parent(&parent);

        assert_eq!(child.main_operation_id, parent.main_operation_id);
        assert_eq!(child.parent_operation_id, parent.operation_id);
        assert!(!child.operation_id.is_empty());
        assert_ne!(child.operation_id, parent.operation_id);
        assert_eq!(child.reply_queue, "replies");
        assert_eq!(child.custom_params, parent.custom_params);

        child
            .custom_params
            .insert("tenant".to_owned(), "other".to_owned());
        assert_eq!(parent.custom_params["tenant"], "acme");
    }

    #[test]
    fn body_is_read_back_as_its_type() {
        let msg = Message::new().with_body(&Order { number: 7 }).unwrap();

        assert_eq!(msg.body::<Order>().unwrap(), Order { number: 7 });
        assert!(MessageType::of::<Order>().check(&msg.body).is_ok());
    }

    #[test]
    fn scalar_body_is_rejected() {
        assert!(Message::new().with_body(&5).is_err());
    }

    #[test]
    fn message_type_rejects_foreign_body() {
        let mut body = Map::new();
        body.insert("number".to_owned(), Value::from("seven"));

        assert!(MessageType::of::<Order>().check(&body).is_err());
        assert!(MessageType::untyped().check(&body).is_ok());
    }

    #[test]
    fn error_reply_keeps_original_payload() {
        let mut parent = Message::new().with_body(&Order { number: 1 }).unwrap();
        parent.reply_queue = "replies".to_owned();
        let err = std::io::Error::other("boom");

        let reply = Message::error_reply(&parent, &err, "orders").unwrap();
        let body = reply.body::<ErrorMessage>().unwrap();

        assert_eq!(reply.reply_queue, "replies");
        assert_eq!(body.message, "boom");
        assert_eq!(body.original_queue, "orders");
        assert_eq!(body.original_message, Some(serde_json::json!({ "number": 1 })));
    }
}
