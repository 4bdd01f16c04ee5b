// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Serialization
//!
//! This module converts messages to and from the bytes carried by the broker.
//!
//! `JsonSerializer` writes a PascalCase JSON envelope. Custom parameters are written
//! in their legacy shape, a list of `key=value` strings under `items`, which older
//! consumers on the same queues still expect.

use crate::{
    errors::AmqpError,
    message::{Message, MessageType},
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::error;
use uuid::Uuid;

/// Converts messages to and from bytes.
pub trait Serializer: Send + Sync {
    fn serialize(&self, message: &Message) -> Result<Vec<u8>, AmqpError>;

    /// Decodes `data` as a message of kind `message_type`.
    fn deserialize(&self, message_type: &MessageType, data: &[u8]) -> Result<Message, AmqpError>;
}

/// JSON implementation of the `Serializer` trait.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Envelope {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    headers: Option<HashMap<String, Value>>,
    #[serde(default)]
    operation_id: Option<String>,
    #[serde(default)]
    parent_operation_id: Option<String>,
    #[serde(default)]
    main_operation_id: Option<String>,
    #[serde(default)]
    custom_params: Option<CustomParams>,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    reply_queue: Option<String>,
    #[serde(default)]
    reply_to: Option<String>,
    #[serde(flatten)]
    body: Map<String, Value>,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum CustomParams {
    Legacy { items: Vec<String> },
    Map(HashMap<String, String>),
}

impl CustomParams {
    fn from_map(params: &HashMap<String, String>) -> CustomParams {
        CustomParams::Legacy {
            items: params.iter().map(|(k, v)| format!("{}={}", k, v)).collect(),
        }
    }

    fn into_map(self) -> HashMap<String, String> {
        match self {
            CustomParams::Map(map) => map,
            CustomParams::Legacy { items } => items
                .into_iter()
                .map(|item| match item.split_once('=') {
                    Some((key, value)) => (key.to_owned(), value.to_owned()),
                    None => (item, String::new()),
                })
                .collect(),
        }
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_owned())
}

impl Serializer for JsonSerializer {
    fn serialize(&self, message: &Message) -> Result<Vec<u8>, AmqpError> {
        let envelope = Envelope {
            id: non_empty(&message.id),
            headers: Some(message.headers.clone()),
            operation_id: Some(message.operation_id.clone()),
            parent_operation_id: Some(message.parent_operation_id.clone()),
            main_operation_id: Some(message.main_operation_id.clone()),
            custom_params: Some(CustomParams::from_map(&message.custom_params)),
            user_id: non_empty(&message.user_id),
            token: non_empty(&message.token),
            reply_queue: non_empty(&message.reply_queue),
            reply_to: non_empty(&message.reply_to),
            body: message.body.clone(),
        };

        serde_json::to_vec(&envelope).map_err(|err| {
            error!(error = err.to_string(), "failure to serialize message");
            AmqpError::SerializationError(err.to_string())
        })
    }

    fn deserialize(&self, message_type: &MessageType, data: &[u8]) -> Result<Message, AmqpError> {
        let envelope: Envelope = serde_json::from_slice(data).map_err(|err| {
            error!(error = err.to_string(), "failure to parse payload");
            AmqpError::ParsePayloadError(err.to_string())
        })?;

        message_type.check(&envelope.body).map_err(|err| {
            error!(
                error = err.to_string(),
                msg_type = message_type.name(),
                "payload does not match message type"
            );
            AmqpError::ParsePayloadError(err.to_string())
        })?;

        let operation_id = envelope
            .operation_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Ok(Message {
            id: envelope.id.unwrap_or_default(),
            headers: envelope.headers.unwrap_or_default(),
            parent_operation_id: envelope
                .parent_operation_id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| operation_id.clone()),
            main_operation_id: envelope
                .main_operation_id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| operation_id.clone()),
            operation_id,
            custom_params: envelope
                .custom_params
                .map(CustomParams::into_map)
                .unwrap_or_default(),
            user_id: envelope.user_id.unwrap_or_default(),
            token: envelope.token.unwrap_or_default(),
            reply_queue: envelope.reply_queue.unwrap_or_default(),
            reply_to: envelope.reply_to.unwrap_or_default(),
            body: envelope.body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Deserialize)]
    struct User {
        #[serde(rename = "userName")]
        _user_name: String,
    }

    #[test]
    fn custom_params_are_written_as_legacy_items() {
        let mut msg = Message::new();
        msg.custom_params.insert("tenant".to_owned(), "acme".to_owned());

        let value: Value = serde_json::from_slice(&JsonSerializer.serialize(&msg).unwrap()).unwrap();

        assert_eq!(value["CustomParams"], json!({ "items": ["tenant=acme"] }));
        assert_eq!(value["OperationId"], json!(msg.operation_id));
    }

    #[test]
    fn legacy_items_are_read_into_a_map() {
        let data = br#"{"OperationId":"op","CustomParams":{"items":["a=1=2","flag"]}}"#;

        let msg = JsonSerializer
            .deserialize(&MessageType::untyped(), data)
            .unwrap();

        assert_eq!(msg.custom_params["a"], "1=2");
        assert_eq!(msg.custom_params["flag"], "");
        assert_eq!(msg.operation_id, "op");
        assert_eq!(msg.main_operation_id, "op");
    }

    #[test]
    fn plain_custom_params_object_is_accepted() {
        let data = br#"{"CustomParams":{"tenant":"acme"}}"#;

        let msg = JsonSerializer
            .deserialize(&MessageType::untyped(), data)
            .unwrap();

        assert_eq!(msg.custom_params["tenant"], "acme");
        assert!(!msg.operation_id.is_empty());
    }

    #[test]
    fn body_fields_survive_the_envelope() {
        let msg = Message::new()
            .with_body(&json!({ "userName": "ana" }))
            .unwrap();

        let bytes = JsonSerializer.serialize(&msg).unwrap();
        let back = JsonSerializer
            .deserialize(&MessageType::of::<User>(), &bytes)
            .unwrap();

        assert_eq!(back.body["userName"], json!("ana"));
        assert_eq!(back.operation_id, msg.operation_id);
    }

    #[test]
    fn payload_of_another_type_is_rejected() {
        let err = JsonSerializer
            .deserialize(&MessageType::of::<User>(), br#"{"OperationId":"op"}"#)
            .unwrap_err();

        assert!(matches!(err, AmqpError::ParsePayloadError(_)));
    }

    #[test]
    fn invalid_json_is_rejected() {
        let err = JsonSerializer
            .deserialize(&MessageType::untyped(), b"not json")
            .unwrap_err();

        assert!(matches!(err, AmqpError::ParsePayloadError(_)));
    }
}
