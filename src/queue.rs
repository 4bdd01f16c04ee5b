// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Attributes
//!
//! This module provides `QueueInfo`, the declared attributes of a RabbitMQ queue as
//! reported by the management API and used when the queue is declared.
//!
//! The queue priority is never transmitted as its own field: it travels inside the
//! queue arguments under `x-max-priority`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Constant for the argument used to specify the maximum queue priority
pub const AMQP_ARGS_MAX_PRIORITY: &str = "x-max-priority";

/// Declared attributes of a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "QueueInfoRepr", into = "QueueInfoRepr")]
pub struct QueueInfo {
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
    pub priority: i64,
    pub arguments: Map<String, Value>,
}

impl Default for QueueInfo {
    /// Attributes of a queue that was never customized on the broker.
    fn default() -> Self {
        QueueInfo {
            durable: true,
            auto_delete: false,
            exclusive: false,
            priority: 0,
            arguments: Map::default(),
        }
    }
}

impl QueueInfo {
    /// Attributes of a server-named request-reply queue.
    pub fn reply_queue() -> QueueInfo {
        QueueInfo {
            durable: false,
            auto_delete: true,
            exclusive: true,
            priority: 0,
            arguments: Map::default(),
        }
    }

    /// Sets the maximum priority supported by the queue.
    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Adds a single argument to the queue.
    pub fn argument(mut self, key: &str, value: Value) -> Self {
        self.arguments.insert(key.to_owned(), value);
        self
    }

    /// Arguments sent with the queue declaration.
    ///
    /// `x-max-priority` is present iff the priority is positive.
    pub fn declare_arguments(&self) -> Map<String, Value> {
        let mut args = self.arguments.clone();
        if self.priority > 0 {
            args.insert(AMQP_ARGS_MAX_PRIORITY.to_owned(), Value::from(self.priority));
        } else {
            args.remove(AMQP_ARGS_MAX_PRIORITY);
        }
        args
    }
}

/// Shape of a queue in the management API.
#[derive(Serialize, Deserialize)]
struct QueueInfoRepr {
    #[serde(default)]
    durable: bool,
    #[serde(default)]
    auto_delete: bool,
    #[serde(default)]
    exclusive: bool,
    #[serde(default)]
    arguments: Map<String, Value>,
}

impl From<QueueInfoRepr> for QueueInfo {
    fn from(repr: QueueInfoRepr) -> Self {
        let priority = repr
            .arguments
            .get(AMQP_ARGS_MAX_PRIORITY)
            .and_then(|value| match value {
                Value::Number(n) => n.as_i64(),
                Value::String(s) => s.parse().ok(),
                _ => None,
            })
            .unwrap_or_default();

        QueueInfo {
            durable: repr.durable,
            auto_delete: repr.auto_delete,
            exclusive: repr.exclusive,
            priority,
            arguments: repr.arguments,
        }
    }
}

impl From<QueueInfo> for QueueInfoRepr {
    fn from(info: QueueInfo) -> Self {
        QueueInfoRepr {
            arguments: info.declare_arguments(),
            durable: info.durable,
            auto_delete: info.auto_delete,
            exclusive: info.exclusive,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn priority_travels_inside_arguments() {
        let info = QueueInfo::default().priority(5);

        let value = serde_json::to_value(&info).unwrap();
        assert_eq!(value["arguments"][AMQP_ARGS_MAX_PRIORITY], json!(5));
        assert!(value.get("priority").is_none());

        let back: QueueInfo = serde_json::from_value(value).unwrap();
        assert_eq!(back.priority, 5);
    }

    #[test]
    fn missing_priority_argument_means_zero() {
        let info: QueueInfo = serde_json::from_str(
            r#"{"durable":false,"auto_delete":true,"exclusive":false,"arguments":{"x-message-ttl":1000}}"#,
        )
        .unwrap();

        assert_eq!(info.priority, 0);
        assert!(!info.durable);
        assert!(info.auto_delete);
        assert_eq!(info.arguments["x-message-ttl"], json!(1000));
    }

    #[test]
    fn zero_priority_is_not_declared() {
        let info = QueueInfo::default().argument(AMQP_ARGS_MAX_PRIORITY, json!(3)).priority(0);

        assert!(!info.declare_arguments().contains_key(AMQP_ARGS_MAX_PRIORITY));
    }

    #[test]
    fn default_queue_is_durable_and_shared() {
        let info = QueueInfo::default();

        assert!(info.durable);
        assert!(!info.auto_delete);
        assert!(!info.exclusive);
        assert_eq!(info.priority, 0);
    }
}
