use crate::channel::Versioned;
use crate::types::RoomId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Requests a remote replica sends to the relay.
///
/// Keys and topics must live under the connection's room (`rooms/{room}/...`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum ClientMessage {
    Read {
        req_id: u64,
        key: String,
    },
    Write {
        req_id: u64,
        key: String,
        value: Value,
    },
    CompareAndSwap {
        req_id: u64,
        key: String,
        expected: Option<u64>,
        value: Value,
    },
    /// Stream durable writes to `key` as `KeyChanged`
    SubscribeKey {
        key: String,
    },
    /// Stream broadcasts on `topic` as `TopicMessage`
    SubscribeTopic {
        topic: String,
    },
    Publish {
        topic: String,
        msg: Value,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome {
        protocol: String,
        room: RoomId,
        /// Server clock in epoch millis, for client-side skew estimation
        server_now: i64,
    },
    Value {
        req_id: u64,
        key: String,
        record: Option<Versioned>,
    },
    Written {
        req_id: u64,
        key: String,
        version: u64,
    },
    Swapped {
        req_id: u64,
        key: String,
        applied: bool,
    },
    Subscribed {
        name: String,
    },
    /// Notifications on subscription `name` were dropped; re-read the key
    Resync {
        name: String,
    },
    KeyChanged {
        key: String,
        value: Value,
    },
    TopicMessage {
        topic: String,
        msg: Value,
    },
    Error {
        code: String,
        msg: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        req_id: Option<u64>,
    },
}

impl ServerMessage {
    pub fn error(code: &str, msg: impl Into<String>, req_id: Option<u64>) -> Self {
        Self::Error {
            code: code.to_string(),
            msg: msg.into(),
            req_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_message_parsing() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "t": "compare_and_swap",
            "req_id": 4,
            "key": "rooms/a/session",
            "expected": null,
            "value": {"run_id": "x"}
        }))
        .unwrap();
        assert!(matches!(
            msg,
            ClientMessage::CompareAndSwap { req_id: 4, expected: None, .. }
        ));
    }

    #[test]
    fn test_error_omits_missing_req_id() {
        let json = serde_json::to_value(ServerMessage::error("PARSE_ERROR", "bad", None)).unwrap();
        assert_eq!(json["t"], "error");
        assert!(json.get("req_id").is_none());
    }
}
