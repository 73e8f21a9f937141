//! WebSocket message types: envelope and commands.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Top-level WebSocket message envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsMessage {
    /// Client-provided ID for requests; server-generated for events.
    pub id: String,
    /// Message type discriminator.
    #[serde(rename = "type")]
    pub msg_type: WsMessageType,
    /// ISO-8601 timestamp.
    pub timestamp: DateTime<Utc>,
    /// Variant-specific payload.
    pub payload: serde_json::Value,
}

impl WsMessage {
    /// Builds a server message stamped with the current time.
    #[must_use]
    pub fn new(id: String, msg_type: WsMessageType, payload: serde_json::Value) -> Self {
        Self {
            id,
            msg_type,
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Builds an error reply.
    #[must_use]
    pub fn error(id: String, code: u16, message: &str) -> Self {
        Self::new(
            id,
            WsMessageType::Error,
            serde_json::json!({ "code": code, "message": message }),
        )
    }
}

/// Discriminator for WebSocket message types.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WsMessageType {
    /// Client → Server command.
    Command,
    /// Server → Client response to a command.
    Response,
    /// Server → Client change notification.
    Event,
    /// Server → Client error.
    Error,
}

/// Commands a client can send in a `command` envelope's payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum WsCommand {
    /// Subscribe to notifications for specific VMs. Use `["*"]` for all.
    Subscribe {
        /// VM ids to subscribe to.
        vm_ids: Vec<String>,
    },
    /// Unsubscribe from specific VMs. `"*"` drops the wildcard.
    Unsubscribe {
        /// VM ids to unsubscribe from.
        vm_ids: Vec<String>,
    },
    /// Fetch one cached VM record.
    GetVm {
        /// Target VM id.
        vm_id: String,
    },
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_command_parses_from_payload() {
        let payload = serde_json::json!({ "command": "subscribe", "vm_ids": ["vm-1", "*"] });
        let Ok(cmd) = serde_json::from_value::<WsCommand>(payload) else {
            panic!("subscribe command rejected");
        };
        assert_eq!(
            cmd,
            WsCommand::Subscribe {
                vm_ids: vec!["vm-1".to_string(), "*".to_string()]
            }
        );
    }

    #[test]
    fn envelope_uses_type_key() {
        let msg = WsMessage::error("req-1".to_string(), 400, "malformed JSON");
        let json = serde_json::to_string(&msg).unwrap_or_default();
        assert!(json.contains("\"type\":\"error\""));
        assert!(json.contains("malformed JSON"));
    }
}
