use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Internal fan-out event, one variant per server-pushed frame. Serialized
/// (tagged) when it crosses the redis channel between processes; `to_wire`
/// is the shape clients actually see.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GroupEvent {
    ChatMessage {
        message: String,
        sender_id: i64,
        sender_username: String,
        timestamp: String,
        message_id: i64,
    },
    ReadReceipt {
        message_id: i64,
        reader_id: i64,
    },
    Notify {
        payload: Value,
    },
}

impl GroupEvent {
    pub fn to_wire(&self) -> String {
        let frame = match self {
            GroupEvent::ChatMessage {
                message,
                sender_id,
                sender_username,
                timestamp,
                message_id,
            } => json!({
                "message": message,
                "sender_id": sender_id,
                "sender_username": sender_username,
                "timestamp": timestamp,
                "message_id": message_id,
            }),
            GroupEvent::ReadReceipt { message_id, reader_id } => json!({
                "event": "read",
                "message_id": message_id,
                "reader_id": reader_id,
            }),
            // Notifications are relayed verbatim.
            GroupEvent::Notify { payload } => payload.clone(),
        };
        frame.to_string()
    }
}
