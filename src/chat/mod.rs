/// Family chat
///
/// Messages are persisted through the KV store and fanned out to the
/// family's live WebSocket connections by the connection hub. Members with
/// no live connection are handed to the push queue.
///
/// # Protocol
///
/// Every frame is a JSON object `{type, payload, timestamp}`:
/// - `new_message`: `{message}`
/// - `delete_message`: `{message_id, user_id}`
/// - `user_typing`: `{user_id, user_name, is_typing}`
/// - `user_online` / `user_offline`: `{user_id, user_name, is_online}`
/// - `heartbeat`: `"ping"` / `"pong"`
/// - `error`: a message string

pub mod connection;
pub mod hub;
pub mod service;

pub use hub::{Client, Hub};
pub use service::ChatService;

use crate::error::{AppError, AppResult};
use crate::store::codec::{CodecError, Packer, Unpacker};
use crate::store::{tables, Record};
use chrono::{DateTime, Utc};
use redb::TableDefinition;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Longest accepted message, in characters
pub const MAX_CONTENT_CHARS: usize = 1000;

/// A persisted chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: u64,
    pub family_id: u64,
    pub user_id: u64,
    /// Author display name at send time
    pub user_name: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    /// Opaque idempotency id chosen by the client
    pub client_id: String,
}

impl Record for ChatMessage {
    const BUCKET: TableDefinition<'static, u64, &'static [u8]> = tables::CHAT_MESSAGES;

    fn id(&self) -> u64 {
        self.id
    }

    fn pack(&self) -> Vec<u8> {
        let mut p = Packer::new(1);
        p.u64(self.id)
            .u64(self.family_id)
            .u64(self.user_id)
            .str(&self.user_name)
            .str(&self.content)
            .time(self.created_at)
            .str(&self.client_id);
        p.finish()
    }

    fn unpack(buf: &[u8]) -> Result<Self, CodecError> {
        let (mut u, _) = Unpacker::new("chat_message", buf, &[1])?;
        Ok(Self {
            id: u.u64()?,
            family_id: u.u64()?,
            user_id: u.u64()?,
            user_name: u.str()?,
            content: u.str()?,
            created_at: u.time()?,
            client_id: u.str()?,
        })
    }
}

/// Trim and check message content
pub fn validate_content(content: &str) -> AppResult<String> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(AppError::Validation("Message content cannot be empty".to_string()));
    }
    if trimmed.chars().count() > MAX_CONTENT_CHARS {
        return Err(AppError::Validation(format!(
            "Message content exceeds {} characters",
            MAX_CONTENT_CHARS
        )));
    }
    Ok(trimmed.to_string())
}

/// Presence change payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Presence {
    pub user_id: u64,
    pub user_name: String,
    pub is_online: bool,
}

/// Frame body, tagged by `type` with its `payload`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum FrameKind {
    NewMessage {
        message: ChatMessage,
    },
    DeleteMessage {
        message_id: u64,
        user_id: u64,
    },
    UserTyping {
        user_id: u64,
        user_name: String,
        is_typing: bool,
    },
    UserOnline(Presence),
    UserOffline(Presence),
    Heartbeat(String),
    Error(String),
}

/// A server frame
#[derive(Debug, Clone, Serialize)]
pub struct Frame {
    #[serde(flatten)]
    pub kind: FrameKind,
    pub timestamp: DateTime<Utc>,
}

impl Frame {
    pub fn new(kind: FrameKind) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
        }
    }

    /// Serialized text, shared by every connection it is sent to
    pub fn encode(&self) -> AppResult<Arc<str>> {
        serde_json::to_string(self)
            .map(Arc::from)
            .map_err(|e| AppError::Internal(format!("Failed to encode frame: {}", e)))
    }
}

/// A client frame. Only the tag is required; payloads are read per tag.
#[derive(Debug, Deserialize)]
pub struct InboundFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validate_content() {
        assert_eq!(validate_content("  hello family \n").unwrap(), "hello family");
        assert!(matches!(validate_content("   "), Err(AppError::Validation(_))));
        assert!(validate_content(&"é".repeat(1000)).is_ok());
        assert!(matches!(
            validate_content(&"a".repeat(1001)),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn test_frame_shape() {
        let frame = Frame::new(FrameKind::DeleteMessage {
            message_id: 5,
            user_id: 10,
        });
        let value: serde_json::Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();

        assert_eq!(value["type"], "delete_message");
        assert_eq!(value["payload"], json!({"message_id": 5, "user_id": 10}));
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn test_presence_and_heartbeat_frames() {
        let online = Frame::new(FrameKind::UserOnline(Presence {
            user_id: 10,
            user_name: "Ada".into(),
            is_online: true,
        }));
        let value: serde_json::Value = serde_json::from_str(&online.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "user_online");
        assert_eq!(value["payload"]["is_online"], true);

        let pong = Frame::new(FrameKind::Heartbeat("pong".into()));
        let value: serde_json::Value = serde_json::from_str(&pong.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "heartbeat");
        assert_eq!(value["payload"], "pong");
    }

    #[test]
    fn test_inbound_frame_without_payload() {
        let frame: InboundFrame = serde_json::from_str(r#"{"type":"heartbeat"}"#).unwrap();
        assert_eq!(frame.kind, "heartbeat");
        assert!(frame.payload.is_null());
    }

    #[test]
    fn test_message_record_roundtrip_keeps_client_id() {
        let message = ChatMessage {
            id: 1,
            family_id: 7,
            user_id: 10,
            user_name: "Ada".into(),
            content: "hello family".into(),
            created_at: DateTime::from_timestamp_millis(1_700_000_000_000).unwrap(),
            client_id: "c-1".into(),
        };
        assert_eq!(ChatMessage::unpack(&message.pack()).unwrap(), message);
    }
}
