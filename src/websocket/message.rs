use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::Message;

use crate::error::WebSocketError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// A client connected.
    #[serde(rename = "login")]
    Join,
    /// A client disconnected.
    #[serde(rename = "exit")]
    Leave,
    /// A client changed its playback state.
    #[serde(rename = "status_update")]
    StatusUpdate,
    /// Asks a client to publish its current playback state.
    #[serde(rename = "send_current_status")]
    RequestCurrentStatus,
}

/// One frame on the wire: `{"Type": ..., "Data": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "Type")]
    pub kind: MessageKind,
    #[serde(rename = "Data")]
    pub payload: Option<String>,
}

impl Envelope {
    pub fn new(kind: MessageKind, payload: Option<String>) -> Self {
        Self { kind, payload }
    }

    pub fn status_update(payload: impl Into<String>) -> Self {
        Self::new(MessageKind::StatusUpdate, Some(payload.into()))
    }

    pub fn request_current_status() -> Self {
        Self::new(MessageKind::RequestCurrentStatus, None)
    }

    pub fn join(notice: &PresenceNotice) -> Result<Self, WebSocketError> {
        Ok(Self::new(MessageKind::Join, Some(notice.to_json()?)))
    }

    pub fn leave(notice: &PresenceNotice) -> Result<Self, WebSocketError> {
        Ok(Self::new(MessageKind::Leave, Some(notice.to_json()?)))
    }

    pub fn to_message(&self) -> Result<Message, WebSocketError> {
        serde_json::to_string(self)
            .map(Message::Text)
            .map_err(|e| WebSocketError::InvalidFormat(format!("Failed to serialize message: {}", e)))
    }
}

/// Point-in-time view of the registry, embedded in join/leave notices.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StatusSnapshot {
    pub last_status_received: Option<String>,
    pub total_connected_clients: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PresenceNotice {
    pub user_name: Option<String>,
    pub time: DateTime<Local>,
    pub current: StatusSnapshot,
}

impl PresenceNotice {
    pub fn new(user_name: Option<String>, current: StatusSnapshot) -> Self {
        Self {
            user_name,
            time: Local::now(),
            current,
        }
    }

    fn to_json(&self) -> Result<String, WebSocketError> {
        serde_json::to_string(self)
            .map_err(|e| WebSocketError::InvalidFormat(format!("Failed to serialize notice: {}", e)))
    }
}
