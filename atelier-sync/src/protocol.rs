//! Wire protocol for workspace synchronization.
//!
//! Every frame is one JSON object carrying a `type` field that names the
//! event category, e.g.:
//!
//! ```text
//! {"type":"cursor:move","projectId":"p1","fileId":"f1","position":{"line":3,"column":9}}
//! ```
//!
//! Outbound and inbound directions are separate enums: [`ClientEvent`] is
//! what this client emits, [`ServerEvent`] is what arrives off the wire.
//! Inbound presence/cursor events additionally carry the originating
//! `userId`/`username`, which the server stamps on fan-out.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event categories the router dispatches on.
///
/// Each inbound event maps to exactly one category; subscribers register
/// per category. `auth_error` has no category — it is consumed by the
/// session itself, never routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventCategory {
    File,
    Chat,
    Presence,
    Cursor,
    Notification,
}

impl EventCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Chat => "chat",
            Self::Presence => "presence",
            Self::Cursor => "cursor",
            Self::Notification => "notification",
        }
    }
}

impl std::fmt::Display for EventCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A cursor location inside a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub line: u32,
    pub column: u32,
}

impl CursorPosition {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

/// Who authored a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    User,
    Assistant,
    System,
}

/// A chat message in the ordered conversation sequence.
///
/// Confirmed messages carry server-assigned ids; optimistic placeholders
/// carry locally generated ids until the round trip resolves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub kind: MessageKind,
    pub author: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

/// Full file record delivered on `file:created`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub id: String,
    pub name: String,
    pub content: String,
    pub project_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Events emitted by this client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    #[serde(rename = "project:join")]
    ProjectJoin { project_id: String },

    #[serde(rename = "project:leave")]
    ProjectLeave { project_id: String },

    #[serde(rename = "file:update")]
    FileUpdate {
        file_id: String,
        content: String,
        project_id: String,
    },

    #[serde(rename = "chat:typing")]
    ChatTyping { project_id: String, is_typing: bool },

    #[serde(rename = "user:typing")]
    UserTyping {
        project_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        file_id: Option<String>,
        is_typing: bool,
    },

    #[serde(rename = "cursor:move")]
    CursorMove {
        project_id: String,
        file_id: String,
        position: CursorPosition,
    },
}

/// Events arriving from the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    #[serde(rename = "file:updated")]
    FileUpdated {
        file_id: String,
        content: String,
        user_id: String,
    },

    #[serde(rename = "file:created")]
    FileCreated(FileRecord),

    #[serde(rename = "file:deleted")]
    FileDeleted { file_id: String },

    #[serde(rename = "chat:message")]
    ChatMessage(ChatMessage),

    #[serde(rename = "user:typing")]
    UserTyping {
        project_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        file_id: Option<String>,
        is_typing: bool,
        user_id: String,
        username: String,
    },

    #[serde(rename = "cursor:move")]
    CursorMove {
        project_id: String,
        file_id: String,
        position: CursorPosition,
        user_id: String,
        username: String,
    },

    #[serde(rename = "user:joined")]
    UserJoined {
        id: String,
        username: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        avatar: Option<String>,
    },

    #[serde(rename = "user:left")]
    UserLeft { user_id: String },

    #[serde(rename = "notification")]
    Notification {
        kind: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },

    #[serde(rename = "auth_error")]
    AuthError {
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl ClientEvent {
    /// Serialize to a wire frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

impl ServerEvent {
    /// Parse a wire frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    /// Serialize to a wire frame (used by test servers).
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// The routing category for this event, or `None` for events the
    /// session consumes itself (`auth_error`).
    pub fn category(&self) -> Option<EventCategory> {
        match self {
            Self::FileUpdated { .. } | Self::FileCreated(_) | Self::FileDeleted { .. } => {
                Some(EventCategory::File)
            }
            Self::ChatMessage(_) => Some(EventCategory::Chat),
            Self::UserTyping { .. } | Self::UserJoined { .. } | Self::UserLeft { .. } => {
                Some(EventCategory::Presence)
            }
            Self::CursorMove { .. } => Some(EventCategory::Cursor),
            Self::Notification { .. } => Some(EventCategory::Notification),
            Self::AuthError { .. } => None,
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Serialization(String),
    Deserialization(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "Serialization error: {e}"),
            Self::Deserialization(e) => write!(f, "Deserialization error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}
