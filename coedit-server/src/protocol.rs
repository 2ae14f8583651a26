//! JSON wire protocol for the two message families sharing a room.
//!
//! Every frame is a UTF-8 JSON object discriminated by its `type` field:
//! ```text
//! legacy  ─ {"type": insert|delete|cursor|join|leave,
//!            "content", "position", "user_id", "timestamp"}
//!
//! collab  ─ {"type": pull|push|version|updates,
//!            "version", "updates": [{"version","changes","clientID"}],
//!            "content", "user_id"}
//! ```
//!
//! Clients only originate `pull`/`push` on the collab side; `version` and
//! `updates` are produced by the server. A frame that is not a valid client
//! collab request falls back to the legacy schema (see [`route_frame`]).

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Identity stamped on server-originated collab frames.
pub const SERVER_ID: &str = "server";

/// Legacy (positional) message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Splice `content` in at `position`
    Insert,
    /// Remove `len(content)` characters starting at `position`
    Delete,
    /// Cursor position relay, never mutates the document
    Cursor,
    /// Join acknowledgment carrying the assigned identity
    Join,
    /// Departure notice
    Leave,
}

/// A legacy stream message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    #[serde(default)]
    pub content: String,
    /// Character offset into the document (may be out of range, the room clamps it)
    #[serde(default)]
    pub position: i64,
    #[serde(default)]
    pub user_id: String,
    /// Unix timestamp in nanoseconds
    #[serde(default)]
    pub timestamp: i64,
}

impl Message {
    /// Create a message stamped with the current time.
    pub fn new(
        msg_type: MessageType,
        content: impl Into<String>,
        position: i64,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            msg_type,
            content: content.into(),
            position,
            user_id: user_id.into(),
            timestamp: now_nanos(),
        }
    }

    /// Join acknowledgment: the assigned identity travels in both `content` and `user_id`.
    pub fn join(client_id: &str) -> Self {
        Self::new(MessageType::Join, client_id, 0, client_id)
    }

    /// Departure notice for the given identity.
    pub fn leave(client_id: &str) -> Self {
        Self::new(MessageType::Leave, "", 0, client_id)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    /// Parse and validate a legacy frame. `type` and `user_id` are required.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let msg: Self = serde_json::from_str(text).map_err(ProtocolError::Decode)?;
        if msg.user_id.is_empty() {
            return Err(ProtocolError::MissingField("user_id"));
        }
        Ok(msg)
    }
}

/// Collab (version log) message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollabType {
    /// Client asks for every update since `version`
    Pull,
    /// Client submits `updates` based on `version`
    Push,
    /// Server snapshot sent at join time
    Version,
    /// Server batch of log entries
    Updates,
}

/// One accepted (or proposed) entry of the change log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollabUpdate {
    #[serde(default)]
    pub version: u64,
    /// Opaque serialized change set, never interpreted by the server
    #[serde(default)]
    pub changes: String,
    #[serde(rename = "clientID", default)]
    pub client_id: String,
}

impl CollabUpdate {
    pub fn new(changes: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            version: 0,
            changes: changes.into(),
            client_id: client_id.into(),
        }
    }
}

/// A collab stream message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollabMessage {
    #[serde(rename = "type")]
    pub msg_type: CollabType,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub version: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub updates: Vec<CollabUpdate>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content: String,
    #[serde(default)]
    pub user_id: String,
}

impl CollabMessage {
    /// Pull request for every update since `version`.
    pub fn pull(version: u64, user_id: impl Into<String>) -> Self {
        Self {
            msg_type: CollabType::Pull,
            version,
            updates: Vec::new(),
            content: String::new(),
            user_id: user_id.into(),
        }
    }

    /// Push of `updates` based on `version`.
    pub fn push(version: u64, updates: Vec<CollabUpdate>, user_id: impl Into<String>) -> Self {
        Self {
            msg_type: CollabType::Push,
            version,
            updates,
            content: String::new(),
            user_id: user_id.into(),
        }
    }

    /// Join-time snapshot of the room.
    pub fn version(version: u64, content: impl Into<String>) -> Self {
        Self {
            msg_type: CollabType::Version,
            version,
            updates: Vec::new(),
            content: content.into(),
            user_id: SERVER_ID.to_string(),
        }
    }

    /// Batch of log entries, tagged with the room's current version.
    pub fn updates(version: u64, updates: Vec<CollabUpdate>) -> Self {
        Self {
            msg_type: CollabType::Updates,
            version,
            updates,
            content: String::new(),
            user_id: SERVER_ID.to_string(),
        }
    }

    /// Whether this is a request a client may originate.
    pub fn is_client_request(&self) -> bool {
        matches!(self.msg_type, CollabType::Pull | CollabType::Push)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    /// Parse and validate a collab frame. `type` and `user_id` are required.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let msg: Self = serde_json::from_str(text).map_err(ProtocolError::Decode)?;
        if msg.user_id.is_empty() {
            return Err(ProtocolError::MissingField("user_id"));
        }
        Ok(msg)
    }
}

/// A decoded inbound frame, ready for the room stream it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Collab(CollabMessage),
    Legacy(Message),
}

/// Route a client frame to its stream.
///
/// Collab decoding is tried first and only wins for `pull`/`push`; anything
/// else must parse as a legacy message. Server-only collab types sent by a
/// client therefore fail both and are rejected.
pub fn route_frame(text: &str) -> Result<Inbound, ProtocolError> {
    if let Ok(msg) = CollabMessage::decode(text) {
        if msg.is_client_request() {
            return Ok(Inbound::Collab(msg));
        }
    }
    Message::decode(text).map(Inbound::Legacy)
}

/// Protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Deserialization error: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("Invalid message: missing required field '{0}'")]
    MissingField(&'static str),
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}
