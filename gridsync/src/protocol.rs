//! JSON wire protocol between editors and the sync server.
//!
//! Every socket frame is a JSON text frame:
//! ```text
//! {"type":"INIT","userId":"u1","fileId":"u1_budget"}
//! {"type":"UPDATE","fileId":"u1_budget","isWritePermitted":true,
//!  "updates":[{"row":0,"col":0,"value":"5"}]}
//! [{"row":0,"col":0,"value":"5","fileId":"u1_budget","isWritePermitted":true}]
//! ```
//! The array form is the legacy cell batch; a bare `{row,col,value,...}`
//! object is a legacy batch of one. Unknown `type` values parse as
//! [`ClientMessage::Unknown`] and are ignored by the server.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;

use crate::grid::{Cell, CellUpdate, Matrix};
use crate::registry::ConnectionId;

/// Chat transcripts keep at most this many entries.
pub const CHAT_HISTORY_LIMIT: usize = 100;

/// File identifier some clients send before a file is loaded.
pub const UNDEFINED_FILE_ID: &str = "undefined";

fn one() -> usize {
    1
}

/// Messages sent by editors.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    Init {
        user_id: String,
        file_id: String,
    },
    Update {
        file_id: String,
        sender_id: Option<String>,
        #[serde(default)]
        is_write_permitted: bool,
        updates: Vec<CellUpdate>,
    },
    RowAdd {
        file_id: String,
        sender_id: Option<String>,
        #[serde(default)]
        is_write_permitted: bool,
        #[serde(default = "one")]
        amount: usize,
    },
    ColAdd {
        file_id: String,
        sender_id: Option<String>,
        #[serde(default)]
        is_write_permitted: bool,
        #[serde(default = "one")]
        amount: usize,
    },
    ChatMessage {
        file_id: String,
        sender_id: Option<String>,
        /// Display name; falls back to the sender id.
        sender: Option<String>,
        message: String,
    },
    ChatHistory {
        file_id: String,
    },
    DrawingUpdate {
        file_id: String,
        sender_id: Option<String>,
        scene: Value,
    },
    GetDrawingHistory {
        file_id: String,
    },
    SaveDrawing {
        file_id: String,
    },
    VideoOffer {
        file_id: String,
        sender_id: Option<String>,
    },
    VideoAnswer {
        file_id: String,
        sender_id: Option<String>,
    },
    IceCandidate {
        file_id: String,
        sender_id: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

impl ClientMessage {
    /// Wire name, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Init { .. } => "INIT",
            Self::Update { .. } => "UPDATE",
            Self::RowAdd { .. } => "ROW_ADD",
            Self::ColAdd { .. } => "COL_ADD",
            Self::ChatMessage { .. } => "CHAT_MESSAGE",
            Self::ChatHistory { .. } => "CHAT_HISTORY",
            Self::DrawingUpdate { .. } => "DRAWING_UPDATE",
            Self::GetDrawingHistory { .. } => "GET_DRAWING_HISTORY",
            Self::SaveDrawing { .. } => "SAVE_DRAWING",
            Self::VideoOffer { .. } => "VIDEO_OFFER",
            Self::VideoAnswer { .. } => "VIDEO_ANSWER",
            Self::IceCandidate { .. } => "ICE_CANDIDATE",
            Self::Unknown => "UNKNOWN",
        }
    }
}

/// One element of a legacy cell batch.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellUpdateRecord {
    pub row: usize,
    pub col: usize,
    pub value: Cell,
    pub file_id: Option<String>,
    pub sender_id: Option<String>,
    #[serde(default)]
    pub is_write_permitted: bool,
}

impl CellUpdateRecord {
    pub fn update(&self) -> CellUpdate {
        CellUpdate {
            row: self.row,
            col: self.col,
            value: self.value.clone(),
        }
    }
}

/// A parsed inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Message(ClientMessage),
    /// Legacy array of cell updates.
    Batch(Vec<CellUpdateRecord>),
    /// Legacy untyped single cell update.
    Single(CellUpdateRecord),
}

impl Inbound {
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(raw)?;
        if value.is_array() {
            return Ok(Inbound::Batch(serde_json::from_value(value)?));
        }
        if !value.is_object() {
            return Err(ProtocolError::NotAnObject);
        }
        if value.get("type").is_some() {
            Ok(Inbound::Message(serde_json::from_value(value)?))
        } else {
            Ok(Inbound::Single(serde_json::from_value(value)?))
        }
    }
}

/// One chat transcript record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEntry {
    pub sender: String,
    pub message: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

/// Kind of structural growth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GrowthKind {
    RowAdd,
    ColAdd,
}

/// Broadcast body for structural growth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrowthRecord {
    #[serde(rename = "type")]
    pub kind: GrowthKind,
    pub file_id: String,
    pub sender_id: Option<String>,
    pub start_index: usize,
    pub amount: usize,
}

/// Broadcast body for a chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRecord {
    #[serde(rename = "type")]
    pub kind: String,
    pub file_id: String,
    #[serde(flatten)]
    pub entry: ChatEntry,
}

impl ChatRecord {
    pub fn new(file_id: impl Into<String>, entry: ChatEntry) -> Self {
        Self {
            kind: "CHAT_MESSAGE".to_string(),
            file_id: file_id.into(),
            entry,
        }
    }
}

/// Replies the server sends to a single socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    /// Current grid, sent after a successful INIT.
    Snapshot { file_id: String, data: Matrix },
    ChatHistory {
        file_id: String,
        messages: Vec<ChatEntry>,
    },
    DrawingHistory {
        file_id: String,
        scene: Option<Value>,
    },
    DrawingSaved { file_id: String },
    Error { code: String, message: String },
}

impl ServerMessage {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A payload on the pub/sub bus.
///
/// `body` is the exact text relayed to sockets. `origin` and `sender_id`
/// let each server skip the socket that originated the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub channel: String,
    pub sender_id: Option<String>,
    /// Connection the message came from, when it came from a socket.
    pub origin: Option<ConnectionId>,
    pub body: Arc<str>,
}

impl BusMessage {
    pub fn new(
        channel: impl Into<String>,
        sender_id: Option<String>,
        body: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            channel: channel.into(),
            sender_id,
            origin: None,
            body: body.into(),
        }
    }

    pub fn with_origin(mut self, origin: ConnectionId) -> Self {
        self.origin = Some(origin);
        self
    }

    /// Serialize `body` as JSON.
    pub fn json<T: Serialize>(
        channel: impl Into<String>,
        sender_id: Option<String>,
        body: &T,
    ) -> Result<Self, ProtocolError> {
        let text = serde_json::to_string(body)?;
        Ok(Self::new(channel, sender_id, text))
    }
}

/// Protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message must be a JSON object or array")]
    NotAnObject,
    #[error("binary frames are not supported")]
    BinaryFrame,
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
