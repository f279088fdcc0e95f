//! JSON wire protocol spoken over the WebSocket.
//!
//! Every client frame is a [`ClientMessage`] and gets exactly one
//! [`ServerMessage::Response`] with the same `requestId`. Operations other
//! connections resolved arrive unprompted as [`ServerMessage::Broadcast`].
//! A successful mutation is answered in the order operations were applied,
//! so a client that applies its own operation on the response stays in step
//! with everyone.
//!
//! ```json
//! → {"requestId": 3, "document": {"kind": "entries"},
//!    "request": {"op": "add", "node": {"name": "main", "type": "script"}}}
//! ← {"type": "response", "requestId": 3, "error": null, "result": 0}
//! ```

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use supersync_core::{ManifestRequest, TreeRequest};
use thiserror::Error;
use uuid::Uuid;

/// Identifies one WebSocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn:{}", self.0)
    }
}

/// A document hosted by the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "camelCase")]
pub enum DocumentId {
    Manifest,
    Entries,
    Room(String),
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentId::Manifest => write!(f, "manifest"),
            DocumentId::Entries => write!(f, "entries"),
            DocumentId::Room(id) => write!(f, "room:{}", id),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMessage {
    pub request_id: u64,
    pub document: DocumentId,
    /// Parsed separately so a malformed request still gets a response
    pub request: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum ControlRequest {
    /// Start receiving broadcasts; joins the roster for rooms
    Subscribe,
    Unsubscribe,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum RoomAction {
    AppendMessage { text: String },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ClientRequest {
    Control(ControlRequest),
    Tree(TreeRequest),
    /// Tried after trees, whose `setProperty` also names a node id
    Manifest(ManifestRequest),
    Room(RoomAction),
}

impl ClientRequest {
    pub fn parse(value: Value) -> Result<Self, ProtocolError> {
        serde_json::from_value(value).map_err(|_| ProtocolError::UnknownRequest)
    }

    /// Whether this request changes a document.
    pub fn is_mutation(&self) -> bool {
        !matches!(self, ClientRequest::Control(_))
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Welcome {
        connection_id: ConnectionId,
        username: String,
    },
    Response {
        request_id: u64,
        error: Option<String>,
        result: Option<Value>,
    },
    Broadcast {
        document: DocumentId,
        operation: Value,
    },
}

impl ServerMessage {
    pub fn ok(request_id: u64, result: Option<Value>) -> Self {
        ServerMessage::Response {
            request_id,
            error: None,
            result,
        }
    }

    pub fn err(request_id: u64, error: impl fmt::Display) -> Self {
        ServerMessage::Response {
            request_id,
            error: Some(error.to_string()),
            result: None,
        }
    }
}

fn room_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("valid room id regex"))
}

pub fn is_valid_room_id(id: &str) -> bool {
    room_id_pattern().is_match(id)
}

/// Request failures that never reach a document.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Malformed message")]
    Malformed,

    #[error("Unknown request")]
    UnknownRequest,

    #[error("Request not supported by {0}")]
    Unsupported(DocumentId),

    #[error("Not subscribed to {0}")]
    NotSubscribed(DocumentId),

    #[error("Already subscribed to {0}")]
    AlreadySubscribed(DocumentId),

    #[error("Invalid room id: {0}")]
    InvalidRoomId(String),

    #[error("Too many requests, retry in {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
}
