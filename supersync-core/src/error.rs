//! Error types for replicated documents

use thiserror::Error;

use crate::schema::Violation;

/// A request that was refused by an authoritative replica.
///
/// These are routine: clients send stale ids and bad values all the time.
/// The `Display` text is what gets reported back to the requester.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RequestError {
    #[error("Found unexpected id key")]
    UnexpectedId,

    #[error("Invalid parent id: {0}")]
    InvalidParent(String),

    #[error("Invalid node id: {0}")]
    UnknownNode(String),

    #[error("Node id already exists: {0}")]
    DuplicateId(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Missing key: {0}")]
    MissingKey(String),

    #[error("Invalid value for {key}: {violation}")]
    InvalidValue { key: String, violation: Violation },

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Cannot move node {0} inside itself")]
    Cycle(String),

    #[error("There's already an entry with this name in this folder")]
    NameCollision(String),

    #[error("Your message was too long")]
    MessageTooLong,

    #[error("Unknown user: {0}")]
    UnknownUser(String),

    #[error("Document is not ready")]
    NotReady,
}

/// A resolved operation that a replica could not apply.
///
/// Resolved operations come from the authoritative side and are supposed to
/// apply cleanly. Hitting one of these means the transport or protocol
/// delivered something corrupt, and the mirror has diverged.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ApplyError {
    #[error("unknown node {0}")]
    UnknownNode(String),

    #[error("node {0} is already present")]
    DuplicateNode(String),

    #[error("parent {0} does not exist or is not a group")]
    InvalidParent(String),

    #[error("index {index} out of bounds for {len} siblings")]
    IndexOutOfBounds { index: usize, len: usize },

    #[error("malformed operation: {0}")]
    Malformed(String),

    #[error("path {0} does not resolve to an object")]
    InvalidPath(String),
}

/// Backing-store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode or decode JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),
}

/// A persisted document that does not have the expected shape.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LoadError {
    #[error("Expected {expected} at {path}")]
    Shape { path: String, expected: &'static str },

    #[error("Duplicate node id in stored document: {0}")]
    DuplicateId(String),

    #[error("Invalid stored document: {0}")]
    Invalid(Violation),

    #[error("Unsupported format version {found} (this build reads up to {supported})")]
    FormatVersion { found: u64, supported: u64 },
}

/// Top-level error
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Request(#[from] RequestError),

    #[error("Replica diverged: {0}")]
    Apply(#[from] ApplyError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Failed to load document: {0}")]
    Load(#[from] LoadError),
}

impl Error {
    /// The request error, if this is one.
    pub fn as_request(&self) -> Option<&RequestError> {
        match self {
            Error::Request(err) => Some(err),
            _ => None,
        }
    }

    /// Whether the in-memory document can still be trusted.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Request(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
