//! Error types for the server core and its transport boundary

use shared::{DecodeError, MapError};
use thiserror::Error;

/// Failures of World Model operations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorldError {
    #[error("player not found: {0}")]
    NotFound(String),
    #[error("player already exists: {0}")]
    AlreadyExists(String),
    #[error("cell ({x}, {y}) is occupied")]
    Occupied { x: i64, y: i64 },
    #[error("cell ({x}, {y}) is outside the map")]
    OutOfBounds { x: i64, y: i64 },
}

/// Failures of Session Registry operations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session already registered: {0}")]
    AlreadyRegistered(String),
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("session closed: {0}")]
    Closed(String),
    #[error("session outbound buffer full: {0}")]
    Full(String),
}

/// The delivery routine is gone and can no longer accept events
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BroadcastError {
    #[error("event broadcaster has shut down")]
    Closed,
}

/// Errors surfaced to a single offending connection
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("command received before registration")]
    NotRegistered,
    #[error("register requires a non-empty id")]
    MissingIdentity,
    #[error("connection is already registered as {0}")]
    AlreadyRegistered(String),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("client did not negotiate the required subprotocol")]
    SubprotocolMismatch,
}

/// Errors that stop the server or abort startup
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Map(#[from] MapError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}
