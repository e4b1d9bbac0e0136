//! Error types for the relay.

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the relay to its callers and on turn streams.
#[derive(Error, Debug)]
pub enum RelayError {
    /// The connection did not open within the configured timeout.
    #[error("timed out after {0:?} waiting for the connection to open")]
    ConnectTimeout(Duration),

    /// A WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),

    /// A JSON serialization error on the outbound path.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// An inbound frame could not be decoded.
    #[error("invalid frame: {0}")]
    Frame(#[from] FrameError),

    /// The backend closed the connection while a turn was streaming.
    #[error("connection closed unexpectedly: {0}")]
    ConnectionLost(String),

    /// The upgrade request could not be built.
    #[error("invalid connection request: {0}")]
    InvalidRequest(String),

    /// The connection task is gone.
    #[error("relay connection is not open")]
    NotConnected,
}

impl From<tokio_tungstenite::tungstenite::Error> for RelayError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}

/// Reasons a single inbound frame failed to parse.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("empty frame payload")]
    Empty,
    #[error("malformed JSON payload: {0}")]
    Json(String),
    #[error("frame payload is not a JSON object")]
    NotAnObject,
    #[error("unrecognized event: {0}")]
    Event(String),
}

/// The current turn's sink was already closed.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("turn sink already closed")]
pub struct SinkClosed;

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
