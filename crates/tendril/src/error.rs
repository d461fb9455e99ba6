//! Error types for the Tendril library

use std::sync::Arc;
use std::time::Duration;
use tendril_proto::ProtocolError;
use thiserror::Error;

/// Main error type for Tendril operations
///
/// Errors are cloneable so one teardown cause can fail every pending
/// request and still be broadcast as a session event.
#[derive(Debug, Clone, Error)]
pub enum TendrilError {
    /// The transport failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// The session or its connection closed
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// Malformed envelope, frame or descriptor
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The peer's handler replied with an error; carries its message as sent
    #[error("{0}")]
    Remote(String),

    /// Pumping an embedded stream failed
    #[error("Stream pipe error: {0}")]
    StreamPipe(String),

    /// Request timed out waiting for its response
    #[error("Timeout after {duration:?}")]
    Timeout {
        /// Duration that was exceeded
        duration: Duration,
    },

    /// Payload codec failure
    #[error("Codec error: {0}")]
    Codec(String),

    /// Session misuse or internal state errors
    #[error("Session error: {0}")]
    Session(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[source] Arc<std::io::Error>),
}

impl TendrilError {
    /// Whether the error means the connection is gone
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::ConnectionClosed(_))
    }
}

impl From<std::io::Error> for TendrilError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<ProtocolError> for TendrilError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::StreamClosed => Self::ConnectionClosed("stream closed".to_string()),
            ProtocolError::StreamReset(name) => Self::StreamPipe(format!("channel {} reset", name)),
            ProtocolError::Codec(msg) => Self::Codec(msg),
            ProtocolError::Io(e) => Self::from(e),
            other => Self::Protocol(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for TendrilError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(format!("JSON error: {}", err))
    }
}
