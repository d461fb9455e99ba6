//! Error types for protocol operations

use std::io;
use thiserror::Error;

/// Protocol-specific errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid frame format
    #[error("Invalid frame format")]
    InvalidFrame,

    /// Frame too large
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge {
        /// Actual frame size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// Envelope written with a version this build does not speak
    #[error("Unsupported envelope version: {0}")]
    UnsupportedVersion(u8),

    /// Channel or multiplexer closed
    #[error("Stream closed")]
    StreamClosed,

    /// Channel was reset by the peer or torn down locally
    #[error("Stream reset: {0}")]
    StreamReset(String),

    /// Payload codec failure
    #[error("Codec error: {0}")]
    Codec(String),

    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<rmp_serde::encode::Error> for ProtocolError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::Serialization(format!("MessagePack encode error: {}", err))
    }
}

impl From<rmp_serde::decode::Error> for ProtocolError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::Serialization(format!("MessagePack decode error: {}", err))
    }
}

impl From<ProtocolError> for io::Error {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(e) => e,
            ProtocolError::StreamClosed => io::Error::new(io::ErrorKind::BrokenPipe, err),
            ProtocolError::StreamReset(_) => io::Error::new(io::ErrorKind::ConnectionReset, err),
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
