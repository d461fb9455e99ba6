//! Request/response envelopes and embedded stream descriptors

use crate::codec::WireMessage;
use crate::ProtocolError;
use bytes::{BufMut, Bytes};
use serde::{Deserialize, Serialize};

/// Current envelope format version, written as the first body byte
pub const ENVELOPE_VERSION: u8 = 1;

/// Prefix reserved for auxiliary (embedded stream) channel names
pub const STREAM_CHANNEL_PREFIX: &str = "stream-";

/// Name of the channel each endpoint opens for its own requests
pub const MAIN_CHANNEL: &str = "rpc";

/// Prefix of locally generated request ids
pub const REQUEST_ID_PREFIX: &str = "req-";

/// What a sub-channel is used for, derived from its name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelPurpose {
    /// Carries request/response envelopes
    Main,
    /// Carries the bytes of one embedded stream
    Stream,
}

impl ChannelPurpose {
    /// Classify a channel by name
    pub fn classify(name: &str) -> Self {
        if name.starts_with(STREAM_CHANNEL_PREFIX) {
            Self::Stream
        } else {
            Self::Main
        }
    }
}

/// Build the channel name for an embedded stream
pub fn stream_channel_name(seq: u64) -> String {
    format!("{}{}", STREAM_CHANNEL_PREFIX, seq)
}

/// Build a request id
pub fn request_id(seq: u64) -> String {
    format!("{}{}", REQUEST_ID_PREFIX, seq)
}

/// Direction of an embedded stream, as seen by the endpoint that embedded it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum StreamKind {
    /// The embedding side produces data
    Readable = 0,
    /// The embedding side consumes data
    Writable = 1,
    /// Both directions
    Duplex = 2,
}

impl StreamKind {
    /// Whether the embedding side sends bytes on the channel
    pub fn sends(self) -> bool {
        matches!(self, Self::Readable | Self::Duplex)
    }

    /// Whether the embedding side receives bytes from the channel
    pub fn receives(self) -> bool {
        matches!(self, Self::Writable | Self::Duplex)
    }
}

impl From<StreamKind> for u8 {
    fn from(kind: StreamKind) -> Self {
        kind as u8
    }
}

impl TryFrom<u8> for StreamKind {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Readable),
            1 => Ok(Self::Writable),
            2 => Ok(Self::Duplex),
            other => Err(format!("unknown stream kind {}", other)),
        }
    }
}

/// Metadata for one embedded stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    /// Sub-channel carrying the stream
    pub id: String,
    /// Key of the stream in the payload's stream map
    pub name: String,
    /// Whether the stream carries discrete items
    #[serde(rename = "objectMode")]
    pub object_mode: bool,
    /// Stream direction
    #[serde(rename = "type")]
    pub kind: StreamKind,
}

impl StreamDescriptor {
    /// Create a descriptor
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: StreamKind, object_mode: bool) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            object_mode,
            kind,
        }
    }
}

/// One framed protocol message, either a request or a response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Request id; responses carry the id of the request they answer
    pub id: String,
    /// Payload encoded with the application codec
    pub data: Bytes,
    /// Error message of a failed request; `data` is empty when set
    pub error: Option<String>,
    /// Embedded streams, in payload order
    pub streams: Vec<StreamDescriptor>,
}

impl Envelope {
    /// Create an envelope carrying data
    pub fn new(id: impl Into<String>, data: Bytes) -> Self {
        Self {
            id: id.into(),
            data,
            error: None,
            streams: Vec::new(),
        }
    }

    /// Create an error response
    pub fn error(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            data: Bytes::new(),
            error: Some(message.into()),
            streams: Vec::new(),
        }
    }

    /// Attach stream descriptors
    pub fn with_streams(mut self, streams: Vec<StreamDescriptor>) -> Self {
        self.streams = streams;
        self
    }

    /// Whether this is an error response
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Serialize to the versioned wire body
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        let body = rmp_serde::to_vec(self)?;
        let mut buf = Vec::with_capacity(1 + body.len());
        buf.put_u8(ENVELOPE_VERSION);
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    /// Deserialize from the versioned wire body
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (&version, body) = bytes.split_first().ok_or(ProtocolError::InvalidFrame)?;
        if version != ENVELOPE_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }
        Ok(rmp_serde::from_slice(body)?)
    }
}

impl WireMessage for Envelope {
    fn to_wire(&self) -> Result<Vec<u8>, ProtocolError> {
        self.to_bytes()
    }

    fn from_wire(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Self::from_bytes(bytes)
    }
}
