//! Pluggable application payload codecs

use crate::ProtocolError;
use bytes::Bytes;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Encodes and decodes application payloads and stream items
pub trait PayloadCodec: Send + Sync {
    /// Short codec name for logging
    fn name(&self) -> &'static str;

    /// Encode a value to bytes
    fn encode(&self, value: &Value) -> Result<Bytes, ProtocolError>;

    /// Decode a value from bytes
    fn decode(&self, bytes: &[u8]) -> Result<Value, ProtocolError>;
}

/// Shared codec handle
pub type SharedCodec = Arc<dyn PayloadCodec>;

/// Human-readable JSON codec, the default
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl PayloadCodec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, value: &Value) -> Result<Bytes, ProtocolError> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| ProtocolError::Codec(format!("JSON encode error: {}", e)))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Codec(format!("JSON decode error: {}", e)))
    }
}

/// Binary MessagePack codec
#[cfg(feature = "msgpack")]
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackCodec;

#[cfg(feature = "msgpack")]
impl PayloadCodec for MsgPackCodec {
    fn name(&self) -> &'static str {
        "msgpack"
    }

    fn encode(&self, value: &Value) -> Result<Bytes, ProtocolError> {
        rmp_serde::to_vec_named(value)
            .map(Bytes::from)
            .map_err(|e| ProtocolError::Codec(format!("MessagePack encode error: {}", e)))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, ProtocolError> {
        rmp_serde::from_slice(bytes).map_err(|e| ProtocolError::Codec(format!("MessagePack decode error: {}", e)))
    }
}

/// Default codec handle
pub fn default_codec() -> SharedCodec {
    Arc::new(JsonCodec)
}

impl fmt::Debug for dyn PayloadCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PayloadCodec({})", self.name())
    }
}
