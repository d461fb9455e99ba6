//! Multiplexer frame structure and serialization

use crate::codec::WireMessage;
use crate::ProtocolError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Frame flags for channel control
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameFlags(pub u8);

impl FrameFlags {
    /// Plain data frame
    pub const NONE: Self = Self(0);
    /// Opens a channel; the payload carries the channel name
    pub const OPEN: Self = Self(1);
    /// Sender finished writing on this channel
    pub const END_STREAM: Self = Self(2);
    /// Channel aborted in both directions
    pub const RESET: Self = Self(4);
    /// Set when the sender is the endpoint that opened the channel
    pub const INITIATOR: Self = Self(8);
    /// Returns send credit; the payload is a big-endian `u32` byte count
    pub const WINDOW_UPDATE: Self = Self(16);

    /// Check if a flag is set
    pub fn has_flag(self, flag: FrameFlags) -> bool {
        (self.0 & flag.0) != 0
    }

    /// Set a flag
    pub fn set_flag(&mut self, flag: FrameFlags) {
        self.0 |= flag.0;
    }

    /// Clear a flag
    pub fn clear_flag(&mut self, flag: FrameFlags) {
        self.0 &= !flag.0;
    }

    /// Flags with the initiator bit set according to `initiator`
    pub fn with_origin(mut self, initiator: bool) -> Self {
        if initiator {
            self.set_flag(Self::INITIATOR);
        }
        self
    }
}

/// Multiplexer frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    /// Channel identifier, scoped to the endpoint that opened the channel
    pub channel_id: u32,
    /// Frame flags
    pub flags: FrameFlags,
    /// Frame payload
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame
    pub fn new(channel_id: u32, flags: FrameFlags, payload: Bytes) -> Self {
        Self {
            channel_id,
            flags,
            payload,
        }
    }

    /// Create a channel-open frame. Only the opener sends these.
    pub fn open(channel_id: u32, name: &str) -> Self {
        Self::new(
            channel_id,
            FrameFlags::OPEN.with_origin(true),
            Bytes::copy_from_slice(name.as_bytes()),
        )
    }

    /// Create a data frame
    pub fn data(channel_id: u32, initiator: bool, payload: Bytes) -> Self {
        Self::new(channel_id, FrameFlags::NONE.with_origin(initiator), payload)
    }

    /// Create an end-of-stream frame
    pub fn end_stream(channel_id: u32, initiator: bool) -> Self {
        Self::new(
            channel_id,
            FrameFlags::END_STREAM.with_origin(initiator),
            Bytes::new(),
        )
    }

    /// Create a reset frame
    pub fn reset(channel_id: u32, initiator: bool) -> Self {
        Self::new(channel_id, FrameFlags::RESET.with_origin(initiator), Bytes::new())
    }

    /// Create a window-update frame granting `credit` more bytes
    pub fn window_update(channel_id: u32, initiator: bool, credit: u32) -> Self {
        Self::new(
            channel_id,
            FrameFlags::WINDOW_UPDATE.with_origin(initiator),
            Bytes::copy_from_slice(&credit.to_be_bytes()),
        )
    }

    /// Serialize frame to MessagePack bytes
    pub fn to_msgpack(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(rmp_serde::to_vec(self)?)
    }

    /// Deserialize frame from MessagePack bytes
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    /// Get the payload size
    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }

    /// Check if this frame opens a channel
    pub fn is_open(&self) -> bool {
        self.flags.has_flag(FrameFlags::OPEN)
    }

    /// Check if this is an end-of-stream frame
    pub fn is_end_stream(&self) -> bool {
        self.flags.has_flag(FrameFlags::END_STREAM)
    }

    /// Check if this is a reset frame
    pub fn is_reset(&self) -> bool {
        self.flags.has_flag(FrameFlags::RESET)
    }

    /// Check if this frame returns send credit
    pub fn is_window_update(&self) -> bool {
        self.flags.has_flag(FrameFlags::WINDOW_UPDATE)
    }

    /// Credit carried by a WINDOW_UPDATE frame
    pub fn window_credit(&self) -> Result<u32, ProtocolError> {
        let bytes = <[u8; 4]>::try_from(self.payload.as_ref()).map_err(|_| ProtocolError::InvalidFrame)?;
        Ok(u32::from_be_bytes(bytes))
    }

    /// Check if the sender opened the channel
    pub fn from_initiator(&self) -> bool {
        self.flags.has_flag(FrameFlags::INITIATOR)
    }

    /// Channel name carried by an OPEN frame
    pub fn channel_name(&self) -> Result<String, ProtocolError> {
        String::from_utf8(self.payload.to_vec()).map_err(|_| ProtocolError::InvalidFrame)
    }
}

impl WireMessage for Frame {
    fn to_wire(&self) -> Result<Vec<u8>, ProtocolError> {
        self.to_msgpack()
    }

    fn from_wire(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Self::from_msgpack(bytes)
    }
}
