//! # Tendril Protocol
//!
//! Wire format, envelope codec and sub-channel multiplexer for the Tendril
//! bidirectional RPC protocol.

#![warn(missing_docs)]

/// Multiplexer frame structure and serialization
pub mod frame;

/// Request/response envelopes and stream descriptors
pub mod envelope;

/// Length-prefixed codec for async streams
pub mod codec;

/// Application payload codecs
pub mod payload;

/// Channel handles
pub mod channel;

/// Sub-channel multiplexing over one transport
pub mod mux;

/// Error types for protocol operations
pub mod error;

pub use channel::{Channel, ChannelReader, ChannelSender, ChannelWriter};
pub use codec::{FrameCodec, WireMessage, MAX_FRAME_SIZE};
pub use envelope::{
    request_id, stream_channel_name, ChannelPurpose, Envelope, StreamDescriptor, StreamKind, ENVELOPE_VERSION,
    MAIN_CHANNEL, STREAM_CHANNEL_PREFIX,
};
pub use error::ProtocolError;
pub use frame::{Frame, FrameFlags};
pub use mux::{CloseReason, IncomingChannels, MuxConfig, Multiplexer, DEFAULT_CHUNK_SIZE, DEFAULT_WINDOW};
#[cfg(feature = "msgpack")]
pub use payload::MsgPackCodec;
pub use payload::{default_codec, JsonCodec, PayloadCodec, SharedCodec};
