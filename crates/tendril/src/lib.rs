//! # Tendril
//!
//! Bidirectional multiplexed RPC over a single duplex byte stream.
//!
//! Either end of a [`Session`] can send requests and serve them. Payloads
//! carry structured data plus named live streams, bytes or items, each
//! piped over its own sub-channel of the same connection.
//!
//! ```ignore
//! let (a, b) = tokio::io::duplex(64 * 1024);
//! let server = Session::builder()
//!     .with_handler(handler_fn(|payload, reply: Reply| async move {
//!         let _ = reply.send(payload);
//!     }))
//!     .connect(b)?;
//! let client = Session::new(a)?;
//! let echoed = client.request(Payload::new(json!({"hello": "world"}))).await?;
//! ```

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub use tendril_proto as proto;

/// Error types for the Tendril library
pub mod error;

/// Payloads and embedded streams
pub mod payload;

/// Session management and request correlation
pub mod session;

/// Request handlers and the inbound dispatcher
pub mod dispatch;

/// Reply handle and reply context pool
pub mod reply;

/// Stream capture and release
pub mod capture;

mod pending;
mod router;

pub use capture::ItemCodec;
pub use dispatch::{handler_fn, FnHandler, RequestHandler};
pub use error::TendrilError;
pub use payload::{ByteReader, ByteWriter, EmbeddedStream, ItemSink, ItemStream, Payload};
pub use reply::Reply;
pub use session::{Session, SessionBuilder, SessionConfig, SessionEvent};
pub use tendril_proto::{JsonCodec, MuxConfig, PayloadCodec, StreamKind};
#[cfg(feature = "msgpack")]
pub use tendril_proto::MsgPackCodec;

/// Result type alias for Tendril operations
pub type Result<T> = std::result::Result<T, TendrilError>;
