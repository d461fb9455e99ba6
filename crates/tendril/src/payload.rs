//! Request and response payloads with embedded streams

use crate::{Result, TendrilError};
use futures::stream::BoxStream;
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::pin::Pin;
use tendril_proto::StreamKind;
use tokio::io::{AsyncRead, AsyncWrite};

/// Boxed byte source
pub type ByteReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed byte sink
pub type ByteWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Boxed stream of structured items
pub type ItemStream = BoxStream<'static, Result<Value>>;

/// Boxed sink of structured items
pub type ItemSink = Pin<Box<dyn Sink<Value, Error = TendrilError> + Send>>;

/// A live stream carried alongside a payload
///
/// The kind is fixed when the stream is built: byte variants move raw bytes,
/// item variants move whole [`Value`]s encoded with the session codec.
/// Streams received from the peer come back as the same variants.
pub enum EmbeddedStream {
    /// Bytes flow from this side to the peer
    Readable(ByteReader),
    /// Bytes flow from the peer into this writer
    Writable(ByteWriter),
    /// Bytes flow both ways
    Duplex(ByteReader, ByteWriter),
    /// Items flow from this side to the peer
    ItemReadable(ItemStream),
    /// Items flow from the peer into this sink
    ItemWritable(ItemSink),
    /// Items flow both ways
    ItemDuplex(ItemStream, ItemSink),
}

impl EmbeddedStream {
    /// Byte source sent to the peer
    pub fn readable(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self::Readable(Box::new(reader))
    }

    /// Byte sink filled by the peer
    pub fn writable(writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self::Writable(Box::new(writer))
    }

    /// Byte stream in both directions
    pub fn duplex(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self::Duplex(Box::new(reader), Box::new(writer))
    }

    /// Items sent to the peer
    pub fn item_readable<S>(items: S) -> Self
    where
        S: Stream<Item = Value> + Send + 'static,
    {
        Self::ItemReadable(items.map(Ok).boxed())
    }

    /// Fallible items sent to the peer; an `Err` aborts the stream
    pub fn try_item_readable<S>(items: S) -> Self
    where
        S: Stream<Item = Result<Value>> + Send + 'static,
    {
        Self::ItemReadable(items.boxed())
    }

    /// Sink filled with items from the peer
    pub fn item_writable<S>(sink: S) -> Self
    where
        S: Sink<Value> + Send + 'static,
        S::Error: fmt::Display,
    {
        Self::ItemWritable(into_item_sink(sink))
    }

    /// Items in both directions
    pub fn item_duplex<St, Si>(items: St, sink: Si) -> Self
    where
        St: Stream<Item = Value> + Send + 'static,
        Si: Sink<Value> + Send + 'static,
        Si::Error: fmt::Display,
    {
        Self::ItemDuplex(items.map(Ok).boxed(), into_item_sink(sink))
    }

    /// Stream direction
    pub fn kind(&self) -> StreamKind {
        match self {
            Self::Readable(_) | Self::ItemReadable(_) => StreamKind::Readable,
            Self::Writable(_) | Self::ItemWritable(_) => StreamKind::Writable,
            Self::Duplex(..) | Self::ItemDuplex(..) => StreamKind::Duplex,
        }
    }

    /// Whether the stream carries items rather than bytes
    pub fn object_mode(&self) -> bool {
        matches!(
            self,
            Self::ItemReadable(_) | Self::ItemWritable(_) | Self::ItemDuplex(..)
        )
    }

    /// Take the byte reader of a `Readable` or `Duplex` stream
    pub fn into_reader(self) -> Option<ByteReader> {
        match self {
            Self::Readable(reader) | Self::Duplex(reader, _) => Some(reader),
            _ => None,
        }
    }

    /// Take the byte writer of a `Writable` or `Duplex` stream
    pub fn into_writer(self) -> Option<ByteWriter> {
        match self {
            Self::Writable(writer) | Self::Duplex(_, writer) => Some(writer),
            _ => None,
        }
    }

    /// Take the item stream of an `ItemReadable` or `ItemDuplex` stream
    pub fn into_items(self) -> Option<ItemStream> {
        match self {
            Self::ItemReadable(items) | Self::ItemDuplex(items, _) => Some(items),
            _ => None,
        }
    }

    /// Take the item sink of an `ItemWritable` or `ItemDuplex` stream
    pub fn into_item_sink(self) -> Option<ItemSink> {
        match self {
            Self::ItemWritable(sink) | Self::ItemDuplex(_, sink) => Some(sink),
            _ => None,
        }
    }
}

fn into_item_sink<S>(sink: S) -> ItemSink
where
    S: Sink<Value> + Send + 'static,
    S::Error: fmt::Display,
{
    Box::pin(sink.sink_map_err(|e| TendrilError::StreamPipe(e.to_string())))
}

impl fmt::Debug for EmbeddedStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbeddedStream")
            .field("kind", &self.kind())
            .field("object_mode", &self.object_mode())
            .finish()
    }
}

/// Application payload: structured data plus named live streams
///
/// Only `data` goes through the payload codec. Streams travel on their own
/// sub-channels and are reattached under the same names on the other side.
#[derive(Debug, Default)]
pub struct Payload {
    /// Structured data
    pub data: Value,
    /// Embedded streams keyed by name
    pub streams: BTreeMap<String, EmbeddedStream>,
}

impl Payload {
    /// Payload with data and no streams
    pub fn new(data: Value) -> Self {
        Self {
            data,
            streams: BTreeMap::new(),
        }
    }

    /// Payload with `null` data and no streams
    pub fn empty() -> Self {
        Self::new(Value::Null)
    }

    /// Build a payload from any serializable value
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(Self::new(serde_json::to_value(value)?))
    }

    /// Deserialize the data into a typed value
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(T::deserialize(&self.data)?)
    }

    /// Attach a stream under `name`
    pub fn with_stream(mut self, name: impl Into<String>, stream: EmbeddedStream) -> Self {
        self.streams.insert(name.into(), stream);
        self
    }

    /// Remove and return the stream named `name`
    pub fn take_stream(&mut self, name: &str) -> Option<EmbeddedStream> {
        self.streams.remove(name)
    }

    /// Whether any streams are attached
    pub fn has_streams(&self) -> bool {
        !self.streams.is_empty()
    }
}

impl From<Value> for Payload {
    fn from(data: Value) -> Self {
        Self::new(data)
    }
}
