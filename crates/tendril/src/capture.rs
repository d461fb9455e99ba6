//! Stream capture and release
//!
//! Capture turns the live streams of an outgoing payload into stream
//! descriptors plus one sub-channel per stream, and pumps each stream into
//! or out of its channel. Release is the mirror image: it claims the
//! sub-channels named by the descriptors of an incoming envelope and wraps
//! them back into [`EmbeddedStream`]s under their original names.

use crate::payload::{ByteReader, ByteWriter, ItemSink, ItemStream};
use crate::session::{SessionEvent, SessionShared};
use crate::{EmbeddedStream, Payload, Result, TendrilError};
use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::io;
use std::sync::Arc;
use tendril_proto::{
    stream_channel_name, Channel, ChannelPurpose, ChannelReader, ChannelSender, ChannelWriter, Envelope,
    SharedCodec, StreamDescriptor, StreamKind,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinSet;
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, trace, warn};

/// Bytes read from a source per write into its channel
const COPY_BUFFER_SIZE: usize = 16 * 1024;

/// Frames structured items on a byte channel
///
/// Each item is a `u32` big-endian length followed by the payload codec's
/// encoding of the item.
pub struct ItemCodec {
    frames: LengthDelimitedCodec,
    codec: SharedCodec,
}

impl ItemCodec {
    /// Create an item codec; items larger than `max_item_size` are rejected
    pub fn new(codec: SharedCodec, max_item_size: usize) -> Self {
        Self {
            frames: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(max_item_size)
                .new_codec(),
            codec,
        }
    }
}

impl Decoder for ItemCodec {
    type Item = Value;
    type Error = TendrilError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Value>> {
        match self.frames.decode(src)? {
            Some(frame) => Ok(Some(self.codec.decode(&frame)?)),
            None => Ok(None),
        }
    }
}

impl Encoder<Value> for ItemCodec {
    type Error = TendrilError;

    fn encode(&mut self, item: Value, dst: &mut BytesMut) -> Result<()> {
        let bytes = self.codec.encode(&item)?;
        self.frames.encode(bytes, dst)?;
        Ok(())
    }
}

/// Who is waiting on a set of pumps
#[derive(Debug, Clone)]
pub(crate) enum PumpOwner {
    /// Outgoing request; a pump failure fails the request
    Request(String),
    /// Fire-and-forget request
    Fire(String),
    /// Reply to an inbound request
    Reply(String),
}

struct PumpEntry {
    name: String,
    channel: Channel,
    stream: EmbeddedStream,
}

/// Opened channels whose pumps have not started yet
#[derive(Default)]
pub(crate) struct StreamPumps {
    entries: Vec<PumpEntry>,
}

/// Result of capturing a payload
pub(crate) struct Captured {
    data: Bytes,
    descriptors: Vec<StreamDescriptor>,
    pumps: StreamPumps,
}

impl Captured {
    /// Build the envelope for `id`, leaving the pumps to be started once the
    /// envelope is written
    pub(crate) fn into_envelope(self, id: &str) -> (Envelope, StreamPumps) {
        (Envelope::new(id, self.data).with_streams(self.descriptors), self.pumps)
    }
}

/// Strip the streams from `payload`, encode its data and open one
/// sub-channel per stream
pub(crate) fn capture(shared: &SessionShared, payload: Payload) -> Result<Captured> {
    let Payload { data, streams } = payload;
    let data = shared.codec.encode(&data)?;

    let mut descriptors = Vec::with_capacity(streams.len());
    let mut pumps = StreamPumps::default();
    for (name, stream) in streams {
        let channel_name = stream_channel_name(shared.next_seq());
        let channel = match shared.mux.open_channel(&channel_name) {
            Ok(channel) => channel,
            Err(e) => {
                pumps.abort();
                return Err(e.into());
            }
        };
        channel.set_half_open(true);

        trace!(stream = %name, channel = %channel_name, kind = ?stream.kind(), "captured stream");
        descriptors.push(StreamDescriptor::new(
            channel_name,
            name.clone(),
            stream.kind(),
            stream.object_mode(),
        ));
        pumps.entries.push(PumpEntry { name, channel, stream });
    }

    Ok(Captured {
        data,
        descriptors,
        pumps,
    })
}

impl StreamPumps {
    /// Reset every channel without pumping
    pub(crate) fn abort(self) {
        for entry in self.entries {
            entry.channel.reset();
        }
    }

    /// Spawn the pumps under one supervisor
    ///
    /// The first pump to fail aborts the others, resets every channel of the
    /// set and reports the failure according to `owner`.
    pub(crate) fn start(self, shared: &Arc<SessionShared>, owner: PumpOwner) {
        if self.entries.is_empty() {
            return;
        }

        let senders: Vec<ChannelSender> = self.entries.iter().map(|e| e.channel.sender()).collect();
        let max_item_size = shared.config.mux.max_frame_size;
        let mut pumps = JoinSet::new();
        for PumpEntry { name, channel, stream } in self.entries {
            let codec = shared.codec.clone();
            pumps.spawn(async move {
                let result = pump(channel, stream, codec, max_item_size).await;
                (name, result)
            });
        }

        tokio::spawn(supervise(Arc::clone(shared), owner, pumps, senders));
    }
}

async fn supervise(
    shared: Arc<SessionShared>,
    owner: PumpOwner,
    mut pumps: JoinSet<(String, Result<()>)>,
    senders: Vec<ChannelSender>,
) {
    let shutdown = shared.mux.shutdown_token();
    loop {
        let joined = tokio::select! {
            _ = shutdown.cancelled() => {
                pumps.abort_all();
                return;
            }
            joined = pumps.join_next() => joined,
        };

        let (name, error) = match joined {
            None => break,
            Some(Ok((_, Ok(())))) => continue,
            Some(Ok((name, Err(e)))) => (name, e),
            Some(Err(e)) if e.is_cancelled() => continue,
            Some(Err(e)) => ("<unknown>".to_string(), TendrilError::StreamPipe(format!("pump panicked: {}", e))),
        };

        // Reset before aborting so no aborted writer can end its channel
        for sender in &senders {
            sender.reset();
        }
        pumps.abort_all();
        report_failure(&shared, &owner, &name, error);
        return;
    }
    trace!(?owner, "all stream pumps finished");
}

fn report_failure(shared: &SessionShared, owner: &PumpOwner, stream: &str, error: TendrilError) {
    let error = match error {
        TendrilError::StreamPipe(msg) => TendrilError::StreamPipe(format!("stream {}: {}", stream, msg)),
        other => TendrilError::StreamPipe(format!("stream {}: {}", stream, other)),
    };

    match owner {
        PumpOwner::Request(id) => match shared.pending.complete(id) {
            Some(tx) => {
                warn!(request_id = %id, error = %error, "stream pipe failed, failing request");
                let _ = tx.send(Err(error));
            }
            None => debug!(request_id = %id, error = %error, "stream pipe failed after request completed"),
        },
        PumpOwner::Fire(id) => {
            warn!(request_id = %id, error = %error, "stream pipe failed for fired request");
            shared.emit(SessionEvent::Error(error));
        }
        PumpOwner::Reply(id) => {
            warn!(request_id = %id, error = %error, "stream pipe failed for reply");
            shared.emit(SessionEvent::ResponseError {
                request_id: id.clone(),
                error,
            });
        }
    }
}

async fn pump(channel: Channel, stream: EmbeddedStream, codec: SharedCodec, max_item_size: usize) -> Result<()> {
    let (reader, writer) = channel.into_split();
    match stream {
        EmbeddedStream::Readable(source) => pump_out(source, writer).await,
        EmbeddedStream::Writable(dest) => {
            let result = pump_in(reader, dest).await;
            drop(writer);
            result
        }
        EmbeddedStream::Duplex(source, dest) => {
            let sender = writer.sender();
            both_ways(sender, pump_out(source, writer), pump_in(reader, dest)).await
        }
        EmbeddedStream::ItemReadable(items) => {
            send_items(items, FramedWrite::new(writer, ItemCodec::new(codec, max_item_size))).await
        }
        EmbeddedStream::ItemWritable(sink) => {
            let result = recv_items(FramedRead::new(reader, ItemCodec::new(codec, max_item_size)), sink).await;
            drop(writer);
            result
        }
        EmbeddedStream::ItemDuplex(items, sink) => {
            let sender = writer.sender();
            let outgoing = FramedWrite::new(writer, ItemCodec::new(codec.clone(), max_item_size));
            let incoming = FramedRead::new(reader, ItemCodec::new(codec, max_item_size));
            both_ways(sender, send_items(items, outgoing), recv_items(incoming, sink)).await
        }
    }
}

/// Run both directions of a duplex stream. On failure the channel is reset
/// while the unfinished direction still holds its writer, so the peer never
/// mistakes the teardown for a clean end of stream.
async fn both_ways(
    sender: ChannelSender,
    outgoing: impl Future<Output = Result<()>>,
    incoming: impl Future<Output = Result<()>>,
) -> Result<()> {
    tokio::pin!(outgoing, incoming);
    let result = tokio::try_join!(&mut outgoing, &mut incoming);
    if result.is_err() {
        sender.reset();
    }
    result.map(|_| ())
}

/// A write rejected because the peer reset the channel means the consumer
/// went away; the pump stops without failing its owner.
fn consumer_gone(channel: &str, error: TendrilError) -> Result<()> {
    match &error {
        TendrilError::Io(e) if e.kind() == io::ErrorKind::ConnectionReset => {
            debug!(channel, "consumer reset the stream, pump stopped");
            Ok(())
        }
        _ => Err(error),
    }
}

async fn pump_out(mut source: ByteReader, mut channel: ChannelWriter) -> Result<()> {
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = match source.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                channel.reset();
                return Err(TendrilError::StreamPipe(format!("source failed: {}", e)));
            }
        };
        if let Err(e) = channel.write_all(&buf[..n]).await {
            channel.reset();
            return consumer_gone(channel.name(), e.into());
        }
    }
    channel.shutdown().await?;
    Ok(())
}

/// The destination is shut down even when the channel fails
async fn pump_in(mut channel: ChannelReader, mut dest: ByteWriter) -> Result<()> {
    let copied = tokio::io::copy(&mut channel, &mut dest).await;
    let closed = dest.shutdown().await;
    copied?;
    closed?;
    Ok(())
}

async fn send_items(mut items: ItemStream, mut channel: FramedWrite<ChannelWriter, ItemCodec>) -> Result<()> {
    while let Some(item) = items.next().await {
        let sent = match item {
            Ok(item) => channel.send(item).await,
            Err(e) => {
                channel.get_ref().reset();
                return Err(e);
            }
        };
        if let Err(e) = sent {
            channel.get_ref().reset();
            return consumer_gone(channel.get_ref().name(), e);
        }
    }
    channel.close().await
}

async fn recv_items(mut channel: FramedRead<ChannelReader, ItemCodec>, mut sink: ItemSink) -> Result<()> {
    let forwarded = sink.send_all(&mut channel).await;
    let closed = sink.close().await;
    forwarded.and(closed)
}

/// Decode an envelope's data and reattach its streams
pub(crate) async fn release_payload(
    shared: &Arc<SessionShared>,
    data: Bytes,
    descriptors: Vec<StreamDescriptor>,
) -> Result<Payload> {
    let decoded = if data.is_empty() {
        Ok(Value::Null)
    } else {
        shared.codec.decode(&data)
    };
    let data = match decoded {
        Ok(data) => data,
        Err(e) => {
            discard(shared, descriptors);
            return Err(e.into());
        }
    };

    let streams = release(shared, descriptors).await?;
    Ok(Payload { data, streams })
}

/// Claim the sub-channel of every descriptor and wrap it as a stream
pub(crate) async fn release(
    shared: &SessionShared,
    descriptors: Vec<StreamDescriptor>,
) -> Result<BTreeMap<String, EmbeddedStream>> {
    let mut streams = BTreeMap::new();
    let mut claimed: Vec<ChannelSender> = Vec::with_capacity(descriptors.len());

    for descriptor in descriptors {
        let duplicate = streams.contains_key(&descriptor.name);
        let channel = match claim(shared, &descriptor, duplicate).await {
            Ok(channel) => channel,
            Err(e) => {
                for sender in claimed {
                    sender.reset();
                }
                return Err(e);
            }
        };
        claimed.push(channel.sender());
        let stream = wrap(channel, &descriptor, shared);
        streams.insert(descriptor.name, stream);
    }
    Ok(streams)
}

async fn claim(shared: &SessionShared, descriptor: &StreamDescriptor, duplicate: bool) -> Result<Channel> {
    if ChannelPurpose::classify(&descriptor.id) != ChannelPurpose::Stream {
        return Err(TendrilError::Protocol(format!(
            "stream {} names non-stream channel {}",
            descriptor.name, descriptor.id
        )));
    }
    if duplicate {
        return Err(TendrilError::Protocol(format!("duplicate stream name {}", descriptor.name)));
    }
    shared.waiting.claim(&descriptor.id, &shared.mux.shutdown_token()).await
}

/// Wrap a claimed channel from the receiving side's point of view
fn wrap(channel: Channel, descriptor: &StreamDescriptor, shared: &SessionShared) -> EmbeddedStream {
    channel.set_half_open(true);
    let item_codec = || ItemCodec::new(shared.codec.clone(), shared.config.mux.max_frame_size);
    let (mut reader, writer) = channel.into_split();
    // Dropping a released stream unread tells the sender to stop
    reader.set_reset_on_drop(true);

    match (descriptor.kind, descriptor.object_mode) {
        // The peer only sends; our write side is finished straight away
        (StreamKind::Readable, false) => {
            drop(writer);
            EmbeddedStream::Readable(Box::new(reader))
        }
        (StreamKind::Writable, false) => EmbeddedStream::Writable(Box::new(writer)),
        (StreamKind::Duplex, false) => EmbeddedStream::Duplex(Box::new(reader), Box::new(writer)),
        (StreamKind::Readable, true) => {
            drop(writer);
            EmbeddedStream::ItemReadable(FramedRead::new(reader, item_codec()).boxed())
        }
        (StreamKind::Writable, true) => EmbeddedStream::ItemWritable(Box::pin(FramedWrite::new(writer, item_codec()))),
        (StreamKind::Duplex, true) => EmbeddedStream::ItemDuplex(
            FramedRead::new(reader, item_codec()).boxed(),
            Box::pin(FramedWrite::new(writer, item_codec())),
        ),
    }
}

/// Claim and reset the sub-channels of an envelope nobody will consume
pub(crate) fn discard(shared: &Arc<SessionShared>, descriptors: Vec<StreamDescriptor>) {
    if descriptors.is_empty() {
        return;
    }
    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        let shutdown = shared.mux.shutdown_token();
        for descriptor in descriptors {
            if ChannelPurpose::classify(&descriptor.id) != ChannelPurpose::Stream {
                continue;
            }
            match shared.waiting.claim(&descriptor.id, &shutdown).await {
                Ok(channel) => {
                    trace!(channel = %descriptor.id, "resetting unclaimed stream");
                    channel.reset();
                }
                Err(_) => return,
            }
        }
    });
}
