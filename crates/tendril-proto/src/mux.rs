//! Sub-channel multiplexer over a single duplex transport
//!
//! Each endpoint allocates channel ids for the channels it opens. Frames
//! carry an initiator bit so the receiver knows which id space a frame
//! belongs to; both sides can therefore open channels concurrently.

use crate::channel::{Channel, ChannelLink, ChannelState, Inbound};
use crate::codec::MAX_FRAME_SIZE;
use crate::{Frame, FrameCodec, ProtocolError};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Default maximum bytes per data frame (64KB)
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Default per-channel send window (256KB)
pub const DEFAULT_WINDOW: usize = 256 * 1024;

/// Multiplexer configuration
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Largest frame accepted from or written to the transport
    pub max_frame_size: usize,
    /// Writes larger than this are split across several data frames
    pub max_chunk_size: usize,
    /// Channels start half-open: a remote END never ends the local side
    pub half_open: bool,
    /// Bytes a writer may have in flight per channel before it waits for
    /// the peer to consume them
    pub initial_window: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
            max_chunk_size: DEFAULT_CHUNK_SIZE,
            half_open: false,
            initial_window: DEFAULT_WINDOW,
        }
    }
}

/// Why the multiplexer stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed locally
    Local,
    /// The transport reached EOF
    RemoteClosed,
    /// The transport failed
    Failed(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "closed locally"),
            Self::RemoteClosed => write!(f, "connection closed by peer"),
            Self::Failed(reason) => write!(f, "transport failed: {}", reason),
        }
    }
}

/// Routing entry for one open channel
struct ChannelEntry {
    inbound: mpsc::UnboundedSender<Inbound>,
    state: Arc<ChannelState>,
}

/// Channels opened locally and by the peer live in separate id spaces
#[derive(Default)]
struct ChannelTables {
    local: HashMap<u32, ChannelEntry>,
    remote: HashMap<u32, ChannelEntry>,
}

impl ChannelTables {
    fn side(&mut self, local_origin: bool) -> &mut HashMap<u32, ChannelEntry> {
        if local_origin {
            &mut self.local
        } else {
            &mut self.remote
        }
    }
}

/// State shared by the multiplexer tasks and every channel handle
pub(crate) struct MuxShared {
    outbound: mpsc::UnboundedSender<Frame>,
    channels: Mutex<ChannelTables>,
    next_channel_id: AtomicU32,
    shutdown: CancellationToken,
    close_reason: Mutex<Option<CloseReason>>,
    pub(crate) config: MuxConfig,
}

impl MuxShared {
    fn tables(&self) -> MutexGuard<'_, ChannelTables> {
        self.channels.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Queue a frame for the writer task
    pub(crate) fn send_frame(&self, frame: Frame) -> Result<(), ProtocolError> {
        if self.is_closed() {
            return Err(ProtocolError::StreamClosed);
        }
        self.outbound.send(frame).map_err(|_| ProtocolError::StreamClosed)
    }

    /// Stop the multiplexer; the first reason recorded wins
    fn shutdown_with(&self, reason: CloseReason) {
        {
            let mut slot = self.close_reason.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_none() {
                debug!(%reason, "multiplexer shutting down");
                *slot = Some(reason);
            }
        }
        self.shutdown.cancel();
    }

    /// Drop every routing entry; readers observe an aborted channel
    fn abort_channels(&self) {
        let mut tables = self.tables();
        let count = tables.local.len() + tables.remote.len();
        for entry in tables.local.values().chain(tables.remote.values()) {
            entry.state.wake_writer();
        }
        tables.local.clear();
        tables.remote.clear();
        if count > 0 {
            debug!(count, "aborted open channels");
        }
    }

    pub(crate) fn end_local(&self, link: &ChannelLink) {
        let state = &link.state;
        if state.reset.load(Ordering::Acquire) || state.local_ended.swap(true, Ordering::AcqRel) {
            return;
        }
        trace!(channel = %link.name, "ending local side");
        let _ = self.send_frame(Frame::end_stream(link.id, link.local_origin));
        if state.remote_ended.load(Ordering::Acquire) {
            self.tables().side(link.local_origin).remove(&link.id);
        }
    }

    pub(crate) fn reset_channel(&self, link: &ChannelLink) {
        if link.state.reset.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(channel = %link.name, "resetting channel");
        link.state.wake_writer();
        let _ = self.send_frame(Frame::reset(link.id, link.local_origin));
        if let Some(entry) = self.tables().side(link.local_origin).remove(&link.id) {
            let _ = entry.inbound.send(Inbound::Reset);
        }
    }

    fn register(
        self: &Arc<Self>,
        id: u32,
        local_origin: bool,
        name: String,
    ) -> Result<Channel, ProtocolError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(ChannelState::default());
        state.half_open.store(self.config.half_open, Ordering::Release);
        state.set_window(self.config.initial_window);
        let entry = ChannelEntry {
            inbound: tx,
            state: Arc::clone(&state),
        };

        let mut tables = self.tables();
        let side = tables.side(local_origin);
        if side.contains_key(&id) {
            return Err(ProtocolError::InvalidFrame);
        }
        side.insert(id, entry);
        drop(tables);

        let link = ChannelLink::new(id, local_origin, name, state, Arc::clone(self));
        Ok(Channel::new(link, rx))
    }

    /// Route one frame read from the transport
    fn route(self: &Arc<Self>, frame: Frame, incoming: &mpsc::UnboundedSender<Channel>) -> Result<(), ProtocolError> {
        // The initiator bit is the sender's view; a frame from the opener
        // belongs to a channel the peer opened.
        let local_origin = !frame.from_initiator();
        let id = frame.channel_id;

        if frame.is_open() {
            if local_origin {
                return Err(ProtocolError::InvalidFrame);
            }
            let name = frame.channel_name()?;
            debug!(channel = %name, id, "peer opened channel");
            let channel = self.register(id, false, name)?;
            if let Err(mpsc::error::SendError(channel)) = incoming.send(channel) {
                warn!(channel = %channel.name(), "no acceptor for incoming channel");
                channel.reset();
            }
            return Ok(());
        }

        let mut tables = self.tables();
        let side = tables.side(local_origin);
        let Some(entry) = side.get(&id) else {
            trace!(id, local_origin, "frame for unknown channel dropped");
            return Ok(());
        };

        if frame.is_reset() {
            entry.state.reset.store(true, Ordering::Release);
            entry.state.wake_writer();
            let _ = entry.inbound.send(Inbound::Reset);
            side.remove(&id);
        } else if frame.is_end_stream() {
            entry.state.remote_ended.store(true, Ordering::Release);
            let _ = entry.inbound.send(Inbound::End);
            let half_open = entry.state.half_open.load(Ordering::Acquire);
            if !half_open && !entry.state.local_ended.swap(true, Ordering::AcqRel) {
                let _ = self.send_frame(Frame::end_stream(id, local_origin));
            }
            if entry.state.local_ended.load(Ordering::Acquire) {
                side.remove(&id);
            }
        } else if frame.is_window_update() {
            entry.state.grant(frame.window_credit()?);
        } else if !frame.payload.is_empty() {
            // A reader that went away just discards its data
            let _ = entry.inbound.send(Inbound::Data(frame.payload));
        }
        Ok(())
    }
}

/// Stream of channels opened by the peer
pub struct IncomingChannels {
    rx: mpsc::UnboundedReceiver<Channel>,
}

impl IncomingChannels {
    /// Wait for the next channel the peer opens. `None` once the
    /// multiplexer has stopped.
    pub async fn accept(&mut self) -> Option<Channel> {
        self.rx.recv().await
    }
}

/// Multiplexes named channels over one `AsyncRead + AsyncWrite` transport
#[derive(Clone)]
pub struct Multiplexer {
    shared: Arc<MuxShared>,
}

impl Multiplexer {
    /// Start multiplexing over `io`. Spawns a reader and a writer task on
    /// the current tokio runtime.
    pub fn new<T>(io: T, config: MuxConfig) -> (Self, IncomingChannels)
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(MuxShared {
            outbound: outbound_tx,
            channels: Mutex::new(ChannelTables::default()),
            next_channel_id: AtomicU32::new(1),
            shutdown: CancellationToken::new(),
            close_reason: Mutex::new(None),
            config,
        });

        let (reader, writer) = tokio::io::split(io);
        tokio::spawn(write_loop(Arc::clone(&shared), writer, outbound_rx));
        tokio::spawn(read_loop(Arc::clone(&shared), reader, incoming_tx));

        (Self { shared }, IncomingChannels { rx: incoming_rx })
    }

    /// Open a named channel to the peer
    pub fn open_channel(&self, name: &str) -> Result<Channel, ProtocolError> {
        if self.shared.is_closed() {
            return Err(ProtocolError::StreamClosed);
        }
        let id = self.shared.next_channel_id.fetch_add(1, Ordering::Relaxed);
        let channel = self.shared.register(id, true, name.to_string())?;
        self.shared.send_frame(Frame::open(id, name))?;
        debug!(channel = %name, id, "opened channel");
        Ok(channel)
    }

    /// Close the multiplexer; queued frames are flushed first
    pub fn close(&self) {
        self.shared.shutdown_with(CloseReason::Local);
    }

    /// Close the multiplexer because of an error
    pub fn fail(&self, reason: impl Into<String>) {
        self.shared.shutdown_with(CloseReason::Failed(reason.into()));
    }

    /// Whether the multiplexer has stopped
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Why the multiplexer stopped, once it has
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared
            .close_reason
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Wait until the multiplexer stops
    pub async fn closed(&self) {
        self.shared.shutdown.cancelled().await
    }

    /// Token cancelled when the multiplexer stops
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shared.shutdown.clone()
    }

    /// Number of channels with a live routing entry
    pub fn channel_count(&self) -> usize {
        let tables = self.shared.tables();
        tables.local.len() + tables.remote.len()
    }

    /// Multiplexer configuration
    pub fn config(&self) -> &MuxConfig {
        &self.shared.config
    }
}

impl fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multiplexer")
            .field("closed", &self.is_closed())
            .field("channels", &self.channel_count())
            .finish()
    }
}

async fn write_loop<W>(shared: Arc<MuxShared>, mut writer: W, mut outbound: mpsc::UnboundedReceiver<Frame>)
where
    W: AsyncWrite + Unpin,
{
    let codec = FrameCodec::<Frame>::with_max_frame_size(shared.config.max_frame_size);

    loop {
        tokio::select! {
            biased;
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = codec.write_frame(&mut writer, &frame).await {
                    shared.shutdown_with(CloseReason::Failed(format!("write error: {}", e)));
                    break;
                }
            }
            _ = shared.shutdown.cancelled() => {
                while let Ok(frame) = outbound.try_recv() {
                    if codec.write_frame(&mut writer, &frame).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }

    let _ = writer.shutdown().await;
    debug!("multiplexer writer stopped");
}

async fn read_loop<R>(shared: Arc<MuxShared>, mut reader: R, incoming: mpsc::UnboundedSender<Channel>)
where
    R: AsyncRead + Unpin,
{
    let mut codec = FrameCodec::<Frame>::with_max_frame_size(shared.config.max_frame_size);

    let reason = loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break CloseReason::Local,
            result = codec.read_frame(&mut reader) => match result {
                Ok(Some(frame)) => {
                    if let Err(e) = shared.route(frame, &incoming) {
                        break CloseReason::Failed(format!("invalid frame: {}", e));
                    }
                }
                Ok(None) => break CloseReason::RemoteClosed,
                Err(e) => break CloseReason::Failed(e.to_string()),
            }
        }
    };

    shared.shutdown_with(reason);
    shared.abort_channels();
    debug!("multiplexer reader stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
    use tokio::time::timeout;

    fn pair() -> ((Multiplexer, IncomingChannels), (Multiplexer, IncomingChannels)) {
        let (a, b) = duplex(64 * 1024);
        (
            Multiplexer::new(a, MuxConfig::default()),
            Multiplexer::new(b, MuxConfig::default()),
        )
    }

    async fn accept(incoming: &mut IncomingChannels) -> Channel {
        timeout(Duration::from_secs(5), incoming.accept())
            .await
            .expect("accept timed out")
            .expect("multiplexer closed")
    }

    #[tokio::test]
    async fn test_open_and_accept_named_channel() {
        let ((left, _), (_right, mut right_in)) = pair();

        let mut outbound = left.open_channel("stream-1").unwrap();
        let mut inbound = accept(&mut right_in).await;
        assert_eq!(inbound.name(), "stream-1");
        assert!(outbound.is_local());
        assert!(!inbound.is_local());

        outbound.write_all(b"hello").await.unwrap();
        outbound.shutdown().await.unwrap();

        let mut buf = Vec::new();
        inbound.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello");
    }

    #[tokio::test]
    async fn test_both_sides_open_same_id_space() {
        let ((left, mut left_in), (right, mut right_in)) = pair();

        let mut from_left = left.open_channel("rpc").unwrap();
        let mut from_right = right.open_channel("rpc").unwrap();
        let mut at_right = accept(&mut right_in).await;
        let mut at_left = accept(&mut left_in).await;

        from_left.write_all(b"L").await.unwrap();
        from_right.write_all(b"R").await.unwrap();

        let mut byte = [0u8; 1];
        at_right.read_exact(&mut byte).await.unwrap();
        assert_eq!(&byte, b"L");
        at_left.read_exact(&mut byte).await.unwrap();
        assert_eq!(&byte, b"R");

        at_right.write_all(b"r").await.unwrap();
        from_left.read_exact(&mut byte).await.unwrap();
        assert_eq!(&byte, b"r");
    }

    #[tokio::test]
    async fn test_large_write_is_chunked_in_order() {
        let (a, b) = duplex(1024);
        let config = MuxConfig { max_chunk_size: 100, ..MuxConfig::default() };
        let (left, _left_in) = Multiplexer::new(a, config.clone());
        let (_right, mut right_in) = Multiplexer::new(b, config);

        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let mut outbound = left.open_channel("bulk").unwrap();
        let mut inbound = accept(&mut right_in).await;

        let expected = data.clone();
        let writer = tokio::spawn(async move {
            outbound.write_all(&data).await.unwrap();
            outbound.shutdown().await.unwrap();
        });

        let mut received = Vec::new();
        inbound.read_to_end(&mut received).await.unwrap();
        writer.await.unwrap();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_write_blocks_when_transport_stalls() {
        // Nothing ever reads the far end of the transport
        let (a, _stalled) = duplex(1024);
        let (left, _left_in) = Multiplexer::new(a, MuxConfig::default());
        let mut outbound = left.open_channel("bulk").unwrap();

        let data = vec![7u8; 16 * DEFAULT_WINDOW];
        let write = timeout(Duration::from_millis(300), outbound.write_all(&data)).await;
        assert!(write.is_err(), "write finished without the transport draining");
    }

    #[tokio::test]
    async fn test_unread_channel_holds_writer_until_consumed() {
        let (a, b) = duplex(64 * 1024);
        let config = MuxConfig { initial_window: 4096, max_chunk_size: 1024, ..MuxConfig::default() };
        let (left, _left_in) = Multiplexer::new(a, config.clone());
        let (_right, mut right_in) = Multiplexer::new(b, config);

        let mut outbound = left.open_channel("slow").unwrap();
        let mut inbound = accept(&mut right_in).await;

        let data: Vec<u8> = (0..64 * 1024u32).map(|i| (i % 251) as u8).collect();
        let expected = data.clone();
        let writer = tokio::spawn(async move {
            outbound.write_all(&data).await.unwrap();
            outbound.shutdown().await.unwrap();
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!writer.is_finished(), "writer ran past the window of an unread channel");

        let mut received = Vec::new();
        timeout(Duration::from_secs(5), inbound.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        timeout(Duration::from_secs(5), writer).await.unwrap().unwrap();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_reset_wakes_writer_waiting_for_credit() {
        let (a, b) = duplex(64 * 1024);
        let config = MuxConfig { initial_window: 1024, ..MuxConfig::default() };
        let (left, _left_in) = Multiplexer::new(a, config.clone());
        let (_right, mut right_in) = Multiplexer::new(b, config);

        let mut outbound = left.open_channel("parked").unwrap();
        let inbound = accept(&mut right_in).await;

        let writer = tokio::spawn(async move { outbound.write_all(&[1u8; 8192]).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        inbound.reset();

        let err = timeout(Duration::from_secs(5), writer).await.unwrap().unwrap().unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionReset);
    }

    #[tokio::test]
    async fn test_dropping_unfinished_reader_resets_when_asked() {
        let ((left, _), (_right, mut right_in)) = pair();

        let (mut kept_reader, mut kept_writer) = left.open_channel("kept").unwrap().into_split();
        let (mut dropped_reader, mut dropped_writer) = left.open_channel("dropped").unwrap().into_split();
        let (plain, _plain_writer) = accept(&mut right_in).await.into_split();
        let (mut guarded, _guarded_writer) = accept(&mut right_in).await.into_split();
        guarded.set_reset_on_drop(true);
        drop(plain);
        drop(guarded);

        let mut buf = [0u8; 1];
        let err = timeout(Duration::from_secs(5), dropped_reader.read(&mut buf))
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionReset);
        let err = dropped_writer.write_all(b"x").await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionReset);

        // Without the flag a dropped reader is silent
        assert!(kept_writer.write_all(b"x").await.is_ok());
        assert!(timeout(Duration::from_millis(100), kept_reader.read(&mut buf)).await.is_err());
    }

    #[tokio::test]
    async fn test_remote_end_closes_local_side_unless_half_open() {
        let ((left, _), (_right, mut right_in)) = pair();

        let closing = left.open_channel("auto").unwrap();
        let half = left.open_channel("half").unwrap();
        half.set_half_open(true);

        let auto_remote = accept(&mut right_in).await;
        let half_remote = accept(&mut right_in).await;
        let (_r1, w1) = auto_remote.into_split();
        let (_r2, w2) = half_remote.into_split();
        drop(w1);
        drop(w2);

        let (mut closing_reader, closing_writer) = closing.into_split();
        let (mut half_reader, mut half_writer) = half.into_split();

        let mut buf = Vec::new();
        closing_reader.read_to_end(&mut buf).await.unwrap();
        half_reader.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());

        assert!(closing_writer.sender().is_closed());
        assert!(half_writer.write_all(b"still open").await.is_ok());
    }

    #[tokio::test]
    async fn test_half_open_default_applies_to_both_origins() {
        let (a, b) = duplex(1024);
        let config = MuxConfig { half_open: true, ..MuxConfig::default() };
        let (left, _left_in) = Multiplexer::new(a, config.clone());
        let (_right, mut right_in) = Multiplexer::new(b, config);

        let outbound = left.open_channel("stream-1").unwrap();
        let inbound = accept(&mut right_in).await;
        assert!(outbound.is_half_open());
        assert!(inbound.is_half_open());
    }

    #[tokio::test]
    async fn test_reset_propagates() {
        let ((left, _), (_right, mut right_in)) = pair();

        let mut outbound = left.open_channel("doomed").unwrap();
        let mut inbound = accept(&mut right_in).await;

        inbound.reset();
        let mut buf = [0u8; 4];
        let err = timeout(Duration::from_secs(5), outbound.read(&mut buf))
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionReset);

        let err = outbound.write_all(b"x").await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionReset);

        let err = inbound.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionReset);
    }

    #[tokio::test]
    async fn test_close_aborts_channels_and_notifies_peer() {
        let ((left, _left_in), (right, mut right_in)) = pair();

        let mut outbound = left.open_channel("rpc").unwrap();
        let mut inbound = accept(&mut right_in).await;

        left.close();
        timeout(Duration::from_secs(5), right.closed()).await.unwrap();
        assert_eq!(left.close_reason(), Some(CloseReason::Local));
        assert_eq!(right.close_reason(), Some(CloseReason::RemoteClosed));

        let mut buf = [0u8; 1];
        let err = outbound.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionAborted);
        let err = inbound.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionAborted);

        assert!(matches!(left.open_channel("late"), Err(ProtocolError::StreamClosed)));
        assert!(right_in.accept().await.is_none());
    }

    #[tokio::test]
    async fn test_entries_removed_after_both_ends() {
        let ((left, _), (right, mut right_in)) = pair();

        let outbound = left.open_channel("short").unwrap();
        outbound.set_half_open(true);
        let inbound = accept(&mut right_in).await;
        inbound.set_half_open(true);

        let (mut out_reader, out_writer) = outbound.into_split();
        let (mut in_reader, in_writer) = inbound.into_split();
        drop(out_writer);
        let mut buf = Vec::new();
        in_reader.read_to_end(&mut buf).await.unwrap();
        drop(in_writer);
        out_reader.read_to_end(&mut buf).await.unwrap();

        assert_eq!(left.channel_count(), 0);
        assert_eq!(right.channel_count(), 0);
    }
}
