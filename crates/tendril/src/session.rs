//! Session management and request correlation

use crate::capture::{self, PumpOwner};
use crate::dispatch::{self, Dispatcher, RequestHandler};
use crate::pending::{PendingGuard, PendingTable};
use crate::reply::ReplyPool;
use crate::router::{self, WaitingTable};
use crate::{Payload, Result, TendrilError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tendril_proto::{
    default_codec, request_id, ChannelSender, ChannelWriter, CloseReason, Envelope, FrameCodec, MuxConfig,
    Multiplexer, PayloadCodec, SharedCodec, MAIN_CHANNEL,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Default number of requests handled concurrently
pub const DEFAULT_MAX_INFLIGHT: usize = 100;

/// Capacity of the session event channel
const EVENT_CAPACITY: usize = 64;

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Inbound requests handled concurrently; also the reply pool size
    pub max_inflight: usize,
    /// Fail requests that wait longer than this for a response
    pub request_timeout: Option<Duration>,
    /// Multiplexer settings
    pub mux: MuxConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_inflight: DEFAULT_MAX_INFLIGHT,
            request_timeout: None,
            mux: MuxConfig {
                half_open: true,
                ..MuxConfig::default()
            },
        }
    }
}

/// Notifications delivered to [`Session::events`] subscribers
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Session-level failure: transport errors, malformed traffic, failed
    /// pumps of fired requests
    Error(TendrilError),
    /// Sending the streams of a reply failed
    ResponseError {
        /// Request the reply answered
        request_id: String,
        /// What went wrong
        error: TendrilError,
    },
    /// The session has shut down
    Closed,
}

/// Session builder for configuring connections
pub struct SessionBuilder {
    config: SessionConfig,
    codec: SharedCodec,
    handler: Option<Arc<dyn RequestHandler>>,
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionBuilder {
    /// Create a builder with default settings and the JSON codec
    pub fn new() -> Self {
        Self {
            config: SessionConfig::default(),
            codec: default_codec(),
            handler: None,
        }
    }

    /// Set the payload codec
    pub fn with_codec(mut self, codec: impl PayloadCodec + 'static) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    /// Set the maximum number of inbound requests handled concurrently
    pub fn with_max_inflight(mut self, max_inflight: usize) -> Self {
        self.config.max_inflight = max_inflight.max(1);
        self
    }

    /// Fail requests that get no response within `timeout`
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = Some(timeout);
        self
    }

    /// Set multiplexer limits. Session channels are always half-open.
    pub fn with_mux_config(mut self, mux: MuxConfig) -> Self {
        self.config.mux = mux;
        self
    }

    /// Register the request handler
    pub fn with_handler(mut self, handler: impl RequestHandler + 'static) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub(crate) fn build_config(&self) -> SessionConfig {
        let mut config = self.config.clone();
        config.mux.half_open = true;
        config
    }

    /// Start a session over `io`. Must be called inside a tokio runtime.
    pub fn connect<T>(self, io: T) -> Result<Session>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let config = self.build_config();
        let (mux, incoming) = Multiplexer::new(io, config.mux.clone());
        let main = mux.open_channel(MAIN_CHANNEL)?;
        let (main_reader, main_writer) = main.into_split();
        let (dispatcher, requests) = Dispatcher::new();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let shared = Arc::new(SessionShared {
            id: Uuid::new_v4(),
            main: main_writer.sender(),
            main_writer: Mutex::new(Some(main_writer)),
            envelopes: FrameCodec::with_max_frame_size(config.mux.max_frame_size),
            pending: PendingTable::new(),
            waiting: WaitingTable::new(),
            replies: ReplyPool::new(config.max_inflight),
            dispatcher,
            handler: RwLock::new(self.handler),
            events,
            next_seq: AtomicU64::new(0),
            close_cause: Mutex::new(None),
            closed: CancellationToken::new(),
            codec: self.codec,
            mux,
            config,
        });

        let span = info_span!("session", id = %shared.id);
        tokio::spawn(router::accept_loop(Arc::clone(&shared), incoming).instrument(span.clone()));
        tokio::spawn(router::response_loop(Arc::clone(&shared), main_reader).instrument(span.clone()));
        tokio::spawn(dispatch::run(Arc::clone(&shared), requests).instrument(span.clone()));
        tokio::spawn(watch_transport(Arc::clone(&shared)).instrument(span));

        info!(
            session = %shared.id,
            codec = shared.codec.name(),
            max_inflight = shared.config.max_inflight,
            "session established"
        );

        Ok(Session {
            _owner: Arc::new(SessionOwner {
                shared: Arc::clone(&shared),
            }),
            shared,
        })
    }
}

/// State shared by the session handle and its background tasks
pub(crate) struct SessionShared {
    pub(crate) id: Uuid,
    pub(crate) config: SessionConfig,
    pub(crate) codec: SharedCodec,
    pub(crate) mux: Multiplexer,
    /// Our main channel; requests out, responses back
    main: ChannelSender,
    main_writer: Mutex<Option<ChannelWriter>>,
    envelopes: FrameCodec<Envelope>,
    pub(crate) pending: PendingTable,
    pub(crate) waiting: WaitingTable,
    pub(crate) replies: ReplyPool,
    pub(crate) dispatcher: Dispatcher,
    handler: RwLock<Option<Arc<dyn RequestHandler>>>,
    events: broadcast::Sender<SessionEvent>,
    /// Shared by request ids and stream channel names
    next_seq: AtomicU64,
    close_cause: Mutex<Option<TendrilError>>,
    closed: CancellationToken,
}

impl SessionShared {
    pub(crate) fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Frame and write one envelope to a channel
    pub(crate) fn send_envelope(&self, destination: &ChannelSender, envelope: &Envelope) -> Result<()> {
        let frame = self.envelopes.encode_frame(envelope)?;
        destination.send(frame)?;
        Ok(())
    }

    pub(crate) fn handler(&self) -> Option<Arc<dyn RequestHandler>> {
        self.handler.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_handler(&self, handler: Arc<dyn RequestHandler>) {
        *self.handler.write().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Tear the session down; the first recorded cause wins
    pub(crate) fn destroy(&self, cause: Option<TendrilError>) {
        if let Some(cause) = cause {
            let mut slot = self.close_cause.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_none() {
                debug!(error = %cause, "destroying session");
                *slot = Some(cause);
            }
        }
        self.mux.close();
    }

    /// Error pending requests fail with, and whether it is reported as an
    /// error event
    fn teardown_error(&self) -> (TendrilError, bool) {
        let cause = self.close_cause.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(cause) = cause {
            return (cause, true);
        }
        match self.mux.close_reason() {
            Some(CloseReason::Failed(reason)) => (TendrilError::Transport(reason), true),
            Some(CloseReason::RemoteClosed) => {
                (TendrilError::ConnectionClosed("connection closed by peer".to_string()), false)
            }
            Some(CloseReason::Local) | None => (TendrilError::ConnectionClosed("session closed".to_string()), false),
        }
    }
}

async fn watch_transport(shared: Arc<SessionShared>) {
    shared.mux.closed().await;
    let (err, report) = shared.teardown_error();

    shared.pending.close(&err);
    shared.waiting.close();
    drop(shared.main_writer.lock().unwrap_or_else(|e| e.into_inner()).take());

    if report {
        error!(error = %err, "session failed");
        shared.emit(SessionEvent::Error(err));
    }
    info!(session = %shared.id, "session closed");
    shared.emit(SessionEvent::Closed);
    shared.closed.cancel();
}

/// Closes the session when the last user handle goes away
struct SessionOwner {
    shared: Arc<SessionShared>,
}

impl Drop for SessionOwner {
    fn drop(&mut self) {
        if !self.shared.mux.is_closed() {
            debug!(session = %self.shared.id, "last session handle dropped");
            self.shared.mux.close();
        }
    }
}

/// One end of a bidirectional RPC connection
///
/// Both ends can send requests and serve them. Cloning is cheap; dropping
/// the last clone closes the session.
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
    _owner: Arc<SessionOwner>,
}

impl Session {
    /// Start a session over `io` with default settings
    pub fn new<T>(io: T) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        SessionBuilder::new().connect(io)
    }

    /// Create a session builder
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    /// Unique session id
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// Send a request and wait for its response
    ///
    /// Streams in the response come back as live handles under their
    /// original names. Dropping the returned future abandons the request;
    /// a late response is then ignored.
    pub async fn request(&self, payload: Payload) -> Result<Payload> {
        let shared = &self.shared;
        let id = request_id(shared.next_seq());
        let response = shared.pending.register(&id)?;
        let _guard = PendingGuard::new(&shared.pending, &id);

        let (envelope, pumps) = capture::capture(shared, payload)?.into_envelope(&id);
        if let Err(e) = shared.send_envelope(&shared.main, &envelope) {
            pumps.abort();
            return Err(shared.pending.closed_error().unwrap_or(e));
        }
        debug!(request_id = %id, streams = envelope.streams.len(), "request sent");
        pumps.start(shared, PumpOwner::Request(id.clone()));

        let outcome = match shared.config.request_timeout {
            Some(duration) => match timeout(duration, response).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(request_id = %id, ?duration, "request timed out");
                    return Err(TendrilError::Timeout { duration });
                }
            },
            None => response.await,
        };

        outcome.unwrap_or_else(|_| {
            Err(shared
                .pending
                .closed_error()
                .unwrap_or_else(|| TendrilError::ConnectionClosed("request abandoned".to_string())))
        })
    }

    /// Send a request without waiting for a response
    ///
    /// Any reply is discarded and the streams it carries are reset.
    pub fn fire(&self, payload: Payload) -> Result<()> {
        let shared = &self.shared;
        if let Some(err) = shared.pending.closed_error() {
            return Err(err);
        }
        let id = request_id(shared.next_seq());
        let (envelope, pumps) = capture::capture(shared, payload)?.into_envelope(&id);
        if let Err(e) = shared.send_envelope(&shared.main, &envelope) {
            pumps.abort();
            return Err(e);
        }
        debug!(request_id = %id, streams = envelope.streams.len(), "request fired");
        pumps.start(shared, PumpOwner::Fire(id));
        Ok(())
    }

    /// Register or replace the request handler
    pub fn on_request(&self, handler: impl RequestHandler + 'static) {
        self.shared.set_handler(Arc::new(handler));
    }

    /// Subscribe to session events
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// Close the session; pending requests fail with a connection-closed
    /// error
    pub fn close(&self) {
        self.shared.destroy(None);
    }

    /// Tear the session down, failing pending requests with `error` when
    /// given
    pub fn destroy(&self, error: Option<TendrilError>) {
        self.shared.destroy(error);
    }

    /// Wait until the session has shut down
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await
    }

    /// Whether the session has shut down or is shutting down
    pub fn is_closed(&self) -> bool {
        self.shared.mux.is_closed()
    }

    /// Requests waiting for a response
    pub fn pending_count(&self) -> usize {
        self.shared.pending.len()
    }

    /// Reply contexts currently free
    pub fn reply_contexts_available(&self) -> usize {
        self.shared.replies.available()
    }

    /// Size of the reply context pool
    pub fn reply_contexts_capacity(&self) -> usize {
        self.shared.replies.capacity()
    }

    /// Peer stream channels not yet claimed by a descriptor
    pub fn waiting_channel_count(&self) -> usize {
        self.shared.waiting.len()
    }

    /// Payload codec in use
    pub fn codec(&self) -> &SharedCodec {
        &self.shared.codec
    }

    /// Session configuration
    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("codec", &self.shared.codec.name())
            .field("pending", &self.pending_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
impl Session {
    pub(crate) fn shared_for_tests(&self) -> Arc<SessionShared> {
        Arc::clone(&self.shared)
    }
}

#[cfg(test)]
impl SessionShared {
    pub(crate) fn main_for_tests(&self) -> &ChannelSender {
        &self.main
    }
}
