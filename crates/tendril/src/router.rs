//! Inbound channel routing
//!
//! Channels opened by the peer are classified by name. Stream channels are
//! parked in the waiting table until an envelope's descriptors claim them;
//! any other channel is the peer's main channel and carries requests. Our
//! own main channel carries the responses to our requests.

use crate::capture;
use crate::dispatch::InboundRequest;
use crate::session::{SessionEvent, SessionShared};
use crate::{Result, TendrilError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tendril_proto::{
    Channel, ChannelPurpose, ChannelReader, Envelope, FrameCodec, IncomingChannels, ProtocolError,
};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

#[derive(Default)]
struct WaitingInner {
    /// Stream channels that arrived before their descriptor
    parked: HashMap<String, Channel>,
    /// Descriptors that arrived before their stream channel
    waiters: HashMap<String, oneshot::Sender<Channel>>,
    closed: bool,
}

/// Rendezvous between peer-opened stream channels and the descriptors
/// that name them; either side may arrive first
#[derive(Default)]
pub(crate) struct WaitingTable {
    inner: Mutex<WaitingInner>,
}

impl WaitingTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, WaitingInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Hand a newly opened stream channel to its claimant, or park it
    pub(crate) fn deliver(&self, channel: Channel) {
        let name = channel.name().to_string();
        let mut inner = self.lock();
        if inner.closed {
            drop(inner);
            channel.reset();
            return;
        }

        if let Some(waiter) = inner.waiters.remove(&name) {
            drop(inner);
            if let Err(channel) = waiter.send(channel) {
                debug!(channel = %name, "claimant went away, resetting stream channel");
                channel.reset();
            }
            return;
        }

        if inner.parked.contains_key(&name) {
            drop(inner);
            warn!(channel = %name, "duplicate stream channel name, resetting");
            channel.reset();
            return;
        }
        trace!(channel = %name, "parked stream channel");
        inner.parked.insert(name, channel);
    }

    /// Take the stream channel `name`, waiting for the peer to open it
    pub(crate) async fn claim(&self, name: &str, shutdown: &CancellationToken) -> Result<Channel> {
        let rx = {
            let mut inner = self.lock();
            if inner.closed {
                return Err(TendrilError::ConnectionClosed("session closed".to_string()));
            }
            if let Some(channel) = inner.parked.remove(name) {
                return Ok(channel);
            }
            if let Some(existing) = inner.waiters.get(name) {
                if !existing.is_closed() {
                    return Err(TendrilError::Protocol(format!("stream channel {} claimed twice", name)));
                }
            }
            let (tx, rx) = oneshot::channel();
            inner.waiters.insert(name.to_string(), tx);
            rx
        };

        tokio::select! {
            channel = rx => channel.map_err(|_| {
                TendrilError::ConnectionClosed(format!("session closed while waiting for {}", name))
            }),
            _ = shutdown.cancelled() => Err(TendrilError::ConnectionClosed(format!(
                "session closed while waiting for {}",
                name
            ))),
        }
    }

    /// Drop parked channels and wake every claimant
    pub(crate) fn close(&self) {
        let parked: Vec<Channel> = {
            let mut inner = self.lock();
            inner.closed = true;
            inner.waiters.clear();
            inner.parked.drain().map(|(_, channel)| channel).collect()
        };
        if !parked.is_empty() {
            debug!(count = parked.len(), "dropping unclaimed stream channels");
        }
        for channel in parked {
            channel.reset();
        }
    }

    /// Number of parked channels
    pub(crate) fn len(&self) -> usize {
        self.lock().parked.len()
    }
}

/// Route every channel the peer opens
pub(crate) async fn accept_loop(shared: Arc<SessionShared>, mut incoming: IncomingChannels) {
    while let Some(channel) = incoming.accept().await {
        match ChannelPurpose::classify(channel.name()) {
            ChannelPurpose::Stream => shared.waiting.deliver(channel),
            ChannelPurpose::Main => {
                debug!(channel = %channel.name(), "peer opened main channel");
                tokio::spawn(request_loop(Arc::clone(&shared), channel));
            }
        }
    }
    debug!("accept loop stopped");
}

/// Read request envelopes from a peer main channel and queue them for
/// dispatch; replies go back on the same channel
async fn request_loop(shared: Arc<SessionShared>, channel: Channel) {
    let name = channel.name().to_string();
    let (mut reader, writer) = channel.into_split();
    let destination = writer.sender();
    let mut codec = FrameCodec::<Envelope>::with_max_frame_size(shared.config.mux.max_frame_size);

    loop {
        match codec.read_frame(&mut reader).await {
            Ok(Some(envelope)) => {
                trace!(request_id = %envelope.id, "request received");
                shared.dispatcher.submit(InboundRequest {
                    envelope,
                    destination: destination.clone(),
                });
            }
            Ok(None) => {
                debug!(channel = %name, "peer main channel ended");
                break;
            }
            Err(ProtocolError::Io(e)) => {
                debug!(channel = %name, error = %e, "peer main channel closed");
                break;
            }
            Err(e) => {
                warn!(channel = %name, error = %e, "malformed request envelope, resetting channel");
                destination.reset();
                shared.emit(SessionEvent::Error(TendrilError::Protocol(e.to_string())));
                break;
            }
        }
    }
    drop(writer);
}

/// Read response envelopes from our own main channel
pub(crate) async fn response_loop(shared: Arc<SessionShared>, mut reader: ChannelReader) {
    let mut codec = FrameCodec::<Envelope>::with_max_frame_size(shared.config.mux.max_frame_size);

    let failure = loop {
        match codec.read_frame(&mut reader).await {
            Ok(Some(envelope)) => {
                tokio::spawn(handle_response(Arc::clone(&shared), envelope));
            }
            Ok(None) => break TendrilError::ConnectionClosed("response channel ended by peer".to_string()),
            Err(ProtocolError::Io(e)) => break TendrilError::ConnectionClosed(format!("response channel closed: {}", e)),
            Err(e) => {
                error!(error = %e, "malformed response envelope");
                break TendrilError::Protocol(e.to_string());
            }
        }
    };

    // Without a response channel no pending request can complete
    if !shared.mux.is_closed() {
        shared.destroy(Some(failure));
    }
}

async fn handle_response(shared: Arc<SessionShared>, envelope: Envelope) {
    let Envelope {
        id,
        data,
        error,
        streams,
    } = envelope;

    if !shared.pending.contains(&id) {
        debug!(request_id = %id, "response without a pending request discarded");
        capture::discard(&shared, streams);
        return;
    }

    let result = match error {
        Some(message) => {
            capture::discard(&shared, streams);
            Err(TendrilError::Remote(message))
        }
        None => capture::release_payload(&shared, data, streams).await,
    };

    match shared.pending.complete(&id) {
        Some(tx) => {
            trace!(request_id = %id, ok = result.is_ok(), "response delivered");
            let _ = tx.send(result);
        }
        None => debug!(request_id = %id, "request finished before its response was released"),
    }
}
