//! Request handlers and the inbound dispatcher

use crate::capture;
use crate::reply::Reply;
use crate::session::SessionShared;
use crate::Payload;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tendril_proto::{ChannelSender, Envelope};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, trace, warn};

/// Application handler for inbound requests
///
/// The handler answers through `reply`, immediately or at any later point.
/// The dispatcher slot the request occupies is freed when the reply is
/// sent or dropped, not when `on_request` returns.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Handle one request
    async fn on_request(&self, payload: Payload, reply: Reply);
}

/// Handler built from a closure, see [`handler_fn`]
pub struct FnHandler<F> {
    f: F,
}

/// Build a handler from an async closure
///
/// ```ignore
/// let handler = handler_fn(|payload, reply: Reply| async move {
///     let _ = reply.send(payload);
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Payload, Reply) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> RequestHandler for FnHandler<F>
where
    F: Fn(Payload, Reply) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn on_request(&self, payload: Payload, reply: Reply) {
        (self.f)(payload, reply).await
    }
}

#[async_trait]
impl<H: RequestHandler + ?Sized> RequestHandler for Arc<H> {
    async fn on_request(&self, payload: Payload, reply: Reply) {
        (**self).on_request(payload, reply).await
    }
}

/// A decoded request envelope and where its reply goes
pub(crate) struct InboundRequest {
    pub(crate) envelope: Envelope,
    pub(crate) destination: ChannelSender,
}

/// Queue feeding the dispatcher worker
pub(crate) struct Dispatcher {
    tx: mpsc::UnboundedSender<InboundRequest>,
}

impl Dispatcher {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<InboundRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub(crate) fn submit(&self, request: InboundRequest) {
        if self.tx.send(request).is_err() {
            debug!("dispatcher stopped, request dropped");
        }
    }
}

/// Run queued requests, at most `max_inflight` at a time
pub(crate) async fn run(shared: Arc<SessionShared>, mut requests: mpsc::UnboundedReceiver<InboundRequest>) {
    let slots = Arc::new(Semaphore::new(shared.config.max_inflight));
    let shutdown = shared.mux.shutdown_token();

    loop {
        let request = tokio::select! {
            _ = shutdown.cancelled() => break,
            request = requests.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        let permit = tokio::select! {
            _ = shutdown.cancelled() => break,
            permit = Arc::clone(&slots).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        tokio::spawn(process(Arc::clone(&shared), request, permit));
    }
    debug!("dispatcher stopped");
}

async fn process(shared: Arc<SessionShared>, request: InboundRequest, permit: OwnedSemaphorePermit) {
    let InboundRequest { envelope, destination } = request;
    let Envelope {
        id,
        data,
        error,
        streams,
    } = envelope;

    if error.is_some() {
        warn!(request_id = %id, "error envelope on a request channel ignored");
        capture::discard(&shared, streams);
        return;
    }

    let Some(reply) = Reply::checkout(&shared, &id, destination.clone(), permit) else {
        error!(request_id = %id, "no free reply context");
        let _ = shared.send_envelope(&destination, &Envelope::error(&id, "server busy"));
        capture::discard(&shared, streams);
        return;
    };

    let payload = match capture::release_payload(&shared, data, streams).await {
        Ok(payload) => payload,
        Err(e) => {
            warn!(request_id = %id, error = %e, "failed to release request");
            let _ = reply.error(e);
            return;
        }
    };

    match shared.handler() {
        Some(handler) => {
            trace!(request_id = %id, "dispatching request");
            handler.on_request(payload, reply).await;
        }
        None => {
            warn!(request_id = %id, "no request handler registered");
            let _ = reply.error("no request handler registered");
        }
    }
}
