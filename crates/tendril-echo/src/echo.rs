//! Echo request handler

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use tendril::{Payload, Reply, RequestHandler};
use tracing::{debug, warn};

/// Answers every request with its own data and streams
///
/// Received streams are embedded unchanged in the reply, so bytes or items
/// sent to the server flow straight back to the caller.
#[derive(Debug, Default)]
pub struct EchoHandler {
    served: AtomicU64,
}

impl EchoHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests answered so far
    pub fn served(&self) -> u64 {
        self.served.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl RequestHandler for EchoHandler {
    async fn on_request(&self, payload: Payload, reply: Reply) {
        let request_id = reply.request_id();
        debug!(?request_id, streams = payload.streams.len(), "echoing request");
        match reply.send(payload) {
            Ok(()) => {
                self.served.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => warn!(?request_id, error = %e, "failed to send echo"),
        }
    }
}
