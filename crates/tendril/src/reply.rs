//! Reply context pool and the reply handle

use crate::capture::{self, PumpOwner};
use crate::session::SessionShared;
use crate::{Payload, Result, TendrilError};
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tendril_proto::{ChannelSender, Envelope};
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, trace, warn};

/// Error sent when a handler drops its reply unanswered
pub const DROPPED_REPLY: &str = "request dropped without a reply";

#[derive(Default)]
struct ReplySlot {
    generation: u64,
    request_id: Option<String>,
    destination: Option<ChannelSender>,
    /// Dispatcher slot held until the reply is written
    completion: Option<OwnedSemaphorePermit>,
}

impl ReplySlot {
    fn clear(&mut self) -> Option<OwnedSemaphorePermit> {
        self.request_id = None;
        self.destination = None;
        self.generation = self.generation.wrapping_add(1);
        self.completion.take()
    }
}

struct PoolInner {
    slots: Vec<ReplySlot>,
    free: Vec<usize>,
}

/// Checked-out slot; stale once its slot is released
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReplyContext {
    index: usize,
    generation: u64,
}

/// Fixed arena of reply contexts with a free-index stack
pub(crate) struct ReplyPool {
    inner: Mutex<PoolInner>,
    capacity: usize,
}

impl ReplyPool {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                slots: (0..capacity).map(|_| ReplySlot::default()).collect(),
                free: (0..capacity).rev().collect(),
            }),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take a free slot
    pub(crate) fn checkout(&self) -> Option<ReplyContext> {
        let mut inner = self.lock();
        let index = inner.free.pop()?;
        Some(ReplyContext {
            index,
            generation: inner.slots[index].generation,
        })
    }

    /// Bind a checked-out slot to a request
    pub(crate) fn bind(
        &self,
        context: ReplyContext,
        request_id: &str,
        destination: ChannelSender,
        completion: OwnedSemaphorePermit,
    ) -> bool {
        let mut inner = self.lock();
        match inner.slots.get_mut(context.index) {
            Some(slot) if slot.generation == context.generation => {
                slot.request_id = Some(request_id.to_string());
                slot.destination = Some(destination);
                slot.completion = Some(completion);
                true
            }
            _ => false,
        }
    }

    /// Request id and destination bound to a slot
    pub(crate) fn binding(&self, context: ReplyContext) -> Option<(String, ChannelSender)> {
        let inner = self.lock();
        let slot = inner.slots.get(context.index)?;
        if slot.generation != context.generation {
            return None;
        }
        Some((slot.request_id.clone()?, slot.destination.clone()?))
    }

    /// Clear a slot and return it to the free list. Returns the slot's
    /// completion; a stale context releases nothing.
    pub(crate) fn release(&self, context: ReplyContext) -> Option<OwnedSemaphorePermit> {
        let mut inner = self.lock();
        let slot = match inner.slots.get_mut(context.index) {
            Some(slot) if slot.generation == context.generation => slot,
            _ => {
                debug!(index = context.index, "stale reply context ignored");
                return None;
            }
        };
        let completion = slot.clear();
        inner.free.push(context.index);
        completion
    }

    pub(crate) fn available(&self) -> usize {
        self.lock().free.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Answers one inbound request
///
/// Every method consumes the handle, so a request is answered at most
/// once. Dropping the handle unanswered replies with an error.
pub struct Reply {
    shared: Arc<SessionShared>,
    context: Option<ReplyContext>,
}

impl Reply {
    pub(crate) fn checkout(
        shared: &Arc<SessionShared>,
        request_id: &str,
        destination: ChannelSender,
        completion: OwnedSemaphorePermit,
    ) -> Option<Self> {
        let context = shared.replies.checkout()?;
        if !shared.replies.bind(context, request_id, destination, completion) {
            shared.replies.release(context);
            return None;
        }
        Some(Self {
            shared: Arc::clone(shared),
            context: Some(context),
        })
    }

    /// Id of the request being answered
    pub fn request_id(&self) -> Option<String> {
        let context = self.context?;
        self.shared.replies.binding(context).map(|(id, _)| id)
    }

    /// Reply with a payload, which may carry streams
    pub fn send(mut self, payload: Payload) -> Result<()> {
        self.finish(Ok(payload))
    }

    /// Reply with any serializable value
    pub fn ok<T: Serialize + ?Sized>(mut self, data: &T) -> Result<()> {
        match Payload::from_serialize(data) {
            Ok(payload) => self.finish(Ok(payload)),
            Err(e) => {
                self.finish(Err(e.to_string()))?;
                Err(e)
            }
        }
    }

    /// Reply with `null`
    pub fn empty(mut self) -> Result<()> {
        self.finish(Ok(Payload::empty()))
    }

    /// Reply with an error; the caller receives its message
    pub fn error(mut self, error: impl fmt::Display) -> Result<()> {
        self.finish(Err(error.to_string()))
    }

    fn finish(&mut self, outcome: std::result::Result<Payload, String>) -> Result<()> {
        let context = self
            .context
            .take()
            .ok_or_else(|| TendrilError::Session("reply already sent".to_string()))?;

        let result = self.write(context, outcome);
        // Slot goes back to the pool before the dispatcher slot is freed
        let completion = self.shared.replies.release(context);
        drop(completion);
        result
    }

    fn write(&self, context: ReplyContext, outcome: std::result::Result<Payload, String>) -> Result<()> {
        let (request_id, destination) = self
            .shared
            .replies
            .binding(context)
            .ok_or_else(|| TendrilError::Session("reply context was recycled".to_string()))?;

        let payload = match outcome {
            Ok(payload) => payload,
            Err(message) => {
                trace!(request_id = %request_id, error = %message, "sending error reply");
                return self
                    .shared
                    .send_envelope(&destination, &Envelope::error(&request_id, message));
            }
        };

        let captured = match capture::capture(&self.shared, payload) {
            Ok(captured) => captured,
            Err(e) => {
                warn!(request_id = %request_id, error = %e, "failed to encode reply");
                self.shared
                    .send_envelope(&destination, &Envelope::error(&request_id, e.to_string()))?;
                return Err(e);
            }
        };

        let (envelope, pumps) = captured.into_envelope(&request_id);
        if let Err(e) = self.shared.send_envelope(&destination, &envelope) {
            pumps.abort();
            return Err(e);
        }
        trace!(request_id = %request_id, streams = envelope.streams.len(), "reply sent");
        pumps.start(&self.shared, PumpOwner::Reply(request_id));
        Ok(())
    }
}

impl Drop for Reply {
    fn drop(&mut self) {
        if self.context.is_some() {
            warn!(request_id = ?self.request_id(), "{}", DROPPED_REPLY);
            let _ = self.finish(Err(DROPPED_REPLY.to_string()));
        }
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reply")
            .field("request_id", &self.request_id())
            .finish()
    }
}

#[cfg(test)]
mod tests;
