//! Pending request table

use crate::{Payload, Result, TendrilError};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::oneshot;
use tracing::debug;

/// Where a request's outcome is delivered
pub(crate) type Completion = oneshot::Sender<Result<Payload>>;

#[derive(Default)]
struct PendingInner {
    requests: HashMap<String, Completion>,
    /// Set once the session tears down; later registrations fail with it
    closed: Option<TendrilError>,
}

/// Outstanding requests by id
///
/// Removing an entry is the single point that decides a request's outcome,
/// so each request completes at most once.
#[derive(Default)]
pub(crate) struct PendingTable {
    inner: Mutex<PendingInner>,
}

impl PendingTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, PendingInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a request and return the receiver for its outcome
    pub(crate) fn register(&self, id: &str) -> Result<oneshot::Receiver<Result<Payload>>> {
        let mut inner = self.lock();
        if let Some(err) = &inner.closed {
            return Err(err.clone());
        }
        if inner.requests.contains_key(id) {
            return Err(TendrilError::Session(format!("duplicate request id {}", id)));
        }
        let (tx, rx) = oneshot::channel();
        inner.requests.insert(id.to_string(), tx);
        Ok(rx)
    }

    /// Whether `id` is still waiting for a response
    pub(crate) fn contains(&self, id: &str) -> bool {
        self.lock().requests.contains_key(id)
    }

    /// Remove the entry for `id`; whoever gets `Some` delivers the outcome
    pub(crate) fn complete(&self, id: &str) -> Option<Completion> {
        self.lock().requests.remove(id)
    }

    /// Fail every outstanding request and refuse new ones
    pub(crate) fn close(&self, err: &TendrilError) {
        let drained: Vec<(String, Completion)> = {
            let mut inner = self.lock();
            if inner.closed.is_none() {
                inner.closed = Some(err.clone());
            }
            inner.requests.drain().collect()
        };

        if !drained.is_empty() {
            debug!(count = drained.len(), error = %err, "failing pending requests");
        }
        for (_, tx) in drained {
            let _ = tx.send(Err(err.clone()));
        }
    }

    /// Error the table was closed with, if any
    pub(crate) fn closed_error(&self) -> Option<TendrilError> {
        self.lock().closed.clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().requests.len()
    }
}

/// Removes a request's entry when the caller stops waiting
pub(crate) struct PendingGuard<'a> {
    table: &'a PendingTable,
    id: &'a str,
}

impl<'a> PendingGuard<'a> {
    pub(crate) fn new(table: &'a PendingTable, id: &'a str) -> Self {
        Self { table, id }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.table.complete(self.id);
    }
}

#[cfg(test)]
mod tests;
