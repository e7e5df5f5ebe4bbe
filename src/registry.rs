//! Correlation registry.
//!
//! Maps each pending correlation ID to the one-shot channel its caller is
//! waiting on. The consumer resolves entries as replies arrive; callers
//! register entries before publishing and expire them on timeout.
//!
//! # Concurrency
//!
//! Entries are guarded by a single mutex. Every operation is a plain
//! `HashMap` insert or remove and the lock is never held across an await, so
//! contention stays low. `resolve` and `expire` both remove the entry under
//! the lock, so for one ID exactly one of them wins.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;

use crate::{CorrelationId, Error, ResponseEnvelope, Result};

type PendingMap = HashMap<CorrelationId, oneshot::Sender<ResponseEnvelope>>;

/// Acquire a mutex guard, intentionally ignoring poisoning.
///
/// The map has no invariants spanning several entries; the worst outcome of
/// continuing after a panic elsewhere is a reply that is never matched.
pub(crate) fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Process-wide table of callers waiting for replies.
#[derive(Default)]
pub struct CorrelationRegistry {
    pending: Mutex<PendingMap>,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an entry for `id` and return the end the caller waits on.
    ///
    /// # Errors
    ///
    /// [`Error::DuplicateCorrelationId`] if `id` is already pending.
    pub fn register(&self, id: CorrelationId) -> Result<oneshot::Receiver<ResponseEnvelope>> {
        let mut pending = lock_ignore_poison(&self.pending);

        match pending.entry(id) {
            Entry::Occupied(entry) => Err(Error::DuplicateCorrelationId(entry.key().clone())),
            Entry::Vacant(entry) => {
                let (tx, rx) = oneshot::channel();
                entry.insert(tx);
                Ok(rx)
            }
        }
    }

    /// Deliver `response` to the caller waiting on `id` and remove the entry.
    ///
    /// Returns `false` when nobody here waits for `id`; the response is then
    /// dropped. That is expected whenever the reply belongs to a request this
    /// process did not issue.
    pub fn resolve(&self, id: &CorrelationId, response: ResponseEnvelope) -> bool {
        let tx = lock_ignore_poison(&self.pending).remove(id);

        match tx {
            Some(tx) => {
                if tx.send(response).is_err() {
                    // The caller gave up between our remove and send.
                    log_debug!("waiter for {id} dropped before delivery");
                }
                true
            }
            None => false,
        }
    }

    /// Remove the entry for `id` without delivering anything.
    ///
    /// Returns `false` if the entry was already resolved or expired.
    pub fn expire(&self, id: &CorrelationId) -> bool {
        lock_ignore_poison(&self.pending).remove(id).is_some()
    }

    pub fn contains(&self, id: &CorrelationId) -> bool {
        lock_ignore_poison(&self.pending).contains_key(id)
    }

    pub fn len(&self) -> usize {
        lock_ignore_poison(&self.pending).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every pending entry. Waiting callers observe a closed channel.
    ///
    /// Returns the number of entries removed.
    pub fn drain(&self) -> usize {
        let drained: Vec<_> = lock_ignore_poison(&self.pending).drain().collect();
        drained.len()
    }
}

/// Expires its entry when dropped.
///
/// Held by a caller for the duration of a request so the entry is removed
/// even if the caller's future is cancelled. After a successful resolve the
/// expire is a no-op.
pub(crate) struct PendingGuard {
    registry: Arc<CorrelationRegistry>,
    id: CorrelationId,
}

impl PendingGuard {
    pub(crate) fn new(registry: Arc<CorrelationRegistry>, id: CorrelationId) -> Self {
        Self { registry, id }
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.registry.expire(&self.id) {
            log_debug!("expired pending request {}", self.id);
        }
    }
}
