//! The ordered queue of shares for one destination.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{ShareHandle, ShareStatus};

/// Ordered collection of shares awaiting or undergoing transfer.
///
/// Cloning gives another handle to the same queue. The lock is never held
/// across an await point.
#[derive(Debug, Clone, Default)]
pub struct ShareQueue {
    items: Arc<Mutex<Vec<ShareHandle>>>,
}

impl ShareQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ShareHandle>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a share.
    pub fn push(&self, share: ShareHandle) {
        self.lock().push(share);
    }

    /// The earliest-inserted share still `Pending`.
    pub fn next_pending(&self) -> Option<ShareHandle> {
        self.lock()
            .iter()
            .find(|share| share.status() == ShareStatus::Pending)
            .cloned()
    }

    /// Remove `share` by identity. Returns whether it was queued.
    pub fn remove(&self, share: &ShareHandle) -> bool {
        let mut items = self.lock();
        let before = items.len();
        items.retain(|queued| !Arc::ptr_eq(queued, share));
        items.len() != before
    }

    /// Whether `share` is queued.
    pub fn contains(&self, share: &ShareHandle) -> bool {
        self.lock().iter().any(|queued| Arc::ptr_eq(queued, share))
    }

    /// Number of queued shares.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copy of the queued handles in order.
    pub fn snapshot(&self) -> Vec<ShareHandle> {
        self.lock().clone()
    }

    /// Remove and return every queued share.
    pub fn drain(&self) -> Vec<ShareHandle> {
        std::mem::take(&mut *self.lock())
    }
}
