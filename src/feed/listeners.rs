//! Callback registration list shared by feed backings

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::FeedEvent;

/// Listener invoked on the simulation thread for each new edit
pub type FeedCallback = Arc<dyn Fn(FeedEvent) + Send + Sync>;

/// Handle returned by registration, used to unregister
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Ordered list of listeners
#[derive(Default)]
pub struct FeedListeners {
    next_id: AtomicU64,
    entries: Mutex<Vec<(ListenerId, FeedCallback)>>,
}

impl FeedListeners {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, Vec<(ListenerId, FeedCallback)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, callback: FeedCallback) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries().push((id, callback));
        id
    }

    /// Returns whether `id` was registered
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|(i, _)| *i != id);
        entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Invoke every listener registered at the time of the call, in order.
    ///
    /// The list is not locked while callbacks run, so a callback may
    /// register or remove listeners.
    pub fn notify(&self, event: FeedEvent) {
        let snapshot: Vec<FeedCallback> = self.entries().iter().map(|(_, cb)| cb.clone()).collect();
        for callback in snapshot {
            callback(event);
        }
    }
}
