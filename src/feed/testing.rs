//! In-memory feed doubles for manager and subscription tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::{EditFeed, FeedCallback, FeedEvent, FeedFactory, FeedListeners, ListenerId};
use crate::cell::CellIndex;
use crate::edit::CompressedEdit;

/// Always-loaded feed that records how often it was disposed
pub struct MemoryFeed {
    cell: CellIndex,
    edits: Mutex<Vec<CompressedEdit>>,
    listeners: FeedListeners,
    pub disposals: AtomicUsize,
}

impl MemoryFeed {
    pub fn new(cell: CellIndex) -> Self {
        Self {
            cell,
            edits: Mutex::new(Vec::new()),
            listeners: FeedListeners::new(),
            disposals: AtomicUsize::new(0),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

impl EditFeed for MemoryFeed {
    fn cell_index(&self) -> CellIndex {
        self.cell
    }

    fn submit(&self, edit: CompressedEdit) {
        self.edits.lock().unwrap().push(edit);
        self.listeners.notify(FeedEvent { cell: self.cell, edit });
    }

    fn copy_history(&self, out: &mut Vec<CompressedEdit>) {
        out.extend_from_slice(&self.edits.lock().unwrap());
    }

    fn listen(&self, callback: FeedCallback) -> ListenerId {
        self.listeners.add(callback)
    }

    fn unlisten(&self, id: ListenerId) {
        self.listeners.remove(id);
    }

    fn is_loaded(&self) -> bool {
        true
    }

    fn len(&self) -> usize {
        self.edits.lock().unwrap().len()
    }

    fn dispose(&self) {
        self.disposals.fetch_add(1, Ordering::SeqCst);
    }
}

/// Factory that hands out [`MemoryFeed`]s and remembers every one
#[derive(Clone, Default)]
pub struct MemoryFeedFactory {
    pub created: Arc<Mutex<HashMap<CellIndex, Vec<Arc<MemoryFeed>>>>>,
}

impl MemoryFeedFactory {
    /// Most recent feed created for `cell`
    pub fn feed(&self, cell: CellIndex) -> Option<Arc<MemoryFeed>> {
        self.created.lock().unwrap().get(&cell).and_then(|v| v.last().cloned())
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().values().map(Vec::len).sum()
    }
}

impl FeedFactory for MemoryFeedFactory {
    fn create_feed(&self, cell: CellIndex) -> Arc<dyn EditFeed> {
        let feed = Arc::new(MemoryFeed::new(cell));
        self.created.lock().unwrap().entry(cell).or_default().push(feed.clone());
        feed
    }
}
