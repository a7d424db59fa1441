//! Blob-store backed edit feed.
//!
//! The feed starts unloaded. Its history is read on a worker thread and
//! handed back to the simulation thread through the dispatcher, where it is
//! spliced in front of anything submitted during the load and replayed to
//! listeners. Flushing rewrites the whole blob from the in-memory log.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::runtime::{Handle, Runtime};

use super::{EditFeed, FeedCallback, FeedEvent, FeedFactory, FeedListeners, ListenerId};
use crate::cell::CellIndex;
use crate::core::config::EditSyncConfig;
use crate::core::types::Result;
use crate::dispatch::DispatchHandle;
use crate::edit::CompressedEdit;
use crate::store::{decode_blob, encode_blob, BlobStore, FsBlobStore};

/// In-memory edit log guarded by the feed's lock
#[derive(Default)]
struct FeedLog {
    edits: Vec<CompressedEdit>,
    loaded: bool,
    /// Changed since the last flush
    dirty: bool,
    /// Stored blob could not be read; never overwrite it
    read_only: bool,
}

/// Edit feed persisted as one blob per cell
pub struct PersistedEditFeed {
    cell: CellIndex,
    store: Arc<dyn BlobStore>,
    log: Mutex<FeedLog>,
    listeners: FeedListeners,
    disposed: AtomicBool,
}

impl PersistedEditFeed {
    /// Create an unloaded feed. Call [`Self::begin_load`] to read history.
    pub fn new(cell: CellIndex, store: Arc<dyn BlobStore>) -> Self {
        Self {
            cell,
            store,
            log: Mutex::new(FeedLog::default()),
            listeners: FeedListeners::new(),
            disposed: AtomicBool::new(false),
        }
    }

    fn log(&self) -> MutexGuard<'_, FeedLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Whether there are edits not yet written to the store
    pub fn is_dirty(&self) -> bool {
        self.log().dirty
    }

    /// Read the stored history on `runtime`'s blocking pool and finish the
    /// load on the simulation thread via `dispatch`.
    pub fn begin_load(self: &Arc<Self>, runtime: &Handle, dispatch: DispatchHandle) {
        let feed = Arc::clone(self);
        let store = Arc::clone(&self.store);
        let cell = self.cell;

        runtime.spawn_blocking(move || {
            let result = read_history(store.as_ref(), cell);
            if !dispatch.post(move || feed.finish_load(result)) {
                log::warn!("Dispatcher gone before cell {} finished loading", cell);
            }
        });
    }

    /// Apply a load result. Must run on the simulation thread.
    ///
    /// Stored edits go in front of edits submitted while loading; then every
    /// edit is replayed to listeners in order. A feed disposed mid-load is
    /// flushed instead of notifying.
    pub fn finish_load(&self, result: Result<Vec<CompressedEdit>>) {
        let (history, read_only) = match result {
            Ok(history) => (history, false),
            Err(e) if e.is_recoverable() => {
                log::warn!("Skipping stored edits for cell {}: {}", self.cell, e);
                (Vec::new(), true)
            }
            Err(e) => {
                log::error!("Failed to load cell {}: {}", self.cell, e);
                (Vec::new(), true)
            }
        };

        let loaded_count = history.len();
        let snapshot = {
            let mut log = self.log();
            log.edits.splice(0..0, history);
            log.loaded = true;
            log.read_only = read_only;
            log.edits.clone()
        };

        log::debug!(
            "Cell {} loaded {} stored edits ({} total)",
            self.cell,
            loaded_count,
            snapshot.len()
        );

        if self.is_disposed() {
            if let Err(e) = self.flush() {
                log::error!("Failed to flush cell {} after late load: {}", self.cell, e);
            }
            return;
        }

        for edit in snapshot {
            self.listeners.notify(FeedEvent { cell: self.cell, edit });
        }
    }

    /// Rewrite the stored blob from the in-memory log.
    ///
    /// Returns `Ok(false)` when nothing was written: no changes since the
    /// last flush, the feed has not loaded yet, or its stored blob was
    /// unreadable.
    pub fn flush(&self) -> Result<bool> {
        let blob = {
            let mut log = self.log();
            if !log.dirty {
                return Ok(false);
            }
            if !log.loaded {
                log::warn!("Can't flush cell {}: not loaded", self.cell);
                return Ok(false);
            }
            if log.read_only {
                log::warn!("Not flushing cell {}: stored blob is unreadable", self.cell);
                return Ok(false);
            }
            log.dirty = false;
            encode_blob(&log.edits)
        };

        if let Err(e) = self.store.write(self.cell, &blob) {
            self.log().dirty = true;
            return Err(e);
        }

        log::debug!("Flushed cell {} ({} bytes)", self.cell, blob.len());
        Ok(true)
    }
}

impl EditFeed for PersistedEditFeed {
    fn cell_index(&self) -> CellIndex {
        self.cell
    }

    fn submit(&self, edit: CompressedEdit) {
        if self.is_disposed() {
            log::debug!("Dropping edit for disposed cell {}", self.cell);
            return;
        }

        let loaded = {
            let mut log = self.log();
            log.edits.push(edit);
            log.dirty = true;
            log.loaded
        };

        if loaded {
            self.listeners.notify(FeedEvent { cell: self.cell, edit });
        }
    }

    fn copy_history(&self, out: &mut Vec<CompressedEdit>) {
        out.extend_from_slice(&self.log().edits);
    }

    fn listen(&self, callback: FeedCallback) -> ListenerId {
        self.listeners.add(callback)
    }

    fn unlisten(&self, id: ListenerId) {
        self.listeners.remove(id);
    }

    fn is_loaded(&self) -> bool {
        self.log().loaded
    }

    fn len(&self) -> usize {
        self.log().edits.len()
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        log::debug!("Disposing cell {}", self.cell);
        if let Err(e) = self.flush() {
            log::error!("Failed to flush cell {}: {}", self.cell, e);
        }
    }
}

fn read_history(store: &dyn BlobStore, cell: CellIndex) -> Result<Vec<CompressedEdit>> {
    if !store.exists(cell) {
        return Ok(Vec::new());
    }
    let blob = store.read(cell)?;
    decode_blob(cell, &blob)
}

/// Creates [`PersistedEditFeed`]s and starts their loads
pub struct PersistedFeedFactory {
    store: Arc<dyn BlobStore>,
    dispatch: DispatchHandle,
    handle: Handle,
    /// Dedicated runtime when not sharing the caller's
    runtime: Option<Runtime>,
}

impl PersistedFeedFactory {
    /// Create a factory with its own single-worker I/O runtime
    pub fn new(store: Arc<dyn BlobStore>, dispatch: DispatchHandle) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("terrafeed-io")
            .enable_all()
            .build()?;

        Ok(Self {
            store,
            dispatch,
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
        })
    }

    /// Create a factory persisting to the config's `storage_dir`, which is
    /// created if missing
    pub fn from_config(config: &EditSyncConfig, dispatch: DispatchHandle) -> Result<Self> {
        config.validate()?;
        let store = FsBlobStore::from_config(config);
        store.create_dir()?;
        log::info!("Persisting cells under {}", store.base_dir().display());
        Self::new(Arc::new(store), dispatch)
    }

    /// Create a factory that loads on an existing runtime
    pub fn with_handle(store: Arc<dyn BlobStore>, handle: Handle, dispatch: DispatchHandle) -> Self {
        Self {
            store,
            dispatch,
            handle,
            runtime: None,
        }
    }

    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }

    /// Create a feed, returning the concrete type
    pub fn create(&self, cell: CellIndex) -> Arc<PersistedEditFeed> {
        let feed = Arc::new(PersistedEditFeed::new(cell, Arc::clone(&self.store)));
        feed.begin_load(&self.handle, self.dispatch.clone());
        feed
    }
}

impl FeedFactory for PersistedFeedFactory {
    fn create_feed(&self, cell: CellIndex) -> Arc<dyn EditFeed> {
        self.create(cell)
    }
}

impl Drop for PersistedFeedFactory {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
