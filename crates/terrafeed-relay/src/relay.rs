//! Relay state: per-cell edit logs and connected peers
//!
//! The relay is the authority for every cell's history. Peers subscribe to
//! cells, get the stored history replayed as Edit frames, and from then on
//! receive each edit and observer batch other subscribers send.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};

use terrafeed::cell::CellIndex;
use terrafeed::edit::CompressedEdit;
use terrafeed::net::{ControlMessage, Frame, MessageKind};
use terrafeed::store::{decode_blob, encode_blob, BlobStore, FsBlobStore};

use crate::config::{RelayConfig, Result};

/// Connection-scoped peer identifier
pub type PeerId = u64;

struct CellLog {
    edits: Vec<CompressedEdit>,
    subscribers: HashSet<PeerId>,
    dirty: bool,
    /// Stored blob was unreadable; keep it untouched
    read_only: bool,
}

impl CellLog {
    fn new(edits: Vec<CompressedEdit>, read_only: bool) -> Self {
        Self {
            edits,
            subscribers: HashSet::new(),
            dirty: false,
            read_only,
        }
    }

    /// Blob to write, if the log changed since the last flush
    fn take_blob(&mut self) -> Option<Vec<u8>> {
        if !self.dirty || self.read_only {
            return None;
        }
        self.dirty = false;
        Some(encode_blob(&self.edits))
    }
}

struct Peer {
    observer_id: i64,
    name: String,
    appearance: String,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    cells: HashSet<CellIndex>,
}

impl Peer {
    fn send(&self, bytes: Vec<u8>) {
        if self.tx.send(bytes).is_err() {
            log::debug!("Peer {} is gone, dropping frame", self.observer_id);
        }
    }
}

#[derive(Default)]
struct RelayState {
    cells: HashMap<CellIndex, CellLog>,
    peers: HashMap<PeerId, Peer>,
    next_peer: PeerId,
}

/// Shared relay authority
pub struct Relay {
    config: RelayConfig,
    store: Arc<dyn BlobStore>,
    state: Mutex<RelayState>,
}

impl Relay {
    /// Relay persisting cells under `config.storage_dir`
    pub fn new(config: RelayConfig) -> Result<Self> {
        config.validate()?;
        let store = FsBlobStore::new(&config.storage_dir);
        store.create_dir()?;
        log::info!("Relay storing cells in {}", config.storage_dir.display());
        Ok(Self::with_store(config, Arc::new(store)))
    }

    pub fn with_store(config: RelayConfig, store: Arc<dyn BlobStore>) -> Self {
        Self {
            config,
            store,
            state: Mutex::new(RelayState::default()),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Register a peer whose handshake succeeded.
    ///
    /// Returns its id and the control messages to send before `Begin`:
    /// world parameters, then metadata for every peer already connected.
    pub async fn join(
        &self,
        observer_id: i64,
        name: String,
        appearance: String,
        tx: mpsc::UnboundedSender<Vec<u8>>,
    ) -> (PeerId, Vec<ControlMessage>) {
        let mut state = self.state.lock().await;

        let mut greeting = vec![ControlMessage::WorldParameters {
            seed: self.config.seed.clone(),
            parameters: self.config.parameters.clone(),
        }];
        greeting.extend(state.peers.values().map(|p| ControlMessage::ObserverInfo {
            observer_id: p.observer_id,
            name: p.name.clone(),
            appearance: p.appearance.clone(),
        }));

        let id = state.next_peer;
        state.next_peer += 1;
        log::info!("Peer {} joined as observer {} ('{}')", id, observer_id, name);
        state.peers.insert(
            id,
            Peer {
                observer_id,
                name,
                appearance,
                tx,
                cells: HashSet::new(),
            },
        );

        (id, greeting)
    }

    /// Drop a peer and every subscription it held
    pub async fn leave(&self, peer: PeerId) {
        let mut state = self.state.lock().await;
        let Some(gone) = state.peers.remove(&peer) else {
            return;
        };
        log::info!("Peer {} (observer {}) left", peer, gone.observer_id);

        for cell in gone.cells {
            if let Some(blob) = release(&mut state, peer, cell) {
                self.write_blob(cell, blob).await;
            }
        }
    }

    /// Apply one frame from `peer`
    pub async fn handle_frame(&self, peer: PeerId, frame: Frame) {
        match frame.kind {
            MessageKind::Subscribe => self.subscribe(peer, frame.cell).await,
            MessageKind::Unsubscribe => self.unsubscribe(peer, frame.cell).await,
            MessageKind::Edit => self.edit(peer, frame).await,
            MessageKind::ObserverState => self.forward(peer, frame).await,
        }
    }

    async fn subscribe(&self, peer: PeerId, cell: CellIndex) {
        let mut state = self.state.lock().await;
        if !state.peers.contains_key(&peer) {
            return;
        }

        if !state.cells.contains_key(&cell) {
            let log = self.read_blob(cell).await;
            log::debug!("Loaded cell {} ({} edits)", cell, log.edits.len());
            state.cells.insert(cell, log);
        }

        let RelayState { cells, peers, .. } = &mut *state;
        let (Some(log), Some(p)) = (cells.get_mut(&cell), peers.get_mut(&peer)) else {
            return;
        };
        if !p.cells.insert(cell) {
            log::debug!("Peer {} already subscribed to cell {}", peer, cell);
            return;
        }
        log.subscribers.insert(peer);

        for edit in &log.edits {
            p.send(Frame::edit(cell, edit).encode());
        }
        log::debug!("Peer {} subscribed to cell {}, replayed {} edits", peer, cell, log.edits.len());
    }

    async fn unsubscribe(&self, peer: PeerId, cell: CellIndex) {
        let mut state = self.state.lock().await;
        let subscribed = state
            .peers
            .get_mut(&peer)
            .is_some_and(|p| p.cells.remove(&cell));
        if !subscribed {
            return;
        }
        if let Some(blob) = release(&mut state, peer, cell) {
            self.write_blob(cell, blob).await;
        }
    }

    async fn edit(&self, peer: PeerId, frame: Frame) {
        let Some(edit) = frame.edit_payload() else {
            log::debug!("Discarding short edit from peer {}", peer);
            return;
        };

        let mut state = self.state.lock().await;
        let RelayState { cells, peers, .. } = &mut *state;
        let Some(log) = cells
            .get_mut(&frame.cell)
            .filter(|log| log.subscribers.contains(&peer))
        else {
            log::debug!("Peer {} edited unsubscribed cell {}", peer, frame.cell);
            return;
        };

        log.edits.push(edit);
        log.dirty = true;

        let bytes = frame.encode();
        for other in log.subscribers.iter().filter(|id| **id != peer) {
            if let Some(p) = peers.get(other) {
                p.send(bytes.clone());
            }
        }
    }

    async fn forward(&self, peer: PeerId, frame: Frame) {
        let state = self.state.lock().await;
        let Some(log) = state.cells.get(&frame.cell) else {
            return;
        };
        if !log.subscribers.contains(&peer) {
            return;
        }

        let bytes = frame.encode();
        for other in log.subscribers.iter().filter(|id| **id != peer) {
            if let Some(p) = state.peers.get(other) {
                p.send(bytes.clone());
            }
        }
    }

    /// Write every dirty cell. Returns how many were written.
    pub async fn flush_all(&self) -> usize {
        let mut state = self.state.lock().await;
        let blobs: Vec<_> = state
            .cells
            .iter_mut()
            .filter_map(|(cell, log)| log.take_blob().map(|blob| (*cell, blob)))
            .collect();

        let count = blobs.len();
        for (cell, blob) in blobs {
            self.write_blob(cell, blob).await;
        }
        count
    }

    /// Flush dirty cells every `interval` until `shutdown` resolves, then
    /// flush once more so no edit is left in memory.
    pub async fn run_flush_loop(&self, interval: Duration, shutdown: impl Future<Output = ()>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires at once; nothing is dirty yet.
        ticker.tick().await;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    let flushed = self.flush_all().await;
                    if flushed > 0 {
                        log::info!("Flushed {} cells", flushed);
                    }
                }
            }
        }

        let flushed = self.flush_all().await;
        log::info!("Relay shutting down, flushed {} cells", flushed);
    }

    /// Number of cells with at least one subscriber
    pub async fn cell_count(&self) -> usize {
        self.state.lock().await.cells.len()
    }

    pub async fn peer_count(&self) -> usize {
        self.state.lock().await.peers.len()
    }

    pub async fn subscriber_count(&self, cell: CellIndex) -> usize {
        self.state
            .lock()
            .await
            .cells
            .get(&cell)
            .map_or(0, |log| log.subscribers.len())
    }

    /// Edits held for `cell`, if it is loaded
    pub async fn cell_len(&self, cell: CellIndex) -> Option<usize> {
        self.state.lock().await.cells.get(&cell).map(|log| log.edits.len())
    }

    async fn read_blob(&self, cell: CellIndex) -> CellLog {
        let store = Arc::clone(&self.store);
        let result = tokio::task::spawn_blocking(move || -> terrafeed::Result<Vec<CompressedEdit>> {
            if !store.exists(cell) {
                return Ok(Vec::new());
            }
            decode_blob(cell, &store.read(cell)?)
        })
        .await;

        match result {
            Ok(Ok(edits)) => CellLog::new(edits, false),
            Ok(Err(e)) => {
                log::warn!("Serving cell {} without history: {}", cell, e);
                CellLog::new(Vec::new(), true)
            }
            Err(e) => {
                log::error!("Load task for cell {} failed: {}", cell, e);
                CellLog::new(Vec::new(), true)
            }
        }
    }

    async fn write_blob(&self, cell: CellIndex, blob: Vec<u8>) {
        let store = Arc::clone(&self.store);
        let len = blob.len();
        match tokio::task::spawn_blocking(move || store.write(cell, &blob)).await {
            Ok(Ok(())) => log::debug!("Flushed cell {} ({} bytes)", cell, len),
            Ok(Err(e)) => log::error!("Failed to flush cell {}: {}", cell, e),
            Err(e) => log::error!("Flush task for cell {} failed: {}", cell, e),
        }
    }
}

/// Remove `peer` from `cell`; evict the cell once nobody is left.
///
/// Returns the blob to write for an evicted dirty cell.
fn release(state: &mut RelayState, peer: PeerId, cell: CellIndex) -> Option<Vec<u8>> {
    let log = state.cells.get_mut(&cell)?;
    log.subscribers.remove(&peer);
    if !log.subscribers.is_empty() {
        return None;
    }
    let mut log = state.cells.remove(&cell)?;
    log::debug!("Evicting cell {}", cell);
    log.take_blob()
}
