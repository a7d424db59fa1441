//! Edit Manager - routes world-space edits to cell feeds
//!
//! Owns the cell grid (and with it the floating origin) plus the registry of
//! cells that currently have subscribers. Edits are only forwarded to cells
//! in the registry; everything else is dropped.
//!
//! Every method takes `&self`, so the manager can be shared behind an `Arc`.
//! Each call works on one snapshot of the grid; a concurrent `recenter`
//! applies to the next call.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::cell::{CellGrid, CellIndex};
use crate::core::config::EditSyncConfig;
use crate::core::types::{Result, Vec3};
use crate::edit::{Edit, EditKind};
use crate::feed::{EditFeed, FeedFactory};
use crate::math::Aabb;
use crate::subscription::{EditCallback, Subscription};

/// Identifies a subscription within a manager
pub type SubscriptionId = u64;

/// Registered feed plus the subscriptions keeping it alive
struct CellEntry {
    feed: Arc<dyn EditFeed>,
    subscribers: HashSet<SubscriptionId>,
}

/// Cell -> (feed, subscribers). An entry exists only while it has subscribers.
#[derive(Default)]
pub(crate) struct Registry {
    cells: HashMap<CellIndex, CellEntry>,
    next_subscription: SubscriptionId,
}

pub(crate) type SharedRegistry = Arc<Mutex<Registry>>;

pub(crate) fn lock_registry(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Registry {
    /// Drop `id` from each cell's subscriber set.
    ///
    /// Returns the feeds whose last subscriber left; they are already out of
    /// the registry and must be disposed by the caller.
    pub(crate) fn release(&mut self, id: SubscriptionId, cells: &[CellIndex]) -> Vec<Arc<dyn EditFeed>> {
        let mut orphaned = Vec::new();
        for cell in cells {
            let Some(entry) = self.cells.get_mut(cell) else {
                continue;
            };
            entry.subscribers.remove(&id);
            if entry.subscribers.is_empty() {
                if let Some(entry) = self.cells.remove(cell) {
                    log::info!("Cell {} has no subscribers left, releasing feed", cell);
                    orphaned.push(entry.feed);
                }
            }
        }
        orphaned
    }
}

/// Maps world-space edit requests and region subscriptions onto cell feeds
pub struct EditManager {
    config: EditSyncConfig,
    grid: Mutex<CellGrid>,
    factory: Box<dyn FeedFactory>,
    registry: SharedRegistry,
}

impl EditManager {
    /// Create a manager that obtains feeds from `factory`
    pub fn new(config: EditSyncConfig, factory: impl FeedFactory + 'static) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            grid: Mutex::new(CellGrid::new(config.cell_size)),
            config,
            factory: Box::new(factory),
            registry: SharedRegistry::default(),
        })
    }

    pub fn config(&self) -> &EditSyncConfig {
        &self.config
    }

    /// Snapshot of the grid as of now
    pub fn grid(&self) -> CellGrid {
        *self.grid.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn cell_size(&self) -> f32 {
        self.config.cell_size
    }

    /// Current floating-origin offset
    pub fn base_cell(&self) -> CellIndex {
        self.grid().base()
    }

    /// World-space position of a cell's minimum corner
    pub fn cell_to_world(&self, index: CellIndex) -> Vec3 {
        self.grid().cell_to_world(index)
    }

    /// Cell containing a world-space position
    pub fn world_to_cell(&self, pos: Vec3) -> CellIndex {
        self.grid().world_to_cell(pos)
    }

    /// Shift the logical origin if `observer` left the recenter box.
    ///
    /// Returns the world offset the caller must subtract from all
    /// world-space content; cell math already reflects the new origin.
    pub fn recenter(&self, observer: Vec3) -> Option<Vec3> {
        self.grid
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recenter(observer, self.config.recenter_threshold)
    }

    /// Apply an edit at a world-space position.
    ///
    /// Every subscribed cell within `size + margin` of the edit's reach
    /// receives it in its own local frame. Cells whose representable span
    /// does not include the origin, and cells without subscribers, are
    /// skipped, as are edits with a non-finite size or origin. Returns the
    /// number of feeds the edit was submitted to.
    pub fn submit(&self, kind: EditKind, size: f32, origin: Vec3) -> usize {
        if !(size.is_finite() && origin.is_finite()) {
            log::warn!("Dropping edit with non-finite size {} or origin {}", size, origin);
            return 0;
        }

        let grid = self.grid();
        let margin = size + self.config.max_influence_distance;
        let reach = Vec3::splat(size + margin);
        let range = grid.cell_range(origin - reach, origin + reach);

        let mut targets: Vec<(CellIndex, Arc<dyn EditFeed>)> = {
            let registry = lock_registry(&self.registry);
            registry
                .cells
                .iter()
                .filter(|(cell, _)| range.contains(**cell))
                .map(|(cell, entry)| (*cell, Arc::clone(&entry.feed)))
                .collect()
        };
        targets.sort_by_key(|(cell, _)| *cell);

        let mut submitted = 0;
        for (cell, feed) in targets {
            let local = Edit::new(kind, size, origin - grid.cell_to_world(cell));
            match local.compress(grid.cell_size()) {
                Some(compressed) => {
                    feed.submit(compressed);
                    submitted += 1;
                }
                None => log::trace!("Edit at {} outside cell {} span", origin, cell),
            }
        }

        if submitted == 0 {
            log::trace!("Edit at {} reached no subscribed cell", origin);
        }
        submitted
    }

    /// Watch the world-space box `[min, max]`.
    ///
    /// Feeds for covered cells are reused or created. Each feed's history is
    /// replayed through `on_edited` before this returns; later edits arrive
    /// as they are submitted. Edits are reported in the subscription's local
    /// frame, whose origin is the minimum covered cell's corner.
    ///
    /// A region with a non-finite corner covers no cells; the returned
    /// subscription never fires.
    pub fn subscribe(&self, min: Vec3, max: Vec3, on_edited: EditCallback) -> Subscription {
        let grid = self.grid();
        if !(min.is_finite() && max.is_finite()) {
            log::warn!("Subscribing to non-finite region {}..{}: no cells covered", min, max);
        }
        let range = grid.cell_range(min, max);

        let (id, feeds) = {
            let mut registry = lock_registry(&self.registry);
            let id = registry.next_subscription;
            registry.next_subscription += 1;

            let mut feeds = Vec::with_capacity(range.len());
            for cell in range.iter() {
                let entry = registry.cells.entry(cell).or_insert_with(|| {
                    log::info!("Creating feed for cell {}", cell);
                    CellEntry {
                        feed: self.factory.create_feed(cell),
                        subscribers: HashSet::new(),
                    }
                });
                entry.subscribers.insert(id);
                feeds.push(Arc::clone(&entry.feed));
            }
            (id, feeds)
        };

        let frame_origin = grid.cell_to_world(range.min);
        let bounds = Aabb::new(min - frame_origin, max - frame_origin);

        log::debug!(
            "Subscription {} covers cells {}..{} ({} feeds)",
            id,
            range.min,
            range.max,
            feeds.len()
        );

        Subscription::attach(
            id,
            range,
            bounds,
            grid.cell_size(),
            self.config.max_influence_distance,
            feeds,
            on_edited,
            Arc::downgrade(&self.registry),
        )
    }

    /// Dispose a subscription, releasing feeds it was the last user of
    pub fn unsubscribe(&self, subscription: &mut Subscription) {
        subscription.dispose();
    }

    /// Cells that currently have a registered feed, sorted
    pub fn registered_cells(&self) -> Vec<CellIndex> {
        let mut cells: Vec<_> = lock_registry(&self.registry).cells.keys().copied().collect();
        cells.sort();
        cells
    }

    pub fn feed_count(&self) -> usize {
        lock_registry(&self.registry).cells.len()
    }

    /// Registered feed for `cell`, if any
    pub fn feed(&self, cell: CellIndex) -> Option<Arc<dyn EditFeed>> {
        lock_registry(&self.registry)
            .cells
            .get(&cell)
            .map(|entry| Arc::clone(&entry.feed))
    }

    /// Number of subscriptions covering `cell`
    pub fn subscriber_count(&self, cell: CellIndex) -> usize {
        lock_registry(&self.registry)
            .cells
            .get(&cell)
            .map_or(0, |entry| entry.subscribers.len())
    }
}

impl Drop for EditManager {
    fn drop(&mut self) {
        let entries: Vec<_> = lock_registry(&self.registry).cells.drain().collect();
        if !entries.is_empty() {
            log::info!("Edit manager shutting down, disposing {} feeds", entries.len());
        }
        for (_, entry) in entries {
            entry.feed.dispose();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Dispatcher;
    use crate::edit::CompressedEdit;
    use crate::feed::testing::MemoryFeedFactory;
    use crate::feed::PersistedFeedFactory;
    use crate::store::{decode_blob, encode_blob, MemoryBlobStore};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    const CELL_SIZE: f32 = 8192.0;

    fn collector() -> (EditCallback, Arc<Mutex<Vec<Edit>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        (Arc::new(move |edit: &Edit| s.lock().unwrap().push(*edit)), seen)
    }

    fn memory_manager() -> (EditManager, MemoryFeedFactory) {
        let factory = MemoryFeedFactory::default();
        let manager = EditManager::new(EditSyncConfig::with_cell_size(CELL_SIZE), factory.clone()).unwrap();
        (manager, factory)
    }

    #[test]
    fn test_rejects_invalid_config() {
        let result = EditManager::new(EditSyncConfig::with_cell_size(-1.0), MemoryFeedFactory::default());
        assert!(result.is_err());
    }

    #[test]
    fn test_edit_without_subscription_is_dropped() {
        let (manager, factory) = memory_manager();
        let submitted = manager.submit(EditKind::Add, 64.0, Vec3::new(100.0, 100.0, 100.0));
        assert_eq!(submitted, 0);
        assert_eq!(factory.created_count(), 0);
        assert_eq!(manager.feed_count(), 0);
    }

    #[test]
    fn test_subscribe_creates_feeds_once_per_cell() {
        let (manager, factory) = memory_manager();
        let (cb, _) = collector();

        let _a = manager.subscribe(Vec3::ZERO, Vec3::new(CELL_SIZE * 2.0, CELL_SIZE, 100.0), cb.clone());
        let _b = manager.subscribe(Vec3::new(10.0, 10.0, 0.0), Vec3::new(20.0, 20.0, 0.0), cb);

        assert_eq!(manager.registered_cells(), vec![CellIndex::new(0, 0), CellIndex::new(1, 0)]);
        assert_eq!(factory.created_count(), 2);
        assert_eq!(manager.subscriber_count(CellIndex::new(0, 0)), 2);
        assert_eq!(manager.subscriber_count(CellIndex::new(1, 0)), 1);
    }

    #[test]
    fn test_edit_near_border_reaches_both_cells() {
        let (manager, factory) = memory_manager();
        let (cb, seen) = collector();
        let _sub = manager.subscribe(Vec3::ZERO, Vec3::new(CELL_SIZE * 2.0, CELL_SIZE, CELL_SIZE), cb);

        let origin = Vec3::new(CELL_SIZE - 10.0, 500.0, 100.0);
        assert_eq!(manager.submit(EditKind::Subtract, 32.0, origin), 2);

        let left = factory.feed(CellIndex::new(0, 0)).unwrap();
        let right = factory.feed(CellIndex::new(1, 0)).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(right.len(), 1);

        // Same world point, each in its own cell frame.
        let mut history = Vec::new();
        right.copy_history(&mut history);
        let local = history[0].decompress(CELL_SIZE);
        assert!((local.origin.x - -10.0).abs() <= CELL_SIZE * 2.0 / 65536.0);

        // Delivered once per feed, both in the subscription's frame.
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        for edit in seen.iter() {
            assert!((edit.origin - origin).abs().max_element() <= CELL_SIZE * 2.0 / 65536.0);
        }
    }

    #[test]
    fn test_unsubscribe_releases_last_user_only() {
        let (manager, factory) = memory_manager();
        let (cb, _) = collector();

        let mut wide = manager.subscribe(Vec3::ZERO, Vec3::new(CELL_SIZE * 2.0, CELL_SIZE, 0.0), cb.clone());
        let _narrow = manager.subscribe(Vec3::ZERO, Vec3::new(100.0, 100.0, 0.0), cb);

        manager.unsubscribe(&mut wide);
        assert_eq!(manager.registered_cells(), vec![CellIndex::new(0, 0)]);
        assert_eq!(factory.feed(CellIndex::new(1, 0)).unwrap().disposals.load(Ordering::SeqCst), 1);
        assert_eq!(factory.feed(CellIndex::new(0, 0)).unwrap().disposals.load(Ordering::SeqCst), 0);

        // Second disposal has no further effect
        manager.unsubscribe(&mut wide);
        assert_eq!(factory.feed(CellIndex::new(1, 0)).unwrap().disposals.load(Ordering::SeqCst), 1);
        assert_eq!(manager.subscriber_count(CellIndex::new(0, 0)), 1);
    }

    #[test]
    fn test_resubscribe_creates_fresh_feed() {
        let (manager, factory) = memory_manager();
        let (cb, _) = collector();

        let sub = manager.subscribe(Vec3::ZERO, Vec3::splat(10.0), cb.clone());
        drop(sub);
        assert_eq!(manager.feed_count(), 0);

        let _sub = manager.subscribe(Vec3::ZERO, Vec3::splat(10.0), cb);
        assert_eq!(factory.created_count(), 2);
    }

    #[test]
    fn test_teardown_disposes_remaining_feeds() {
        let (manager, factory) = memory_manager();
        let (cb, _) = collector();
        let sub = manager.subscribe(Vec3::ZERO, Vec3::splat(10.0), cb);

        drop(manager);
        let feed = factory.feed(CellIndex::new(0, 0)).unwrap();
        assert_eq!(feed.disposals.load(Ordering::SeqCst), 1);

        // The subscription outliving its manager only detaches listeners
        drop(sub);
        assert_eq!(feed.disposals.load(Ordering::SeqCst), 1);
        assert_eq!(feed.listener_count(), 0);
    }

    #[test]
    fn test_late_subscriber_replays_history_in_order() {
        let (manager, _factory) = memory_manager();
        let (cb, _) = collector();
        let _first = manager.subscribe(Vec3::ZERO, Vec3::splat(CELL_SIZE), cb);

        let origins: Vec<Vec3> = (0..5).map(|i| Vec3::new(1000.0 + i as f32 * 100.0, 2000.0, 300.0)).collect();
        for origin in &origins {
            manager.submit(EditKind::Add, 64.0, *origin);
        }

        let (cb, seen) = collector();
        let _late = manager.subscribe(Vec3::ZERO, Vec3::splat(CELL_SIZE), cb);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), origins.len());
        for (edit, origin) in seen.iter().zip(&origins) {
            assert!((edit.origin - *origin).abs().max_element() <= CELL_SIZE * 2.0 / 65536.0);
        }
    }

    #[test]
    fn test_recenter_keeps_submissions_in_same_cell() {
        let (manager, factory) = memory_manager();
        let (cb, _) = collector();
        let _sub = manager.subscribe(
            Vec3::new(CELL_SIZE * 3.0, 0.0, 0.0),
            Vec3::new(CELL_SIZE * 4.0, CELL_SIZE, 0.0),
            cb,
        );
        let cell = CellIndex::new(3, 0);
        assert_eq!(manager.registered_cells(), vec![cell]);

        let world_point = Vec3::new(CELL_SIZE * 3.5, 100.0, 50.0);
        manager.submit(EditKind::Add, 64.0, world_point);

        let offset = manager.recenter(Vec3::new(CELL_SIZE * 3.2, 10.0, 0.0)).unwrap();
        assert_eq!(manager.base_cell(), CellIndex::new(3, 0));
        assert_eq!(manager.world_to_cell(world_point - offset), cell);

        manager.submit(EditKind::Add, 64.0, world_point - offset);

        let mut history = Vec::new();
        factory.feed(cell).unwrap().copy_history(&mut history);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0], history[1]);
    }

    #[test]
    fn test_persisted_scenario() {
        let mut dispatcher = Dispatcher::new();
        let store = Arc::new(MemoryBlobStore::new());
        let factory = PersistedFeedFactory::new(store.clone(), dispatcher.handle()).unwrap();
        let manager = EditManager::new(EditSyncConfig::with_cell_size(CELL_SIZE), factory).unwrap();
        let origin = Vec3::new(100.0, 100.0, 100.0);

        // No subscription: dropped, no feed
        assert_eq!(manager.submit(EditKind::Add, 64.0, origin), 0);
        assert_eq!(manager.feed_count(), 0);

        let (cb, seen) = collector();
        let mut sub = manager.subscribe(Vec3::ZERO, Vec3::splat(CELL_SIZE), cb);
        let cell = CellIndex::new(0, 0);
        let feed = manager.feed(cell).unwrap();
        assert!(dispatcher.pump_until(Duration::from_secs(5), || feed.is_loaded()));

        assert_eq!(manager.submit(EditKind::Add, 64.0, origin), 1);
        {
            let seen = seen.lock().unwrap();
            assert_eq!(seen.len(), 1);
            assert_eq!(seen[0].kind, EditKind::Add);
            assert!((seen[0].origin - origin).abs().max_element() <= CELL_SIZE * 2.0 / 65536.0);
        }

        manager.unsubscribe(&mut sub);
        assert_eq!(manager.feed_count(), 0);

        let stored: Vec<CompressedEdit> = decode_blob(cell, &store.get(cell).unwrap()).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].decompress(CELL_SIZE).kind, EditKind::Add);
    }

    #[test]
    fn test_persisted_blob_replays_to_later_subscriber() {
        let mut dispatcher = Dispatcher::new();
        let store = Arc::new(MemoryBlobStore::new());
        let cell = CellIndex::new(0, 0);
        let records: Vec<CompressedEdit> = (0..3)
            .map(|i| Edit::new(EditKind::Subtract, 128.0, Vec3::new(500.0 * (i + 1) as f32, 400.0, 200.0)))
            .map(|e| e.compress(CELL_SIZE).unwrap())
            .collect();
        store.insert(cell, encode_blob(&records));

        let factory = PersistedFeedFactory::new(store.clone(), dispatcher.handle()).unwrap();
        let manager = EditManager::new(EditSyncConfig::with_cell_size(CELL_SIZE), factory).unwrap();

        let (cb, _) = collector();
        let _loader = manager.subscribe(Vec3::ZERO, Vec3::splat(CELL_SIZE), cb);
        let feed = manager.feed(cell).unwrap();
        assert!(dispatcher.pump_until(Duration::from_secs(5), || feed.is_loaded()));

        let (cb, seen) = collector();
        let _late = manager.subscribe(Vec3::ZERO, Vec3::splat(CELL_SIZE), cb);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().zip(&records).all(|(e, r)| *e == r.decompress(CELL_SIZE)));
    }

    #[test]
    fn test_extreme_edits_are_dropped() {
        let (manager, factory) = memory_manager();
        let (cb, seen) = collector();
        let _sub = manager.subscribe(Vec3::ZERO, Vec3::splat(CELL_SIZE), cb);

        assert_eq!(manager.submit(EditKind::Add, 64.0, Vec3::new(f32::MAX, 0.0, 0.0)), 0);
        assert_eq!(manager.submit(EditKind::Add, 64.0, Vec3::new(f32::INFINITY, 0.0, 0.0)), 0);
        assert_eq!(manager.submit(EditKind::Add, 64.0, Vec3::new(10.0, f32::NAN, 0.0)), 0);
        assert_eq!(manager.submit(EditKind::Add, f32::INFINITY, Vec3::splat(10.0)), 0);

        assert_eq!(factory.feed(CellIndex::new(0, 0)).unwrap().len(), 0);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_far_lookup_after_recenter_saturates() {
        let (manager, _factory) = memory_manager();
        manager.recenter(Vec3::new(CELL_SIZE * 5.5, 0.0, 0.0)).unwrap();
        assert_eq!(manager.base_cell(), CellIndex::new(5, 0));
        assert_eq!(manager.world_to_cell(Vec3::new(1e30, 0.0, 0.0)), CellIndex::new(i32::MAX, 0));
    }

    #[test]
    fn test_non_finite_region_covers_no_cells() {
        let (manager, factory) = memory_manager();
        let (cb, _) = collector();

        let mut sub = manager.subscribe(Vec3::splat(f32::NEG_INFINITY), Vec3::ZERO, cb);
        assert!(sub.cells().is_empty());
        assert_eq!(manager.feed_count(), 0);
        assert_eq!(factory.created_count(), 0);

        manager.unsubscribe(&mut sub);
        assert!(sub.is_disposed());
    }

    #[test]
    fn test_shared_manager_recenters_through_arc() {
        let (manager, _factory) = memory_manager();
        let manager = Arc::new(manager);

        let worker = Arc::clone(&manager);
        let offset = std::thread::spawn(move || worker.recenter(Vec3::new(CELL_SIZE * 2.5, -CELL_SIZE * 1.5, 0.0)))
            .join()
            .unwrap()
            .unwrap();

        assert_eq!(offset, Vec3::new(CELL_SIZE * 2.0, -CELL_SIZE * 2.0, 0.0));
        assert_eq!(manager.base_cell(), CellIndex::new(2, -2));
        assert_eq!(manager.grid().base(), manager.base_cell());
        assert_eq!(manager.cell_to_world(CellIndex::new(2, -2)), Vec3::ZERO);
    }
}
