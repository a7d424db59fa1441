//! Region subscriptions
//!
//! A [`Subscription`] listens on every feed covering its region and reports
//! edits in its own frame, whose origin is the minimum covered cell's
//! corner. Edits whose influence box misses the region are not reported.

use std::sync::{Arc, Mutex, PoisonError, Weak};

use crate::cell::{CellIndex, CellRange};
use crate::core::types::Vec3;
use crate::edit::{CompressedEdit, Edit};
use crate::feed::{EditFeed, FeedEvent, ListenerId};
use crate::manager::{lock_registry, Registry, SubscriptionId};
use crate::math::Aabb;

/// Observer callback; receives edits in the subscription's frame
pub type EditCallback = Arc<dyn Fn(&Edit) + Send + Sync>;

/// Frame conversion and bounds test shared by every feed listener
struct RegionFilter {
    min_cell: CellIndex,
    bounds: Aabb,
    cell_size: f32,
    margin: f32,
    observers: Mutex<Vec<EditCallback>>,
}

impl RegionFilter {
    /// Decompress `edit` from `cell`'s frame into the region frame.
    ///
    /// Returns `None` if its influence box misses the region.
    fn accept(&self, cell: CellIndex, edit: &CompressedEdit) -> Option<Edit> {
        let delta = cell.delta(self.min_cell);
        let offset = Vec3::new(delta.x as f32 * self.cell_size, delta.y as f32 * self.cell_size, 0.0);
        let edit = edit.decompress(self.cell_size).translated(offset);

        edit.influence_bounds(self.margin)
            .intersects(&self.bounds)
            .then_some(edit)
    }

    fn observers(&self) -> Vec<EditCallback> {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn deliver(&self, event: FeedEvent) {
        if let Some(edit) = self.accept(event.cell, &event.edit) {
            for observer in self.observers() {
                observer(&edit);
            }
        }
    }
}

/// Standing interest in a rectangular world region.
///
/// Dropping the subscription disposes it.
pub struct Subscription {
    id: SubscriptionId,
    range: CellRange,
    feeds: Vec<(Arc<dyn EditFeed>, ListenerId)>,
    filter: Arc<RegionFilter>,
    registry: Weak<Mutex<Registry>>,
    disposed: bool,
}

impl Subscription {
    /// Listen on `feeds` and replay their history through `on_edited`
    /// before returning.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn attach(
        id: SubscriptionId,
        range: CellRange,
        bounds: Aabb,
        cell_size: f32,
        margin: f32,
        feeds: Vec<Arc<dyn EditFeed>>,
        on_edited: EditCallback,
        registry: Weak<Mutex<Registry>>,
    ) -> Self {
        let filter = Arc::new(RegionFilter {
            min_cell: range.min,
            bounds,
            cell_size,
            margin,
            observers: Mutex::new(vec![on_edited.clone()]),
        });

        let mut attached = Vec::with_capacity(feeds.len());
        let mut history = Vec::new();
        let mut replayed = 0;

        for feed in feeds {
            let listener = Arc::clone(&filter);
            let listener_id = feed.listen(Arc::new(move |event: FeedEvent| listener.deliver(event)));

            history.clear();
            feed.copy_history(&mut history);
            let cell = feed.cell_index();
            for record in &history {
                if let Some(edit) = filter.accept(cell, record) {
                    on_edited(&edit);
                    replayed += 1;
                }
            }

            attached.push((feed, listener_id));
        }

        if replayed > 0 {
            log::debug!("Subscription {} replayed {} edits", id, replayed);
        }

        Self {
            id,
            range,
            feeds: attached,
            filter,
            registry,
            disposed: false,
        }
    }

    /// Add another observer. It sees edits from now on; history is not
    /// replayed to it.
    pub fn on_edited(&self, callback: EditCallback) {
        self.filter
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Cell whose corner is this subscription's frame origin
    pub fn min_cell(&self) -> CellIndex {
        self.range.min
    }

    /// Covered cells, row-major
    pub fn cells(&self) -> Vec<CellIndex> {
        self.range.iter().collect()
    }

    /// Region bounds in the subscription frame
    pub fn bounds(&self) -> Aabb {
        self.filter.bounds
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Stop listening and release the covered cells. Idempotent.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;

        for (feed, listener) in &self.feeds {
            feed.unlisten(*listener);
        }
        self.feeds.clear();

        // Manager gone: it already disposed every feed.
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let orphaned = lock_registry(&registry).release(self.id, &self.cells());
        for feed in orphaned {
            feed.dispose();
        }

        log::debug!("Subscription {} disposed", self.id);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.dispose();
    }
}
