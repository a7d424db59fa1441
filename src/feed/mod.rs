//! Per-cell edit feeds.
//!
//! A feed owns the ordered, append-only log of compressed edits for one cell
//! and tells registered listeners about each edit as it becomes visible.
//! Two backings share the [`EditFeed`] contract: [`PersistedEditFeed`]
//! (blob store) and [`crate::net::RemoteEditFeed`] (mirrors a relay).
//! Feeds are created through a [`FeedFactory`] injected into the
//! [`crate::manager::EditManager`].

pub mod listeners;
pub mod persisted;

use std::sync::Arc;

use crate::cell::CellIndex;
use crate::edit::CompressedEdit;

pub use listeners::{FeedCallback, FeedListeners, ListenerId};
pub use persisted::{PersistedEditFeed, PersistedFeedFactory};

/// Notification raised by a feed: `edit` became visible in `cell`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FeedEvent {
    pub cell: CellIndex,
    pub edit: CompressedEdit,
}

/// Contract shared by every feed backing
pub trait EditFeed: Send + Sync {
    /// Cell this feed holds edits for
    fn cell_index(&self) -> CellIndex;

    /// Append an edit and notify listeners once the feed is loaded
    fn submit(&self, edit: CompressedEdit);

    /// Append a snapshot of every edit so far, in submission order
    fn copy_history(&self, out: &mut Vec<CompressedEdit>);

    /// Register a listener for new edits
    fn listen(&self, callback: FeedCallback) -> ListenerId;

    /// Remove a listener; unknown ids are ignored
    fn unlisten(&self, id: ListenerId);

    /// Whether the initial history is available
    fn is_loaded(&self) -> bool;

    /// Number of edits in the log
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release the feed: flush or unsubscribe. Idempotent.
    fn dispose(&self);
}

/// Creates the feed for a cell on first subscription
pub trait FeedFactory: Send + Sync {
    fn create_feed(&self, cell: CellIndex) -> Arc<dyn EditFeed>;
}

#[cfg(test)]
pub(crate) mod testing;
