//! Terrafeed - cell-sharded terrain edit sync
//!
//! Edits are routed by [`manager::EditManager`] to per-cell feeds, which
//! either persist them through a [`store::BlobStore`] or mirror a relay over
//! the [`net`] protocol. [`subscription::Subscription`]s watch a world
//! region and receive every edit that can affect it.

pub mod core;
pub mod math;
pub mod cell;
pub mod edit;
pub mod store;
pub mod dispatch;
pub mod feed;
pub mod manager;
pub mod subscription;
pub mod net;

pub use cell::{CellGrid, CellIndex, CellRange};
pub use crate::core::{EditSyncConfig, Error, Result};
pub use dispatch::{DispatchHandle, Dispatcher};
pub use edit::{CompressedEdit, CompressedObserverState, Edit, EditKind, ObserverState};
pub use feed::{EditFeed, FeedFactory, PersistedFeedFactory};
pub use manager::EditManager;
pub use subscription::{EditCallback, Subscription};
