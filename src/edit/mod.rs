//! Terrain edits and observer states, plus their fixed-width encodings.
//!
//! Both records quantize floating-point values relative to a cell's local
//! frame into exactly 8 little-endian bytes, the unit used on disk and on
//! the wire.

pub mod codec;
pub mod observer;

pub use codec::{CompressedEdit, Edit, EditKind, MAX_SIZE, MIN_SIZE};
pub use observer::{flags, CompressedObserverState, ObserverState};

/// Size in bytes of every compressed record
pub const RECORD_SIZE: usize = 8;
