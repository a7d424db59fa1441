//! Durable per-cell blob storage.
//!
//! Each cell's edit history lives in one blob keyed by its [`CellIndex`].
//! [`BlobStore`] is the seam to the host's storage; [`FsBlobStore`] keeps
//! one file per cell on disk and [`MemoryBlobStore`] keeps them in memory.

pub mod format;
pub mod fs;
pub mod memory;

use crate::cell::CellIndex;
use crate::core::types::Result;

pub use format::{decode_blob, encode_blob, MAGIC, VERSION};
pub use fs::FsBlobStore;
pub use memory::MemoryBlobStore;

/// Key-value blob store keyed by cell index
pub trait BlobStore: Send + Sync + 'static {
    /// Whether a blob exists for `cell`
    fn exists(&self, cell: CellIndex) -> bool;

    /// Read the full blob for `cell`
    fn read(&self, cell: CellIndex) -> Result<Vec<u8>>;

    /// Replace the blob for `cell` with `data`
    fn write(&self, cell: CellIndex, data: &[u8]) -> Result<()>;

    /// Make sure the backing location exists
    fn create_dir(&self) -> Result<()>;
}
