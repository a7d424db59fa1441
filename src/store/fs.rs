//! One file per cell on the local filesystem

use std::path::{Path, PathBuf};

use super::BlobStore;
use crate::cell::CellIndex;
use crate::core::config::EditSyncConfig;
use crate::core::types::Result;

/// File extension for cell blobs
pub const CELL_FILE_EXTENSION: &str = "cell";

/// Blob store keeping `<dir>/<x>_<y>.cell` files
#[derive(Clone, Debug)]
pub struct FsBlobStore {
    base_dir: PathBuf,
}

impl FsBlobStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self { base_dir: base_dir.into() }
    }

    /// Store rooted at the config's `storage_dir`
    pub fn from_config(config: &EditSyncConfig) -> Self {
        Self::new(config.storage_dir.clone())
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Get the file path for a cell
    pub fn cell_path(&self, cell: CellIndex) -> PathBuf {
        self.base_dir.join(format!("{}.{}", cell, CELL_FILE_EXTENSION))
    }
}

impl BlobStore for FsBlobStore {
    fn exists(&self, cell: CellIndex) -> bool {
        self.cell_path(cell).exists()
    }

    fn read(&self, cell: CellIndex) -> Result<Vec<u8>> {
        Ok(std::fs::read(self.cell_path(cell))?)
    }

    fn write(&self, cell: CellIndex, data: &[u8]) -> Result<()> {
        self.create_dir()?;

        // Write to temporary file, then replace the original
        let path = self.cell_path(cell);
        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, data)?;
        std::fs::rename(&temp_path, &path)?;
        Ok(())
    }

    fn create_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.base_dir)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_path() {
        let store = FsBlobStore::new("/tmp/world");
        assert_eq!(
            store.cell_path(CellIndex::new(5, -3)),
            PathBuf::from("/tmp/world/5_-3.cell")
        );
    }

    #[test]
    fn test_write_read_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path().join("World1"));
        let cell = CellIndex::new(1, 2);

        assert!(!store.exists(cell));
        store.write(cell, b"first version").unwrap();
        assert!(store.exists(cell));

        store.write(cell, b"second").unwrap();
        assert_eq!(store.read(cell).unwrap(), b"second");
        assert!(!store.cell_path(cell).with_extension("tmp").exists());
    }

    #[test]
    fn test_read_missing_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        assert!(matches!(
            store.read(CellIndex::new(9, 9)),
            Err(crate::core::Error::Io(_))
        ));
    }
}
