//! In-memory blob store

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::BlobStore;
use crate::cell::CellIndex;
use crate::core::error::Error;
use crate::core::types::Result;

/// Blob store backed by a map, for tests and ephemeral worlds
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<CellIndex, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn blobs(&self) -> MutexGuard<'_, HashMap<CellIndex, Vec<u8>>> {
        self.blobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed a blob without going through a feed
    pub fn insert(&self, cell: CellIndex, data: Vec<u8>) {
        self.blobs().insert(cell, data);
    }

    /// Copy of the blob for `cell`, if any
    pub fn get(&self, cell: CellIndex) -> Option<Vec<u8>> {
        self.blobs().get(&cell).cloned()
    }

    pub fn len(&self) -> usize {
        self.blobs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs().is_empty()
    }
}

impl BlobStore for MemoryBlobStore {
    fn exists(&self, cell: CellIndex) -> bool {
        self.blobs().contains_key(&cell)
    }

    fn read(&self, cell: CellIndex) -> Result<Vec<u8>> {
        self.get(cell).ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no blob for cell {}", cell),
            ))
        })
    }

    fn write(&self, cell: CellIndex, data: &[u8]) -> Result<()> {
        self.insert(cell, data.to_vec());
        Ok(())
    }

    fn create_dir(&self) -> Result<()> {
        Ok(())
    }
}
