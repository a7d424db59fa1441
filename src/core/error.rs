//! Error types for terrafeed

use thiserror::Error;

use crate::cell::CellIndex;

/// Main error type for edit feeds, storage and transport
#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt persisted state for cell {cell}: {reason}")]
    CorruptPersistedState { cell: CellIndex, reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl Error {
    /// Whether this error only affects a single cell and the caller may carry on.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::CorruptPersistedState { .. })
    }
}
