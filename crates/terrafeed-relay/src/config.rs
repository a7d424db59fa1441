//! Relay configuration and errors

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default listen address
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:9743";

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Feed error: {0}")]
    Feed(#[from] terrafeed::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),
}

pub type Result<T> = std::result::Result<T, RelayError>;

/// Relay settings, loaded from JSON
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub bind_addr: String,
    /// Directory holding one blob per cell
    pub storage_dir: PathBuf,
    /// World generation seed handed to every peer
    pub seed: String,
    /// Opaque world generation parameters handed to every peer
    pub parameters: String,
    /// Accepted session tokens. `None` accepts any non-empty token.
    pub tokens: Option<Vec<String>>,
    /// Seconds between periodic flushes of dirty cells
    pub flush_interval_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            storage_dir: PathBuf::from("World1"),
            seed: String::new(),
            parameters: String::new(),
            tokens: None,
            flush_interval_secs: 30,
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> Result<()> {
        if self.flush_interval_secs == 0 {
            return Err(RelayError::Config("flush_interval_secs must be at least 1".into()));
        }
        if self.tokens.as_ref().is_some_and(|t| t.iter().any(String::is_empty)) {
            return Err(RelayError::Config("accepted tokens must not be empty".into()));
        }
        Ok(())
    }

    /// Check a peer's session token
    pub fn authorize(&self, token: &str) -> std::result::Result<(), String> {
        if token.is_empty() {
            return Err("missing session token".into());
        }
        match &self.tokens {
            Some(tokens) if !tokens.iter().any(|t| t == token) => Err("unknown session token".into()),
            _ => Ok(()),
        }
    }

    /// Save to a JSON file (sync)
    pub fn save_sync(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load from a JSON file (sync)
    pub fn load_sync(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }
}
