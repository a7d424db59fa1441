//! Edit sync configuration

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::error::Error;
use crate::core::types::Result;

/// Default cell edge length in world units
pub const DEFAULT_CELL_SIZE: f32 = 8192.0;

/// Settings shared by the edit manager, feeds and subscriptions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EditSyncConfig {
    /// Edge length of a square cell in world units.
    pub cell_size: f32,
    /// How far an edit's effect can bleed past its radius.
    ///
    /// Supplied by the surface representation; added to every edit's size
    /// when resolving cells and when filtering for subscriptions.
    pub max_influence_distance: f32,
    /// Half-width of the horizontal box around the logical origin an
    /// observer may roam before the world is recentered.
    pub recenter_threshold: f32,
    /// Directory holding persisted cell blobs; see
    /// `PersistedFeedFactory::from_config`.
    pub storage_dir: PathBuf,
}

impl Default for EditSyncConfig {
    fn default() -> Self {
        Self {
            cell_size: DEFAULT_CELL_SIZE,
            max_influence_distance: 0.0,
            recenter_threshold: DEFAULT_CELL_SIZE,
            storage_dir: PathBuf::from("World1"),
        }
    }
}

impl EditSyncConfig {
    /// Config with the given cell size; the recenter threshold follows it.
    pub fn with_cell_size(cell_size: f32) -> Self {
        Self {
            cell_size,
            recenter_threshold: cell_size,
            ..Default::default()
        }
    }

    /// Builder-style setter for the influence margin.
    pub fn with_max_influence_distance(mut self, distance: f32) -> Self {
        self.max_influence_distance = distance;
        self
    }

    /// Reject settings the cell math cannot work with.
    pub fn validate(&self) -> Result<()> {
        if !(self.cell_size.is_finite() && self.cell_size > 0.0) {
            return Err(Error::Config(format!(
                "cell_size must be positive, got {}",
                self.cell_size
            )));
        }
        if !(self.max_influence_distance.is_finite() && self.max_influence_distance >= 0.0) {
            return Err(Error::Config(format!(
                "max_influence_distance must be non-negative, got {}",
                self.max_influence_distance
            )));
        }
        if !(self.recenter_threshold.is_finite() && self.recenter_threshold > 0.0) {
            return Err(Error::Config(format!(
                "recenter_threshold must be positive, got {}",
                self.recenter_threshold
            )));
        }
        Ok(())
    }

    /// Save to a JSON file (sync)
    pub fn save_sync(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load from a JSON file (sync). Missing fields take their defaults.
    pub fn load_sync(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }
}
