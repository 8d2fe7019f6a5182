//! Session configuration.

use gpureplay_core::{CoreError, CoreResult};
use gpureplay_placement::{PLACEMENT_FILE_NAME, ReconcilerConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Replay session configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Reconcile heap placements across runs
    pub placement_reconciliation: bool,
    /// Report unexpected overlaps after every placed creation
    pub portability_checks: bool,
    /// Hooks are never called concurrently
    pub single_threaded: bool,
    /// Keep a replay-to-replay lookup for diagnostics
    pub dump_lookup: bool,
    /// Placement log location
    pub placement_file: PathBuf,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            placement_reconciliation: true,
            portability_checks: false,
            single_threaded: false,
            dump_lookup: false,
            placement_file: PathBuf::from(PLACEMENT_FILE_NAME),
        }
    }
}

impl SessionConfig {
    /// Parse from JSON; missing fields take their defaults
    ///
    /// # Errors
    ///
    /// Returns error if the JSON is malformed
    pub fn from_json(json: &str) -> CoreResult<Self> {
        serde_json::from_str(json).map_err(|e| CoreError::Encoding {
            reason: format!("session config: {e}"),
        })
    }

    /// Load from a JSON file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn load(path: &Path) -> CoreResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Set the placement log location
    #[must_use]
    pub fn with_placement_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.placement_file = path.into();
        self
    }

    /// Reconciler settings derived from this config
    #[must_use]
    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            placement_file: self.placement_file.clone(),
            single_threaded: self.single_threaded,
            portability_checks: self.portability_checks,
        }
    }
}
