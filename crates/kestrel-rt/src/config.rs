//! Builder configuration.

use serde::{Deserialize, Serialize};

/// Acceleration structure build settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccelerationConfig {
    /// Upper bound on the summed scratch size of one bottom-level batch.
    pub scratch_budget: u64,
    /// Compact bottom-level structures after building them.
    pub compact: bool,
}

impl Default for AccelerationConfig {
    fn default() -> Self {
        Self {
            scratch_budget: 256 * 1024 * 1024,
            compact: true,
        }
    }
}

impl AccelerationConfig {
    pub fn with_scratch_budget(mut self, bytes: u64) -> Self {
        self.scratch_budget = bytes;
        self
    }

    pub fn with_compaction(mut self, compact: bool) -> Self {
        self.compact = compact;
        self
    }
}
