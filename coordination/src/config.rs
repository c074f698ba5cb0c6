//! Top-level coordination configuration
//!
//! Defaults, overridden by `COORD_*` environment variables, overridden in
//! turn by CLI flags in the binary.

use crate::checkpoint::CheckpointConfig;
use crate::events::EventBusConfig;
use crate::state::DEFAULT_HISTORY_CAPACITY;

#[derive(Debug, Clone, PartialEq)]
pub struct CoordinationConfig {
    pub bus: EventBusConfig,
    /// Events retained for delta queries and checkpoint settling
    pub history_capacity: usize,
    pub checkpoint: CheckpointConfig,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            bus: EventBusConfig::default(),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            checkpoint: CheckpointConfig::default(),
        }
    }
}

impl CoordinationConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self {
            bus: EventBusConfig::from_env(),
            checkpoint: CheckpointConfig::from_env(),
            ..Self::default()
        };

        if let Ok(capacity) = std::env::var("COORD_HISTORY_CAPACITY") {
            if let Ok(n) = capacity.parse() {
                config.history_capacity = n;
            }
        }

        config
    }
}
