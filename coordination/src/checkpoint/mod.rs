//! Checkpoint service — persists run snapshots at trigger events.
//!
//! The service listens on the event bus independently of the state manager.
//! When a trigger event arrives it waits for the projection to apply that
//! event, builds a `RunSnapshot` and hands it to a `CheckpointStore`.
//!
//! Triggers: `run.ended`, `negotiation.resolved`, `phase.ended`, `manual`.

pub mod service;
pub mod store;

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::RunSnapshot;

pub use service::CheckpointService;
pub use store::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};

/// Trigger recorded for checkpoints requested through `checkpoint_now`
pub const MANUAL_TRIGGER: &str = "manual";

/// Event types that cause a checkpoint
pub const DEFAULT_TRIGGERS: &[&str] = &[
    "run.ended",
    "negotiation.resolved",
    "phase.ended",
    MANUAL_TRIGGER,
];

/// Default wait for the projection to catch up with a trigger event
pub const DEFAULT_SETTLE_TIMEOUT: Duration = Duration::from_secs(2);

/// Error type for checkpoint operations
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("Checkpoint I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Checkpoint serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Checkpoint schema version mismatch: expected <= {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("Checkpoint service is already running")]
    AlreadyStarted,

    #[error("No Tokio runtime available to start the checkpoint service")]
    NoRuntime,
}

impl CheckpointError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type CheckpointResult<T> = Result<T, CheckpointError>;

/// A persisted run snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Schema version for forward compatibility
    pub schema_version: u32,
    pub id: Uuid,
    /// Event type (or `manual`) that caused this checkpoint
    pub trigger: String,
    pub created_at: DateTime<Utc>,
    pub snapshot: RunSnapshot,
}

impl Checkpoint {
    /// Current schema version
    pub const CURRENT_VERSION: u32 = 1;

    pub fn new(trigger: impl Into<String>, snapshot: RunSnapshot) -> Self {
        Self {
            schema_version: Self::CURRENT_VERSION,
            id: Uuid::new_v4(),
            trigger: trigger.into(),
            created_at: Utc::now(),
            snapshot,
        }
    }

    /// Projection version the snapshot was taken at
    pub fn version(&self) -> u64 {
        self.snapshot.version
    }

    pub fn to_json(&self) -> CheckpointResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse a checkpoint, rejecting schemas newer than this build understands
    pub fn from_json(json: &str) -> CheckpointResult<Self> {
        let checkpoint: Self = serde_json::from_str(json)?;
        if checkpoint.schema_version > Self::CURRENT_VERSION {
            return Err(CheckpointError::VersionMismatch {
                expected: Self::CURRENT_VERSION,
                found: checkpoint.schema_version,
            });
        }
        Ok(checkpoint)
    }
}

/// Checkpoint service configuration
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointConfig {
    /// Directory for `FileCheckpointStore`; `None` disables file checkpoints
    pub directory: Option<PathBuf>,
    /// Bounded wait for the projection to apply a trigger event
    pub settle_timeout: Duration,
    pub triggers: Vec<String>,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            directory: None,
            settle_timeout: DEFAULT_SETTLE_TIMEOUT,
            triggers: DEFAULT_TRIGGERS.iter().map(|t| t.to_string()).collect(),
        }
    }
}

impl CheckpointConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("COORD_CHECKPOINT_DIR") {
            if !dir.is_empty() {
                config.directory = Some(PathBuf::from(dir));
            }
        }
        if let Some(ms) = std::env::var("COORD_CHECKPOINT_SETTLE_MS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.settle_timeout = Duration::from_millis(ms);
        }

        config
    }

    pub fn is_trigger(&self, event_type: &str) -> bool {
        self.triggers.iter().any(|t| t == event_type)
    }
}
