//! Triad Coordination Library
//!
//! Event-sourced run state for multi-agent triad runs. Producers emit typed
//! events on an in-process bus; a single state manager folds them into a
//! versioned projection that UI widgets and the checkpoint service read.
//!
//! # Components
//!
//! - [`events`]: event model, glob-routed pub/sub bus with bounded queues,
//!   and a bridge that re-emits events through `tracing`
//! - [`state`]: projection, section negotiation state machine, state
//!   manager and the read-only query interface
//! - [`checkpoint`]: snapshot persistence at trigger events
//! - [`config`]: environment-driven configuration
//!
//! # Usage
//!
//! ```bash
//! # Replay a recorded run and print the final snapshot
//! triad-coordination replay run.jsonl
//!
//! # Same, writing checkpoints as triggers are seen
//! COORD_CHECKPOINT_DIR=./checkpoints triad-coordination replay run.jsonl
//!
//! # Print only negotiation events
//! triad-coordination watch run.jsonl --pattern 'negotiation.*'
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod checkpoint;
pub mod config;
pub mod events;
pub mod state;

pub use checkpoint::{
    Checkpoint, CheckpointConfig, CheckpointError, CheckpointResult, CheckpointService,
    CheckpointStore, FileCheckpointStore, MemoryCheckpointStore,
};
pub use config::CoordinationConfig;
pub use events::{Event, EventBus, EventBusConfig, EventError, EventKind, EventStream, TraceBridge};
pub use state::{
    ChangeCategory, ChangeFilter, ChangeSet, QueryInterface, RunSnapshot, SectionStatus,
    StateChange, StateError, StateManager, StateResult, Unsubscribe,
};
