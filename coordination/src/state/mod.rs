//! Run state projection module
//!
//! This module turns the event stream into an indexed, queryable view of
//! a run: the agent tree, section negotiation, token usage and timing.
//!
//! # Architecture
//!
//! - `types`: entities, snapshot types and change tracking
//! - `negotiation`: the section claim/contest/resolve state machine
//! - `projection`: pure event application and snapshot builders
//! - `manager`: the single writer that drains the bus into the projection
//! - `query`: the read-only facade handed to consumers
//!
//! The manager is the only writer. Every event bumps the version by one,
//! entities are replaced rather than patched, and readers hold the read
//! lock only while building a snapshot.
//!
//! # Usage
//!
//! ```ignore
//! use triad_coordination::events::{Event, EventBus};
//! use triad_coordination::state::{ChangeCategory, StateManager};
//!
//! let bus = EventBus::new();
//! let manager = StateManager::new(bus.clone());
//! manager.start()?;
//!
//! manager.subscribe(ChangeCategory::Negotiation, |change| async move {
//!     println!("negotiation changed at v{}", change.version);
//!     Ok(())
//! });
//!
//! bus.emit(Event::section_claimed("r1", "header", "A")).await;
//! manager.wait_for_version(1, Duration::from_secs(1)).await;
//!
//! let snapshot = manager.query().get_snapshot();
//! manager.stop().await;
//! ```

pub mod manager;
pub mod negotiation;
pub mod projection;
pub mod query;
pub mod types;

pub use manager::{StateError, StateManager, StateResult, Unsubscribe};
pub use negotiation::{ContestEvent, SectionNegotiationState, SectionStatus};
pub use projection::{HistoryEntry, Projection, DEFAULT_HISTORY_CAPACITY};
pub use query::QueryInterface;
pub use types::{
    AgentId, AgentNode, AgentStatus, AgentTokenUsage, AgentTree, ChangeCategory, ChangeFilter,
    ChangeSet, NegotiationSnapshot, PhaseTimeline, PhaseTokenUsage, RunSnapshot, StateChange,
    TokenUsageSummary, TraceTimeline, TriadId, TriadInfo, UNKNOWN_PRESET,
};
