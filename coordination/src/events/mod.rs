//! Event-driven coordination module
//!
//! This module provides the pub/sub messaging infrastructure that carries
//! run, phase, agent, negotiation and usage events from producers to the
//! state projection and any other consumer.
//!
//! # Architecture
//!
//! 1. **Event Types** (`types.rs`): the typed event model and its flat JSON
//!    wire form, keyed by dotted `event_type` strings.
//!
//! 2. **Event Bus** (`bus.rs`): glob-routed pub/sub over bounded
//!    per-subscriber queues. Slow subscribers lose events after a bounded
//!    wait instead of stalling producers.
//!
//! 3. **Trace Bridge** (`bridge.rs`): forwards events into `tracing`.
//!
//! # Event Flow
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────────┐
//! │   Producer   │────▶│  Event Bus   │────▶│ EventStream (*)  │──▶ StateManager
//! │    (emit)    │     │ (snapshot +  │────▶│ EventStream (*)  │──▶ CheckpointService
//! └──────────────┘     │  timed put)  │────▶│ EventStream (..) │──▶ TraceBridge / UI
//!                      └──────────────┘     └──────────────────┘
//! ```
//!
//! # Delivery
//!
//! Delivery is best effort. Per subscription, events arrive in emission
//! order with gaps where the queue stayed full past the put timeout; there
//! is no redelivery and no ordering across subscriptions.
//!
//! # Usage
//!
//! ```ignore
//! use triad_coordination::events::{Event, EventBus};
//!
//! let bus = EventBus::new();
//! let mut agents = bus.subscribe("agent.*");
//!
//! bus.emit(Event::agent_started("r1", "a1", "t1", "planner")).await;
//!
//! let event = agents.next().await;
//! ```

pub mod bridge;
pub mod bus;
pub mod types;

pub use bridge::TraceBridge;
pub use bus::{
    EventBus, EventBusConfig, EventStream, DEFAULT_PUT_TIMEOUT, DEFAULT_QUEUE_CAPACITY,
};
pub use types::{Event, EventError, EventKind, EventResult, RawEvent, KNOWN_EVENT_TYPES};
