//! Event types for run coordination
//!
//! Events are immutable records of lifecycle occurrences. The dotted
//! `event_type` string (`"agent.started"`) is both the routing key used by
//! the bus and the discriminator resolved into [`EventKind`] at the boundary
//! where raw JSON becomes a typed event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Event type strings understood by the state projection.
pub const KNOWN_EVENT_TYPES: &[&str] = &[
    "run.started",
    "run.ended",
    "phase.started",
    "phase.ended",
    "agent.started",
    "agent.ended",
    "negotiation.claimed",
    "negotiation.contested",
    "negotiation.resolved",
    "usage.recorded",
    "error.occurred",
];

/// Error type for event decoding
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("Invalid payload for {event_type}: {source}")]
    InvalidPayload {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Malformed event: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Result type for event decoding
pub type EventResult<T> = Result<T, EventError>;

/// Wire form of an event: envelope plus untyped fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub run_id: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// A single lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawEvent", into = "RawEvent")]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub run_id: String,
    pub kind: EventKind,
}

fn default_true() -> bool {
    true
}

/// Typed payload of an event, one arm per known `event_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum EventKind {
    #[serde(rename = "run.started")]
    RunStarted,

    #[serde(rename = "run.ended")]
    RunEnded {
        duration_ms: u64,
        #[serde(default = "default_true")]
        success: bool,
    },

    #[serde(rename = "phase.started")]
    PhaseStarted { phase_id: String, phase_name: String },

    #[serde(rename = "phase.ended")]
    PhaseEnded {
        phase_id: String,
        phase_name: String,
        duration_ms: u64,
    },

    #[serde(rename = "agent.started")]
    AgentStarted {
        agent_id: String,
        triad_id: String,
        role: String,
    },

    #[serde(rename = "agent.ended")]
    AgentEnded {
        agent_id: String,
        triad_id: String,
        role: String,
        duration_ms: u64,
        #[serde(default = "default_true")]
        success: bool,
    },

    #[serde(rename = "negotiation.claimed")]
    SectionClaimed {
        section_name: String,
        triad_id: String,
    },

    #[serde(rename = "negotiation.contested")]
    SectionContested {
        section_name: String,
        claimants: Vec<String>,
    },

    #[serde(rename = "negotiation.resolved")]
    SectionResolved {
        section_name: String,
        winner: String,
        resolution_type: String,
    },

    #[serde(rename = "usage.recorded")]
    UsageRecorded {
        triad_id: String,
        prompt_tokens: u64,
        completion_tokens: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        phase_name: Option<String>,
    },

    #[serde(rename = "error.occurred")]
    ErrorOccurred {
        error_type: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        triad_id: Option<String>,
    },

    /// Any event type this crate does not model. Kept verbatim.
    #[serde(skip)]
    Unrecognized {
        event_type: String,
        fields: Map<String, Value>,
    },
}

impl EventKind {
    /// Dotted event type string
    pub fn event_type(&self) -> &str {
        match self {
            EventKind::RunStarted => "run.started",
            EventKind::RunEnded { .. } => "run.ended",
            EventKind::PhaseStarted { .. } => "phase.started",
            EventKind::PhaseEnded { .. } => "phase.ended",
            EventKind::AgentStarted { .. } => "agent.started",
            EventKind::AgentEnded { .. } => "agent.ended",
            EventKind::SectionClaimed { .. } => "negotiation.claimed",
            EventKind::SectionContested { .. } => "negotiation.contested",
            EventKind::SectionResolved { .. } => "negotiation.resolved",
            EventKind::UsageRecorded { .. } => "usage.recorded",
            EventKind::ErrorOccurred { .. } => "error.occurred",
            EventKind::Unrecognized { event_type, .. } => event_type,
        }
    }

    /// Whether the event type string maps onto a typed arm
    pub fn is_known(event_type: &str) -> bool {
        KNOWN_EVENT_TYPES.contains(&event_type)
    }
}

impl Event {
    /// Create an event stamped with the current time
    pub fn new(run_id: impl Into<String>, kind: EventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            run_id: run_id.into(),
            kind,
        }
    }

    /// Override the timestamp
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Get the event type as a string
    pub fn event_type(&self) -> &str {
        self.kind.event_type()
    }

    /// Get the agent ID if this event is agent-scoped
    pub fn agent_id(&self) -> Option<&str> {
        match &self.kind {
            EventKind::AgentStarted { agent_id, .. } | EventKind::AgentEnded { agent_id, .. } => {
                Some(agent_id)
            }
            EventKind::UsageRecorded { agent_id, .. }
            | EventKind::ErrorOccurred { agent_id, .. } => agent_id.as_deref(),
            _ => None,
        }
    }

    /// Get the triad ID if this event is triad-scoped
    pub fn triad_id(&self) -> Option<&str> {
        match &self.kind {
            EventKind::AgentStarted { triad_id, .. }
            | EventKind::AgentEnded { triad_id, .. }
            | EventKind::SectionClaimed { triad_id, .. }
            | EventKind::UsageRecorded { triad_id, .. } => Some(triad_id),
            EventKind::ErrorOccurred { triad_id, .. } => triad_id.as_deref(),
            _ => None,
        }
    }

    /// Get the phase ID if this event is phase-scoped
    pub fn phase_id(&self) -> Option<&str> {
        match &self.kind {
            EventKind::PhaseStarted { phase_id, .. } | EventKind::PhaseEnded { phase_id, .. } => {
                Some(phase_id)
            }
            _ => None,
        }
    }

    /// Get the section name if this is a negotiation event
    pub fn section_name(&self) -> Option<&str> {
        match &self.kind {
            EventKind::SectionClaimed { section_name, .. }
            | EventKind::SectionContested { section_name, .. }
            | EventKind::SectionResolved { section_name, .. } => Some(section_name),
            _ => None,
        }
    }

    /// Decode one event from a JSON document
    pub fn from_json(json: &str) -> EventResult<Self> {
        let raw: RawEvent = serde_json::from_str(json)?;
        Self::try_from(raw)
    }

    /// Encode as a single-line JSON document
    pub fn to_json(&self) -> EventResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    // =========================================================================
    // Constructors for producers
    // =========================================================================

    pub fn run_started(run_id: impl Into<String>) -> Self {
        Self::new(run_id, EventKind::RunStarted)
    }

    pub fn run_ended(run_id: impl Into<String>, duration_ms: u64) -> Self {
        Self::new(
            run_id,
            EventKind::RunEnded {
                duration_ms,
                success: true,
            },
        )
    }

    pub fn phase_started(
        run_id: impl Into<String>,
        phase_id: impl Into<String>,
        phase_name: impl Into<String>,
    ) -> Self {
        Self::new(
            run_id,
            EventKind::PhaseStarted {
                phase_id: phase_id.into(),
                phase_name: phase_name.into(),
            },
        )
    }

    pub fn phase_ended(
        run_id: impl Into<String>,
        phase_id: impl Into<String>,
        phase_name: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self::new(
            run_id,
            EventKind::PhaseEnded {
                phase_id: phase_id.into(),
                phase_name: phase_name.into(),
                duration_ms,
            },
        )
    }

    pub fn agent_started(
        run_id: impl Into<String>,
        agent_id: impl Into<String>,
        triad_id: impl Into<String>,
        role: impl Into<String>,
    ) -> Self {
        Self::new(
            run_id,
            EventKind::AgentStarted {
                agent_id: agent_id.into(),
                triad_id: triad_id.into(),
                role: role.into(),
            },
        )
    }

    pub fn agent_ended(
        run_id: impl Into<String>,
        agent_id: impl Into<String>,
        triad_id: impl Into<String>,
        role: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self::new(
            run_id,
            EventKind::AgentEnded {
                agent_id: agent_id.into(),
                triad_id: triad_id.into(),
                role: role.into(),
                duration_ms,
                success: true,
            },
        )
    }

    pub fn section_claimed(
        run_id: impl Into<String>,
        section_name: impl Into<String>,
        triad_id: impl Into<String>,
    ) -> Self {
        Self::new(
            run_id,
            EventKind::SectionClaimed {
                section_name: section_name.into(),
                triad_id: triad_id.into(),
            },
        )
    }

    pub fn section_contested(
        run_id: impl Into<String>,
        section_name: impl Into<String>,
        claimants: Vec<String>,
    ) -> Self {
        Self::new(
            run_id,
            EventKind::SectionContested {
                section_name: section_name.into(),
                claimants,
            },
        )
    }

    pub fn section_resolved(
        run_id: impl Into<String>,
        section_name: impl Into<String>,
        winner: impl Into<String>,
        resolution_type: impl Into<String>,
    ) -> Self {
        Self::new(
            run_id,
            EventKind::SectionResolved {
                section_name: section_name.into(),
                winner: winner.into(),
                resolution_type: resolution_type.into(),
            },
        )
    }

    pub fn usage_recorded(
        run_id: impl Into<String>,
        triad_id: impl Into<String>,
        prompt_tokens: u64,
        completion_tokens: u64,
    ) -> Self {
        Self::new(
            run_id,
            EventKind::UsageRecorded {
                triad_id: triad_id.into(),
                prompt_tokens,
                completion_tokens,
                agent_id: None,
                phase_name: None,
            },
        )
    }

    pub fn error_occurred(
        run_id: impl Into<String>,
        error_type: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(
            run_id,
            EventKind::ErrorOccurred {
                error_type: error_type.into(),
                message: message.into(),
                agent_id: None,
                triad_id: None,
            },
        )
    }

    /// An event type this crate has no typed arm for
    pub fn custom(
        run_id: impl Into<String>,
        event_type: impl Into<String>,
        fields: Map<String, Value>,
    ) -> Self {
        Self::new(
            run_id,
            EventKind::Unrecognized {
                event_type: event_type.into(),
                fields,
            },
        )
    }
}

impl TryFrom<RawEvent> for Event {
    type Error = EventError;

    fn try_from(raw: RawEvent) -> Result<Self, Self::Error> {
        let RawEvent {
            event_type,
            timestamp,
            run_id,
            fields,
        } = raw;

        let kind = if EventKind::is_known(&event_type) {
            let mut tagged = fields;
            tagged.insert("event_type".to_string(), Value::String(event_type.clone()));
            serde_json::from_value(Value::Object(tagged))
                .map_err(|source| EventError::InvalidPayload { event_type, source })?
        } else {
            EventKind::Unrecognized { event_type, fields }
        };

        Ok(Self {
            timestamp,
            run_id,
            kind,
        })
    }
}

impl From<Event> for RawEvent {
    fn from(event: Event) -> Self {
        let event_type = event.event_type().to_string();
        let fields = match event.kind {
            EventKind::Unrecognized { fields, .. } => fields,
            kind => match serde_json::to_value(&kind) {
                Ok(Value::Object(mut map)) => {
                    map.remove("event_type");
                    map
                }
                _ => Map::new(),
            },
        };

        RawEvent {
            event_type,
            timestamp: event.timestamp,
            run_id: event.run_id,
            fields,
        }
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.event_type(), self.run_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_serialization_is_flat() {
        let event = Event::agent_started("r1", "a1", "t1", "planner");
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["event_type"], "agent.started");
        assert_eq!(value["run_id"], "r1");
        assert_eq!(value["agent_id"], "a1");
        assert_eq!(value["triad_id"], "t1");
        assert_eq!(value["role"], "planner");

        let parsed: Event = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_unknown_event_type_is_retained() {
        let json = r#"{"event_type":"review.requested","timestamp":"2026-01-01T00:00:00Z","run_id":"r1","reviewer":"x","depth":2}"#;
        let event = Event::from_json(json).unwrap();

        assert_eq!(event.event_type(), "review.requested");
        match &event.kind {
            EventKind::Unrecognized { fields, .. } => {
                assert_eq!(fields.get("reviewer"), Some(&json!("x")));
                assert_eq!(fields.get("depth"), Some(&json!(2)));
            }
            other => panic!("expected unrecognized, got {:?}", other),
        }

        let back = serde_json::to_value(&event).unwrap();
        assert_eq!(back["event_type"], "review.requested");
        assert_eq!(back["reviewer"], "x");
    }

    #[test]
    fn test_known_type_with_missing_field_is_rejected() {
        let json = r#"{"event_type":"agent.started","timestamp":"2026-01-01T00:00:00Z","run_id":"r1","agent_id":"a1"}"#;
        let err = Event::from_json(json).unwrap_err();
        assert!(matches!(err, EventError::InvalidPayload { ref event_type, .. } if event_type == "agent.started"));
    }

    #[test]
    fn test_success_defaults_to_true() {
        let json = r#"{"event_type":"run.ended","timestamp":"2026-01-01T00:00:00Z","run_id":"r1","duration_ms":150}"#;
        let event = Event::from_json(json).unwrap();
        assert_eq!(
            event.kind,
            EventKind::RunEnded {
                duration_ms: 150,
                success: true
            }
        );
    }

    #[test]
    fn test_event_accessors() {
        let usage = Event::usage_recorded("r1", "t1", 10, 5);
        assert_eq!(usage.triad_id(), Some("t1"));
        assert_eq!(usage.agent_id(), None);
        assert_eq!(usage.event_type(), "usage.recorded");

        let claim = Event::section_claimed("r1", "header", "A");
        assert_eq!(claim.section_name(), Some("header"));
        assert_eq!(claim.triad_id(), Some("A"));

        let phase = Event::phase_started("r1", "p1", "drafting");
        assert_eq!(phase.phase_id(), Some("p1"));
        assert_eq!(phase.to_string(), "phase.started[r1]");
    }

    #[test]
    fn test_known_type_list_matches_kinds() {
        let events = vec![
            Event::run_started("r"),
            Event::run_ended("r", 1),
            Event::phase_started("r", "p", "n"),
            Event::phase_ended("r", "p", "n", 1),
            Event::agent_started("r", "a", "t", "x"),
            Event::agent_ended("r", "a", "t", "x", 1),
            Event::section_claimed("r", "s", "t"),
            Event::section_contested("r", "s", vec![]),
            Event::section_resolved("r", "s", "t", "vote"),
            Event::usage_recorded("r", "t", 1, 1),
            Event::error_occurred("r", "timeout", "slow"),
        ];
        let types: Vec<&str> = events.iter().map(|e| e.event_type()).collect();
        assert_eq!(types, KNOWN_EVENT_TYPES);
    }
}
