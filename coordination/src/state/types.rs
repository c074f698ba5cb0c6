//! Core types for the run state projection
//!
//! Entities are replaced wholesale on every transition rather than patched
//! in place; each `with_*`/transition method returns a new value.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::negotiation::SectionNegotiationState;

/// Unique identifier for agents
pub type AgentId = String;

/// Unique identifier for triads
pub type TriadId = String;

/// Preset recorded for triads first seen through an agent event
pub const UNKNOWN_PRESET: &str = "unknown";

/// Execution status of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Working,
    Blocked,
    Complete,
}

impl AgentStatus {
    /// Whether the agent is still executing
    pub fn is_active(self) -> bool {
        matches!(self, Self::Working | Self::Blocked)
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Working => write!(f, "working"),
            Self::Blocked => write!(f, "blocked"),
            Self::Complete => write!(f, "complete"),
        }
    }
}

/// One execution unit within a triad
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentNode {
    pub agent_id: AgentId,
    pub triad_id: TriadId,
    pub role: String,
    pub status: AgentStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocking_reason: Option<String>,
}

impl AgentNode {
    /// A freshly started agent
    pub fn started(
        agent_id: impl Into<AgentId>,
        triad_id: impl Into<TriadId>,
        role: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            triad_id: triad_id.into(),
            role: role.into(),
            status: AgentStatus::Working,
            started_at,
            ended_at: None,
            current_action: None,
            progress: None,
            blocking_reason: None,
        }
    }

    /// Copy of this node marked complete at `ended_at`
    pub fn completed(&self, ended_at: DateTime<Utc>) -> Self {
        Self {
            status: AgentStatus::Complete,
            ended_at: Some(ended_at),
            ..self.clone()
        }
    }
}

/// A group of cooperating agents under one coordination preset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriadInfo {
    pub triad_id: TriadId,
    pub preset: String,
    pub agents: Vec<AgentNode>,
}

impl TriadInfo {
    /// A triad first seen through an agent event
    pub fn discovered(triad_id: impl Into<TriadId>) -> Self {
        Self {
            triad_id: triad_id.into(),
            preset: UNKNOWN_PRESET.to_string(),
            agents: Vec::new(),
        }
    }

    /// Copy with `agent` inserted, or replacing the entry with its id
    pub fn with_agent(&self, agent: AgentNode) -> Self {
        let mut agents = self.agents.clone();
        match agents.iter_mut().find(|a| a.agent_id == agent.agent_id) {
            Some(slot) => *slot = agent,
            None => agents.push(agent),
        }
        Self {
            agents,
            ..self.clone()
        }
    }

    pub fn agent(&self, agent_id: &str) -> Option<&AgentNode> {
        self.agents.iter().find(|a| a.agent_id == agent_id)
    }
}

/// Accumulated token counts for one usage key.
///
/// Keyed by the `triad_id` carried on `usage.recorded` events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentTokenUsage {
    pub agent_id: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub requests: u64,
}

impl AgentTokenUsage {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            ..Default::default()
        }
    }

    /// Copy with one more usage record added
    pub fn add(&self, prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            agent_id: self.agent_id.clone(),
            prompt_tokens: self.prompt_tokens + prompt_tokens,
            completion_tokens: self.completion_tokens + completion_tokens,
            requests: self.requests + 1,
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Accumulated token counts for one phase
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseTokenUsage {
    pub phase_name: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub requests: u64,
}

impl PhaseTokenUsage {
    pub fn new(phase_name: impl Into<String>) -> Self {
        Self {
            phase_name: phase_name.into(),
            ..Default::default()
        }
    }

    pub fn add(&self, prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            phase_name: self.phase_name.clone(),
            prompt_tokens: self.prompt_tokens + prompt_tokens,
            completion_tokens: self.completion_tokens + completion_tokens,
            requests: self.requests + 1,
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Start and end of one phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseTimeline {
    pub phase_id: String,
    pub phase_name: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl PhaseTimeline {
    pub fn started(
        phase_id: impl Into<String>,
        phase_name: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            phase_id: phase_id.into(),
            phase_name: phase_name.into(),
            started_at,
            ended_at: None,
            duration_ms: None,
        }
    }

    /// Copy of this phase closed at `ended_at`
    pub fn ended(&self, ended_at: DateTime<Utc>, duration_ms: u64) -> Self {
        Self {
            ended_at: Some(ended_at),
            duration_ms: Some(duration_ms),
            ..self.clone()
        }
    }

    pub fn is_complete(&self) -> bool {
        self.ended_at.is_some()
    }
}

// ============================================================================
// Snapshots
// ============================================================================

/// All triads and their agents
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentTree {
    pub triads: Vec<TriadInfo>,
    pub total_agents: usize,
    pub active_agents: usize,
}

impl AgentTree {
    pub fn triad(&self, triad_id: &str) -> Option<&TriadInfo> {
        self.triads.iter().find(|t| t.triad_id == triad_id)
    }
}

/// Every section's negotiation record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NegotiationSnapshot {
    pub sections: Vec<SectionNegotiationState>,
    /// Global contest round counter
    pub contest_round: u32,
}

impl NegotiationSnapshot {
    pub fn section(&self, name: &str) -> Option<&SectionNegotiationState> {
        self.sections.iter().find(|s| s.section_name == name)
    }

    /// Number of sections currently contested
    pub fn contested_count(&self) -> usize {
        self.sections.iter().filter(|s| s.is_contested()).count()
    }
}

/// Token usage totals and breakdowns
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsageSummary {
    pub by_agent: BTreeMap<String, AgentTokenUsage>,
    pub by_phase: BTreeMap<String, PhaseTokenUsage>,
    pub total_prompt_tokens: u64,
    pub total_completion_tokens: u64,
}

impl TokenUsageSummary {
    pub fn total_tokens(&self) -> u64 {
        self.total_prompt_tokens + self.total_completion_tokens
    }
}

/// Run and phase timing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceTimeline {
    pub run_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub phases: Vec<PhaseTimeline>,
}

impl TraceTimeline {
    /// Wall-clock run duration once both ends are known
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

/// Complete point-in-time view of the projection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub version: u64,
    pub run_id: Option<String>,
    pub agent_tree: AgentTree,
    pub negotiation: NegotiationSnapshot,
    pub token_usage: TokenUsageSummary,
    pub timeline: TraceTimeline,
}

// ============================================================================
// Change tracking
// ============================================================================

/// Which part of the snapshot an event affects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeCategory {
    AgentTree,
    Negotiation,
    Usage,
    Timeline,
    None,
}

impl ChangeCategory {
    /// Classify by event type prefix
    pub fn from_event_type(event_type: &str) -> Self {
        let prefix = event_type.split('.').next().unwrap_or_default();
        match prefix {
            "agent" => Self::AgentTree,
            "negotiation" => Self::Negotiation,
            "usage" => Self::Usage,
            "run" | "phase" => Self::Timeline,
            _ => Self::None,
        }
    }
}

impl std::fmt::Display for ChangeCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AgentTree => write!(f, "agent_tree"),
            Self::Negotiation => write!(f, "negotiation"),
            Self::Usage => write!(f, "usage"),
            Self::Timeline => write!(f, "timeline"),
            Self::None => write!(f, "none"),
        }
    }
}

/// Which changes a listener wants to hear about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeFilter {
    All,
    Only(ChangeCategory),
}

impl ChangeFilter {
    pub fn accepts(self, category: ChangeCategory) -> bool {
        match self {
            Self::All => true,
            Self::Only(wanted) => wanted == category,
        }
    }
}

impl From<ChangeCategory> for ChangeFilter {
    fn from(category: ChangeCategory) -> Self {
        Self::Only(category)
    }
}

/// Notification sent to listeners after an event is applied
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub version: u64,
    pub category: ChangeCategory,
    pub event_type: String,
}

/// Result of a delta query.
///
/// Built from the bounded event history only, so it lists the categories
/// known to have changed; when `history_truncated` is set, older changes
/// fell out of the window and are not reported.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub since_version: u64,
    pub current_version: u64,
    pub events_processed: usize,
    pub categories: Vec<ChangeCategory>,
    pub history_truncated: bool,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.events_processed == 0
    }

    pub fn contains(&self, category: ChangeCategory) -> bool {
        self.categories.contains(&category)
    }
}
