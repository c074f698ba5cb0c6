//! Event-sourced projection of run state
//!
//! `Projection` holds the indexed maps derived from the event stream and
//! the snapshot builders over them. Applying the same event sequence to a
//! fresh projection always yields the same state and version.

use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::{DateTime, Utc};

use super::negotiation::SectionNegotiationState;
use super::types::*;
use crate::events::{Event, EventKind};

/// Events retained for delta queries
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

/// One applied event in the bounded history
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub version: u64,
    pub category: ChangeCategory,
    pub event: Event,
}

/// Indexed run state built from applied events
#[derive(Debug, Clone)]
pub struct Projection {
    version: u64,
    run_id: Option<String>,
    run_started_at: Option<DateTime<Utc>>,
    run_ended_at: Option<DateTime<Utc>>,

    agents: HashMap<AgentId, AgentNode>,
    triads: BTreeMap<TriadId, TriadInfo>,

    phases: HashMap<String, PhaseTimeline>,
    /// Phase ids in first-start order
    phase_order: Vec<String>,

    sections: BTreeMap<String, SectionNegotiationState>,
    contest_round: u32,

    usage_by_agent: BTreeMap<String, AgentTokenUsage>,
    usage_by_phase: BTreeMap<String, PhaseTokenUsage>,

    history: VecDeque<HistoryEntry>,
    history_capacity: usize,
    /// Last applied event of each type, kept even when history is disabled
    last_by_type: HashMap<String, Event>,
}

impl Default for Projection {
    fn default() -> Self {
        Self::new()
    }
}

impl Projection {
    pub fn new() -> Self {
        Self::with_history_capacity(DEFAULT_HISTORY_CAPACITY)
    }

    pub fn with_history_capacity(history_capacity: usize) -> Self {
        Self {
            version: 0,
            run_id: None,
            run_started_at: None,
            run_ended_at: None,
            agents: HashMap::new(),
            triads: BTreeMap::new(),
            phases: HashMap::new(),
            phase_order: Vec::new(),
            sections: BTreeMap::new(),
            contest_round: 0,
            usage_by_agent: BTreeMap::new(),
            usage_by_phase: BTreeMap::new(),
            history: VecDeque::with_capacity(history_capacity.min(DEFAULT_HISTORY_CAPACITY)),
            history_capacity,
            last_by_type: HashMap::new(),
        }
    }

    /// Number of events applied so far
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn run_id(&self) -> Option<&str> {
        self.run_id.as_deref()
    }

    /// Apply one event, bumping the version by exactly one
    pub fn apply(&mut self, event: &Event) -> StateChange {
        let category = ChangeCategory::from_event_type(event.event_type());
        let at = event.timestamp;

        match &event.kind {
            EventKind::RunStarted => {
                self.run_id = Some(event.run_id.clone());
                self.run_started_at = Some(at);
            }
            EventKind::RunEnded { .. } => {
                self.run_ended_at = Some(at);
            }
            EventKind::PhaseStarted {
                phase_id,
                phase_name,
            } => {
                if !self.phases.contains_key(phase_id) {
                    self.phase_order.push(phase_id.clone());
                }
                self.phases.insert(
                    phase_id.clone(),
                    PhaseTimeline::started(phase_id.as_str(), phase_name.as_str(), at),
                );
            }
            EventKind::PhaseEnded {
                phase_id,
                duration_ms,
                ..
            } => {
                if let Some(phase) = self.phases.get(phase_id) {
                    let ended = phase.ended(at, *duration_ms);
                    self.phases.insert(phase_id.clone(), ended);
                }
            }
            EventKind::AgentStarted {
                agent_id,
                triad_id,
                role,
            } => {
                let node = AgentNode::started(agent_id.as_str(), triad_id.as_str(), role.as_str(), at);
                let triad = self
                    .triads
                    .get(triad_id)
                    .cloned()
                    .unwrap_or_else(|| TriadInfo::discovered(triad_id.as_str()));
                self.triads
                    .insert(triad_id.clone(), triad.with_agent(node.clone()));
                self.agents.insert(agent_id.clone(), node);
            }
            EventKind::AgentEnded { agent_id, .. } => {
                if let Some(existing) = self.agents.get(agent_id) {
                    let node = existing.completed(at);
                    if let Some(triad) = self.triads.get(&node.triad_id) {
                        let updated = triad.with_agent(node.clone());
                        self.triads.insert(node.triad_id.clone(), updated);
                    }
                    self.agents.insert(agent_id.clone(), node);
                }
            }
            EventKind::SectionClaimed {
                section_name,
                triad_id,
            } => {
                let next = match self.sections.get(section_name) {
                    Some(section) => section.with_claim(triad_id),
                    None => SectionNegotiationState::first_claim(
                        section_name.as_str(),
                        triad_id.as_str(),
                    ),
                };
                self.sections.insert(section_name.clone(), next);
            }
            EventKind::SectionContested {
                section_name,
                claimants,
            } => {
                self.contest_round += 1;
                let current = self
                    .sections
                    .get(section_name)
                    .cloned()
                    .unwrap_or_else(|| SectionNegotiationState::unclaimed(section_name.as_str()));
                let next = current.with_contest(self.contest_round, claimants.clone());
                self.sections.insert(section_name.clone(), next);
            }
            EventKind::SectionResolved {
                section_name,
                winner,
                resolution_type,
            } => {
                if let Some(section) = self.sections.get(section_name) {
                    if section.contest_history.is_empty() && !section.status.is_terminal() {
                        self.contest_round += 1;
                    }
                    let next = section.with_resolution(winner, resolution_type, self.contest_round);
                    self.sections.insert(section_name.clone(), next);
                }
            }
            EventKind::UsageRecorded {
                triad_id,
                prompt_tokens,
                completion_tokens,
                phase_name,
                ..
            } => {
                let usage = self
                    .usage_by_agent
                    .get(triad_id)
                    .cloned()
                    .unwrap_or_else(|| AgentTokenUsage::new(triad_id.as_str()))
                    .add(*prompt_tokens, *completion_tokens);
                self.usage_by_agent.insert(triad_id.clone(), usage);

                if let Some(phase_name) = phase_name {
                    let usage = self
                        .usage_by_phase
                        .get(phase_name)
                        .cloned()
                        .unwrap_or_else(|| PhaseTokenUsage::new(phase_name.as_str()))
                        .add(*prompt_tokens, *completion_tokens);
                    self.usage_by_phase.insert(phase_name.clone(), usage);
                }
            }
            EventKind::ErrorOccurred { .. } | EventKind::Unrecognized { .. } => {}
        }

        self.version += 1;
        self.record(event, category);

        StateChange {
            version: self.version,
            category,
            event_type: event.event_type().to_string(),
        }
    }

    fn record(&mut self, event: &Event, category: ChangeCategory) {
        self.last_by_type
            .insert(event.event_type().to_string(), event.clone());
        if self.history_capacity == 0 {
            return;
        }
        while self.history.len() >= self.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(HistoryEntry {
            version: self.version,
            category,
            event: event.clone(),
        });
    }

    // =========================================================================
    // Snapshot builders
    // =========================================================================

    pub fn build_agent_tree(&self) -> AgentTree {
        AgentTree {
            triads: self.triads.values().cloned().collect(),
            total_agents: self.agents.len(),
            active_agents: self
                .agents
                .values()
                .filter(|a| a.status.is_active())
                .count(),
        }
    }

    pub fn build_negotiation_snapshot(&self) -> NegotiationSnapshot {
        NegotiationSnapshot {
            sections: self.sections.values().cloned().collect(),
            contest_round: self.contest_round,
        }
    }

    pub fn build_token_usage(&self) -> TokenUsageSummary {
        TokenUsageSummary {
            by_agent: self.usage_by_agent.clone(),
            by_phase: self.usage_by_phase.clone(),
            total_prompt_tokens: self.usage_by_agent.values().map(|u| u.prompt_tokens).sum(),
            total_completion_tokens: self
                .usage_by_agent
                .values()
                .map(|u| u.completion_tokens)
                .sum(),
        }
    }

    pub fn build_trace_timeline(&self) -> TraceTimeline {
        TraceTimeline {
            run_id: self.run_id.clone(),
            started_at: self.run_started_at,
            ended_at: self.run_ended_at,
            phases: self
                .phase_order
                .iter()
                .filter_map(|id| self.phases.get(id).cloned())
                .collect(),
        }
    }

    pub fn build_snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            version: self.version,
            run_id: self.run_id.clone(),
            agent_tree: self.build_agent_tree(),
            negotiation: self.build_negotiation_snapshot(),
            token_usage: self.build_token_usage(),
            timeline: self.build_trace_timeline(),
        }
    }

    // =========================================================================
    // Index lookups
    // =========================================================================

    pub fn agent(&self, agent_id: &str) -> Option<AgentNode> {
        self.agents.get(agent_id).cloned()
    }

    pub fn triad(&self, triad_id: &str) -> Option<TriadInfo> {
        self.triads.get(triad_id).cloned()
    }

    pub fn section(&self, section_name: &str) -> Option<SectionNegotiationState> {
        self.sections.get(section_name).cloned()
    }

    /// Usage bucket for a key; buckets are keyed by triad id
    pub fn usage_by_agent(&self, agent_id: &str) -> Option<AgentTokenUsage> {
        self.usage_by_agent.get(agent_id).cloned()
    }

    pub fn usage_by_phase(&self, phase_name: &str) -> Option<PhaseTokenUsage> {
        self.usage_by_phase.get(phase_name).cloned()
    }

    /// Look a phase up by id, falling back to the first phase with that name
    pub fn phase_timeline(&self, phase: &str) -> Option<PhaseTimeline> {
        self.phases.get(phase).cloned().or_else(|| {
            self.phase_order
                .iter()
                .filter_map(|id| self.phases.get(id))
                .find(|p| p.phase_name == phase)
                .cloned()
        })
    }

    // =========================================================================
    // History
    // =========================================================================

    /// Categories changed after `since`, from retained history only
    pub fn changes_since(&self, since: u64) -> ChangeSet {
        let mut changes = ChangeSet {
            since_version: since,
            current_version: self.version,
            ..Default::default()
        };
        if since >= self.version {
            return changes;
        }

        let mut categories = std::collections::BTreeSet::new();
        for entry in self.history.iter().filter(|e| e.version > since) {
            changes.events_processed += 1;
            if entry.category != ChangeCategory::None {
                categories.insert(entry.category);
            }
        }

        changes.categories = categories.into_iter().collect();
        changes.history_truncated = match self.history.front() {
            Some(oldest) => oldest.version > since + 1,
            None => true,
        };
        changes
    }

    /// Whether `event` has been applied.
    ///
    /// Checks the retained history, then the last event applied for its
    /// type, so the answer does not depend on the history capacity.
    pub fn has_applied(&self, event: &Event) -> bool {
        self.last_by_type.get(event.event_type()) == Some(event)
            || self.history.iter().rev().any(|entry| entry.event == *event)
    }

    /// Retained history, oldest first
    pub fn history(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.history.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::negotiation::SectionStatus;

    fn apply_all(projection: &mut Projection, events: &[Event]) {
        for event in events {
            projection.apply(event);
        }
    }

    #[test]
    fn test_version_increments_once_per_event() {
        let mut projection = Projection::new();
        let events = vec![
            Event::run_started("r1"),
            Event::custom("r1", "something.new", Default::default()),
            Event::phase_ended("r1", "missing", "missing", 1),
            Event::error_occurred("r1", "timeout", "slow"),
        ];

        for (i, event) in events.iter().enumerate() {
            let change = projection.apply(event);
            assert_eq!(change.version, i as u64 + 1);
        }
        assert_eq!(projection.version(), 4);
    }

    #[test]
    fn test_agent_lifecycle() {
        let mut projection = Projection::new();
        apply_all(
            &mut projection,
            &[
                Event::agent_started("r1", "a1", "t1", "planner"),
                Event::agent_started("r1", "a2", "t1", "critic"),
                Event::agent_ended("r1", "a1", "t1", "planner", 120),
            ],
        );

        let tree = projection.build_agent_tree();
        assert_eq!(tree.triads.len(), 1);
        assert_eq!(tree.total_agents, 2);
        assert_eq!(tree.active_agents, 1);

        let triad = projection.triad("t1").unwrap();
        assert_eq!(triad.preset, UNKNOWN_PRESET);
        assert_eq!(triad.agents.len(), 2);
        assert_eq!(triad.agent("a1").unwrap().status, AgentStatus::Complete);
        assert_eq!(triad.agent("a2").unwrap().status, AgentStatus::Working);

        let a1 = projection.agent("a1").unwrap();
        assert!(a1.ended_at.is_some());
        assert_eq!(a1.role, "planner");
    }

    #[test]
    fn test_agent_ended_for_unknown_agent_is_noop() {
        let mut projection = Projection::new();
        projection.apply(&Event::agent_ended("r1", "ghost", "t9", "planner", 1));

        assert!(projection.agent("ghost").is_none());
        assert!(projection.triad("t9").is_none());
        assert_eq!(projection.version(), 1);
    }

    #[test]
    fn test_restarted_agent_is_replaced_not_duplicated() {
        let mut projection = Projection::new();
        apply_all(
            &mut projection,
            &[
                Event::agent_started("r1", "a1", "t1", "planner"),
                Event::agent_ended("r1", "a1", "t1", "planner", 5),
                Event::agent_started("r1", "a1", "t1", "planner"),
            ],
        );

        let triad = projection.triad("t1").unwrap();
        assert_eq!(triad.agents.len(), 1);
        assert_eq!(triad.agents[0].status, AgentStatus::Working);
        assert_eq!(triad.agents[0].ended_at, None);
    }

    #[test]
    fn test_phase_timeline() {
        let mut projection = Projection::new();
        apply_all(
            &mut projection,
            &[
                Event::phase_started("r1", "p1", "drafting"),
                Event::phase_started("r1", "p2", "review"),
                Event::phase_ended("r1", "p1", "drafting", 40),
            ],
        );

        let timeline = projection.build_trace_timeline();
        let names: Vec<&str> = timeline.phases.iter().map(|p| p.phase_name.as_str()).collect();
        assert_eq!(names, vec!["drafting", "review"]);
        assert!(timeline.phases[0].is_complete());
        assert_eq!(timeline.phases[0].duration_ms, Some(40));
        assert!(!timeline.phases[1].is_complete());

        assert_eq!(projection.phase_timeline("p2").unwrap().phase_name, "review");
        assert_eq!(projection.phase_timeline("drafting").unwrap().phase_id, "p1");
        assert!(projection.phase_timeline("nope").is_none());
    }

    #[test]
    fn test_claim_contest_resolve() {
        let mut projection = Projection::new();
        apply_all(
            &mut projection,
            &[
                Event::section_claimed("r1", "header", "A"),
                Event::section_claimed("r1", "header", "B"),
            ],
        );

        let section = projection.section("header").unwrap();
        assert_eq!(section.status, SectionStatus::Contested);
        assert_eq!(section.claimants, vec!["A", "B"]);

        projection.apply(&Event::section_resolved("r1", "header", "A", "negotiated"));
        let section = projection.section("header").unwrap();
        assert_eq!(section.status, SectionStatus::Claimed);
        assert_eq!(section.owner.as_deref(), Some("A"));
        assert_eq!(section.latest_contest().unwrap().winner.as_deref(), Some("A"));
    }

    #[test]
    fn test_contest_rounds_are_global() {
        let mut projection = Projection::new();
        apply_all(
            &mut projection,
            &[
                Event::section_contested("r1", "intro", vec!["A".into(), "B".into()]),
                Event::section_contested("r1", "body", vec!["B".into(), "C".into()]),
                Event::section_contested("r1", "intro", vec!["A".into(), "C".into()]),
                Event::section_resolved("r1", "intro", "C", "vote"),
            ],
        );

        let intro = projection.section("intro").unwrap();
        let rounds: Vec<u32> = intro.contest_history.iter().map(|c| c.round).collect();
        assert_eq!(rounds, vec![1, 3]);
        assert_eq!(intro.claimants, vec!["A", "C"]);
        assert_eq!(intro.contest_history[1].winner.as_deref(), Some("C"));
        assert_eq!(intro.contest_history[0].winner, None);

        let body = projection.section("body").unwrap();
        assert_eq!(body.contest_history[0].round, 2);
        assert_eq!(projection.build_negotiation_snapshot().contest_round, 3);
    }

    #[test]
    fn test_resolution_for_unknown_section_is_noop() {
        let mut projection = Projection::new();
        projection.apply(&Event::section_resolved("r1", "ghost", "A", "vote"));
        assert!(projection.section("ghost").is_none());
        assert_eq!(projection.build_negotiation_snapshot().contest_round, 0);
    }

    #[test]
    fn test_token_accumulation() {
        let mut projection = Projection::new();
        let mut with_phase = Event::usage_recorded("r1", "t1", 3, 2);
        if let EventKind::UsageRecorded { phase_name, .. } = &mut with_phase.kind {
            *phase_name = Some("drafting".to_string());
        }
        apply_all(
            &mut projection,
            &[
                Event::usage_recorded("r1", "t1", 10, 5),
                with_phase,
                Event::usage_recorded("r1", "t2", 1, 1),
            ],
        );

        let t1 = projection.usage_by_agent("t1").unwrap();
        assert_eq!((t1.prompt_tokens, t1.completion_tokens), (13, 7));

        let drafting = projection.usage_by_phase("drafting").unwrap();
        assert_eq!((drafting.prompt_tokens, drafting.completion_tokens), (3, 2));

        let summary = projection.build_token_usage();
        assert_eq!(summary.total_prompt_tokens, 14);
        assert_eq!(summary.total_completion_tokens, 8);
        assert_eq!(summary.total_tokens(), 22);
    }

    #[test]
    fn test_changes_since() {
        let mut projection = Projection::new();
        apply_all(
            &mut projection,
            &[
                Event::run_started("r1"),
                Event::agent_started("r1", "a1", "t1", "planner"),
                Event::usage_recorded("r1", "t1", 1, 1),
                Event::error_occurred("r1", "x", "y"),
            ],
        );

        let none = projection.changes_since(4);
        assert_eq!(none.events_processed, 0);
        assert!(none.categories.is_empty());
        assert!(!none.history_truncated);

        let ahead = projection.changes_since(10);
        assert!(ahead.is_empty());

        let recent = projection.changes_since(1);
        assert_eq!(recent.events_processed, 3);
        assert_eq!(
            recent.categories,
            vec![ChangeCategory::AgentTree, ChangeCategory::Usage]
        );
        assert!(!recent.history_truncated);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut projection = Projection::with_history_capacity(3);
        apply_all(
            &mut projection,
            &[
                Event::run_started("r1"),
                Event::section_claimed("r1", "s", "A"),
                Event::usage_recorded("r1", "t1", 1, 1),
                Event::usage_recorded("r1", "t1", 1, 1),
                Event::usage_recorded("r1", "t1", 1, 1),
            ],
        );

        assert_eq!(projection.history().count(), 3);
        assert_eq!(projection.history().next().unwrap().version, 3);

        let changes = projection.changes_since(0);
        assert_eq!(changes.events_processed, 3);
        assert_eq!(changes.categories, vec![ChangeCategory::Usage]);
        assert!(changes.history_truncated);

        let inside = projection.changes_since(2);
        assert!(!inside.history_truncated);
    }

    #[test]
    fn test_has_applied() {
        let mut projection = Projection::new();
        let event = Event::run_ended("r1", 10);
        assert!(!projection.has_applied(&event));
        projection.apply(&event);
        assert!(projection.has_applied(&event));
    }

    #[test]
    fn test_has_applied_without_history() {
        let mut projection = Projection::with_history_capacity(0);
        let first = Event::phase_ended("r1", "p1", "drafting", 10);
        let other = Event::run_started("r1");
        projection.apply(&first);
        projection.apply(&other);

        assert_eq!(projection.history().count(), 0);
        assert!(projection.has_applied(&first));
        assert!(projection.has_applied(&other));
        assert!(!projection.has_applied(&Event::run_ended("r1", 10)));
    }
}
