//! Query interface — read-only facade over the state manager
//!
//! This is the surface UI widgets and the checkpoint service consume.
//! Every method maps onto one projection accessor; parameterized lookups
//! return `None` for unknown keys.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::manager::{ManagerShared, Unsubscribe};
use super::negotiation::SectionNegotiationState;
use super::types::*;
use crate::events::Event;

/// Cloneable read handle onto a state manager's projection
#[derive(Clone)]
pub struct QueryInterface {
    shared: Arc<ManagerShared>,
}

impl QueryInterface {
    pub(crate) fn new(shared: Arc<ManagerShared>) -> Self {
        Self { shared }
    }

    pub fn version(&self) -> u64 {
        self.shared.read(|p| p.version())
    }

    pub fn get_snapshot(&self) -> RunSnapshot {
        self.shared.read(|p| p.build_snapshot())
    }

    pub fn get_agent_tree(&self) -> AgentTree {
        self.shared.read(|p| p.build_agent_tree())
    }

    pub fn get_agent(&self, agent_id: &str) -> Option<AgentNode> {
        self.shared.read(|p| p.agent(agent_id))
    }

    pub fn get_triad(&self, triad_id: &str) -> Option<TriadInfo> {
        self.shared.read(|p| p.triad(triad_id))
    }

    pub fn get_negotiation_state(&self) -> NegotiationSnapshot {
        self.shared.read(|p| p.build_negotiation_snapshot())
    }

    pub fn get_section(&self, section_name: &str) -> Option<SectionNegotiationState> {
        self.shared.read(|p| p.section(section_name))
    }

    pub fn get_token_usage(&self) -> TokenUsageSummary {
        self.shared.read(|p| p.build_token_usage())
    }

    pub fn get_usage_by_phase(&self, phase_name: &str) -> Option<PhaseTokenUsage> {
        self.shared.read(|p| p.usage_by_phase(phase_name))
    }

    /// Usage bucket for `agent_id`.
    ///
    /// Usage is accumulated per `triad_id`, so this resolves triad ids;
    /// agents sharing a triad share one bucket.
    pub fn get_usage_by_agent(&self, agent_id: &str) -> Option<AgentTokenUsage> {
        self.shared.read(|p| p.usage_by_agent(agent_id))
    }

    pub fn get_trace_timeline(&self) -> TraceTimeline {
        self.shared.read(|p| p.build_trace_timeline())
    }

    /// Phase by id, or by name when no id matches
    pub fn get_phase_timeline(&self, phase: &str) -> Option<PhaseTimeline> {
        self.shared.read(|p| p.phase_timeline(phase))
    }

    /// Categories changed after `version`.
    ///
    /// Answered from the bounded event history, so the result means "at
    /// least these categories changed". Check `history_truncated` before
    /// treating it as complete.
    pub fn get_changes_since(&self, version: u64) -> ChangeSet {
        self.shared.read(|p| p.changes_since(version))
    }

    /// Register a change listener; see `StateManager::subscribe`
    pub fn subscribe<F, Fut>(&self, filter: impl Into<ChangeFilter>, callback: F) -> Unsubscribe
    where
        F: Fn(StateChange) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.shared.subscribe(filter.into(), callback)
    }

    /// Whether the projection has applied `event` (within retained history)
    pub fn has_applied(&self, event: &Event) -> bool {
        self.shared.read(|p| p.has_applied(event))
    }

    /// Wait until `event` shows up in the projection. Returns false on timeout.
    pub async fn wait_until_applied(&self, event: &Event, timeout: Duration) -> bool {
        let mut versions = self.shared.version_receiver();
        let applied = async {
            loop {
                if self.has_applied(event) {
                    return true;
                }
                if versions.changed().await.is_err() {
                    return false;
                }
            }
        };
        tokio::time::timeout(timeout, applied).await.unwrap_or(false)
    }
}

impl std::fmt::Debug for QueryInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryInterface")
            .field("version", &self.version())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::state::negotiation::SectionStatus;
    use crate::state::StateManager;

    async fn seeded() -> (StateManager, QueryInterface) {
        let manager = StateManager::new(EventBus::new());
        for event in [
            Event::run_started("r1"),
            Event::phase_started("r1", "p1", "drafting"),
            Event::agent_started("r1", "a1", "t1", "planner"),
            Event::section_contested("r1", "intro", vec!["t1".into(), "t2".into()]),
            Event::usage_recorded("r1", "t1", 50, 20),
        ] {
            manager.ingest(event).await.unwrap();
        }
        let query = manager.query();
        (manager, query)
    }

    #[tokio::test]
    async fn test_lookups() {
        let (_manager, query) = seeded().await;

        assert_eq!(query.version(), 5);
        assert_eq!(query.get_agent("a1").unwrap().triad_id, "t1");
        assert!(query.get_agent("missing").is_none());
        assert_eq!(query.get_triad("t1").unwrap().agents.len(), 1);
        assert!(query.get_triad("t9").is_none());
        assert_eq!(
            query.get_section("intro").unwrap().status,
            SectionStatus::Contested
        );
        assert!(query.get_section("outro").is_none());
        assert_eq!(query.get_usage_by_agent("t1").unwrap().prompt_tokens, 50);
        assert!(query.get_usage_by_agent("a1").is_none());
        assert!(query.get_usage_by_phase("drafting").is_none());
        assert_eq!(query.get_phase_timeline("p1").unwrap().phase_name, "drafting");
        assert_eq!(query.get_trace_timeline().run_id.as_deref(), Some("r1"));
        assert_eq!(query.get_negotiation_state().contest_round, 1);
        assert_eq!(query.get_token_usage().total_tokens(), 70);
        assert_eq!(query.get_agent_tree().total_agents, 1);
        assert_eq!(query.get_snapshot().version, 5);
    }

    #[tokio::test]
    async fn test_changes_since_boundaries() {
        let (_manager, query) = seeded().await;

        let current = query.get_changes_since(5);
        assert_eq!(current.events_processed, 0);
        assert!(current.categories.is_empty());

        let all = query.get_changes_since(0);
        assert_eq!(all.events_processed, 5);
        assert!(all.contains(ChangeCategory::Timeline));
        assert!(all.contains(ChangeCategory::AgentTree));
        assert!(all.contains(ChangeCategory::Negotiation));
        assert!(all.contains(ChangeCategory::Usage));
        assert!(!all.history_truncated);
    }

    #[tokio::test]
    async fn test_wait_until_applied() {
        let bus = EventBus::new();
        let manager = StateManager::new(bus.clone());
        manager.start().unwrap();
        let query = manager.query();

        let event = Event::run_ended("r1", 10);
        bus.emit(event.clone()).await;
        assert!(query.wait_until_applied(&event, Duration::from_secs(2)).await);

        let never = Event::run_ended("r2", 1);
        assert!(!query.wait_until_applied(&never, Duration::from_millis(20)).await);

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_subscribe_through_query() {
        let (manager, query) = seeded().await;
        let handle = query.subscribe(ChangeCategory::Negotiation, |_| async { Ok(()) });
        assert_eq!(manager.listener_count(), 1);
        assert!(handle.unsubscribe());
    }
}
