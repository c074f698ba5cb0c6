//! Integration tests for the run state pipeline
//!
//! Drives events through the public bus into a started state manager and
//! checks the resulting snapshots through the query interface.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use triad_coordination::events::{Event, EventBus, EventBusConfig};
use triad_coordination::state::{
    AgentStatus, ChangeCategory, ChangeFilter, SectionStatus, StateChange, StateManager,
};

const WAIT: Duration = Duration::from_secs(2);

fn scenario() -> Vec<Event> {
    vec![
        Event::run_started("r1"),
        Event::agent_started("r1", "a1", "t1", "planner"),
        Event::usage_recorded("r1", "t1", 50, 20),
        Event::agent_ended("r1", "a1", "t1", "planner", 120),
        Event::run_ended("r1", 150),
    ]
}

async fn started(bus: &EventBus) -> StateManager {
    let manager = StateManager::new(bus.clone());
    manager.start().expect("manager starts inside a runtime");
    manager
}

/// Test: A complete single-agent run projects into the expected snapshot
#[tokio::test]
async fn test_end_to_end_run() {
    let bus = EventBus::new();
    let manager = started(&bus).await;

    for event in scenario() {
        bus.emit(event).await;
    }
    assert!(manager.wait_for_version(5, WAIT).await);

    let snapshot = manager.query().get_snapshot();
    assert_eq!(snapshot.version, 5);
    assert_eq!(snapshot.run_id.as_deref(), Some("r1"));

    assert_eq!(snapshot.agent_tree.triads.len(), 1);
    let triad = &snapshot.agent_tree.triads[0];
    assert_eq!(triad.triad_id, "t1");
    assert_eq!(triad.preset, "unknown");
    assert_eq!(triad.agents.len(), 1);
    assert_eq!(triad.agents[0].status, AgentStatus::Complete);
    assert_eq!(snapshot.agent_tree.active_agents, 0);

    let usage = &snapshot.token_usage.by_agent["t1"];
    assert_eq!(usage.prompt_tokens, 50);
    assert_eq!(usage.completion_tokens, 20);

    assert!(snapshot.timeline.started_at.is_some());
    assert!(snapshot.timeline.ended_at.is_some());

    manager.stop().await;
}

/// Test: Replaying the same events into a fresh manager gives the same snapshot
#[tokio::test]
async fn test_replay_is_deterministic() {
    let mut events = scenario();
    events.insert(2, Event::section_claimed("r1", "header", "t1"));
    events.insert(3, Event::section_claimed("r1", "header", "t2"));
    events.insert(4, Event::section_resolved("r1", "header", "t2", "vote"));
    events.insert(5, Event::custom("r1", "ui.refreshed", serde_json::Map::new()));

    let first = StateManager::new(EventBus::new());
    let second = StateManager::new(EventBus::new());
    for event in &events {
        first.ingest(event.clone()).await.unwrap();
    }
    for event in &events {
        second.ingest(event.clone()).await.unwrap();
    }

    assert_eq!(first.version(), events.len() as u64);
    assert_eq!(first.build_snapshot(), second.build_snapshot());
}

/// Test: Versions seen by listeners go up by exactly one per event
#[tokio::test]
async fn test_versions_are_monotonic() {
    let bus = EventBus::new();
    let manager = started(&bus).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let _all = manager.subscribe(ChangeFilter::All, move |change: StateChange| {
        let sink = sink.clone();
        async move {
            sink.lock().unwrap().push(change.version);
            Ok(())
        }
    });

    for i in 0..20 {
        bus.emit(Event::usage_recorded("r1", format!("t{}", i % 3), 1, 1))
            .await;
    }
    assert!(manager.wait_for_version(20, WAIT).await);
    manager.stop().await;

    let versions = seen.lock().unwrap().clone();
    assert_eq!(versions, (1..=20).collect::<Vec<u64>>());
}

/// Test: Two claims contest a section; a resolution settles the last round
#[tokio::test]
async fn test_claim_contest_resolve() {
    let bus = EventBus::new();
    let manager = started(&bus).await;
    let query = manager.query();

    bus.emit(Event::section_claimed("r1", "header", "A")).await;
    bus.emit(Event::section_claimed("r1", "header", "B")).await;
    assert!(manager.wait_for_version(2, WAIT).await);

    let section = query.get_section("header").unwrap();
    assert_eq!(section.status, SectionStatus::Contested);
    assert_eq!(section.claimants, vec!["A".to_string(), "B".to_string()]);

    bus.emit(Event::section_resolved("r1", "header", "A", "negotiated"))
        .await;
    assert!(manager.wait_for_version(3, WAIT).await);

    let section = query.get_section("header").unwrap();
    assert_eq!(section.status, SectionStatus::Claimed);
    assert_eq!(section.owner.as_deref(), Some("A"));
    let last = section.contest_history.last().unwrap();
    assert_eq!(last.winner.as_deref(), Some("A"));

    manager.stop().await;
}

/// Test: Usage for the same triad accumulates
#[tokio::test]
async fn test_token_accumulation() {
    let manager = StateManager::new(EventBus::new());
    manager.ingest(Event::usage_recorded("r1", "t1", 10, 5)).await.unwrap();
    manager.ingest(Event::usage_recorded("r1", "t1", 3, 2)).await.unwrap();

    let usage = manager.query().get_usage_by_agent("t1").unwrap();
    assert_eq!((usage.prompt_tokens, usage.completion_tokens), (13, 7));
    assert_eq!(usage.requests, 2);
}

/// Test: A stalled subscriber loses events without blocking the emitter
#[tokio::test]
async fn test_backpressure_drops_instead_of_blocking() {
    let bus = EventBus::with_config(EventBusConfig {
        put_timeout: Duration::from_millis(50),
        ..Default::default()
    });
    let _stalled = bus.subscribe_with_capacity("*", 1);

    let started = Instant::now();
    assert_eq!(bus.emit(Event::run_started("r1")).await, 1);
    assert_eq!(bus.emit(Event::run_ended("r1", 1)).await, 0);
    assert!(started.elapsed() < Duration::from_secs(1));
}

/// Test: Delta queries report categories, and flag a truncated window
#[tokio::test]
async fn test_changes_since_with_truncated_history() {
    let manager = StateManager::with_history_capacity(EventBus::new(), 3);
    for event in scenario() {
        manager.ingest(event).await.unwrap();
    }
    let query = manager.query();

    let current = query.get_changes_since(5);
    assert_eq!(current.events_processed, 0);
    assert!(current.categories.is_empty());

    let recent = query.get_changes_since(3);
    assert_eq!(recent.events_processed, 2);
    assert_eq!(
        recent.categories,
        vec![ChangeCategory::AgentTree, ChangeCategory::Timeline]
    );
    assert!(!recent.history_truncated);

    let old = query.get_changes_since(0);
    assert!(old.history_truncated);
    assert_eq!(old.events_processed, 3);
    assert!(!old.categories.contains(&ChangeCategory::Negotiation));
}

/// Test: A listener that fails does not starve the others
#[tokio::test]
async fn test_listener_failure_is_isolated() {
    let bus = EventBus::new();
    let manager = started(&bus).await;

    let calls = Arc::new(AtomicU64::new(0));
    let counter = calls.clone();
    let _broken = manager.subscribe(ChangeCategory::Timeline, |_| async {
        Err(anyhow::anyhow!("widget unavailable"))
    });
    let _counting = manager.subscribe(ChangeCategory::Timeline, move |_| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });

    bus.emit(Event::run_started("r1")).await;
    bus.emit(Event::run_ended("r1", 5)).await;
    assert!(manager.wait_for_version(2, WAIT).await);
    manager.stop().await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
}
