//! Trait contract tests for RemoteStore.
//!
//! Every contract runs against both the in-memory fake and an in-memory
//! SurrealDB instance. Any conforming implementation must pass these.

use std::collections::BTreeSet;

use chrono::{Duration, Utc};
use recall_state::fakes::MemoryRemoteStore;
use recall_state::storage_traits::*;
use recall_state::{
    AgentState, AgentStateKey, AgentStatus, CoordinationEvent, EventType, MemoryRecord,
    MemoryType, StorageError, SurrealHandle, SystemState, SystemStateDelta,
};

fn memory(memory_type: MemoryType, keywords: &[&str], tags: &[&str], score: f64) -> MemoryRecord {
    MemoryRecord::new(
        format!("{memory_type} memory about {}", keywords.join(" ")),
        tags.iter().map(|t| t.to_string()).collect::<BTreeSet<_>>(),
        memory_type,
        keywords.iter().map(|k| k.to_string()).collect(),
        score,
    )
}

async fn surreal() -> SurrealHandle {
    SurrealHandle::setup_db().await.unwrap()
}

// ===========================================================================
// Contracts
// ===========================================================================

async fn contract_memory_upsert_replaces(store: &dyn RemoteStore) {
    let mut record = memory(MemoryType::Task, &["deploy"], &["ops"], 0.45);
    store.put_memory(&record).await.unwrap();

    record.content = "Task: deploy the canary first".into();
    record.touch();
    store.put_memory(&record).await.unwrap();

    let loaded = store.get_memory(&record.id).await.unwrap().unwrap();
    assert_eq!(loaded.content, "Task: deploy the canary first");
    assert_eq!(store.count_memories().await.unwrap(), 1);
}

async fn contract_memory_absent_is_none(store: &dyn RemoteStore) {
    assert!(store.get_memory("no-such-id").await.unwrap().is_none());
    store.delete_memory("no-such-id").await.unwrap();
}

async fn contract_search_ranking(store: &dyn RemoteStore) {
    let low = memory(MemoryType::Context, &["cache"], &["infra"], 0.3);
    let high = memory(MemoryType::Goal, &["cache", "latency"], &["infra"], 0.9);
    let other = memory(MemoryType::Error, &["timeout"], &["db"], 0.7);
    for r in [&low, &high, &other] {
        store.put_memory(r).await.unwrap();
    }

    let hits = store
        .search_memories(&MemorySearch::all().with_keywords(["cache"]))
        .await
        .unwrap();
    let ids: Vec<_> = hits.iter().map(|r| r.id.clone()).collect();
    assert_eq!(ids, vec![high.id.clone(), low.id.clone()]);

    let limited = store
        .search_memories(&MemorySearch::all().with_tags(["infra"]).with_limit(1))
        .await
        .unwrap();
    assert_eq!(limited.len(), 1);
    assert_eq!(limited[0].id, high.id);

    let errors = store
        .search_memories(&MemorySearch::all().with_type(Some(MemoryType::Error)))
        .await
        .unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].id, other.id);
}

async fn contract_search_created_before(store: &dyn RemoteStore) {
    let mut old = memory(MemoryType::Progress, &["migration"], &[], 0.5);
    old.created_at = Utc::now() - Duration::days(10);
    old.updated_at = old.created_at;
    let fresh = memory(MemoryType::Progress, &["migration"], &[], 0.5);
    store.put_memory(&old).await.unwrap();
    store.put_memory(&fresh).await.unwrap();

    let hits = store
        .search_memories(&MemorySearch::all().created_before(Utc::now() - Duration::days(1)))
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, old.id);
}

async fn contract_agent_state_round_trip(store: &dyn RemoteStore) {
    let mut state = AgentState::new("agent-7", "reviewer", "session-1")
        .with_status(AgentStatus::Working)
        .with_context("branch", serde_json::json!("main"));
    state.task_history.push("review #12".into());
    state.performance_metrics.insert("reviews".into(), 3.0);
    store.put_agent_state(&state).await.unwrap();

    let key = AgentStateKey::new("reviewer", "agent-7", "session-1");
    let loaded = store.get_agent_state(&key).await.unwrap().unwrap();
    assert_eq!(loaded.status, AgentStatus::Working);
    assert_eq!(loaded.task_history, vec!["review #12".to_string()]);
    assert_eq!(loaded.performance_metrics.get("reviews"), Some(&3.0));
    assert_eq!(loaded.memory_context.get("branch"), Some(&serde_json::json!("main")));

    let found = store
        .find_agent_state("agent-7", "session-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.agent_type, "reviewer");
    assert!(store
        .find_agent_state("agent-7", "session-2")
        .await
        .unwrap()
        .is_none());
}

async fn contract_agent_state_rejects_invalid(store: &dyn RemoteStore) {
    let state = AgentState::new("", "reviewer", "session-1");
    let err = store.put_agent_state(&state).await.unwrap_err();
    assert!(matches!(err, StorageError::Validation(_)));
}

async fn contract_list_agent_states(store: &dyn RemoteStore) {
    store
        .put_agent_state(&AgentState::new("a1", "coder", "s1"))
        .await
        .unwrap();
    store
        .put_agent_state(&AgentState::new("a1", "coder", "s2"))
        .await
        .unwrap();
    store
        .put_agent_state(&AgentState::new("a2", "coder", "s1"))
        .await
        .unwrap();

    assert_eq!(store.list_agent_states(None).await.unwrap().len(), 3);
    assert_eq!(store.list_agent_states(Some("a1")).await.unwrap().len(), 2);
}

async fn contract_events_newest_first(store: &dyn RemoteStore) {
    let mut first = CoordinationEvent::new(EventType::Spawn, "planner", "planner").with_target("w1");
    first.timestamp = Utc::now() - Duration::seconds(30);
    let mut second = CoordinationEvent::new(EventType::Handoff, "planner", "planner").with_target("w2");
    second.timestamp = Utc::now() - Duration::seconds(10);
    let third = CoordinationEvent::new(EventType::Completion, "w1", "worker");

    for e in [&first, &second, &third] {
        store.append_event(e).await.unwrap();
    }
    // Appending the same event twice does not duplicate it.
    store.append_event(&first).await.unwrap();

    let all = store.list_events(&EventFilter::all()).await.unwrap();
    let ids: Vec<_> = all.iter().map(|e| e.event_id.clone()).collect();
    assert_eq!(ids, vec![third.event_id.clone(), second.event_id.clone(), first.event_id.clone()]);

    let planner = store
        .list_events(&EventFilter::all().for_agent("planner").with_limit(1))
        .await
        .unwrap();
    assert_eq!(planner.len(), 1);
    assert_eq!(planner[0].event_id, second.event_id);

    let spawns = store
        .list_events(&EventFilter::all().of_type(EventType::Spawn))
        .await
        .unwrap();
    assert_eq!(spawns.len(), 1);
}

async fn contract_system_state(store: &dyn RemoteStore) {
    assert!(store.get_system_state().await.unwrap().is_none());

    let mut state = SystemState::new("1.0.0");
    SystemStateDelta {
        add_sessions: vec!["s1".into()],
        agents_spawned: 2,
        ..SystemStateDelta::default()
    }
    .apply(&mut state);
    store.put_system_state(&state).await.unwrap();

    let loaded = store.get_system_state().await.unwrap().unwrap();
    assert_eq!(loaded.total_agents_spawned, 2);
    assert!(loaded.active_sessions.contains("s1"));
    assert!(!loaded.emergency_stop);
}

macro_rules! contract_tests {
    ($($name:ident),* $(,)?) => {
        mod fake {
            use super::*;
            $(
                #[tokio::test]
                async fn $name() {
                    let store = MemoryRemoteStore::new();
                    super::$name(&store).await;
                }
            )*
        }

        mod surreal {
            use super::*;
            $(
                #[tokio::test]
                async fn $name() {
                    let store = surreal().await;
                    super::$name(&store).await;
                }
            )*
        }
    };
}

contract_tests!(
    contract_memory_upsert_replaces,
    contract_memory_absent_is_none,
    contract_search_ranking,
    contract_search_created_before,
    contract_agent_state_round_trip,
    contract_agent_state_rejects_invalid,
    contract_list_agent_states,
    contract_events_newest_first,
    contract_system_state,
);

// ===========================================================================
// Fake-only behavior
// ===========================================================================

#[tokio::test]
async fn fake_offline_reports_unavailable() {
    let store = MemoryRemoteStore::new();
    store.set_available(false);
    let err = store.ping().await.unwrap_err();
    assert!(err.is_unavailable());

    store.set_available(true);
    store.ping().await.unwrap();
}

#[tokio::test]
async fn fake_injected_failures_are_transient_and_finite() {
    let store = MemoryRemoteStore::new();
    store.fail_next(2);
    assert!(store.ping().await.unwrap_err().is_transient());
    assert!(store.ping().await.unwrap_err().is_transient());
    store.ping().await.unwrap();
}

#[tokio::test]
async fn fake_rejected_memory_is_permanent() {
    let store = MemoryRemoteStore::new();
    let record = memory(MemoryType::Knowledge, &["rust"], &[], 0.65);
    store.reject_memory(record.id.clone());

    let err = store.put_memory(&record).await.unwrap_err();
    assert!(!err.is_transient());
    assert_eq!(store.memory_count(), 0);
}
