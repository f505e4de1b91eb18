//! Structured lifecycle events are emitted where operators expect them.
//!
//! These tests capture tracing output and assert on the stable `event`
//! field values, which log pipelines filter on.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use recall_core::coordination::{CoordinationConfig, CoordinationStateManager};
use recall_core::memory::{ConsolidationPolicy, MemoryStoreConfig, TieredMemoryStore};
use recall_core::obs;
use recall_state::fakes::MemoryRemoteStore;
use recall_state::{CoordinationEvent, EventType};
use tracing_test::traced_test;

fn memory_config() -> MemoryStoreConfig {
    MemoryStoreConfig {
        probe_interval: Duration::ZERO,
        remote_timeout: Duration::from_millis(200),
        ..MemoryStoreConfig::default()
    }
}

#[traced_test]
#[test]
fn test_emitters_carry_event_names() {
    obs::emit_migration_finished(4, 1, true);
    obs::emit_store_recovered("memory", 250);

    assert!(logs_contain("migration.finished"));
    assert!(logs_contain("dry_run=true"));
    assert!(logs_contain("store.recovered"));
}

#[tokio::test]
#[traced_test]
async fn test_write_and_sync_are_logged() {
    let fake = Arc::new(MemoryRemoteStore::new());
    let store = TieredMemoryStore::open(fake, memory_config()).await;

    store
        .write_and_sync("Goal: keep the log schema stable", BTreeSet::new())
        .await
        .unwrap();

    assert!(logs_contain("memory.written"));
    assert!(logs_contain("memory_type=GOAL"));
    assert!(logs_contain("sync.finished"));
    assert!(logs_contain("synced=1"));
}

#[tokio::test]
#[traced_test]
async fn test_degradation_and_recovery_are_logged() {
    let fake = Arc::new(MemoryRemoteStore::new());
    let store = TieredMemoryStore::open(fake.clone(), memory_config()).await;

    fake.set_available(false);
    store.write("Task: survive the outage", BTreeSet::new()).unwrap();
    store.sync().await;
    assert!(logs_contain("store.degraded"));

    fake.set_available(true);
    store.sync().await;
    assert!(logs_contain("store.recovered"));
}

#[tokio::test]
#[traced_test]
async fn test_consolidation_is_logged() {
    let store = TieredMemoryStore::cache_only(memory_config());
    store
        .consolidate(&ConsolidationPolicy::new(Duration::from_secs(86_400), 0.2))
        .await
        .unwrap();

    assert!(logs_contain("consolidation.finished"));
}

#[tokio::test]
#[traced_test]
async fn test_rejected_spawn_is_logged() {
    let fake = Arc::new(MemoryRemoteStore::new());
    let manager = CoordinationStateManager::open(
        fake,
        CoordinationConfig {
            emergency_stop: true,
            ..CoordinationConfig::default()
        },
    )
    .await;

    let outcome = manager
        .record_coordination_event(
            CoordinationEvent::new(EventType::Spawn, "orchestrator", "orchestrator")
                .with_target("worker-1"),
        )
        .await
        .unwrap();

    assert!(outcome.is_rejected());
    assert!(logs_contain("coordination.spawn_rejected"));
    assert!(logs_contain("worker-1"));
}
