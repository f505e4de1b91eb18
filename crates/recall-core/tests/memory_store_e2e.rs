//! End-to-end tests for the tiered memory store over the in-memory fake.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use recall_core::memory::{ConsolidationPolicy, MemoryError, MemoryStoreConfig, TieredMemoryStore};
use recall_core::{BackendStatus, RetryPolicy};
use recall_state::fakes::MemoryRemoteStore;
use recall_state::{MemoryRecord, MemoryType};

fn config() -> MemoryStoreConfig {
    MemoryStoreConfig {
        cache_capacity: 100,
        remote_timeout: Duration::from_millis(100),
        probe_interval: Duration::ZERO,
        retry: RetryPolicy {
            max_attempts: 2,
            backoff_base_ms: 1,
            attempt_timeout_ms: 100,
        },
        ..MemoryStoreConfig::default()
    }
}

fn tags(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|t| t.to_string()).collect()
}

#[tokio::test]
async fn test_write_then_read_round_trips_content_and_tags() {
    let fake = Arc::new(MemoryRemoteStore::new());
    let store = TieredMemoryStore::open(fake.clone(), config()).await;

    let written = store
        .write("Knowledge: the cache evicts clean entries only", tags(&["cache", "lru"]))
        .unwrap();
    let read = store.read(&written.id).await.unwrap();

    assert_eq!(read.content, "Knowledge: the cache evicts clean entries only");
    assert_eq!(read.tags, tags(&["cache", "lru"]));
    assert_eq!(read.memory_type, MemoryType::Knowledge);
}

#[tokio::test]
async fn test_second_sync_without_writes_pushes_nothing() {
    let fake = Arc::new(MemoryRemoteStore::new());
    let store = TieredMemoryStore::open(fake.clone(), config()).await;
    store.write("Task: wire the worker", BTreeSet::new()).unwrap();
    store.write("Progress: worker wired", BTreeSet::new()).unwrap();

    let first = store.sync().await;
    let second = store.sync().await;

    assert_eq!(first.synced_count, 2);
    assert_eq!(second.synced_count, 0);
    assert_eq!(second.failed_count, 0);
    assert_eq!(fake.memory_puts(), 2);
}

#[tokio::test]
async fn test_three_record_scenario_survives_restart() {
    let fake = Arc::new(MemoryRemoteStore::new());
    let store = TieredMemoryStore::open(fake.clone(), config()).await;

    let goal = store.write("Goal: improve latency", BTreeSet::new()).unwrap();
    store.write("Task: add retry", BTreeSet::new()).unwrap();
    let error = store.write("Error: timeout on save", BTreeSet::new()).unwrap();

    let goals = store.query(&[], Some(MemoryType::Goal), 10);
    assert_eq!(goals.len(), 1);
    assert_eq!(goals[0].id, goal.id);

    assert_eq!(store.sync().await.synced_count, 3);
    drop(store);

    // A fresh process starts with an empty cache over the same store.
    let restarted = TieredMemoryStore::open(fake.clone(), config()).await;
    assert!(restarted.query(&[], None, 10).is_empty());

    let hits = restarted
        .search_remote(&["timeout".to_string()], None, 10)
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, error.id);
    assert_eq!(hits[0].memory_type, MemoryType::Error);
}

#[tokio::test]
async fn test_outage_is_absorbed_and_observable() {
    let fake = Arc::new(MemoryRemoteStore::new());
    let store = TieredMemoryStore::open(fake.clone(), config()).await;
    let mut status = store.subscribe_status();
    fake.set_available(false);

    let record = store.write("Decision: ship without the index", BTreeSet::new()).unwrap();
    assert_eq!(store.read(&record.id).await.unwrap().id, record.id);

    // A cache miss against a down store is a plain miss.
    let missing = store.read("no-such-id").await.unwrap_err();
    assert!(missing.is_not_found());
    assert!(store.is_degraded());
    assert!(status.has_changed().unwrap());
    assert!(matches!(
        *status.borrow_and_update(),
        BackendStatus::Degraded { .. }
    ));

    let report = store.sync().await;
    assert_eq!(report.synced_count, 0);
    assert_eq!(report.failed_count, 1);
    assert_eq!(report.failures[0].id, record.id);

    fake.set_available(true);
    let report = store.sync().await;
    assert_eq!(report.synced_count, 1);
    assert!(store.status().is_connected());
    assert_eq!(fake.memory_count(), 1);
}

#[tokio::test]
async fn test_slow_store_read_is_explicit_timeout() {
    let fake = Arc::new(MemoryRemoteStore::new());
    let store = TieredMemoryStore::open(fake.clone(), config()).await;
    fake.set_latency(Duration::from_millis(500));

    let err = store.read("slow-id").await.unwrap_err();
    assert!(matches!(err, MemoryError::Timeout { .. }), "got {err:?}");
    assert!(store.is_degraded());
}

#[tokio::test]
async fn test_transient_failures_are_retried_within_sync() {
    let fake = Arc::new(MemoryRemoteStore::new());
    let store = TieredMemoryStore::open(fake.clone(), config()).await;
    store.write("Task: retry me", BTreeSet::new()).unwrap();
    fake.fail_next(1);

    let report = store.sync().await;
    assert_eq!(report.synced_count, 1);
    assert_eq!(report.failed_count, 0);
}

#[tokio::test]
async fn test_consolidation_removes_only_stale_low_value_records() {
    let fake = Arc::new(MemoryRemoteStore::new());
    let aged = |content: &str, memory_type, score, days| {
        let mut record = MemoryRecord::new(content, BTreeSet::new(), memory_type, vec![], score);
        record.created_at = Utc::now() - chrono::Duration::days(days);
        record.updated_at = record.created_at;
        record
    };
    let stale = aged("Context: old scratch", MemoryType::Context, 0.1, 90);
    let important = aged("Goal: old but vital", MemoryType::Goal, 0.9, 90);
    let recent = aged("Context: new scratch", MemoryType::Context, 0.1, 2);
    for record in [&stale, &important, &recent] {
        fake.seed_memory(record.clone());
    }

    let store = TieredMemoryStore::open(fake.clone(), config()).await;
    let report = store
        .consolidate(&ConsolidationPolicy::new(Duration::from_secs(30 * 86_400), 0.3))
        .await
        .unwrap();

    assert_eq!(report.deleted_count, 1);
    assert!(store.read(&stale.id).await.unwrap_err().is_not_found());
    assert!(store.read(&important.id).await.is_ok());
    assert!(store.read(&recent.id).await.is_ok());
}

#[tokio::test]
async fn test_related_records_are_linked_both_ways() {
    let fake = Arc::new(MemoryRemoteStore::new());
    let store = TieredMemoryStore::open(fake.clone(), config()).await;

    let first = store
        .write("Error: database timeout during checkpoint save", BTreeSet::new())
        .unwrap();
    let second = store
        .write("Error: database timeout during checkpoint load", BTreeSet::new())
        .unwrap();

    assert!(second.related_ids.contains(&first.id));
    let back = store.related(&first.id).await.unwrap();
    assert_eq!(back.len(), 1);
    assert_eq!(back[0].id, second.id);
}

#[tokio::test]
async fn test_evicted_record_is_read_through_from_store() {
    let fake = Arc::new(MemoryRemoteStore::new());
    let store = TieredMemoryStore::open(
        fake.clone(),
        MemoryStoreConfig {
            cache_capacity: 2,
            ..config()
        },
    )
    .await;
    assert!(!store.is_partial_view());

    let first = store.write("Goal: reduce p99 latency", BTreeSet::new()).unwrap();
    store.write("Task: profile the parser", BTreeSet::new()).unwrap();
    store.write("Error: disk quota exceeded", BTreeSet::new()).unwrap();
    store.write("Context: staging cluster", BTreeSet::new()).unwrap();
    // Unsynced writes are never evicted.
    assert_eq!(store.stats().cache.entries, 4);

    store.sync().await;
    let stats = store.stats();
    assert_eq!(stats.cache.entries, 2);
    assert_eq!(stats.cache.evictions, 2);
    assert_eq!(stats.remote_count, Some(4));
    assert!(stats.partial_view);
    assert!(store.is_partial_view());

    // Only the local shadow was dropped.
    let read = store.read(&first.id).await.unwrap();
    assert_eq!(read.content, "Goal: reduce p99 latency");
    assert_eq!(fake.memory_count(), 4);
    assert_eq!(fake.memory_puts(), 4);
}

#[tokio::test]
async fn test_partial_view_without_evictions_follows_remote_count() {
    let fake = Arc::new(MemoryRemoteStore::new());
    for content in ["Context: one", "Context: two"] {
        fake.seed_memory(MemoryRecord::new(
            content,
            BTreeSet::new(),
            MemoryType::Context,
            vec![],
            0.3,
        ));
    }

    let store = TieredMemoryStore::open(fake.clone(), config()).await;
    assert_eq!(store.stats().remote_count, Some(2));
    assert!(store.is_partial_view());

    let cache_only = TieredMemoryStore::cache_only(config());
    cache_only.write("Goal: offline only", BTreeSet::new()).unwrap();
    assert!(!cache_only.is_partial_view());
}

#[tokio::test]
async fn test_link_cap_applies_to_every_record() {
    let fake = Arc::new(MemoryRemoteStore::new());
    let store = TieredMemoryStore::open(fake, config()).await;
    let max_links = MemoryStoreConfig::default().relationships.max_links;

    let mut written = Vec::new();
    for _ in 0..9 {
        written.push(
            store
                .write("Knowledge: cache eviction skips dirty entries", BTreeSet::new())
                .unwrap(),
        );
    }

    for record in &written {
        let current = store.read(&record.id).await.unwrap();
        assert!(current.related_ids.len() <= max_links, "{current:?}");
        for peer_id in &current.related_ids {
            let peer = store.read(peer_id).await.unwrap();
            assert!(peer.related_ids.contains(&record.id));
        }
    }
    assert_eq!(
        store.read(&written[0].id).await.unwrap().related_ids.len(),
        max_links
    );
}
