//! Tiered memory store: [`LocalCache`] in front of a [`RemoteStore`].
//!
//! Writes land in the cache and return immediately; [`TieredMemoryStore::sync`]
//! pushes dirty records and pending deletes in the background. When the
//! backing store cannot be reached the store keeps serving from the cache
//! and reports the condition through [`TieredMemoryStore::status`].

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use recall_state::{
    compare_ranked, MemoryRecord, MemorySearch, MemoryType, RemoteStore, StorageError,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tracing::{debug, instrument, warn};

use super::cache::{CacheStats, LocalCache};
use super::classify::classify;
use super::error::{MemoryError, MemoryResult};
use super::relate::{rank_relationships, RelationshipConfig};
use crate::obs;
use crate::retry::{call_with_retry, with_timeout, RetryPolicy};
use crate::status::{BackendStatus, StatusMonitor};

const COMPONENT: &str = "memory";
const UNKNOWN_REMOTE_COUNT: u64 = u64::MAX;

/// Tunables for [`TieredMemoryStore`].
#[derive(Debug, Clone)]
pub struct MemoryStoreConfig {
    pub cache_capacity: usize,
    /// Bound on single foreground remote calls (read, search, delete).
    pub remote_timeout: Duration,
    /// Minimum spacing of remote attempts while degraded.
    pub probe_interval: Duration,
    /// Retry policy for sync and consolidation.
    pub retry: RetryPolicy,
    pub relationships: RelationshipConfig,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 1_000,
            remote_timeout: Duration::from_secs(5),
            probe_interval: Duration::from_secs(15),
            retry: RetryPolicy::default(),
            relationships: RelationshipConfig::default(),
        }
    }
}

/// One record that could not be pushed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncFailure {
    pub id: String,
    pub reason: String,
}

/// Outcome of a sync pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub synced_count: usize,
    pub failed_count: usize,
    pub deleted_count: usize,
    /// Records skipped because the backing store held a newer copy.
    #[serde(default)]
    pub remote_newer: usize,
    pub failures: Vec<SyncFailure>,
}

impl SyncReport {
    fn fail(&mut self, id: impl Into<String>, reason: impl Into<String>) {
        self.failed_count += 1;
        self.failures.push(SyncFailure {
            id: id.into(),
            reason: reason.into(),
        });
    }
}

/// Point-in-time view of the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub cache: CacheStats,
    /// Last known number of records in the backing store.
    pub remote_count: Option<u64>,
    pub partial_view: bool,
    pub status: BackendStatus,
}

/// Local cache plus remote backing store with background sync.
pub struct TieredMemoryStore {
    pub(super) cache: LocalCache,
    pub(super) remote: Option<Arc<dyn RemoteStore>>,
    pub(super) monitor: StatusMonitor,
    pub(super) config: MemoryStoreConfig,
    sync_lock: Mutex<()>,
    remote_count: AtomicU64,
}

impl TieredMemoryStore {
    /// Open a store over `remote`, probing it once.
    ///
    /// An unreachable store does not fail construction; the store starts in
    /// degraded mode instead.
    pub async fn open(remote: Arc<dyn RemoteStore>, config: MemoryStoreConfig) -> Self {
        let store = Self::build(Some(remote), config, BackendStatus::Connected);
        store.refresh_remote_count().await;
        store
    }

    /// A store with no backing store at all, permanently degraded.
    pub fn cache_only(config: MemoryStoreConfig) -> Self {
        Self::build(
            None,
            config,
            BackendStatus::degraded("no backing store configured"),
        )
    }

    fn build(
        remote: Option<Arc<dyn RemoteStore>>,
        config: MemoryStoreConfig,
        initial: BackendStatus,
    ) -> Self {
        Self {
            cache: LocalCache::new(config.cache_capacity),
            monitor: StatusMonitor::new(COMPONENT, initial, config.probe_interval),
            remote,
            config,
            sync_lock: Mutex::new(()),
            remote_count: AtomicU64::new(UNKNOWN_REMOTE_COUNT),
        }
    }

    // ---------------------------------------------------------------------
    // Status
    // ---------------------------------------------------------------------

    pub fn status(&self) -> BackendStatus {
        self.monitor.status()
    }

    pub fn is_degraded(&self) -> bool {
        self.monitor.is_degraded()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<BackendStatus> {
        self.monitor.subscribe()
    }

    /// Whether the cache is known to hold only part of the stored records.
    pub fn is_partial_view(&self) -> bool {
        let stats = self.cache.stats();
        if stats.evictions > 0 {
            return true;
        }
        match self.remote_count.load(Ordering::SeqCst) {
            UNKNOWN_REMOTE_COUNT => false,
            remote => remote > stats.entries as u64,
        }
    }

    pub fn stats(&self) -> MemoryStats {
        let remote_count = match self.remote_count.load(Ordering::SeqCst) {
            UNKNOWN_REMOTE_COUNT => None,
            n => Some(n),
        };
        MemoryStats {
            cache: self.cache.stats(),
            remote_count,
            partial_view: self.is_partial_view(),
            status: self.status(),
        }
    }

    /// Ping the backing store now, regardless of the probe interval.
    pub async fn check_remote(&self) -> BackendStatus {
        match &self.remote {
            Some(remote) => {
                match with_timeout("ping", self.config.remote_timeout, remote.ping()).await {
                    Ok(()) => self.monitor.record_success(),
                    Err(err) => self.monitor.record_failure(&err),
                }
            }
            None => self.monitor.mark_degraded("no backing store configured"),
        }
        self.status()
    }

    /// The backing store, if one is configured and an attempt is due.
    pub(super) fn usable_remote(&self) -> Option<&Arc<dyn RemoteStore>> {
        let remote = self.remote.as_ref()?;
        self.monitor.should_attempt().then_some(remote)
    }

    /// Feed a remote outcome into the status monitor.
    pub(super) fn observe<T>(&self, result: &Result<T, StorageError>) {
        match result {
            Ok(_) => self.monitor.record_success(),
            Err(err) => self.monitor.record_failure(err),
        }
    }

    async fn refresh_remote_count(&self) {
        let Some(remote) = self.usable_remote() else {
            return;
        };
        let result = with_timeout(
            "count_memories",
            self.config.remote_timeout,
            remote.count_memories(),
        )
        .await;
        self.observe(&result);
        if let Ok(count) = result {
            self.remote_count.store(count, Ordering::SeqCst);
        }
    }

    // ---------------------------------------------------------------------
    // Write path
    // ---------------------------------------------------------------------

    /// Classify `content`, link it to similar recent records and cache it.
    ///
    /// Never touches the backing store.
    #[instrument(skip(self, content, tags), fields(len = content.len()))]
    pub fn write(&self, content: &str, tags: BTreeSet<String>) -> MemoryResult<MemoryRecord> {
        if let Some(tag) = tags.iter().find(|t| t.trim().is_empty()) {
            return Err(MemoryError::Validation(format!("empty tag {tag:?}")));
        }

        let classification = classify(content);
        let record = MemoryRecord::new(
            content,
            tags,
            classification.memory_type,
            classification.keywords,
            classification.importance_score,
        );

        let candidates = self.cache.recent(self.config.relationships.candidate_pool);
        let links = rank_relationships(&record, &candidates, &self.config.relationships);
        let stored = self
            .cache
            .insert_linked(record, links, self.config.relationships.max_links);

        obs::emit_memory_written(
            &stored.id,
            stored.memory_type.as_str(),
            stored.importance_score,
            stored.related_ids.len(),
        );
        Ok(stored)
    }

    /// [`write`](Self::write) followed by a forced [`sync`](Self::sync).
    pub async fn write_and_sync(
        &self,
        content: &str,
        tags: BTreeSet<String>,
    ) -> MemoryResult<(MemoryRecord, SyncReport)> {
        let record = self.write(content, tags)?;
        let report = self.sync().await;
        Ok((record, report))
    }

    /// Replace the tags of an existing record.
    pub async fn update_tags(&self, id: &str, tags: BTreeSet<String>) -> MemoryResult<MemoryRecord> {
        if let Some(tag) = tags.iter().find(|t| t.trim().is_empty()) {
            return Err(MemoryError::Validation(format!("empty tag {tag:?}")));
        }
        // Make sure the record is cached before mutating it.
        self.read(id).await?;
        self.cache
            .modify(id, |record| record.tags = tags)
            .ok_or_else(|| MemoryError::not_found(id))
    }

    /// Delete locally now and remotely as soon as the store answers.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: &str) -> MemoryResult<()> {
        self.cache.delete(id);

        if let Some(remote) = self.usable_remote() {
            let result =
                with_timeout("delete_memory", self.config.remote_timeout, remote.delete_memory(id))
                    .await;
            self.observe(&result);
            match result {
                Ok(()) => self.cache.clear_tombstone(id),
                Err(err) => {
                    debug!(memory_id = %id, error = %err, "Remote delete deferred to next sync");
                }
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Read path
    // ---------------------------------------------------------------------

    /// Cache first, then the backing store.
    ///
    /// A record absent from both, or unreachable while only the cache is
    /// available, is `NotFound`. A remote call exceeding its bound is
    /// `Timeout`.
    #[instrument(skip(self))]
    pub async fn read(&self, id: &str) -> MemoryResult<MemoryRecord> {
        if self.cache.is_tombstoned(id) {
            return Err(MemoryError::not_found(id));
        }
        if let Some(record) = self.cache.get(id) {
            return Ok(record);
        }

        let Some(remote) = self.usable_remote() else {
            return Err(MemoryError::not_found(id));
        };

        let result =
            with_timeout("get_memory", self.config.remote_timeout, remote.get_memory(id)).await;
        self.observe(&result);
        match result {
            Ok(Some(record)) => {
                self.cache.put_clean(record.clone());
                Ok(record)
            }
            Ok(None) => Err(MemoryError::not_found(id)),
            Err(err) if err.is_unavailable() => Err(MemoryError::not_found(id)),
            Err(err) => Err(err.into()),
        }
    }

    /// Cached records matching tags (all-of) and type, ranked.
    pub fn query(
        &self,
        tags: &[String],
        type_filter: Option<MemoryType>,
        limit: usize,
    ) -> Vec<MemoryRecord> {
        let search = MemorySearch::all()
            .with_tags(tags.iter().cloned())
            .with_type(type_filter)
            .with_limit(limit);
        self.cache.list(&search)
    }

    /// Search the backing store directly, merged with unsynced local records.
    ///
    /// Falls back to the cache alone when the backing store is unreachable.
    #[instrument(skip(self, keywords))]
    pub async fn search_remote(
        &self,
        keywords: &[String],
        type_filter: Option<MemoryType>,
        limit: usize,
    ) -> MemoryResult<Vec<MemoryRecord>> {
        let search = MemorySearch::all()
            .with_keywords(keywords)
            .with_type(type_filter)
            .with_limit(limit);
        let local = self.cache.list(&MemorySearch {
            limit: None,
            ..search.clone()
        });

        let remote_hits = match self.usable_remote() {
            Some(remote) => {
                let result = with_timeout(
                    "search_memories",
                    self.config.remote_timeout,
                    remote.search_memories(&search),
                )
                .await;
                self.observe(&result);
                match result {
                    Ok(hits) => hits,
                    Err(err) if err.is_transient() => {
                        warn!(error = %err, "Remote search failed, serving cache only");
                        Vec::new()
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            None => Vec::new(),
        };

        // Local copies win: they may carry writes the store has not seen.
        let mut merged: HashMap<String, MemoryRecord> = remote_hits
            .into_iter()
            .filter(|r| !self.cache.is_tombstoned(&r.id))
            .map(|r| (r.id.clone(), r))
            .collect();
        for record in local {
            merged.insert(record.id.clone(), record);
        }

        let mut results: Vec<MemoryRecord> = merged.into_values().collect();
        results.sort_by(compare_ranked);
        results.truncate(limit);
        Ok(results)
    }

    /// Records linked from `id`. Links to records that no longer exist are skipped.
    pub async fn related(&self, id: &str) -> MemoryResult<Vec<MemoryRecord>> {
        let record = self.read(id).await?;
        let mut related = Vec::with_capacity(record.related_ids.len());
        for peer_id in &record.related_ids {
            match self.read(peer_id).await {
                Ok(peer) => related.push(peer),
                Err(err) => debug!(memory_id = %id, peer_id = %peer_id, error = %err, "Skipping unresolved link"),
            }
        }
        related.sort_by(compare_ranked);
        Ok(related)
    }

    // ---------------------------------------------------------------------
    // Sync
    // ---------------------------------------------------------------------

    /// Push pending deletes and dirty records to the backing store.
    ///
    /// A dirty record is only pushed if the stored copy is not newer by
    /// `updated_at`; otherwise the stored copy replaces the cached one.
    /// Never fails: records that could not be pushed stay dirty and are
    /// listed in the report. Running it twice with no writes in between
    /// syncs nothing the second time.
    #[instrument(name = "recall.sync", skip(self))]
    pub async fn sync(&self) -> SyncReport {
        let _guard = self.sync_lock.lock().await;
        let started = Instant::now();
        let mut report = SyncReport::default();

        let tombstones = self.cache.tombstones();
        let dirty = self.cache.dirty_snapshot();
        if tombstones.is_empty() && dirty.is_empty() {
            return report;
        }

        let Some(remote) = self.usable_remote() else {
            let reason = match &self.remote {
                Some(_) => "backing store unavailable",
                None => "no backing store configured",
            };
            for id in tombstones {
                report.fail(id, reason);
            }
            for (record, _) in dirty {
                report.fail(record.id, reason);
            }
            obs::emit_sync_finished(0, report.failed_count, 0, elapsed_ms(started));
            return report;
        };
        let remote: &dyn RemoteStore = remote.as_ref();
        let policy = &self.config.retry;
        let mut unreachable: Option<String> = None;

        for id in tombstones {
            if let Some(reason) = &unreachable {
                report.fail(id, reason.clone());
                continue;
            }
            let target = id.as_str();
            let result =
                call_with_retry(policy, "delete_memory", move || remote.delete_memory(target))
                    .await;
            self.observe(&result);
            match result {
                Ok(()) => {
                    self.cache.clear_tombstone(&id);
                    report.deleted_count += 1;
                }
                Err(err) => {
                    if err.is_transient() {
                        unreachable = Some(err.to_string());
                    }
                    report.fail(id, err.to_string());
                }
            }
        }

        for (record, version) in dirty {
            if let Some(reason) = &unreachable {
                report.fail(record.id, reason.clone());
                continue;
            }
            let lookup = record.id.as_str();
            let stored =
                call_with_retry(policy, "get_memory", move || remote.get_memory(lookup)).await;
            self.observe(&stored);
            let result = match stored {
                Ok(Some(newer)) if newer.updated_at > record.updated_at => {
                    debug!(memory_id = %record.id, "Backing store holds a newer memory");
                    self.cache.replace_if_version(newer, version);
                    report.remote_newer += 1;
                    continue;
                }
                Ok(_) => {
                    let pending = &record;
                    let pushed =
                        call_with_retry(policy, "put_memory", move || remote.put_memory(pending))
                            .await;
                    self.observe(&pushed);
                    pushed
                }
                Err(err) => Err(err),
            };
            match result {
                Ok(()) => {
                    self.cache.mark_synced(&record.id, version);
                    report.synced_count += 1;
                }
                Err(err) => {
                    if err.is_transient() {
                        unreachable = Some(err.to_string());
                    } else {
                        warn!(memory_id = %record.id, error = %err, "Backing store rejected memory");
                    }
                    report.fail(record.id, err.to_string());
                }
            }
        }

        self.cache.evict_if_over_capacity();
        if unreachable.is_none() {
            self.refresh_remote_count().await;
        }

        obs::emit_sync_finished(
            report.synced_count,
            report.failed_count,
            report.deleted_count,
            elapsed_ms(started),
        );
        report
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

impl std::fmt::Debug for TieredMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredMemoryStore")
            .field("cache", &self.cache.stats())
            .field("has_remote", &self.remote.is_some())
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recall_state::fakes::MemoryRemoteStore;

    fn test_config() -> MemoryStoreConfig {
        MemoryStoreConfig {
            cache_capacity: 100,
            remote_timeout: Duration::from_millis(200),
            probe_interval: Duration::ZERO,
            retry: RetryPolicy {
                max_attempts: 2,
                backoff_base_ms: 1,
                attempt_timeout_ms: 200,
            },
            relationships: RelationshipConfig::default(),
        }
    }

    fn tags(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|t| t.to_string()).collect()
    }

    async fn store_with_fake() -> (TieredMemoryStore, Arc<MemoryRemoteStore>) {
        let fake = Arc::new(MemoryRemoteStore::new());
        let store = TieredMemoryStore::open(fake.clone(), test_config()).await;
        (store, fake)
    }

    #[tokio::test]
    async fn test_write_does_not_touch_remote() {
        let (store, fake) = store_with_fake().await;
        store.write("Goal: ship v1", tags(&["release"])).unwrap();
        assert_eq!(fake.memory_count(), 0);
        assert_eq!(store.stats().cache.dirty, 1);
    }

    #[tokio::test]
    async fn test_empty_tag_is_rejected() {
        let (store, _fake) = store_with_fake().await;
        let err = store.write("Goal: ship v1", tags(&[" "])).unwrap_err();
        assert!(matches!(err, MemoryError::Validation(_)));
    }

    #[tokio::test]
    async fn test_sync_pushes_and_is_idempotent() {
        let (store, fake) = store_with_fake().await;
        store.write("Goal: ship v1", tags(&[])).unwrap();
        store.write("Task: add retry", tags(&[])).unwrap();

        let first = store.sync().await;
        assert_eq!(first.synced_count, 2);
        assert_eq!(first.failed_count, 0);
        assert_eq!(fake.memory_count(), 2);

        let second = store.sync().await;
        assert_eq!(second.synced_count, 0);
        assert_eq!(fake.memory_puts(), 2);
    }

    #[tokio::test]
    async fn test_read_through_populates_cache() {
        let (store, fake) = store_with_fake().await;
        let record = MemoryRecord::new("Context: remote only", tags(&[]), MemoryType::Context, vec![], 0.3);
        fake.seed_memory(record.clone());

        let loaded = store.read(&record.id).await.unwrap();
        assert_eq!(loaded.content, record.content);
        assert!(store.cache.contains(&record.id));
        assert_eq!(store.stats().cache.dirty, 0);
    }

    #[tokio::test]
    async fn test_read_miss_is_not_found() {
        let (store, _fake) = store_with_fake().await;
        let err = store.read("missing").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_permanent_rejection_stays_dirty_and_is_reported() {
        let (store, fake) = store_with_fake().await;
        let bad = store.write("Error: malformed", tags(&[])).unwrap();
        store.write("Goal: fine", tags(&[])).unwrap();
        fake.reject_memory(bad.id.clone());

        let report = store.sync().await;
        assert_eq!(report.synced_count, 1);
        assert_eq!(report.failed_count, 1);
        assert_eq!(report.failures[0].id, bad.id);
        assert!(!store.is_degraded());
        assert_eq!(store.stats().cache.dirty, 1);
    }

    #[tokio::test]
    async fn test_delete_is_pushed_on_sync_when_remote_was_down() {
        let (store, fake) = store_with_fake().await;
        let record = store.write("Context: temp", tags(&[])).unwrap();
        store.sync().await;

        fake.set_available(false);
        store.delete(&record.id).await.unwrap();
        assert!(store.read(&record.id).await.unwrap_err().is_not_found());
        assert_eq!(fake.memory_count(), 1);

        fake.set_available(true);
        let report = store.sync().await;
        assert_eq!(report.deleted_count, 1);
        assert_eq!(fake.memory_count(), 0);
        assert_eq!(store.stats().cache.tombstones, 0);
    }

    #[tokio::test]
    async fn test_related_skips_dangling_links() {
        let (store, _fake) = store_with_fake().await;
        let a = store
            .write("Knowledge: cache eviction needs clean entries", tags(&[]))
            .unwrap();
        let b = store
            .write("Knowledge: cache eviction skips dirty entries", tags(&[]))
            .unwrap();
        assert!(b.related_ids.contains(&a.id));

        let related = store.related(&a.id).await.unwrap();
        assert_eq!(related.len(), 1);
        assert_eq!(related[0].id, b.id);

        store.delete(&b.id).await.unwrap();
        assert!(store.related(&a.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cache_only_store_reports_degraded() {
        let store = TieredMemoryStore::cache_only(test_config());
        assert!(store.is_degraded());

        let record = store.write("Goal: offline", tags(&[])).unwrap();
        assert_eq!(store.read(&record.id).await.unwrap().id, record.id);

        let report = store.sync().await;
        assert_eq!(report.failed_count, 1);
        assert_eq!(report.failures[0].reason, "no backing store configured");
    }

    #[tokio::test]
    async fn test_sync_keeps_newer_stored_copy() {
        let fake = Arc::new(MemoryRemoteStore::new());
        let first = TieredMemoryStore::open(fake.clone(), test_config()).await;
        let second = TieredMemoryStore::open(fake.clone(), test_config()).await;
        let record = first.write("Goal: ship v1", tags(&["a"])).unwrap();
        first.sync().await;

        first.update_tags(&record.id, tags(&["from_first"])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        second.update_tags(&record.id, tags(&["from_second"])).await.unwrap();

        assert_eq!(second.sync().await.synced_count, 1);
        let report = first.sync().await;
        assert_eq!(report.synced_count, 0);
        assert_eq!(report.remote_newer, 1);
        assert_eq!(report.failed_count, 0);

        let stored = fake.get_memory(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.tags, tags(&["from_second"]));
        // The losing store now serves the stored copy and has nothing pending.
        assert_eq!(first.read(&record.id).await.unwrap().tags, tags(&["from_second"]));
        assert_eq!(first.stats().cache.dirty, 0);
    }

    #[tokio::test]
    async fn test_update_tags_marks_dirty() {
        let (store, fake) = store_with_fake().await;
        let record = store.write("Goal: ship v1", tags(&["a"])).unwrap();
        store.sync().await;

        let updated = store.update_tags(&record.id, tags(&["b"])).await.unwrap();
        assert_eq!(updated.tags, tags(&["b"]));
        store.sync().await;
        assert_eq!(fake.memory_puts(), 2);
    }
}
