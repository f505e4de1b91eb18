//! Consolidation: prune old low-importance memories and decay the rest.
//!
//! A pass snapshots its candidates first (cache entries plus a remote
//! `created_before` search) and then acts on them one at a time, so the
//! cache lock is never held across the sweep. Every local action is
//! version-checked; a record rewritten after the snapshot is skipped.

use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use recall_state::{MemoryRecord, MemorySearch, RemoteStore};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use super::classify::{decayed_importance, DecayPolicy};
use super::error::MemoryResult;
use super::store::TieredMemoryStore;
use crate::obs;
use crate::retry::call_with_retry;

const SCORE_EPSILON: f64 = 1e-9;

/// What a consolidation pass removes or rescores.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsolidationPolicy {
    /// Only records created more than this long ago are considered.
    pub older_than: Duration,
    /// Old records scoring strictly below this are deleted.
    pub min_importance: f64,
    /// Applied to old records that are kept.
    pub decay: DecayPolicy,
}

impl ConsolidationPolicy {
    pub fn new(older_than: Duration, min_importance: f64) -> Self {
        Self {
            older_than,
            min_importance,
            decay: DecayPolicy::None,
        }
    }

    pub fn with_decay(mut self, decay: DecayPolicy) -> Self {
        self.decay = decay;
        self
    }
}

/// Outcome of a consolidation pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationReport {
    pub scanned: usize,
    pub deleted_count: usize,
    pub updated_count: usize,
    /// Candidates rewritten concurrently and left alone.
    pub skipped: usize,
    /// Remote deletes or rescores that failed; deletes are retried on sync.
    pub failed: usize,
    /// Whether the backing store contributed candidates.
    pub remote_scanned: bool,
}

enum Source {
    Cache { version: u64 },
    Remote,
}

struct Candidate {
    record: MemoryRecord,
    source: Source,
}

impl TieredMemoryStore {
    /// Delete old records below `min_importance` and decay the old ones kept.
    #[instrument(skip(self, policy), fields(min_importance = policy.min_importance))]
    pub async fn consolidate(&self, policy: &ConsolidationPolicy) -> MemoryResult<ConsolidationReport> {
        let older_than = chrono::Duration::from_std(policy.older_than)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let now = Utc::now();
        let cutoff = now - older_than;
        let mut report = ConsolidationReport::default();

        let mut candidates: Vec<Candidate> = self
            .cache
            .snapshot()
            .into_iter()
            .filter(|c| c.record.created_at < cutoff)
            .map(|c| Candidate {
                record: c.record,
                source: Source::Cache { version: c.version },
            })
            .collect();
        let local_ids: HashSet<String> = candidates.iter().map(|c| c.record.id.clone()).collect();

        if let Some(remote) = self.usable_remote() {
            let remote: &dyn RemoteStore = remote.as_ref();
            let query = MemorySearch::all().created_before(cutoff);
            let search = &query;
            let result = call_with_retry(&self.config.retry, "search_memories", move || {
                remote.search_memories(search)
            })
            .await;
            self.observe(&result);
            match result {
                Ok(hits) => {
                    report.remote_scanned = true;
                    candidates.extend(
                        hits.into_iter()
                            .filter(|r| !local_ids.contains(&r.id))
                            .filter(|r| !self.cache.is_tombstoned(&r.id))
                            .map(|record| Candidate {
                                record,
                                source: Source::Remote,
                            }),
                    );
                }
                Err(err) => warn!(error = %err, "Consolidating cached records only"),
            }
        }

        report.scanned = candidates.len();

        for candidate in candidates {
            if candidate.record.importance_score < policy.min_importance {
                self.consolidate_delete(candidate, &mut report).await;
            } else if !policy.decay.is_none() {
                let age = now - candidate.record.created_at;
                let score = decayed_importance(&candidate.record.content, age, &policy.decay);
                if (score - candidate.record.importance_score).abs() > SCORE_EPSILON {
                    self.consolidate_rescore(candidate, score, &mut report).await;
                }
            }
        }

        obs::emit_consolidation_finished(
            report.scanned,
            report.deleted_count,
            report.updated_count,
            report.skipped,
        );
        Ok(report)
    }

    async fn consolidate_delete(&self, candidate: Candidate, report: &mut ConsolidationReport) {
        let id = candidate.record.id;
        let expected = match candidate.source {
            Source::Cache { version } => Some(version),
            Source::Remote => None,
        };
        if !self.cache.remove_if_unchanged(&id, expected) {
            debug!(memory_id = %id, "Record rewritten since snapshot, keeping it");
            report.skipped += 1;
            return;
        }
        report.deleted_count += 1;

        // The tombstone makes the next sync retry this if it fails now.
        let Some(remote) = self.usable_remote() else {
            return;
        };
        let remote: &dyn RemoteStore = remote.as_ref();
        let target = id.as_str();
        let result = call_with_retry(&self.config.retry, "delete_memory", move || {
            remote.delete_memory(target)
        })
        .await;
        self.observe(&result);
        match result {
            Ok(()) => self.cache.clear_tombstone(&id),
            Err(err) => {
                warn!(memory_id = %id, error = %err, "Remote delete deferred to next sync");
                report.failed += 1;
            }
        }
    }

    async fn consolidate_rescore(
        &self,
        candidate: Candidate,
        score: f64,
        report: &mut ConsolidationReport,
    ) {
        match candidate.source {
            Source::Cache { version } => {
                // Picked up by the next sync as a dirty record.
                if self
                    .cache
                    .set_importance_if_version(&candidate.record.id, version, score)
                {
                    report.updated_count += 1;
                } else {
                    report.skipped += 1;
                }
            }
            Source::Remote => {
                if self.cache.contains(&candidate.record.id) {
                    report.skipped += 1;
                    return;
                }
                let Some(remote) = self.usable_remote() else {
                    report.failed += 1;
                    return;
                };
                let remote: &dyn RemoteStore = remote.as_ref();
                let mut record = candidate.record;
                record.importance_score = score;
                record.touch();
                let pending = &record;
                let result = call_with_retry(&self.config.retry, "put_memory", move || {
                    remote.put_memory(pending)
                })
                .await;
                self.observe(&result);
                match result {
                    Ok(()) => report.updated_count += 1,
                    Err(err) => {
                        warn!(memory_id = %record.id, error = %err, "Rescore not persisted");
                        report.failed += 1;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::store::MemoryStoreConfig;
    use recall_state::fakes::MemoryRemoteStore;
    use recall_state::MemoryType;
    use std::collections::BTreeSet;
    use std::sync::Arc;

    fn aged(content: &str, memory_type: MemoryType, score: f64, age_days: i64) -> MemoryRecord {
        let mut record = MemoryRecord::new(content, BTreeSet::new(), memory_type, vec![], score);
        record.created_at = Utc::now() - chrono::Duration::days(age_days);
        record.updated_at = record.created_at;
        record
    }

    fn config() -> MemoryStoreConfig {
        MemoryStoreConfig {
            probe_interval: Duration::ZERO,
            ..MemoryStoreConfig::default()
        }
    }

    fn thirty_days() -> Duration {
        Duration::from_secs(30 * 86_400)
    }

    #[tokio::test]
    async fn test_deletes_only_old_and_unimportant() {
        let fake = Arc::new(MemoryRemoteStore::new());
        let old_low = aged("Context: stale note", MemoryType::Context, 0.2, 60);
        let old_high = aged("Goal: keep me", MemoryType::Goal, 0.8, 60);
        let new_low = aged("Context: fresh note", MemoryType::Context, 0.2, 1);
        for r in [&old_low, &old_high, &new_low] {
            fake.seed_memory(r.clone());
        }
        let store = TieredMemoryStore::open(fake.clone(), config()).await;

        let report = store
            .consolidate(&ConsolidationPolicy::new(thirty_days(), 0.5))
            .await
            .unwrap();

        assert!(report.remote_scanned);
        assert_eq!(report.deleted_count, 1);
        assert!(store.read(&old_low.id).await.unwrap_err().is_not_found());
        assert!(store.read(&old_high.id).await.is_ok());
        assert!(store.read(&new_low.id).await.is_ok());
        assert_eq!(fake.memory_count(), 2);
    }

    #[tokio::test]
    async fn test_cached_candidates_are_version_checked() {
        let store = TieredMemoryStore::cache_only(config());
        let old = aged("Context: stale", MemoryType::Context, 0.2, 60);
        store.cache.put(old.clone());
        let snapshot_version = store.cache.snapshot()[0].version;

        // A rewrite after the snapshot wins over consolidation.
        store.cache.modify(&old.id, |r| {
            r.tags.insert("pinned".into());
        });
        assert!(!store.cache.remove_if_unchanged(&old.id, Some(snapshot_version)));

        let report = store
            .consolidate(&ConsolidationPolicy::new(thirty_days(), 0.5))
            .await
            .unwrap();
        assert_eq!(report.deleted_count, 1);
        assert!(!report.remote_scanned);
    }

    #[tokio::test]
    async fn test_decay_rescored_kept_records() {
        let fake = Arc::new(MemoryRemoteStore::new());
        let old_goal = aged("Goal: ship v1", MemoryType::Goal, 0.8, 40);
        fake.seed_memory(old_goal.clone());
        let store = TieredMemoryStore::open(fake.clone(), config()).await;

        let policy = ConsolidationPolicy::new(thirty_days(), 0.3).with_decay(DecayPolicy::Linear {
            per_day: 0.005,
            floor: 0.4,
        });
        let report = store.consolidate(&policy).await.unwrap();
        assert_eq!(report.updated_count, 1);
        assert_eq!(report.deleted_count, 0);

        let rescored = store.read(&old_goal.id).await.unwrap();
        assert!((rescored.importance_score - 0.6).abs() < 0.01);

        // Recomputed from the classified score, so a second pass is stable.
        let again = store.consolidate(&policy).await.unwrap();
        let rescored_again = store.read(&old_goal.id).await.unwrap();
        assert!((rescored_again.importance_score - rescored.importance_score).abs() < 0.01);
        assert_eq!(again.deleted_count, 0);
    }

    #[tokio::test]
    async fn test_default_policy_leaves_scores() {
        let store = TieredMemoryStore::cache_only(config());
        let old = aged("Goal: ship v1", MemoryType::Goal, 0.8, 90);
        store.cache.put(old.clone());

        let report = store
            .consolidate(&ConsolidationPolicy::new(thirty_days(), 0.3))
            .await
            .unwrap();
        assert_eq!(report.updated_count, 0);
        assert_eq!(store.read(&old.id).await.unwrap().importance_score, 0.8);
    }
}
