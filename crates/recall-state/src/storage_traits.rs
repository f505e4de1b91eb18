//! Storage trait definitions for Recall
//!
//! `RemoteStore` is the boundary to the durable document store. It exposes
//! one namespace per record type:
//! - memories (keyed by memory id)
//! - agent_states (keyed by `{agent_type}_{agent_id}_{session_id}`)
//! - coordination_events (keyed by `{timestamp}_{event_id}`)
//! - system_state (singleton)
//!
//! The trait is async and backend-agnostic. An in-memory fake is provided
//! for testing via the `fakes` module.

use std::cmp::Ordering;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::schema::{
    AgentState, AgentStateKey, CoordinationEvent, EventType, MemoryRecord, MemoryType,
    SystemState,
};

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// Query types
// ---------------------------------------------------------------------------

/// Filter for memory lookups, shared by every backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemorySearch {
    /// Match records carrying any of these keywords (empty = no constraint)
    pub keywords: Vec<String>,
    /// Match records carrying all of these tags
    pub tags: Vec<String>,
    pub memory_type: Option<MemoryType>,
    /// Only records created strictly before this instant
    pub created_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl MemorySearch {
    pub fn all() -> Self {
        Self::default()
    }

    /// Keywords are normalized to lowercase to match extracted keywords.
    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.keywords = keywords
            .into_iter()
            .map(|k| k.as_ref().trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_type(mut self, memory_type: Option<MemoryType>) -> Self {
        self.memory_type = memory_type;
        self
    }

    pub fn created_before(mut self, cutoff: DateTime<Utc>) -> Self {
        self.created_before = Some(cutoff);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `record` satisfies every constraint.
    pub fn matches(&self, record: &MemoryRecord) -> bool {
        if let Some(t) = self.memory_type {
            if record.memory_type != t {
                return false;
            }
        }
        if !self.tags.iter().all(|t| record.tags.contains(t)) {
            return false;
        }
        if !self.keywords.is_empty() && !self.keywords.iter().any(|k| record.keywords.contains(k))
        {
            return false;
        }
        if let Some(cutoff) = self.created_before {
            if record.created_at >= cutoff {
                return false;
            }
        }
        true
    }

    /// Sort by importance (highest first), then newest first, then truncate.
    pub fn rank(&self, records: &mut Vec<MemoryRecord>) {
        records.sort_by(compare_ranked);
        if let Some(limit) = self.limit {
            records.truncate(limit);
        }
    }
}

/// Result ordering for memory queries.
pub fn compare_ranked(a: &MemoryRecord, b: &MemoryRecord) -> Ordering {
    b.importance_score
        .partial_cmp(&a.importance_score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.created_at.cmp(&a.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// Filter for coordination event listings (results newest first).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventFilter {
    pub source_agent_id: Option<String>,
    pub event_type: Option<EventType>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.source_agent_id = Some(agent_id.into());
        self
    }

    pub fn of_type(mut self, event_type: EventType) -> Self {
        self.event_type = Some(event_type);
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, event: &CoordinationEvent) -> bool {
        if let Some(agent) = &self.source_agent_id {
            if &event.source_agent_id != agent {
                return false;
            }
        }
        if let Some(t) = self.event_type {
            if event.event_type != t {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.timestamp < since {
                return false;
            }
        }
        true
    }
}

// ---------------------------------------------------------------------------
// RemoteStore
// ---------------------------------------------------------------------------

/// Durable backing store for memories and coordination state.
///
/// Guarantees:
/// - Writes are upserts keyed by the record's document key (last writer wins).
/// - `append_event` is idempotent for the same document key.
/// - Lookups return `Ok(None)` for absent documents rather than an error.
/// - Implementations are safe for concurrent use.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Cheap liveness probe.
    async fn ping(&self) -> StorageResult<()>;

    // -- memories -----------------------------------------------------------

    async fn put_memory(&self, record: &MemoryRecord) -> StorageResult<()>;

    async fn get_memory(&self, id: &str) -> StorageResult<Option<MemoryRecord>>;

    /// Delete by id. No-op if absent.
    async fn delete_memory(&self, id: &str) -> StorageResult<()>;

    /// Records matching `search`, ranked per [`compare_ranked`].
    async fn search_memories(&self, search: &MemorySearch) -> StorageResult<Vec<MemoryRecord>>;

    async fn count_memories(&self) -> StorageResult<u64>;

    // -- agent states -------------------------------------------------------

    async fn put_agent_state(&self, state: &AgentState) -> StorageResult<()>;

    async fn get_agent_state(&self, key: &AgentStateKey) -> StorageResult<Option<AgentState>>;

    /// Lookup by agent and session when the agent type is not known.
    async fn find_agent_state(
        &self,
        agent_id: &str,
        session_id: &str,
    ) -> StorageResult<Option<AgentState>>;

    async fn list_agent_states(&self, agent_id: Option<&str>) -> StorageResult<Vec<AgentState>>;

    // -- coordination events ------------------------------------------------

    async fn append_event(&self, event: &CoordinationEvent) -> StorageResult<()>;

    async fn list_events(&self, filter: &EventFilter) -> StorageResult<Vec<CoordinationEvent>>;

    // -- system state -------------------------------------------------------

    async fn get_system_state(&self) -> StorageResult<Option<SystemState>>;

    async fn put_system_state(&self, state: &SystemState) -> StorageResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::collections::BTreeSet;

    fn record(memory_type: MemoryType, keywords: &[&str], tags: &[&str], score: f64) -> MemoryRecord {
        MemoryRecord::new(
            "content",
            tags.iter().map(|t| t.to_string()).collect::<BTreeSet<_>>(),
            memory_type,
            keywords.iter().map(|k| k.to_string()).collect(),
            score,
        )
    }

    #[test]
    fn search_matches_any_keyword_and_all_tags() {
        let r = record(MemoryType::Error, &["timeout", "save"], &["infra", "db"], 0.7);

        assert!(MemorySearch::all().with_keywords(["TIMEOUT"]).matches(&r));
        assert!(!MemorySearch::all().with_keywords(["latency"]).matches(&r));
        assert!(MemorySearch::all().with_tags(["infra"]).matches(&r));
        assert!(!MemorySearch::all().with_tags(["infra", "ui"]).matches(&r));
        assert!(!MemorySearch::all()
            .with_type(Some(MemoryType::Goal))
            .matches(&r));
    }

    #[test]
    fn created_before_is_strict() {
        let r = record(MemoryType::Context, &[], &[], 0.3);
        assert!(!MemorySearch::all().created_before(r.created_at).matches(&r));
        assert!(MemorySearch::all()
            .created_before(r.created_at + Duration::seconds(1))
            .matches(&r));
    }

    #[test]
    fn rank_orders_by_importance_then_recency() {
        let low = record(MemoryType::Context, &[], &[], 0.3);
        let high = record(MemoryType::Goal, &[], &[], 0.9);
        let mut newer_low = record(MemoryType::Context, &[], &[], 0.3);
        newer_low.created_at = low.created_at + Duration::seconds(5);

        let mut records = vec![low.clone(), newer_low.clone(), high.clone()];
        MemorySearch::all().with_limit(2).rank(&mut records);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, high.id);
        assert_eq!(records[1].id, newer_low.id);
    }
}
