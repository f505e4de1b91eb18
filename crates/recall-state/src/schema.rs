//! Record schema for Recall
//!
//! Tables:
//! - memories: classified agent memory records
//! - agent_states: per-session agent operational records
//! - coordination_events: append-only inter-agent lifecycle log
//! - system_state: deployment-wide singleton

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StorageError;

/// Timestamp layout used inside document keys; sorts chronologically.
const KEY_TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S%6fZ";

// ---------------------------------------------------------------------------
// Memory records
// ---------------------------------------------------------------------------

/// Classification assigned to a memory record at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemoryType {
    Goal,
    Task,
    Context,
    Decision,
    Progress,
    Error,
    Knowledge,
}

impl MemoryType {
    pub const ALL: [MemoryType; 7] = [
        MemoryType::Goal,
        MemoryType::Task,
        MemoryType::Context,
        MemoryType::Decision,
        MemoryType::Progress,
        MemoryType::Error,
        MemoryType::Knowledge,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryType::Goal => "GOAL",
            MemoryType::Task => "TASK",
            MemoryType::Context => "CONTEXT",
            MemoryType::Decision => "DECISION",
            MemoryType::Progress => "PROGRESS",
            MemoryType::Error => "ERROR",
            MemoryType::Knowledge => "KNOWLEDGE",
        }
    }
}

impl fmt::Display for MemoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemoryType {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MemoryType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| StorageError::Validation(format!("unknown memory type: {s}")))
    }
}

/// A single classified, scored unit of agent-generated knowledge.
///
/// `content` and `memory_type` never change after creation; updates only
/// touch `tags`, `related_ids`, `importance_score` and `updated_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub memory_type: MemoryType,
    /// Extracted terms in first-seen order
    #[serde(default)]
    pub keywords: Vec<String>,
    pub importance_score: f64,
    /// Symmetric links to other records; may dangle after consolidation
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub related_ids: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MemoryRecord {
    /// Create a new record with a fresh id and timestamps.
    pub fn new(
        content: impl Into<String>,
        tags: BTreeSet<String>,
        memory_type: MemoryType,
        keywords: Vec<String>,
        importance_score: f64,
    ) -> Self {
        let now = Utc::now();
        MemoryRecord {
            id: Uuid::new_v4().to_string(),
            content: content.into(),
            tags,
            memory_type,
            keywords,
            importance_score: importance_score.clamp(0.0, 1.0),
            related_ids: BTreeSet::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Reject records that can never be stored.
    pub fn validate(&self) -> Result<(), StorageError> {
        if self.id.trim().is_empty() {
            return Err(StorageError::Validation("memory id must not be empty".into()));
        }
        if !(0.0..=1.0).contains(&self.importance_score) || self.importance_score.is_nan() {
            return Err(StorageError::Validation(format!(
                "importance score {} outside [0, 1] for memory {}",
                self.importance_score, self.id
            )));
        }
        if self.tags.iter().any(|t| t.trim().is_empty()) {
            return Err(StorageError::Validation(format!(
                "memory {} carries an empty tag",
                self.id
            )));
        }
        if self.related_ids.contains(&self.id) {
            return Err(StorageError::Validation(format!(
                "memory {} relates to itself",
                self.id
            )));
        }
        Ok(())
    }

    /// Bump `updated_at` after a mutation.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

// ---------------------------------------------------------------------------
// Agent states
// ---------------------------------------------------------------------------

/// Agent lifecycle status.
///
/// `UNINITIALIZED -> ACTIVE -> {IDLE, WORKING} -> {COMPLETED, FAILED, STOPPED}`.
/// IDLE and WORKING may cycle; the last three are terminal for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    Uninitialized,
    Active,
    Idle,
    Working,
    Completed,
    Failed,
    Stopped,
}

impl AgentStatus {
    pub const ALL: [AgentStatus; 7] = [
        AgentStatus::Uninitialized,
        AgentStatus::Active,
        AgentStatus::Idle,
        AgentStatus::Working,
        AgentStatus::Completed,
        AgentStatus::Failed,
        AgentStatus::Stopped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Uninitialized => "UNINITIALIZED",
            AgentStatus::Active => "ACTIVE",
            AgentStatus::Idle => "IDLE",
            AgentStatus::Working => "WORKING",
            AgentStatus::Completed => "COMPLETED",
            AgentStatus::Failed => "FAILED",
            AgentStatus::Stopped => "STOPPED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentStatus::Completed | AgentStatus::Failed | AgentStatus::Stopped
        )
    }

    /// Whether a record in `self` may be saved with status `next`.
    ///
    /// Re-saving the same status is a field update, not a transition, and
    /// is always allowed (a finished agent may still record final metrics).
    pub fn can_transition_to(&self, next: AgentStatus) -> bool {
        use AgentStatus::*;
        if *self == next {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        match self {
            Uninitialized => next == Active,
            Active | Idle | Working => matches!(next, Idle | Working | Completed | Failed | Stopped),
            Completed | Failed | Stopped => false,
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AgentStatus::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| StorageError::Validation(format!("unknown agent status: {s}")))
    }
}

/// Composite identity of an agent operational record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentStateKey {
    pub agent_type: String,
    pub agent_id: String,
    pub session_id: String,
}

impl AgentStateKey {
    pub fn new(
        agent_type: impl Into<String>,
        agent_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            agent_type: agent_type.into(),
            agent_id: agent_id.into(),
            session_id: session_id.into(),
        }
    }

    /// Document key in the agent state namespace.
    pub fn document_key(&self) -> String {
        format!("{}_{}_{}", self.agent_type, self.agent_id, self.session_id)
    }
}

impl fmt::Display for AgentStateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.document_key())
    }
}

/// Operational record for one agent within one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub agent_id: String,
    pub agent_type: String,
    pub session_id: String,
    pub status: AgentStatus,
    #[serde(default)]
    pub memory_context: BTreeMap<String, serde_json::Value>,
    /// Append-only task-result summaries
    #[serde(default)]
    pub task_history: Vec<String>,
    #[serde(default)]
    pub performance_metrics: BTreeMap<String, f64>,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

impl AgentState {
    /// Fresh record in `UNINITIALIZED`.
    pub fn new(
        agent_id: impl Into<String>,
        agent_type: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        AgentState {
            agent_id: agent_id.into(),
            agent_type: agent_type.into(),
            session_id: session_id.into(),
            status: AgentStatus::Uninitialized,
            memory_context: BTreeMap::new(),
            task_history: Vec::new(),
            performance_metrics: BTreeMap::new(),
            created_at: now,
            last_updated: now,
            last_active: now,
        }
    }

    pub fn with_status(mut self, status: AgentStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.memory_context.insert(key.into(), value);
        self
    }

    pub fn key(&self) -> AgentStateKey {
        AgentStateKey::new(&self.agent_type, &self.agent_id, &self.session_id)
    }

    pub fn validate(&self) -> Result<(), StorageError> {
        for (field, value) in [
            ("agent_id", &self.agent_id),
            ("agent_type", &self.agent_type),
            ("session_id", &self.session_id),
        ] {
            if value.trim().is_empty() {
                return Err(StorageError::Validation(format!(
                    "agent state field {field} must not be empty"
                )));
            }
        }
        if let Some((name, _)) = self.performance_metrics.iter().find(|(_, v)| !v.is_finite()) {
            return Err(StorageError::Validation(format!(
                "metric {name} of agent {} is not finite",
                self.agent_id
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Coordination events
// ---------------------------------------------------------------------------

/// Kind of inter-agent lifecycle action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Spawn,
    Handoff,
    Collaboration,
    Completion,
    Failure,
}

impl EventType {
    pub const ALL: [EventType; 5] = [
        EventType::Spawn,
        EventType::Handoff,
        EventType::Collaboration,
        EventType::Completion,
        EventType::Failure,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Spawn => "SPAWN",
            EventType::Handoff => "HANDOFF",
            EventType::Collaboration => "COLLABORATION",
            EventType::Completion => "COMPLETION",
            EventType::Failure => "FAILURE",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| StorageError::Validation(format!("unknown event type: {s}")))
    }
}

/// Immutable log entry describing an inter-agent lifecycle action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinationEvent {
    pub event_id: String,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub source_agent_id: String,
    pub source_agent_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_agent_id: Option<String>,
    #[serde(default)]
    pub context: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub task_context: BTreeMap<String, serde_json::Value>,
    pub success: bool,
}

impl CoordinationEvent {
    pub fn new(
        event_type: EventType,
        source_agent_id: impl Into<String>,
        source_agent_type: impl Into<String>,
    ) -> Self {
        CoordinationEvent {
            event_id: Uuid::new_v4().to_string(),
            event_type,
            timestamp: Utc::now(),
            source_agent_id: source_agent_id.into(),
            source_agent_type: source_agent_type.into(),
            target_agent_id: None,
            context: BTreeMap::new(),
            task_context: BTreeMap::new(),
            success: true,
        }
    }

    pub fn with_target(mut self, target_agent_id: impl Into<String>) -> Self {
        self.target_agent_id = Some(target_agent_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    pub fn with_task_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.task_context.insert(key.into(), value);
        self
    }

    pub fn with_success(mut self, success: bool) -> Self {
        self.success = success;
        self
    }

    /// Document key in the event namespace: `{timestamp}_{event_id}`.
    pub fn document_key(&self) -> String {
        format!(
            "{}_{}",
            self.timestamp.format(KEY_TIMESTAMP_FORMAT),
            self.event_id
        )
    }

    pub fn validate(&self) -> Result<(), StorageError> {
        if self.event_id.trim().is_empty() {
            return Err(StorageError::Validation("event_id must not be empty".into()));
        }
        if self.source_agent_id.trim().is_empty() {
            return Err(StorageError::Validation(format!(
                "event {} has no source agent",
                self.event_id
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// System state
// ---------------------------------------------------------------------------

/// Deployment-wide singleton state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemState {
    pub system_version: String,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub active_sessions: BTreeSet<String>,
    /// Monotonically increasing
    pub total_agents_spawned: u64,
    pub current_agent_count: u64,
    #[serde(default)]
    pub system_metrics: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub feature_flags: BTreeMap<String, bool>,
    pub emergency_stop: bool,
}

impl SystemState {
    pub fn new(system_version: impl Into<String>) -> Self {
        SystemState {
            system_version: system_version.into(),
            last_updated: Utc::now(),
            active_sessions: BTreeSet::new(),
            total_agents_spawned: 0,
            current_agent_count: 0,
            system_metrics: BTreeMap::new(),
            feature_flags: BTreeMap::new(),
            emergency_stop: false,
        }
    }
}

/// Partial update applied by `update_system_state`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemStateDelta {
    pub system_version: Option<String>,
    pub add_sessions: Vec<String>,
    pub remove_sessions: Vec<String>,
    /// Added to `total_agents_spawned`
    pub agents_spawned: u64,
    pub current_agent_count: Option<u64>,
    pub system_metrics: BTreeMap<String, serde_json::Value>,
    pub feature_flags: BTreeMap<String, bool>,
    pub emergency_stop: Option<bool>,
}

impl SystemStateDelta {
    pub fn emergency_stop(enabled: bool) -> Self {
        Self {
            emergency_stop: Some(enabled),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Apply onto `state`, bumping `last_updated`.
    pub fn apply(&self, state: &mut SystemState) {
        if let Some(version) = &self.system_version {
            state.system_version = version.clone();
        }
        for session in &self.add_sessions {
            state.active_sessions.insert(session.clone());
        }
        for session in &self.remove_sessions {
            state.active_sessions.remove(session);
        }
        state.total_agents_spawned = state.total_agents_spawned.saturating_add(self.agents_spawned);
        if let Some(count) = self.current_agent_count {
            state.current_agent_count = count;
        }
        for (k, v) in &self.system_metrics {
            state.system_metrics.insert(k.clone(), v.clone());
        }
        for (k, v) in &self.feature_flags {
            state.feature_flags.insert(k.clone(), *v);
        }
        if let Some(stop) = self.emergency_stop {
            state.emergency_stop = stop;
        }
        state.last_updated = Utc::now();
    }
}
