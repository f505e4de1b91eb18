//! SurrealDB Handle - Connection and Operations
//!
//! Manages the connection and implements [`RemoteStore`] over four tables:
//! - memories
//! - agent_states
//! - coordination_events
//! - system_state
//!
//! Supports in-memory, local file (SurrealKV) and cloud (WebSocket)
//! connections.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use surrealdb::engine::any::Any;
use surrealdb::opt::auth::{Database, Root};
use surrealdb::sql::Datetime as SurrealDatetime;
use surrealdb::Surreal;
use tracing::{debug, info, instrument};

use crate::error::{StateError, StorageError};
use crate::migrations::{self, AGENT_STATES, COORDINATION_EVENTS, MEMORIES, SYSTEM_STATE};
use crate::schema::{
    AgentState, AgentStateKey, AgentStatus, CoordinationEvent, EventType, MemoryRecord,
    MemoryType, SystemState,
};
use crate::storage_traits::{EventFilter, MemorySearch, RemoteStore, StorageResult};
use crate::Result;

const DEFAULT_NAMESPACE: &str = "recall";
const DEFAULT_DATABASE: &str = "main";
const SYSTEM_STATE_KEY: &str = "current";

/// Configuration for SurrealDB Cloud connection
#[derive(Debug, Clone)]
pub struct CloudConfig {
    /// WebSocket endpoint URL (e.g., "wss://xxx.aws-use1.surrealdb.cloud")
    pub endpoint: String,
    /// Database username
    pub username: String,
    /// Database password
    pub password: String,
    /// Namespace (default: "recall")
    pub namespace: String,
    /// Database name (default: "main")
    pub database: String,
    /// Whether this is a root user (true) or database user (false)
    pub is_root: bool,
}

impl CloudConfig {
    /// Create a new cloud configuration for a database user
    pub fn new(
        endpoint: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            username: username.into(),
            password: password.into(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            database: DEFAULT_DATABASE.to_string(),
            is_root: false,
        }
    }

    /// Set custom namespace
    pub fn with_namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = ns.into();
        self
    }

    /// Set custom database
    pub fn with_database(mut self, db: impl Into<String>) -> Self {
        self.database = db.into();
        self
    }

    /// Set whether this is a root user
    pub fn with_root(mut self, is_root: bool) -> Self {
        self.is_root = is_root;
        self
    }

    /// Create from environment variables
    ///
    /// Reads:
    /// - SURREALDB_ENDPOINT (required)
    /// - SURREALDB_USERNAME (required)
    /// - SURREALDB_PASSWORD (required)
    /// - SURREALDB_NAMESPACE (optional, default: "recall")
    /// - SURREALDB_DATABASE (optional, default: "main")
    /// - SURREALDB_ROOT (optional, default: "false") - set to "true" for root users
    pub fn from_env() -> std::result::Result<Self, String> {
        let endpoint =
            std::env::var("SURREALDB_ENDPOINT").map_err(|_| "SURREALDB_ENDPOINT not set")?;
        let username =
            std::env::var("SURREALDB_USERNAME").map_err(|_| "SURREALDB_USERNAME not set")?;
        let password =
            std::env::var("SURREALDB_PASSWORD").map_err(|_| "SURREALDB_PASSWORD not set")?;
        let namespace = std::env::var("SURREALDB_NAMESPACE")
            .unwrap_or_else(|_| DEFAULT_NAMESPACE.to_string());
        let database =
            std::env::var("SURREALDB_DATABASE").unwrap_or_else(|_| DEFAULT_DATABASE.to_string());
        let is_root = std::env::var("SURREALDB_ROOT")
            .map(|v| v.to_lowercase() == "true")
            .unwrap_or(false);

        Ok(Self {
            endpoint,
            username,
            password,
            namespace,
            database,
            is_root,
        })
    }
}

// ---------------------------------------------------------------------------
// Row types (SurrealDB datetimes at the boundary, no `id` field collisions)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DbMemoryRow {
    memory_id: String,
    content: String,
    tags: Vec<String>,
    memory_type: MemoryType,
    keywords: Vec<String>,
    importance_score: f64,
    #[serde(default)]
    related_ids: Vec<String>,
    created_at: SurrealDatetime,
    updated_at: SurrealDatetime,
}

impl From<&MemoryRecord> for DbMemoryRow {
    fn from(r: &MemoryRecord) -> Self {
        DbMemoryRow {
            memory_id: r.id.clone(),
            content: r.content.clone(),
            tags: r.tags.iter().cloned().collect(),
            memory_type: r.memory_type,
            keywords: r.keywords.clone(),
            importance_score: r.importance_score,
            related_ids: r.related_ids.iter().cloned().collect(),
            created_at: SurrealDatetime::from(r.created_at),
            updated_at: SurrealDatetime::from(r.updated_at),
        }
    }
}

impl DbMemoryRow {
    fn into_record(self) -> MemoryRecord {
        MemoryRecord {
            id: self.memory_id,
            content: self.content,
            tags: self.tags.into_iter().collect::<BTreeSet<_>>(),
            memory_type: self.memory_type,
            keywords: self.keywords,
            importance_score: self.importance_score,
            related_ids: self.related_ids.into_iter().collect(),
            created_at: DateTime::<Utc>::from(self.created_at),
            updated_at: DateTime::<Utc>::from(self.updated_at),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DbAgentStateRow {
    agent_id: String,
    agent_type: String,
    session_id: String,
    status: AgentStatus,
    #[serde(default)]
    memory_context: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    task_history: Vec<String>,
    #[serde(default)]
    performance_metrics: BTreeMap<String, f64>,
    created_at: SurrealDatetime,
    last_updated: SurrealDatetime,
    last_active: SurrealDatetime,
}

impl From<&AgentState> for DbAgentStateRow {
    fn from(s: &AgentState) -> Self {
        DbAgentStateRow {
            agent_id: s.agent_id.clone(),
            agent_type: s.agent_type.clone(),
            session_id: s.session_id.clone(),
            status: s.status,
            memory_context: s.memory_context.clone(),
            task_history: s.task_history.clone(),
            performance_metrics: s.performance_metrics.clone(),
            created_at: SurrealDatetime::from(s.created_at),
            last_updated: SurrealDatetime::from(s.last_updated),
            last_active: SurrealDatetime::from(s.last_active),
        }
    }
}

impl DbAgentStateRow {
    fn into_state(self) -> AgentState {
        AgentState {
            agent_id: self.agent_id,
            agent_type: self.agent_type,
            session_id: self.session_id,
            status: self.status,
            memory_context: self.memory_context,
            task_history: self.task_history,
            performance_metrics: self.performance_metrics,
            created_at: DateTime::<Utc>::from(self.created_at),
            last_updated: DateTime::<Utc>::from(self.last_updated),
            last_active: DateTime::<Utc>::from(self.last_active),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DbEventRow {
    event_id: String,
    event_type: EventType,
    timestamp: SurrealDatetime,
    source_agent_id: String,
    source_agent_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target_agent_id: Option<String>,
    #[serde(default)]
    context: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    task_context: BTreeMap<String, serde_json::Value>,
    success: bool,
}

impl From<&CoordinationEvent> for DbEventRow {
    fn from(e: &CoordinationEvent) -> Self {
        DbEventRow {
            event_id: e.event_id.clone(),
            event_type: e.event_type,
            timestamp: SurrealDatetime::from(e.timestamp),
            source_agent_id: e.source_agent_id.clone(),
            source_agent_type: e.source_agent_type.clone(),
            target_agent_id: e.target_agent_id.clone(),
            context: e.context.clone(),
            task_context: e.task_context.clone(),
            success: e.success,
        }
    }
}

impl DbEventRow {
    fn into_event(self) -> CoordinationEvent {
        CoordinationEvent {
            event_id: self.event_id,
            event_type: self.event_type,
            timestamp: DateTime::<Utc>::from(self.timestamp),
            source_agent_id: self.source_agent_id,
            source_agent_type: self.source_agent_type,
            target_agent_id: self.target_agent_id,
            context: self.context,
            task_context: self.task_context,
            success: self.success,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DbSystemStateRow {
    system_version: String,
    last_updated: SurrealDatetime,
    #[serde(default)]
    active_sessions: Vec<String>,
    total_agents_spawned: u64,
    current_agent_count: u64,
    #[serde(default)]
    system_metrics: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    feature_flags: BTreeMap<String, bool>,
    emergency_stop: bool,
}

impl From<&SystemState> for DbSystemStateRow {
    fn from(s: &SystemState) -> Self {
        DbSystemStateRow {
            system_version: s.system_version.clone(),
            last_updated: SurrealDatetime::from(s.last_updated),
            active_sessions: s.active_sessions.iter().cloned().collect(),
            total_agents_spawned: s.total_agents_spawned,
            current_agent_count: s.current_agent_count,
            system_metrics: s.system_metrics.clone(),
            feature_flags: s.feature_flags.clone(),
            emergency_stop: s.emergency_stop,
        }
    }
}

impl DbSystemStateRow {
    fn into_state(self) -> SystemState {
        SystemState {
            system_version: self.system_version,
            last_updated: DateTime::<Utc>::from(self.last_updated),
            active_sessions: self.active_sessions.into_iter().collect(),
            total_agents_spawned: self.total_agents_spawned,
            current_agent_count: self.current_agent_count,
            system_metrics: self.system_metrics,
            feature_flags: self.feature_flags,
            emergency_stop: self.emergency_stop,
        }
    }
}

// ---------------------------------------------------------------------------
// SurrealHandle
// ---------------------------------------------------------------------------

/// SurrealDB connection handle for Recall
#[derive(Clone)]
pub struct SurrealHandle {
    db: Surreal<Any>,
}

impl SurrealHandle {
    /// Connect to SurrealDB in-memory and set up schema
    #[instrument(skip_all)]
    pub async fn setup_db() -> Result<Self> {
        info!("Connecting to SurrealDB (in-memory)");
        Self::setup_url("mem://").await
    }

    /// Connect to a local SurrealKV directory, creating it if needed
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub async fn setup_local(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path).map_err(|e| {
            StateError::Connection(format!(
                "Failed to create database directory {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::setup_url(&format!("surrealkv://{}", path.display())).await
    }

    /// Connect to any SurrealDB URL (`mem://`, `surrealkv://`, `ws://`, ...)
    #[instrument(skip_all, fields(url = %url))]
    pub async fn setup_url(url: &str) -> Result<Self> {
        let db = surrealdb::engine::any::connect(url)
            .await
            .map_err(|e| StateError::Connection(format!("Failed to connect to {}: {}", url, e)))?;

        db.use_ns(DEFAULT_NAMESPACE)
            .use_db(DEFAULT_DATABASE)
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;

        migrations::init_schema(&db).await?;

        info!("SurrealDB connected ({}) and schema initialized", url);
        Ok(SurrealHandle { db })
    }

    /// Connect to SurrealDB Cloud
    ///
    /// # Example
    /// ```ignore
    /// let config = CloudConfig::new(
    ///     "wss://xxx.aws-use1.surrealdb.cloud",
    ///     "your_username",
    ///     "your_password",
    /// );
    /// let handle = SurrealHandle::setup_cloud(config).await?;
    /// ```
    #[instrument(skip(config), fields(endpoint = %config.endpoint, namespace = %config.namespace, database = %config.database))]
    pub async fn setup_cloud(config: CloudConfig) -> Result<Self> {
        info!("Connecting to SurrealDB Cloud (root={})", config.is_root);

        let db = surrealdb::engine::any::connect(&config.endpoint)
            .await
            .map_err(|e| {
                StateError::Connection(format!("Failed to connect to {}: {}", config.endpoint, e))
            })?;

        if config.is_root {
            db.signin(Root {
                username: &config.username,
                password: &config.password,
            })
            .await
            .map_err(|e| StateError::Connection(format!("Root authentication failed: {}", e)))?;
        } else {
            db.signin(Database {
                namespace: &config.namespace,
                database: &config.database,
                username: &config.username,
                password: &config.password,
            })
            .await
            .map_err(|e| {
                StateError::Connection(format!("Database authentication failed: {}", e))
            })?;
        }

        db.use_ns(&config.namespace)
            .use_db(&config.database)
            .await
            .map_err(|e| {
                StateError::Connection(format!("Failed to select namespace/database: {}", e))
            })?;

        migrations::init_schema(&db).await?;

        info!("SurrealDB Cloud connected and schema initialized");
        Ok(SurrealHandle { db })
    }

    /// Connect using environment variables
    ///
    /// If SURREALDB_ENDPOINT is set, connects to cloud.
    /// If SURREALDB_URL is set, connects to that URL.
    /// Otherwise, uses local persistence in `fallback_dir`.
    #[instrument(skip_all)]
    pub async fn setup_from_env(fallback_dir: impl AsRef<Path>) -> Result<Self> {
        if let Ok(config) = CloudConfig::from_env() {
            info!("Cloud config found, connecting to SurrealDB Cloud");
            return Self::setup_cloud(config).await;
        }

        if let Ok(url) = std::env::var("SURREALDB_URL") {
            info!("SURREALDB_URL found, connecting to {}", url);
            return Self::setup_url(&url).await;
        }

        info!("No cloud config found, using local persistence");
        Self::setup_local(fallback_dir).await
    }

    async fn query_rows<T>(&self, sql: String, binds: Vec<(&'static str, Bind)>) -> StorageResult<Vec<T>>
    where
        T: serde::de::DeserializeOwned,
    {
        let mut query = self.db.query(sql);
        for (name, value) in binds {
            query = match value {
                Bind::Text(v) => query.bind((name, v)),
                Bind::TextList(v) => query.bind((name, v)),
                Bind::Time(v) => query.bind((name, v)),
            };
        }
        let mut response = query.await?;
        let rows: Vec<T> = response.take(0)?;
        Ok(rows)
    }
}

/// Owned bind values for dynamically assembled queries.
enum Bind {
    Text(String),
    TextList(Vec<String>),
    Time(SurrealDatetime),
}

#[async_trait]
impl RemoteStore for SurrealHandle {
    async fn ping(&self) -> StorageResult<()> {
        self.db
            .health()
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))
    }

    // ========== Memory Operations ==========

    #[instrument(skip(self, record), fields(memory_id = %record.id))]
    async fn put_memory(&self, record: &MemoryRecord) -> StorageResult<()> {
        record.validate()?;
        debug!("Saving memory");
        let _saved: Option<DbMemoryRow> = self
            .db
            .upsert((MEMORIES, record.id.clone()))
            .content(DbMemoryRow::from(record))
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_memory(&self, id: &str) -> StorageResult<Option<MemoryRecord>> {
        let row: Option<DbMemoryRow> = self.db.select((MEMORIES, id.to_string())).await?;
        Ok(row.map(DbMemoryRow::into_record))
    }

    #[instrument(skip(self))]
    async fn delete_memory(&self, id: &str) -> StorageResult<()> {
        let _deleted: Option<DbMemoryRow> = self.db.delete((MEMORIES, id.to_string())).await?;
        Ok(())
    }

    #[instrument(skip(self, search))]
    async fn search_memories(&self, search: &MemorySearch) -> StorageResult<Vec<MemoryRecord>> {
        let mut clauses = Vec::new();
        let mut binds = Vec::new();

        if !search.keywords.is_empty() {
            clauses.push("keywords CONTAINSANY $keywords");
            binds.push(("keywords", Bind::TextList(search.keywords.clone())));
        }
        if !search.tags.is_empty() {
            clauses.push("tags CONTAINSALL $tags");
            binds.push(("tags", Bind::TextList(search.tags.clone())));
        }
        if let Some(memory_type) = search.memory_type {
            clauses.push("memory_type = $memory_type");
            binds.push(("memory_type", Bind::Text(memory_type.as_str().to_string())));
        }
        if let Some(cutoff) = search.created_before {
            clauses.push("created_at < $created_before");
            binds.push(("created_before", Bind::Time(SurrealDatetime::from(cutoff))));
        }

        let mut sql = format!("SELECT * FROM {MEMORIES}");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY importance_score DESC, created_at DESC");
        if let Some(limit) = search.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let rows: Vec<DbMemoryRow> = self.query_rows(sql, binds).await?;
        debug!(hits = rows.len(), "Memory search complete");
        Ok(rows.into_iter().map(DbMemoryRow::into_record).collect())
    }

    async fn count_memories(&self) -> StorageResult<u64> {
        #[derive(Deserialize)]
        struct CountRow {
            count: u64,
        }

        let rows: Vec<CountRow> = self
            .query_rows(format!("SELECT count() FROM {MEMORIES} GROUP ALL"), Vec::new())
            .await?;
        Ok(rows.into_iter().next().map(|r| r.count).unwrap_or(0))
    }

    // ========== Agent State Operations ==========

    #[instrument(skip(self, state), fields(key = %state.key()))]
    async fn put_agent_state(&self, state: &AgentState) -> StorageResult<()> {
        state.validate()?;
        debug!("Saving agent state");
        let _saved: Option<DbAgentStateRow> = self
            .db
            .upsert((AGENT_STATES, state.key().document_key()))
            .content(DbAgentStateRow::from(state))
            .await?;
        Ok(())
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn get_agent_state(&self, key: &AgentStateKey) -> StorageResult<Option<AgentState>> {
        let row: Option<DbAgentStateRow> =
            self.db.select((AGENT_STATES, key.document_key())).await?;
        Ok(row.map(DbAgentStateRow::into_state))
    }

    #[instrument(skip(self))]
    async fn find_agent_state(
        &self,
        agent_id: &str,
        session_id: &str,
    ) -> StorageResult<Option<AgentState>> {
        let rows: Vec<DbAgentStateRow> = self
            .query_rows(
                format!(
                    "SELECT * FROM {AGENT_STATES} WHERE agent_id = $agent_id \
                     AND session_id = $session_id ORDER BY last_updated DESC LIMIT 1"
                ),
                vec![
                    ("agent_id", Bind::Text(agent_id.to_string())),
                    ("session_id", Bind::Text(session_id.to_string())),
                ],
            )
            .await?;
        Ok(rows.into_iter().next().map(DbAgentStateRow::into_state))
    }

    #[instrument(skip(self))]
    async fn list_agent_states(&self, agent_id: Option<&str>) -> StorageResult<Vec<AgentState>> {
        let (sql, binds) = match agent_id {
            Some(id) => (
                format!(
                    "SELECT * FROM {AGENT_STATES} WHERE agent_id = $agent_id ORDER BY last_updated DESC"
                ),
                vec![("agent_id", Bind::Text(id.to_string()))],
            ),
            None => (
                format!("SELECT * FROM {AGENT_STATES} ORDER BY last_updated DESC"),
                Vec::new(),
            ),
        };
        let rows: Vec<DbAgentStateRow> = self.query_rows(sql, binds).await?;
        Ok(rows.into_iter().map(DbAgentStateRow::into_state).collect())
    }

    // ========== Coordination Event Operations ==========

    #[instrument(skip(self, event), fields(event_id = %event.event_id, event_type = %event.event_type))]
    async fn append_event(&self, event: &CoordinationEvent) -> StorageResult<()> {
        event.validate()?;
        debug!("Appending coordination event");
        // Upsert by document key keeps re-appends of the same event idempotent.
        let _saved: Option<DbEventRow> = self
            .db
            .upsert((COORDINATION_EVENTS, event.document_key()))
            .content(DbEventRow::from(event))
            .await?;
        Ok(())
    }

    #[instrument(skip(self, filter))]
    async fn list_events(&self, filter: &EventFilter) -> StorageResult<Vec<CoordinationEvent>> {
        let mut clauses = Vec::new();
        let mut binds = Vec::new();

        if let Some(agent) = &filter.source_agent_id {
            clauses.push("source_agent_id = $source_agent_id");
            binds.push(("source_agent_id", Bind::Text(agent.clone())));
        }
        if let Some(event_type) = filter.event_type {
            clauses.push("event_type = $event_type");
            binds.push(("event_type", Bind::Text(event_type.as_str().to_string())));
        }
        if let Some(since) = filter.since {
            clauses.push("timestamp >= $since");
            binds.push(("since", Bind::Time(SurrealDatetime::from(since))));
        }

        let mut sql = format!("SELECT * FROM {COORDINATION_EVENTS}");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY timestamp DESC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let rows: Vec<DbEventRow> = self.query_rows(sql, binds).await?;
        Ok(rows.into_iter().map(DbEventRow::into_event).collect())
    }

    // ========== System State Operations ==========

    #[instrument(skip(self))]
    async fn get_system_state(&self) -> StorageResult<Option<SystemState>> {
        let row: Option<DbSystemStateRow> =
            self.db.select((SYSTEM_STATE, SYSTEM_STATE_KEY)).await?;
        Ok(row.map(DbSystemStateRow::into_state))
    }

    #[instrument(skip(self, state), fields(emergency_stop = state.emergency_stop))]
    async fn put_system_state(&self, state: &SystemState) -> StorageResult<()> {
        let _saved: Option<DbSystemStateRow> = self
            .db
            .upsert((SYSTEM_STATE, SYSTEM_STATE_KEY))
            .content(DbSystemStateRow::from(state))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SystemStateDelta;

    fn memory(content: &str, memory_type: MemoryType, keywords: &[&str]) -> MemoryRecord {
        MemoryRecord::new(
            content,
            BTreeSet::from(["test".to_string()]),
            memory_type,
            keywords.iter().map(|k| k.to_string()).collect(),
            0.5,
        )
    }

    #[tokio::test]
    async fn test_surreal_connection_and_schema_creation() {
        let handle = SurrealHandle::setup_db().await;
        assert!(handle.is_ok(), "Failed to connect: {:?}", handle.err());
        handle.unwrap().ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_round_trip_and_delete() {
        let handle = SurrealHandle::setup_db().await.unwrap();
        let record = memory("Goal: ship v1", MemoryType::Goal, &["goal", "ship"]);

        handle.put_memory(&record).await.unwrap();
        let loaded = handle.get_memory(&record.id).await.unwrap().unwrap();
        assert_eq!(loaded.content, record.content);
        assert_eq!(loaded.tags, record.tags);
        assert_eq!(loaded.memory_type, MemoryType::Goal);
        assert_eq!(handle.count_memories().await.unwrap(), 1);

        handle.delete_memory(&record.id).await.unwrap();
        assert!(handle.get_memory(&record.id).await.unwrap().is_none());
        // Deleting again is a no-op.
        handle.delete_memory(&record.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_search_by_keyword_and_type() {
        let handle = SurrealHandle::setup_db().await.unwrap();
        let goal = memory("Goal: improve latency", MemoryType::Goal, &["improve", "latency"]);
        let error = memory("Error: timeout on save", MemoryType::Error, &["timeout", "save"]);
        handle.put_memory(&goal).await.unwrap();
        handle.put_memory(&error).await.unwrap();

        let hits = handle
            .search_memories(&MemorySearch::all().with_keywords(["timeout"]))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, error.id);

        let goals = handle
            .search_memories(&MemorySearch::all().with_type(Some(MemoryType::Goal)))
            .await
            .unwrap();
        assert_eq!(goals.len(), 1);
        assert_eq!(goals[0].id, goal.id);
    }

    #[tokio::test]
    async fn test_agent_state_upsert_by_composite_key() {
        let handle = SurrealHandle::setup_db().await.unwrap();
        let state = AgentState::new("a1", "coder", "s1").with_status(AgentStatus::Active);
        handle.put_agent_state(&state).await.unwrap();

        let mut updated = state.clone();
        updated.status = AgentStatus::Working;
        handle.put_agent_state(&updated).await.unwrap();

        let loaded = handle.get_agent_state(&state.key()).await.unwrap().unwrap();
        assert_eq!(loaded.status, AgentStatus::Working);
        assert_eq!(handle.list_agent_states(Some("a1")).await.unwrap().len(), 1);

        let found = handle.find_agent_state("a1", "s1").await.unwrap().unwrap();
        assert_eq!(found.agent_type, "coder");
    }

    #[tokio::test]
    async fn test_event_append_is_idempotent() {
        let handle = SurrealHandle::setup_db().await.unwrap();
        let event = CoordinationEvent::new(EventType::Spawn, "a1", "planner").with_target("a2");
        handle.append_event(&event).await.unwrap();
        handle.append_event(&event).await.unwrap();

        let events = handle.list_events(&EventFilter::all()).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].target_agent_id.as_deref(), Some("a2"));
    }

    #[tokio::test]
    async fn test_system_state_singleton() {
        let handle = SurrealHandle::setup_db().await.unwrap();
        assert!(handle.get_system_state().await.unwrap().is_none());

        let mut state = SystemState::new("0.3.1");
        SystemStateDelta::emergency_stop(true).apply(&mut state);
        handle.put_system_state(&state).await.unwrap();

        let loaded = handle.get_system_state().await.unwrap().unwrap();
        assert!(loaded.emergency_stop);
        assert_eq!(loaded.system_version, "0.3.1");
    }
}
