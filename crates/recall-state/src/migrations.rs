//! SurrealDB schema migrations and initialization
//!
//! Defines the four Recall namespaces with their indexes. Every statement is
//! a `DEFINE ... IF NOT EXISTS`-style definition, so running it again on an
//! initialized database is a no-op.

use crate::error::StateError;
use crate::Result;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

pub(crate) const MEMORIES: &str = "memories";
pub(crate) const AGENT_STATES: &str = "agent_states";
pub(crate) const COORDINATION_EVENTS: &str = "coordination_events";
pub(crate) const SYSTEM_STATE: &str = "system_state";

/// Initialize all Recall tables in SurrealDB
///
/// Safe to call multiple times (idempotent).
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing Recall SurrealDB schema");

    init_memories_table(db).await?;
    init_agent_states_table(db).await?;
    init_coordination_events_table(db).await?;
    init_system_state_table(db).await?;

    info!("Recall schema initialization complete");
    Ok(())
}

async fn run(db: &Surreal<Any>, table: &str, sql: &str) -> Result<()> {
    debug!("Initializing {} table", table);
    db.query(sql)
        .await
        .and_then(|response| response.check())
        .map_err(|e| StateError::SchemaSetup(format!("{table}: {e}")))?;
    info!("✓ {} table initialized", table);
    Ok(())
}

/// Initialize `memories` table
///
/// Schema:
/// ```text
/// TABLE memories {
///   memory_id:         STRING (record key)
///   content:           STRING
///   tags:              ARRAY<STRING>
///   memory_type:       STRING (GOAL | TASK | CONTEXT | DECISION | PROGRESS | ERROR | KNOWLEDGE)
///   keywords:          ARRAY<STRING> (indexed)
///   importance_score:  FLOAT
///   related_ids:       ARRAY<STRING>
///   created_at:        DATETIME (indexed)
///   updated_at:        DATETIME
/// }
/// ```
async fn init_memories_table(db: &Surreal<Any>) -> Result<()> {
    let sql = r#"
        DEFINE TABLE IF NOT EXISTS memories SCHEMALESS;

        DEFINE INDEX IF NOT EXISTS idx_memory_id ON TABLE memories COLUMNS memory_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_memory_type ON TABLE memories COLUMNS memory_type;
        DEFINE INDEX IF NOT EXISTS idx_memory_keywords ON TABLE memories COLUMNS keywords;
        DEFINE INDEX IF NOT EXISTS idx_memory_created_at ON TABLE memories COLUMNS created_at;
    "#;
    run(db, MEMORIES, sql).await
}

/// Initialize `agent_states` table
///
/// Record key: `{agent_type}_{agent_id}_{session_id}`. Upserts replace the
/// whole document (last writer wins).
async fn init_agent_states_table(db: &Surreal<Any>) -> Result<()> {
    let sql = r#"
        DEFINE TABLE IF NOT EXISTS agent_states SCHEMALESS;

        DEFINE INDEX IF NOT EXISTS idx_agent_session ON TABLE agent_states COLUMNS agent_id, session_id;
        DEFINE INDEX IF NOT EXISTS idx_agent_status ON TABLE agent_states COLUMNS status;
        DEFINE INDEX IF NOT EXISTS idx_agent_last_updated ON TABLE agent_states COLUMNS last_updated;
    "#;
    run(db, AGENT_STATES, sql).await
}

/// Initialize `coordination_events` table
///
/// Record key: `{timestamp}_{event_id}`. The log is append-only: record
/// users may create and read but never update or delete.
async fn init_coordination_events_table(db: &Surreal<Any>) -> Result<()> {
    let sql = r#"
        DEFINE TABLE IF NOT EXISTS coordination_events SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR select FULL
                FOR update NONE
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_event_source ON TABLE coordination_events COLUMNS source_agent_id;
        DEFINE INDEX IF NOT EXISTS idx_event_type ON TABLE coordination_events COLUMNS event_type;
        DEFINE INDEX IF NOT EXISTS idx_event_timestamp ON TABLE coordination_events COLUMNS timestamp;
    "#;
    run(db, COORDINATION_EVENTS, sql).await
}

/// Initialize `system_state` table (single record `system_state:current`)
async fn init_system_state_table(db: &Surreal<Any>) -> Result<()> {
    let sql = r#"
        DEFINE TABLE IF NOT EXISTS system_state SCHEMALESS;
    "#;
    run(db, SYSTEM_STATE, sql).await
}
