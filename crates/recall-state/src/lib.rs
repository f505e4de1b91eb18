//! Recall-State: durable backing store for Recall
//!
//! This crate owns every record type that crosses the process boundary and
//! the [`RemoteStore`] seam the memory and coordination layers persist
//! through.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: record validation, document keys, and query semantics that every
//! backend must honor.
//!
//! ## Key Components
//!
//! - `SurrealHandle`: SurrealDB connection implementing `RemoteStore`
//! - `MemoryRecord`: a classified unit of agent memory
//! - `AgentState` / `CoordinationEvent` / `SystemState`: cross-session coordination records
//! - `fakes::MemoryRemoteStore`: in-memory store with outage and latency switches

mod error;
pub mod fakes;
mod handle;
pub mod migrations;
mod schema;
pub mod storage_traits;

pub use error::{StateError, StorageError};
pub use handle::{CloudConfig, SurrealHandle};
pub use schema::{
    AgentState, AgentStateKey, AgentStatus, CoordinationEvent, EventType, MemoryRecord,
    MemoryType, SystemState, SystemStateDelta,
};
pub use storage_traits::{
    compare_ranked, EventFilter, MemorySearch, RemoteStore, StorageResult,
};

/// Result type for recall-state connection and schema operations
pub type Result<T> = std::result::Result<T, StateError>;
