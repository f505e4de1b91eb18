//! Recall Core Library
//!
//! Memory and coordination state for autonomous agents that outlives any
//! single session.
//!
//! ## Key Components
//!
//! - [`memory`]: content classification, the bounded local cache and the
//!   tiered store that write-behinds into the backing store
//! - [`coordination`]: agent states, the coordination event log and the
//!   system state singleton, mirrored locally while the store is down
//! - [`migrate`]: import of legacy flat-file state
//! - [`worker`]: periodic sync, consolidation and reconciliation
//!
//! Persistence goes through [`recall_state::RemoteStore`]; every component
//! keeps serving from local state when that store is unreachable.

pub mod config;
pub mod connect;
pub mod coordination;
pub mod memory;
pub mod migrate;
pub mod obs;
pub mod retry;
pub mod status;
pub mod telemetry;
pub mod worker;

pub use config::{ConfigError, RecallConfig};
pub use connect::{connect_remote, ReconnectingRemote};
pub use coordination::{
    CoordinationConfig, CoordinationError, CoordinationResult, CoordinationStateManager,
    CoordinationSummary, EventOutcome, ReconcileReport, WriteOutcome,
};
pub use memory::{
    classify, Classification, ConsolidationPolicy, ConsolidationReport, DecayPolicy, MemoryError,
    MemoryResult, MemoryStats, MemoryStoreConfig, SyncReport, TieredMemoryStore,
};
pub use migrate::{migrate, MigrationError, MigrationReport};
pub use retry::RetryPolicy;
pub use status::{BackendStatus, StatusMonitor};
pub use worker::{spawn_worker, WorkerHandle, WorkerSchedule, WorkerSummary};

pub use recall_state::{
    AgentState, AgentStateKey, AgentStatus, CoordinationEvent, EventFilter, EventType,
    MemoryRecord, MemorySearch, MemoryType, RemoteStore, StorageError, SystemState,
    SystemStateDelta,
};
