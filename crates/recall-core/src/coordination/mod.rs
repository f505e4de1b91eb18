//! Agent operational records, the coordination event log and system state.

pub mod error;
pub mod manager;
pub mod mirror;

pub use error::{CoordinationError, CoordinationResult};
pub use manager::{
    CoordinationConfig, CoordinationStateManager, CoordinationSummary, EventOutcome,
    EventTypeSummary, ReconcileFailure, ReconcileReport, WriteOutcome,
};
pub use mirror::{MirrorStats, StateMirror};
