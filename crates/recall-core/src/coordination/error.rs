//! Error types for the coordination subsystem.

use recall_state::{AgentStatus, StorageError};

/// Errors produced by [`CoordinationStateManager`](super::CoordinationStateManager).
///
/// As with memories, an unreachable backing store is not an error: writes
/// land in the in-memory mirror and report `persisted: false`.
#[derive(Debug, thiserror::Error)]
pub enum CoordinationError {
    #[error("agent state not found: agent {agent_id} in session {session_id}")]
    NotFound { agent_id: String, session_id: String },

    #[error("agent {key} cannot move from {from} to {to}")]
    InvalidTransition {
        key: String,
        from: AgentStatus,
        to: AgentStatus,
    },

    #[error("invalid coordination record: {0}")]
    Validation(String),

    #[error("{operation} timed out after {after_ms}ms")]
    Timeout { operation: String, after_ms: u64 },

    #[error("storage error: {0}")]
    Storage(StorageError),
}

impl CoordinationError {
    pub fn not_found(agent_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        CoordinationError::NotFound {
            agent_id: agent_id.into(),
            session_id: session_id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CoordinationError::NotFound { .. })
    }
}

impl From<StorageError> for CoordinationError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Timeout {
                operation,
                after_ms,
            } => CoordinationError::Timeout {
                operation,
                after_ms,
            },
            StorageError::Validation(reason) => CoordinationError::Validation(reason),
            other => CoordinationError::Storage(other),
        }
    }
}

/// Result type for coordination operations.
pub type CoordinationResult<T> = std::result::Result<T, CoordinationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_errors_map_to_explicit_variants() {
        let err: CoordinationError = StorageError::Timeout {
            operation: "get_agent_state".into(),
            after_ms: 50,
        }
        .into();
        assert!(matches!(err, CoordinationError::Timeout { after_ms: 50, .. }));

        let err: CoordinationError = StorageError::Validation("empty id".into()).into();
        assert!(matches!(err, CoordinationError::Validation(_)));
    }

    #[test]
    fn test_transition_message_names_both_states() {
        let err = CoordinationError::InvalidTransition {
            key: "coder_a1_s1".into(),
            from: AgentStatus::Uninitialized,
            to: AgentStatus::Completed,
        };
        assert_eq!(
            err.to_string(),
            "agent coder_a1_s1 cannot move from UNINITIALIZED to COMPLETED"
        );
    }
}
