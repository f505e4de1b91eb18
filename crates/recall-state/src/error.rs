//! Error types for recall-state

use thiserror::Error;

/// Errors raised while connecting to or preparing the backing store
#[derive(Error, Debug)]
pub enum StateError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Database query error
    #[error("Database query failed: {0}")]
    Query(String),

    /// Serialization error
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Schema setup error
    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),
}

impl From<surrealdb::Error> for StateError {
    fn from(err: surrealdb::Error) -> Self {
        StateError::Query(err.to_string())
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::Serialization(err.to_string())
    }
}

/// Errors returned by [`crate::RemoteStore`] operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    /// The requested document does not exist
    #[error("{kind} not found: {key}")]
    NotFound { kind: &'static str, key: String },

    /// The backing store cannot be reached
    #[error("backing store unavailable: {0}")]
    Unavailable(String),

    /// A bounded wait on the backing store elapsed
    #[error("{operation} timed out after {after_ms}ms")]
    Timeout { operation: String, after_ms: u64 },

    /// The record is malformed and will never be accepted
    #[error("invalid record: {0}")]
    Validation(String),

    /// The record could not be encoded or decoded
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Any other backend failure
    #[error("backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StorageError::Unavailable(_) | StorageError::Timeout { .. } | StorageError::Backend(_)
        )
    }

    /// Whether this error means the store could not be reached at all.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StorageError::Unavailable(_))
    }
}

impl From<surrealdb::Error> for StorageError {
    fn from(err: surrealdb::Error) -> Self {
        let message = err.to_string();
        // The `any` engine surfaces dropped sockets and refused connections as
        // plain API errors, so the message is the only discriminator available.
        let lowered = message.to_lowercase();
        if lowered.contains("connection") || lowered.contains("websocket") {
            StorageError::Unavailable(message)
        } else {
            StorageError::Backend(message)
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
