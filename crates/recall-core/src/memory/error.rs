//! Error types for the memory subsystem.

use recall_state::StorageError;

/// Errors produced by memory operations.
///
/// Backing-store unavailability is not an error here: it flips the store
/// into degraded mode and reads fall back to the cache.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("memory not found: {id}")]
    NotFound { id: String },

    #[error("{operation} timed out after {after_ms}ms")]
    Timeout { operation: String, after_ms: u64 },

    #[error("invalid memory: {0}")]
    Validation(String),

    #[error("storage error: {0}")]
    Storage(StorageError),
}

impl MemoryError {
    pub fn not_found(id: impl Into<String>) -> Self {
        MemoryError::NotFound { id: id.into() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, MemoryError::NotFound { .. })
    }
}

impl From<StorageError> for MemoryError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound { key, .. } => MemoryError::NotFound { id: key },
            StorageError::Timeout {
                operation,
                after_ms,
            } => MemoryError::Timeout {
                operation,
                after_ms,
            },
            StorageError::Validation(reason) => MemoryError::Validation(reason),
            other => MemoryError::Storage(other),
        }
    }
}

/// Result type for memory operations.
pub type MemoryResult<T> = std::result::Result<T, MemoryError>;
