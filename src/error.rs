//! Error types for Strata

use thiserror::Error;

/// Main error type for the memory subsystem
#[derive(Error, Debug)]
pub enum MemoryError {
    /// Bad input, never retried
    #[error("Validation error: {0}")]
    Validation(String),

    /// Optimistic concurrency violation; re-read and retry
    #[error("Version conflict on {id}: expected {expected}, found {actual}")]
    VersionConflict {
        id: String,
        expected: u64,
        actual: u64,
    },

    /// Every backend in the fallback chain failed
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Deadline exceeded before the operation finished
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// A context parent chain would loop back on itself
    #[error("Cyclic inheritance involving context {0}")]
    CyclicInheritance(String),

    /// Entity not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// A backend failed in a way that may succeed on retry or on another backend
    #[error("Backend '{backend}' failed: {message}")]
    Backend { backend: String, message: String },

    /// Database operation failed
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Persisted data could not be decoded
    #[error("Corrupt data: {0}")]
    Corruption(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other errors
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl MemoryError {
    /// Shorthand for a backend fault
    pub fn backend(backend: impl Into<String>, message: impl std::fmt::Display) -> Self {
        MemoryError::Backend {
            backend: backend.into(),
            message: message.to_string(),
        }
    }

    /// Whether this error is a storage fault that the fallback chain should absorb
    /// (retry, then fail over) rather than hand back to the caller.
    pub fn is_backend_fault(&self) -> bool {
        matches!(
            self,
            MemoryError::Backend { .. }
                | MemoryError::Database(_)
                | MemoryError::Io(_)
                | MemoryError::Corruption(_)
                | MemoryError::Serialization(_)
        )
    }
}

impl From<serde_json::Error> for MemoryError {
    fn from(e: serde_json::Error) -> Self {
        MemoryError::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for MemoryError {
    fn from(e: bincode::Error) -> Self {
        MemoryError::Serialization(e.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, MemoryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_faults_are_failover_candidates() {
        assert!(MemoryError::backend("graph", "connection reset").is_backend_fault());
        assert!(MemoryError::Io(std::io::Error::other("disk")).is_backend_fault());
    }

    #[test]
    fn caller_errors_are_not_failover_candidates() {
        assert!(!MemoryError::Validation("empty".into()).is_backend_fault());
        assert!(!MemoryError::VersionConflict {
            id: "m".into(),
            expected: 1,
            actual: 2
        }
        .is_backend_fault());
        assert!(!MemoryError::CyclicInheritance("c".into()).is_backend_fault());
        assert!(!MemoryError::NotFound("m".into()).is_backend_fault());
    }
}
