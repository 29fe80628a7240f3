//! Error types for the experiment persistence layer

use std::fmt;
use thiserror::Error;

/// Result type for persistence operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Persistence error types
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// A query that must match exactly one record matched none or several
    #[error("No unique result: {0}")]
    NotUnique(String),

    /// Operation conflict (concurrent modification)
    #[error("Conflict: {0}")]
    Conflict(String),
}

impl StorageError {
    /// Create a serialization error
    pub fn serialization<E: fmt::Display>(err: E) -> Self {
        Self::Serialization(err.to_string())
    }

    /// Create a not found error
    pub fn not_found<E: fmt::Display>(item: E) -> Self {
        Self::NotFound(item.to_string())
    }

    /// Create a "no unique result" error
    pub fn not_unique<E: fmt::Display>(msg: E) -> Self {
        Self::NotUnique(msg.to_string())
    }

    /// Create a conflict error
    pub fn conflict<E: fmt::Display>(msg: E) -> Self {
        Self::Conflict(msg.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err)
    }
}
