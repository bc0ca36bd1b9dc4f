//! Store error types

use thiserror::Error;

/// Errors surfaced by store operations
#[derive(Debug, Error)]
pub enum StoreError {
    /// A dependency insert would create a cycle, or references an unknown task
    #[error("invalid dependency: {0}")]
    InvalidDependency(String),

    /// The requested record does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Input failed validation before touching the database
    #[error("validation failed: {0}")]
    Validation(String),

    /// A unique constraint was violated where upsert is not semantically safe
    #[error("conflict: {0}")]
    Conflict(String),

    /// Underlying database error
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A persisted blob could not be (de)serialized
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// A persisted timestamp could not be parsed
    #[error("invalid timestamp '{value}': {source}")]
    Timestamp {
        value: String,
        source: chrono::ParseError,
    },

    /// Filesystem error while opening the database
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias used throughout the store
pub type StoreResult<T> = Result<T, StoreError>;
