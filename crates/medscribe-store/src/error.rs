//! Error types for the store crate.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur in the document store or vector index.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database connection or operation failed.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Requested record not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Stored row could not be mapped back to a record.
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// The embedder failed to produce a vector.
    #[error("Embedding error: {0}")]
    Embedding(#[from] medscribe_llm::LlmError),

    /// The backing service did not answer in time.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Backend is not reachable (used by test doubles and remote backends).
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// A blocking database task panicked or was cancelled.
    #[error("Task join error: {0}")]
    Join(String),
}

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
