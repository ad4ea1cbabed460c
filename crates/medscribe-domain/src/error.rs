//! Domain error types.

use std::time::Duration;

use medscribe_session::SessionError;
use medscribe_types::SessionId;
use thiserror::Error;

/// Errors raised by the report pipeline.
#[derive(Debug, Error)]
pub enum DomainError {
    /// The vector index could not be queried. Callers degrade to an empty context.
    #[error("Retrieval unavailable: {0}")]
    RetrievalUnavailable(String),

    /// The text generation service failed or produced an incomplete response.
    #[error("Generation failed: {0}")]
    GenerationFailed(String),

    /// Generation exceeded its wall-clock cap.
    #[error("Generation timed out after {0:?}")]
    GenerationTimedOut(Duration),

    /// The report was generated but could not be saved. It is parked under `pending_id`.
    #[error("Persistence failed (pending id {pending_id}): {reason}")]
    PersistenceFailed { pending_id: String, reason: String },

    #[error("Unknown session: {0}")]
    UnknownSession(SessionId),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// No parked report exists under the given recovery id.
    #[error("No pending report with id {0}")]
    UnknownPending(String),
}

impl DomainError {
    /// Stable machine-readable code, also used in the in-band error marker.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RetrievalUnavailable(_) => "retrieval_unavailable",
            Self::GenerationFailed(_) => "generation_failed",
            Self::GenerationTimedOut(_) => "timeout",
            Self::PersistenceFailed { .. } => "persistence_failed",
            Self::UnknownSession(_) => "unknown_session",
            Self::Template(_) => "template_error",
            Self::InvalidRequest(_) => "invalid_request",
            Self::UnknownPending(_) => "unknown_pending",
        }
    }
}

impl From<SessionError> for DomainError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::UnknownSession(id) => Self::UnknownSession(id),
        }
    }
}

impl From<minijinja::Error> for DomainError {
    fn from(err: minijinja::Error) -> Self {
        Self::Template(err.to_string())
    }
}

/// Result type for domain operations.
pub type Result<T> = std::result::Result<T, DomainError>;
