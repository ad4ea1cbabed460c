//! Error types for session store operations.

use medscribe_types::SessionId;

/// Error type for session store operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// The session was never created, was evicted, or has expired.
    #[error("Unknown session: {0}")]
    UnknownSession(SessionId),
}

/// Result type for session store operations.
pub type Result<T> = std::result::Result<T, SessionError>;
