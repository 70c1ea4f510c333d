use thiserror::Error;

use crate::request::{RequestId, RequestStatus};

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

/// Errors that can occur in the request queue.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Database operation failed
    #[cfg(feature = "postgres")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Request not found
    #[error("Request not found: {0}")]
    NotFound(RequestId),

    /// A state change was requested that the state machine does not allow
    #[error("Invalid transition for request {id}: {from} -> {to}")]
    InvalidTransition {
        id: RequestId,
        from: RequestStatus,
        to: RequestStatus,
    },

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
