use thiserror::Error;

use crate::store::BackendError;

/// Errors surfaced by queue and message operations.
///
/// A lost claim race is never an error; it is retried inside the claim and,
/// once the attempt budget is spent, reported as an empty result.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Malformed queue name, message id or payload. Raised before any backend call.
    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("queue [{0}] not found")]
    QueueNotFound(String),

    #[error("message [{0}] not found")]
    MessageNotFound(String),

    /// Create-only call against an existing queue.
    #[error("queue [{0}] already exists")]
    Conflict(String),

    /// Every fresh id drawn for a post was already taken.
    #[error("message id [{0}] already in use")]
    DuplicateId(String),

    #[error("queue [{queue}] reached its pending limit of {limit}")]
    LimitExceeded { queue: String, limit: i64 },

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl QueueError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        QueueError::Validation {
            field,
            reason: reason.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            QueueError::QueueNotFound(_) | QueueError::MessageNotFound(_)
        )
    }
}
