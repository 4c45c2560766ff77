use common::WorkflowId;
use journal::JournalError;
use thiserror::Error;

use crate::instance::WorkflowStatus;

/// Errors raised by the durable workflow adapter.
///
/// Step failures are not errors here: they end the workflow in `FAILED`.
/// What remains is infrastructure trouble, which leaves the workflow
/// `RUNNING` so that a later drive can pick it up.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// The onboarding request was rejected before the workflow was recorded.
    #[error("Validation error: {0}")]
    Validation(String),

    /// No workflow with this ID has been recorded.
    #[error("Workflow not found: {0}")]
    NotFound(WorkflowId),

    /// A recorded event does not fit the workflow's current state.
    #[error("Invalid transition: cannot apply {event} to a {status} workflow")]
    InvalidTransition {
        status: WorkflowStatus,
        event: &'static str,
    },

    /// The journal rejected a read or an append.
    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),

    /// A recorded payload could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl WorkflowError {
    /// Returns true if driving the workflow again may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, WorkflowError::Journal(_))
    }
}

/// Result type for workflow operations.
pub type Result<T> = std::result::Result<T, WorkflowError>;
