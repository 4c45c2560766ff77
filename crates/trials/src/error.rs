//! Trial registry error types.

use common::{SiteId, TrialId};
use thiserror::Error;

/// Errors raised by trial commands, queries and their collaborators.
#[derive(Debug, Error)]
pub enum TrialError {
    /// Input failed a business rule; retrying will not help.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The referenced entity does not exist.
    #[error("{entity} with id {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// The site is already linked to the trial.
    #[error("Site {site_id} is already linked to trial {trial_id}")]
    DuplicateSiteLink { trial_id: TrialId, site_id: SiteId },

    /// The caller's view of the trial is out of date.
    #[error(
        "Trial version mismatch: expected {expected}, current is {actual}. Please refresh and try again."
    )]
    StaleData { expected: i64, actual: i64 },

    /// The storage collaborator failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TrialError {
    /// Builds a `NotFound` error for a trial.
    pub fn trial_not_found(trial_id: TrialId) -> Self {
        TrialError::NotFound {
            entity: "Trial",
            id: trial_id.to_string(),
        }
    }

    /// The error class name recorded in audit payloads.
    pub fn error_type(&self) -> &'static str {
        match self {
            TrialError::Validation(_) => "ValidationError",
            TrialError::NotFound { .. } => "NotFoundError",
            TrialError::DuplicateSiteLink { .. } => "DuplicateSiteLinkError",
            TrialError::StaleData { .. } => "StaleDataError",
            TrialError::Storage(_) => "StorageError",
            TrialError::Database(_) => "DatabaseError",
            TrialError::Serialization(_) => "SerializationError",
        }
    }

    /// Returns true for infrastructure failures that may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TrialError::Storage(_) | TrialError::Database(_))
    }
}

/// Result type for trial operations.
pub type Result<T> = std::result::Result<T, TrialError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn business_errors_are_not_retryable() {
        assert!(!TrialError::Validation("bad".into()).is_retryable());
        let stale = TrialError::StaleData {
            expected: 1,
            actual: 2,
        };
        assert!(!stale.is_retryable());
        assert!(TrialError::Storage("down".into()).is_retryable());
    }

    #[test]
    fn not_found_message_names_the_entity() {
        let id = TrialId::new();
        let err = TrialError::trial_not_found(id);
        assert_eq!(err.to_string(), format!("Trial with id {id} not found"));
        assert_eq!(err.error_type(), "NotFoundError");
    }
}
