use std::time::Duration;

use journal::JournalError;
use thiserror::Error;

/// Infrastructure failures of the router itself.
///
/// Failures of the routed operation are never wrapped in this type; they
/// come back to the caller unchanged.
#[derive(Debug, Error)]
pub enum ConcurrencyRoutingError {
    /// The router cannot accept work right now.
    #[error("Router unavailable: {0}")]
    Unavailable(String),

    /// The key stayed busy for longer than the acquire timeout.
    #[error("Timed out after {waited:?} waiting for key {key}")]
    LeaseTimeout { key: String, waited: Duration },

    /// The operation panicked or its task ended before producing a result.
    #[error("Operation on key {key} aborted: {reason}")]
    Aborted { key: String, reason: String },

    /// The lease journal rejected a read or an append.
    #[error("Lease journal error: {0}")]
    Journal(#[from] JournalError),

    /// A lease record could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ConcurrencyRoutingError {
    /// Returns true if submitting the operation again may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ConcurrencyRoutingError::Aborted { .. } | ConcurrencyRoutingError::Serialization(_)
        )
    }
}

/// Result type for router operations.
pub type Result<T> = std::result::Result<T, ConcurrencyRoutingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_are_retryable_but_panics_are_not() {
        let timeout = ConcurrencyRoutingError::LeaseTimeout {
            key: "trial/1".into(),
            waited: Duration::from_secs(1),
        };
        assert!(timeout.is_retryable());
        assert!(
            !ConcurrencyRoutingError::Aborted {
                key: "trial/1".into(),
                reason: "panicked".into(),
            }
            .is_retryable()
        );
    }
}
