//! Saga error types.

use thiserror::Error;
use trials::TrialError;

/// Errors that escape the saga as `Err` instead of a structured result.
///
/// Step failures never show up here: they become an unsuccessful
/// `OnboardingResult` after compensation.
#[derive(Debug, Error)]
pub enum SagaError {
    /// The request was rejected before any step ran.
    #[error("Validation error: {0}")]
    Validation(String),
}

/// A forward action or compensation failed.
#[derive(Debug, Error)]
pub enum StepError {
    /// The trial registry rejected the operation.
    #[error("{0}")]
    Trial(#[from] TrialError),

    /// A step ran before the step that produces its input.
    #[error("Missing result of step '{0}'")]
    MissingPrior(&'static str),

    /// The task running the operation ended without producing a result.
    #[error("Aborted: {0}")]
    Aborted(String),
}

impl StepError {
    /// Returns true if retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            StepError::Trial(e) => e.is_retryable(),
            StepError::MissingPrior(_) => false,
            StepError::Aborted(_) => true,
        }
    }
}

/// A compensation that could not undo its step. Fatal for the onboarding
/// attempt: the storage may hold rows that nothing will remove.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize)]
#[error("{step}: {error}")]
pub struct CompensationFailure {
    /// Name of the compensation, e.g. `unregister_site_2`.
    pub step: String,
    /// The error it returned.
    pub error: String,
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
