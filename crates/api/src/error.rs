//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use journal::JournalError;
use metrics_exporter_prometheus::BuildError;
use router::ConcurrencyRoutingError;
use saga::SagaError;
use thiserror::Error;
use trials::TrialError;
use workflow::WorkflowError;

use crate::config::ConfigError;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found.
    NotFound(String),
    /// Bad request from the client.
    BadRequest(String),
    /// Trial registry error.
    Trial(TrialError),
    /// Onboarding request rejected by the saga.
    Saga(SagaError),
    /// Durable workflow error.
    Workflow(WorkflowError),
    /// The Concurrency Router could not run the operation.
    Routing(ConcurrencyRoutingError),
    /// Internal server error.
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Trial(err) => trial_error_to_response(err),
            // Only rejected requests escape the saga as errors.
            ApiError::Saga(err) => (StatusCode::BAD_REQUEST, err.to_string()),
            ApiError::Workflow(err) => workflow_error_to_response(err),
            ApiError::Routing(err) => routing_error_to_response(err),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn trial_error_to_response(err: TrialError) -> (StatusCode, String) {
    match &err {
        TrialError::Validation(_) => (StatusCode::BAD_REQUEST, err.to_string()),
        TrialError::NotFound { .. } => (StatusCode::NOT_FOUND, err.to_string()),
        TrialError::DuplicateSiteLink { .. } | TrialError::StaleData { .. } => {
            (StatusCode::CONFLICT, err.to_string())
        }
        _ => {
            tracing::error!(error = %err, "trial registry failure");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

fn workflow_error_to_response(err: WorkflowError) -> (StatusCode, String) {
    match &err {
        WorkflowError::Validation(_) => (StatusCode::BAD_REQUEST, err.to_string()),
        WorkflowError::NotFound(_) => (StatusCode::NOT_FOUND, err.to_string()),
        _ => {
            tracing::error!(error = %err, "workflow failure");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

fn routing_error_to_response(err: ConcurrencyRoutingError) -> (StatusCode, String) {
    if err.is_retryable() {
        tracing::warn!(error = %err, "routing unavailable");
        (StatusCode::SERVICE_UNAVAILABLE, err.to_string())
    } else {
        tracing::error!(error = %err, "routed operation aborted");
        (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

impl From<TrialError> for ApiError {
    fn from(err: TrialError) -> Self {
        ApiError::Trial(err)
    }
}

impl From<SagaError> for ApiError {
    fn from(err: SagaError) -> Self {
        ApiError::Saga(err)
    }
}

impl From<WorkflowError> for ApiError {
    fn from(err: WorkflowError) -> Self {
        ApiError::Workflow(err)
    }
}

impl From<ConcurrencyRoutingError> for ApiError {
    fn from(err: ConcurrencyRoutingError) -> Self {
        ApiError::Routing(err)
    }
}

/// Failures while bringing the server up.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),

    #[error("Failed to resume workflows: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Failed to install Prometheus recorder: {0}")]
    Metrics(#[from] BuildError),

    #[error("Server error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::TrialId;

    fn status_of(err: ApiError) -> StatusCode {
        err.into_response().status()
    }

    #[test]
    fn trial_errors_map_to_client_statuses() {
        assert_eq!(
            status_of(TrialError::Validation("bad phase".into()).into()),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(TrialError::trial_not_found(TrialId::new()).into()),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(
                TrialError::StaleData {
                    expected: 1,
                    actual: 2
                }
                .into()
            ),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(TrialError::Storage("down".into()).into()),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn routing_timeout_is_service_unavailable() {
        let err = ConcurrencyRoutingError::LeaseTimeout {
            key: "trial/1".into(),
            waited: std::time::Duration::from_secs(10),
        };
        assert_eq!(status_of(err.into()), StatusCode::SERVICE_UNAVAILABLE);

        let aborted = ConcurrencyRoutingError::Aborted {
            key: "trial/1".into(),
            reason: "panicked".into(),
        };
        assert_eq!(status_of(aborted.into()), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
