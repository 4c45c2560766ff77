//! Onboarding endpoints: the synchronous saga and the durable workflow.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use common::WorkflowId;
use saga::{OnboardingRequest, OnboardingResult};
use serde::Serialize;

use crate::AppState;
use crate::error::ApiError;

#[derive(Serialize)]
pub struct WorkflowStartedResponse {
    pub workflow_id: WorkflowId,
    pub message: String,
}

/// POST /onboarding/sync
///
/// Runs the saga in the request. A failing step still answers 200 with
/// `success: false`; only an invalid request is an error.
#[tracing::instrument(skip(state, request), fields(name = %request.name))]
pub async fn sync(
    State(state): State<Arc<AppState>>,
    Json(request): Json<OnboardingRequest>,
) -> Result<Json<OnboardingResult>, ApiError> {
    Ok(Json(state.saga.execute(request).await?))
}

/// POST /onboarding/async
///
/// Records the workflow and answers 202 before any step has run. Progress
/// is at `/workflows/{id}/progress`.
#[tracing::instrument(skip(state, request), fields(name = %request.name))]
pub async fn start(
    State(state): State<Arc<AppState>>,
    Json(request): Json<OnboardingRequest>,
) -> Result<(StatusCode, Json<WorkflowStartedResponse>), ApiError> {
    let workflow_id = state.engine.start(request).await?;
    tracing::info!(%workflow_id, "onboarding workflow started");

    let message =
        format!("Onboarding started. Follow progress at /workflows/{workflow_id}/progress");
    Ok((
        StatusCode::ACCEPTED,
        Json(WorkflowStartedResponse {
            workflow_id,
            message,
        }),
    ))
}
