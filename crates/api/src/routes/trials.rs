//! Trial registry endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use common::EntityKey;
use router::KeyedExecutorExt;
use serde::Deserialize;
use trials::{
    AuditEntry, AuditQuery, CreateTrial, MetadataUpdate, RegisterSiteToTrial, SiteRegistration,
    Trial, TrialDetails, TrialFilter, TrialPage, UpdateTrialMetadata,
};

use super::parse_trial_id;
use crate::AppState;
use crate::error::ApiError;

#[derive(Deserialize)]
pub struct RegisterSiteRequest {
    pub name: String,
    pub country: String,
}

/// POST /trials
#[tracing::instrument(skip(state, cmd), fields(name = %cmd.name))]
pub async fn create(
    State(state): State<Arc<AppState>>,
    Json(cmd): Json<CreateTrial>,
) -> Result<(StatusCode, Json<Trial>), ApiError> {
    let trial = state.trials.create_trial(cmd).await?;
    Ok((StatusCode::CREATED, Json(trial)))
}

/// GET /trials?phase=&status=&search=&limit=&offset=
#[tracing::instrument(skip(state, filter))]
pub async fn list(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<TrialFilter>,
) -> Result<Json<TrialPage>, ApiError> {
    Ok(Json(state.trials.list_trials(&filter).await?))
}

/// GET /trials/{id}
#[tracing::instrument(skip(state))]
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TrialDetails>, ApiError> {
    let trial_id = parse_trial_id(&id)?;
    Ok(Json(state.trials.get_trial(trial_id).await?))
}

/// PATCH /trials/{id}
///
/// Runs on the trial's key in the Concurrency Router, so concurrent updates
/// of one trial never interleave. A stale `expected_version` still fails
/// with 409.
#[tracing::instrument(skip(state, cmd))]
pub async fn update(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(mut cmd): Json<UpdateTrialMetadata>,
) -> Result<Json<MetadataUpdate>, ApiError> {
    let trial_id = parse_trial_id(&id)?;
    cmd.trial_id = trial_id;

    let service = Arc::clone(&state.trials);
    let update = state
        .router
        .route_serialized(&EntityKey::for_trial(trial_id), move || async move {
            service.update_trial_metadata(cmd).await
        })
        .await??;

    tracing::info!(%trial_id, changes = %update.changes, "trial metadata updated");
    Ok(Json(update))
}

/// POST /trials/{id}/sites
#[tracing::instrument(skip(state, req))]
pub async fn register_site(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<RegisterSiteRequest>,
) -> Result<(StatusCode, Json<SiteRegistration>), ApiError> {
    let trial_id = parse_trial_id(&id)?;
    let registration = state
        .trials
        .register_site_to_trial(RegisterSiteToTrial::new(trial_id, req.name, req.country))
        .await?;
    Ok((StatusCode::CREATED, Json(registration)))
}

/// GET /audit?entity=&entity_id=&limit=
#[tracing::instrument(skip(state, query))]
pub async fn audit(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Vec<AuditEntry>>, ApiError> {
    Ok(Json(state.trials.audit_log(&query).await?))
}
