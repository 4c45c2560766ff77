//! Request handlers, one module per resource.

pub mod onboarding;
pub mod system;
pub mod trials;
pub mod workflows;

use common::{TrialId, WorkflowId};

use crate::error::ApiError;

pub(crate) fn parse_trial_id(id: &str) -> Result<TrialId, ApiError> {
    id.parse()
        .map_err(|e| ApiError::BadRequest(format!("Invalid trial ID: {e}")))
}

pub(crate) fn parse_workflow_id(id: &str) -> Result<WorkflowId, ApiError> {
    id.parse()
        .map_err(|e| ApiError::BadRequest(format!("Invalid workflow ID: {e}")))
}
