//! Onboarding request and result.

use common::TrialId;
use serde::{Deserialize, Serialize};
use trials::Phase;

use crate::error::{CompensationFailure, SagaError};

/// A site to register during onboarding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteInput {
    pub name: String,
    pub country: String,
}

impl SiteInput {
    /// Creates a new site input.
    pub fn new(name: impl Into<String>, country: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            country: country.into(),
        }
    }
}

/// Everything needed to onboard a trial: the trial itself, its first
/// protocol version and the sites to register.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnboardingRequest {
    pub name: String,
    pub phase: String,
    pub initial_protocol_version: String,
    #[serde(default)]
    pub sites: Vec<SiteInput>,
}

impl OnboardingRequest {
    /// Creates a request with no sites.
    pub fn new(
        name: impl Into<String>,
        phase: impl Into<String>,
        initial_protocol_version: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            phase: phase.into(),
            initial_protocol_version: initial_protocol_version.into(),
            sites: Vec::new(),
        }
    }

    /// Adds a site.
    pub fn with_site(mut self, name: impl Into<String>, country: impl Into<String>) -> Self {
        self.sites.push(SiteInput::new(name, country));
        self
    }

    /// Checks the request before any step runs.
    pub fn validate(&self) -> Result<(), SagaError> {
        if self.name.trim().is_empty() {
            return Err(SagaError::Validation(
                "Trial name must not be empty".to_string(),
            ));
        }
        self.phase
            .parse::<Phase>()
            .map_err(|e| match e {
                trials::TrialError::Validation(msg) => SagaError::Validation(msg),
                other => SagaError::Validation(other.to_string()),
            })?;
        if self.initial_protocol_version.trim().is_empty() {
            return Err(SagaError::Validation(
                "Initial protocol version must not be empty".to_string(),
            ));
        }
        for (i, site) in self.sites.iter().enumerate() {
            if site.name.trim().is_empty() || site.country.trim().is_empty() {
                return Err(SagaError::Validation(format!(
                    "Site {} must have a name and a country",
                    i + 1
                )));
            }
        }
        Ok(())
    }
}

/// Outcome of a synchronous onboarding attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OnboardingResult {
    pub success: bool,
    /// Set on success. A failed attempt has been rolled back, so there is no
    /// trial to point at.
    pub trial_id: Option<TrialId>,
    pub message: String,
    /// Names of the steps that completed before success or failure.
    pub steps_completed: Vec<String>,
    /// Compensations that failed during rollback. Empty unless the rollback
    /// itself went wrong.
    pub compensation_failures: Vec<CompensationFailure>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_request_passes() {
        let request = OnboardingRequest::new("Aspirin", "PHASE_I", "v1.0")
            .with_site("Mayo", "US")
            .with_site("Charite", "DE");
        assert!(request.validate().is_ok());
    }

    #[test]
    fn zero_sites_is_valid() {
        assert!(OnboardingRequest::new("Aspirin", "Phase I", "v1.0")
            .validate()
            .is_ok());
    }

    #[test]
    fn invalid_phase_is_a_validation_error() {
        let err = OnboardingRequest::new("Aspirin", "Phase 9", "v1.0")
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("Invalid phase: Phase 9"));
    }

    #[test]
    fn blank_fields_are_rejected() {
        assert!(
            OnboardingRequest::new(" ", "Phase I", "v1.0")
                .validate()
                .is_err()
        );
        assert!(
            OnboardingRequest::new("A", "Phase I", "")
                .validate()
                .is_err()
        );
        let err = OnboardingRequest::new("A", "Phase I", "v1")
            .with_site("Mayo", "")
            .validate()
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Validation error: Site 1 must have a name and a country"
        );
    }

    #[test]
    fn sites_default_to_empty_when_deserializing() {
        let request: OnboardingRequest = serde_json::from_value(serde_json::json!({
            "name": "Aspirin",
            "phase": "Phase I",
            "initial_protocol_version": "v1.0"
        }))
        .unwrap();
        assert!(request.sites.is_empty());
    }
}
