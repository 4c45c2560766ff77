//! Onboarding step registry.
//!
//! The canonical sequence is `create_trial`, `add_protocol`, then one
//! `register_site_{n}` per requested site. Each step has a forward action that
//! reads the request plus the outputs of earlier steps, and a compensation
//! built from its own output.
//!
//! Compensations tolerate state that is already rolled back: every delete
//! reports "nothing to delete" as success.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use trials::{
    AddProtocolVersion, AuditSink, CreateTrial, ProtocolVersion, RegisterSiteToTrial,
    SiteRegistration, Trial, TrialService, TrialStore,
};

use crate::error::StepError;
use crate::request::OnboardingRequest;

/// Name of the trial creation step.
pub const STEP_CREATE_TRIAL: &str = "create_trial";

/// Name of the protocol version step.
pub const STEP_ADD_PROTOCOL: &str = "add_protocol";

/// One step of the onboarding sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum OnboardingStep {
    CreateTrial,
    AddProtocolVersion,
    /// Registers the site at `index` (0-based) of the request's site list.
    RegisterSite { index: usize },
}

impl OnboardingStep {
    /// Returns the ordered steps for a request. Zero sites yields exactly
    /// the two trial steps.
    pub fn plan(request: &OnboardingRequest) -> Vec<OnboardingStep> {
        let mut steps = Vec::with_capacity(2 + request.sites.len());
        steps.push(OnboardingStep::CreateTrial);
        steps.push(OnboardingStep::AddProtocolVersion);
        steps.extend((0..request.sites.len()).map(|index| OnboardingStep::RegisterSite { index }));
        steps
    }

    /// Returns the step name, e.g. `register_site_2`.
    pub fn name(&self) -> String {
        match self {
            OnboardingStep::CreateTrial => STEP_CREATE_TRIAL.to_string(),
            OnboardingStep::AddProtocolVersion => STEP_ADD_PROTOCOL.to_string(),
            OnboardingStep::RegisterSite { index } => format!("register_site_{}", index + 1),
        }
    }

    /// Returns the name of the compensation that undoes this step.
    pub fn compensation_name(&self) -> String {
        match self {
            OnboardingStep::CreateTrial => "delete_trial".to_string(),
            OnboardingStep::AddProtocolVersion => "delete_protocol".to_string(),
            OnboardingStep::RegisterSite { index } => format!("unregister_site_{}", index + 1),
        }
    }

    /// Returns the coarse label reported when a durable workflow fails here.
    pub fn failure_label(&self) -> &'static str {
        match self {
            OnboardingStep::CreateTrial => "trial_creation",
            OnboardingStep::AddProtocolVersion => "protocol_creation",
            OnboardingStep::RegisterSite { .. } => "site_registration",
        }
    }

    /// Runs the forward action.
    ///
    /// When `idempotency_key` is set, a repeated call with the same key
    /// returns the rows written by the first call instead of writing again.
    pub async fn run<S, A>(
        &self,
        service: &TrialService<S, A>,
        request: &OnboardingRequest,
        prior: &PriorResults,
        idempotency_key: Option<String>,
    ) -> Result<StepOutput, StepError>
    where
        S: TrialStore,
        A: AuditSink,
    {
        match self {
            OnboardingStep::CreateTrial => {
                let mut cmd = CreateTrial::new(request.name.clone(), request.phase.clone());
                if let Some(key) = idempotency_key {
                    cmd = cmd.with_idempotency_key(key);
                }
                let trial = service.create_trial(cmd).await?;
                Ok(StepOutput::TrialCreated(trial))
            }
            OnboardingStep::AddProtocolVersion => {
                let trial = prior
                    .trial()
                    .ok_or(StepError::MissingPrior(STEP_CREATE_TRIAL))?;
                let mut cmd =
                    AddProtocolVersion::new(trial.id, request.initial_protocol_version.clone())
                        .with_notes(format!("Initial protocol for {}", request.name));
                if let Some(key) = idempotency_key {
                    cmd = cmd.with_idempotency_key(key);
                }
                let protocol = service.add_protocol_version(cmd).await?;
                Ok(StepOutput::ProtocolAdded(protocol))
            }
            OnboardingStep::RegisterSite { index } => {
                let trial = prior
                    .trial()
                    .ok_or(StepError::MissingPrior(STEP_CREATE_TRIAL))?;
                let site = request.sites.get(*index).ok_or_else(|| {
                    StepError::Aborted(format!("request has no site at position {}", index + 1))
                })?;
                let mut cmd =
                    RegisterSiteToTrial::new(trial.id, site.name.clone(), site.country.clone());
                if let Some(key) = idempotency_key {
                    cmd = cmd.with_idempotency_key(key);
                }
                let registration = service.register_site_to_trial(cmd).await?;
                Ok(StepOutput::SiteRegistered(registration))
            }
        }
    }
}

impl std::fmt::Display for OnboardingStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name())
    }
}

/// Output of a successful forward action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum StepOutput {
    TrialCreated(Trial),
    ProtocolAdded(ProtocolVersion),
    SiteRegistered(SiteRegistration),
}

impl StepOutput {
    /// Builds the compensation that undoes this output.
    pub fn compensation<S, A>(&self, service: Arc<TrialService<S, A>>) -> Compensation
    where
        S: TrialStore + 'static,
        A: AuditSink + 'static,
    {
        match self {
            StepOutput::TrialCreated(trial) => {
                let trial_id = trial.id;
                Box::new(move || {
                    Box::pin(async move {
                        service
                            .delete_trial(trial_id)
                            .await
                            .map(|_| ())
                            .map_err(StepError::from)
                    })
                })
            }
            StepOutput::ProtocolAdded(protocol) => {
                let id = protocol.id;
                Box::new(move || {
                    Box::pin(async move {
                        service
                            .delete_protocol_version(id)
                            .await
                            .map(|_| ())
                            .map_err(StepError::from)
                    })
                })
            }
            StepOutput::SiteRegistered(registration) => {
                let trial_id = registration.link.trial_id;
                let site_id = registration.link.site_id;
                Box::new(move || {
                    Box::pin(async move {
                        service
                            .unregister_site(trial_id, site_id)
                            .await
                            .map(|_| ())
                            .map_err(StepError::from)
                    })
                })
            }
        }
    }
}

/// Undo action for one completed step. Runs at most once.
pub type Compensation = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), StepError>> + Send>;

/// Outputs of the steps completed so far, in completion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PriorResults {
    outputs: Vec<StepOutput>,
}

impl PriorResults {
    /// Creates an empty result set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends the output of the step that just completed.
    pub fn push(&mut self, output: StepOutput) {
        self.outputs.push(output);
    }

    /// Returns the created trial, once the first step has run.
    pub fn trial(&self) -> Option<&Trial> {
        self.outputs.iter().find_map(|o| match o {
            StepOutput::TrialCreated(t) => Some(t),
            _ => None,
        })
    }

    /// Returns the number of recorded outputs.
    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    /// Returns true if no step has completed.
    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    /// Iterates over the recorded outputs.
    pub fn iter(&self) -> impl Iterator<Item = &StepOutput> {
        self.outputs.iter()
    }
}

impl FromIterator<StepOutput> for PriorResults {
    fn from_iter<I: IntoIterator<Item = StepOutput>>(iter: I) -> Self {
        Self {
            outputs: iter.into_iter().collect(),
        }
    }
}
