//! Durable workflow instance.
//!
//! The instance is rebuilt by folding journaled events. `apply` is a pure
//! transition: it updates the state and returns the progress events the
//! transition produces, without performing any I/O. `next_action` is the
//! pure decision of what the driver should do next.

use chrono::{DateTime, Utc};
use common::{TrialId, WorkflowId};
use journal::Sequence;
use saga::{OnboardingRequest, OnboardingStep, PriorResults, StepOutput};
use serde::{Deserialize, Serialize};

use crate::error::{Result, WorkflowError};
use crate::events::WorkflowEvent;
use crate::progress::{ProgressEvent, ProgressStatus, SiteProgress};

/// Status of a durable workflow.
///
/// ```text
/// RUNNING ──┬──► COMPLETED
///           └──► FAILED
/// ```
/// Both terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    #[default]
    Running,
    Completed,
    Failed,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowStatus::Completed | WorkflowStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Running => "RUNNING",
            WorkflowStatus::Completed => "COMPLETED",
            WorkflowStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What the driver should do next.
#[derive(Debug, Clone, PartialEq)]
pub enum NextAction {
    /// Run the step at `index`; its completion is not recorded yet.
    RunStep { index: usize, step: OnboardingStep },
    /// Every step is recorded; record completion.
    Complete { trial_id: TrialId },
    /// The workflow is terminal.
    Done,
}

/// Event-sourced state of one onboarding workflow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    id: Option<WorkflowId>,
    sequence: Sequence,
    status: WorkflowStatus,
    request: Option<OnboardingRequest>,
    plan: Vec<OnboardingStep>,
    results: PriorResults,
    step_index: usize,
    trial_id: Option<TrialId>,
    failed_step: Option<String>,
    error: Option<String>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl WorkflowInstance {
    /// Journal stream type for workflow streams.
    pub const STREAM_TYPE: &'static str = "OnboardingWorkflow";

    /// Rebuilds an instance from its events, in journal order.
    pub fn replay(events: impl IntoIterator<Item = (Sequence, WorkflowEvent)>) -> Result<Self> {
        let mut instance = Self::default();
        for (sequence, event) in events {
            instance.apply(&event)?;
            instance.sequence = sequence;
        }
        Ok(instance)
    }

    /// Applies one event and returns the progress it produces.
    pub fn apply(&mut self, event: &WorkflowEvent) -> Result<Vec<ProgressEvent>> {
        let invalid = |status| WorkflowError::InvalidTransition {
            status,
            event: event.event_type(),
        };

        if let WorkflowEvent::WorkflowStarted(data) = event {
            if self.id.is_some() {
                return Err(invalid(self.status));
            }
            self.id = Some(data.workflow_id);
            self.status = WorkflowStatus::Running;
            self.plan = OnboardingStep::plan(&data.request);
            self.request = Some(data.request.clone());
            self.started_at = Some(data.started_at);
            return Ok(Vec::new());
        }

        let workflow_id = self.id.ok_or_else(|| invalid(self.status))?;
        if self.status.is_terminal() {
            return Err(invalid(self.status));
        }

        let progress = match event {
            WorkflowEvent::WorkflowStarted(_) => Vec::new(),
            WorkflowEvent::StepCompleted(data) => {
                if data.step_index != self.step_index
                    || self.plan.get(data.step_index) != Some(&data.step)
                {
                    return Err(invalid(self.status));
                }
                self.results.push(data.output.clone());
                self.step_index += 1;
                if let StepOutput::TrialCreated(trial) = &data.output {
                    self.trial_id = Some(trial.id);
                }
                let done = self.completion_progress(workflow_id, &data.step, &data.output);
                vec![done]
            }
            WorkflowEvent::WorkflowCompleted(data) => {
                self.status = WorkflowStatus::Completed;
                self.trial_id = Some(data.trial_id);
                self.finished_at = Some(data.completed_at);
                self.terminal_progress().into_iter().collect()
            }
            WorkflowEvent::WorkflowFailed(data) => {
                self.status = WorkflowStatus::Failed;
                self.failed_step = Some(data.failed_step.clone());
                self.error = Some(data.error.clone());
                self.finished_at = Some(data.failed_at);
                self.terminal_progress().into_iter().collect()
            }
        };
        Ok(progress)
    }

    /// The last progress event of a finished workflow, rebuilt from its
    /// recorded state. `None` while it is running.
    pub fn terminal_progress(&self) -> Option<ProgressEvent> {
        let workflow_id = self.id?;
        match self.status {
            WorkflowStatus::Running => None,
            WorkflowStatus::Completed => {
                let (name, sites) = self
                    .request
                    .as_ref()
                    .map(|r| (r.name.as_str(), r.sites.len()))
                    .unwrap_or_default();
                Some(
                    ProgressEvent::new(
                        workflow_id,
                        ProgressStatus::Completed,
                        format!("Successfully onboarded trial '{name}' with {sites} sites"),
                    )
                    .with_trial(self.results.trial()),
                )
            }
            WorkflowStatus::Failed => {
                let step = self.failed_step.clone().unwrap_or_default();
                let error = self.error.clone().unwrap_or_default();
                Some(
                    ProgressEvent::new(
                        workflow_id,
                        ProgressStatus::Failed,
                        format!("Workflow failed during {step}: {error}"),
                    )
                    .with_trial(self.results.trial())
                    .with_error(step, error),
                )
            }
        }
    }

    /// Decides the next action. Pure.
    pub fn next_action(&self) -> NextAction {
        if self.status.is_terminal() || self.id.is_none() {
            return NextAction::Done;
        }
        if let Some(step) = self.plan.get(self.step_index) {
            return NextAction::RunStep {
                index: self.step_index,
                step: *step,
            };
        }
        match self.results.trial() {
            Some(trial) => NextAction::Complete { trial_id: trial.id },
            None => NextAction::Done,
        }
    }

    /// Progress announcing that a step is about to run.
    pub fn starting_progress(&self, step: &OnboardingStep) -> Option<ProgressEvent> {
        let workflow_id = self.id?;
        let request = self.request.as_ref()?;
        let event = match step {
            OnboardingStep::CreateTrial => ProgressEvent::new(
                workflow_id,
                ProgressStatus::CreatingTrial,
                "Creating trial...",
            ),
            OnboardingStep::AddProtocolVersion => ProgressEvent::new(
                workflow_id,
                ProgressStatus::ProtocolAdding,
                format!(
                    "Adding protocol version {}...",
                    request.initial_protocol_version
                ),
            ),
            OnboardingStep::RegisterSite { index } => {
                let progress = self.site_progress(*index)?;
                ProgressEvent::new(
                    workflow_id,
                    ProgressStatus::SiteRegistering,
                    format!(
                        "Registering site {} ({}/{})...",
                        progress.site_name, progress.current_site_index, progress.total_sites
                    ),
                )
                .with_site_progress(progress)
            }
        };
        Some(event.with_trial(self.results.trial()))
    }

    fn completion_progress(
        &self,
        workflow_id: WorkflowId,
        step: &OnboardingStep,
        output: &StepOutput,
    ) -> ProgressEvent {
        let event = match (step, output) {
            (_, StepOutput::TrialCreated(trial)) => ProgressEvent::new(
                workflow_id,
                ProgressStatus::TrialCreated,
                format!("Trial '{}' created with ID {}", trial.name, trial.id),
            ),
            (_, StepOutput::ProtocolAdded(protocol)) => ProgressEvent::new(
                workflow_id,
                ProgressStatus::ProtocolAdded,
                format!("Protocol version {} added to trial", protocol.version),
            ),
            (
                OnboardingStep::RegisterSite { index },
                StepOutput::SiteRegistered(registration),
            ) => {
                let total = self.request.as_ref().map_or(0, |r| r.sites.len());
                let progress = SiteProgress {
                    current_site_index: index + 1,
                    total_sites: total,
                    site_name: registration.site.name.clone(),
                };
                ProgressEvent::new(
                    workflow_id,
                    ProgressStatus::SiteRegistered,
                    format!(
                        "Site {} registered successfully ({}/{})",
                        progress.site_name, progress.current_site_index, progress.total_sites
                    ),
                )
                .with_site_progress(progress)
            }
            (_, StepOutput::SiteRegistered(registration)) => ProgressEvent::new(
                workflow_id,
                ProgressStatus::SiteRegistered,
                format!("Site {} registered successfully", registration.site.name),
            ),
        };
        event.with_trial(self.results.trial())
    }

    fn site_progress(&self, index: usize) -> Option<SiteProgress> {
        let request = self.request.as_ref()?;
        let site = request.sites.get(index)?;
        Some(SiteProgress {
            current_site_index: index + 1,
            total_sites: request.sites.len(),
            site_name: site.name.clone(),
        })
    }

    pub fn id(&self) -> Option<WorkflowId> {
        self.id
    }

    /// Journal position of the last applied event.
    pub fn sequence(&self) -> Sequence {
        self.sequence
    }

    pub fn status(&self) -> WorkflowStatus {
        self.status
    }

    pub fn request(&self) -> Option<&OnboardingRequest> {
        self.request.as_ref()
    }

    /// Cached outputs of the recorded steps.
    pub fn results(&self) -> &PriorResults {
        &self.results
    }

    /// Index of the next step to run; equals the number of recorded steps.
    pub fn step_index(&self) -> usize {
        self.step_index
    }

    pub fn total_steps(&self) -> usize {
        self.plan.len()
    }

    pub fn trial_id(&self) -> Option<TrialId> {
        self.trial_id
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn failed_step(&self) -> Option<&str> {
        self.failed_step.as_deref()
    }

    /// Returns a flat view for status queries.
    pub fn summary(&self) -> Option<WorkflowSummary> {
        Some(WorkflowSummary {
            workflow_id: self.id?,
            status: self.status,
            current_step: self.step_index,
            total_steps: self.plan.len(),
            trial_id: self.trial_id,
            failed_step: self.failed_step.clone(),
            error: self.error.clone(),
            started_at: self.started_at?,
            finished_at: self.finished_at,
        })
    }
}

/// Status view of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub workflow_id: WorkflowId,
    pub status: WorkflowStatus,
    pub current_step: usize,
    pub total_steps: usize,
    pub trial_id: Option<TrialId>,
    pub failed_step: Option<String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}
