//! Journaled workflow events.

use chrono::{DateTime, Utc};
use common::{TrialId, WorkflowId};
use saga::{OnboardingRequest, OnboardingStep, StepOutput};
use serde::{Deserialize, Serialize};

/// Events recorded in a workflow's journal stream. Replaying them in order
/// rebuilds the workflow instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum WorkflowEvent {
    /// The workflow was accepted.
    WorkflowStarted(WorkflowStartedData),

    /// A step's forward action finished and its output is cached.
    StepCompleted(StepCompletedData),

    /// Every step completed.
    WorkflowCompleted(WorkflowCompletedData),

    /// A step failed. Nothing is compensated.
    WorkflowFailed(WorkflowFailedData),
}

impl WorkflowEvent {
    /// Returns the journal entry type for this event.
    pub fn event_type(&self) -> &'static str {
        match self {
            WorkflowEvent::WorkflowStarted(_) => "WorkflowStarted",
            WorkflowEvent::StepCompleted(_) => "StepCompleted",
            WorkflowEvent::WorkflowCompleted(_) => "WorkflowCompleted",
            WorkflowEvent::WorkflowFailed(_) => "WorkflowFailed",
        }
    }

    pub fn started(workflow_id: WorkflowId, request: OnboardingRequest) -> Self {
        WorkflowEvent::WorkflowStarted(WorkflowStartedData {
            workflow_id,
            request,
            started_at: Utc::now(),
        })
    }

    pub fn step_completed(step_index: usize, step: OnboardingStep, output: StepOutput) -> Self {
        WorkflowEvent::StepCompleted(StepCompletedData {
            step_index,
            step,
            output,
            completed_at: Utc::now(),
        })
    }

    pub fn completed(trial_id: TrialId) -> Self {
        WorkflowEvent::WorkflowCompleted(WorkflowCompletedData {
            trial_id,
            completed_at: Utc::now(),
        })
    }

    pub fn failed(step_index: usize, step: OnboardingStep, error: impl Into<String>) -> Self {
        WorkflowEvent::WorkflowFailed(WorkflowFailedData {
            step_index,
            failed_step: step.failure_label().to_string(),
            error: error.into(),
            failed_at: Utc::now(),
        })
    }
}

/// Data for WorkflowStarted event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStartedData {
    pub workflow_id: WorkflowId,
    pub request: OnboardingRequest,
    pub started_at: DateTime<Utc>,
}

/// Data for StepCompleted event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCompletedData {
    /// Position of the step in the plan.
    pub step_index: usize,
    pub step: OnboardingStep,
    pub output: StepOutput,
    pub completed_at: DateTime<Utc>,
}

/// Data for WorkflowCompleted event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowCompletedData {
    pub trial_id: TrialId,
    pub completed_at: DateTime<Utc>,
}

/// Data for WorkflowFailed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowFailedData {
    pub step_index: usize,
    /// Coarse label of the failing step, e.g. `site_registration`.
    pub failed_step: String,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_types() {
        let id = WorkflowId::new();
        let started = WorkflowEvent::started(id, OnboardingRequest::new("A", "Phase I", "v1"));
        assert_eq!(started.event_type(), "WorkflowStarted");
        assert_eq!(
            WorkflowEvent::completed(TrialId::new()).event_type(),
            "WorkflowCompleted"
        );
    }

    #[test]
    fn failed_event_uses_step_label() {
        let event = WorkflowEvent::failed(3, OnboardingStep::RegisterSite { index: 1 }, "boom");
        let WorkflowEvent::WorkflowFailed(data) = event else {
            panic!("expected WorkflowFailed");
        };
        assert_eq!(data.failed_step, "site_registration");
        assert_eq!(data.step_index, 3);
    }

    #[test]
    fn events_are_tagged_by_type() {
        let event = WorkflowEvent::completed(TrialId::new());
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "WorkflowCompleted");
        let back: WorkflowEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
