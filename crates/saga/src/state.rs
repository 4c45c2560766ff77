//! Saga execution state: lifecycle plus the compensation stack.

use serde::{Deserialize, Serialize};

use crate::steps::{Compensation, OnboardingStep, PriorResults, StepOutput};

/// The state of a saga in its lifecycle.
///
/// State transitions:
/// ```text
/// NotStarted ──► Running ──┬──► Completed
///                          └──► Compensating ──► Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SagaState {
    #[default]
    NotStarted,
    Running,
    /// A step failed and the stack is being unwound.
    Compensating,
    /// All steps completed (terminal).
    Completed,
    /// Compensation finished after a failure (terminal).
    Failed,
}

impl SagaState {
    /// Returns true if the saga can begin running.
    pub fn can_run(&self) -> bool {
        matches!(self, SagaState::NotStarted)
    }

    /// Returns true if the saga can begin compensation.
    pub fn can_compensate(&self) -> bool {
        matches!(self, SagaState::Running)
    }

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SagaState::Completed | SagaState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SagaState::NotStarted => "NotStarted",
            SagaState::Running => "Running",
            SagaState::Compensating => "Compensating",
            SagaState::Completed => "Completed",
            SagaState::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for SagaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A completed step paired with its undo action.
pub struct CompletedStep {
    pub step: OnboardingStep,
    pub compensation: Compensation,
}

impl std::fmt::Debug for CompletedStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletedStep")
            .field("step", &self.step)
            .finish_non_exhaustive()
    }
}

/// In-memory state of one `execute` call. Never persisted and never shared
/// between calls.
#[derive(Debug, Default)]
pub struct SagaExecution {
    state: SagaState,
    results: PriorResults,
    stack: Vec<CompletedStep>,
}

impl SagaExecution {
    /// Creates an execution that has not started.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SagaState {
        self.state
    }

    /// Outputs of the completed steps, for the next forward action.
    pub fn results(&self) -> &PriorResults {
        &self.results
    }

    /// Moves to `Running`. Returns false if the saga already started.
    pub fn start(&mut self) -> bool {
        if !self.state.can_run() {
            return false;
        }
        self.state = SagaState::Running;
        true
    }

    /// Records a completed step and pushes its compensation.
    pub fn record(&mut self, step: OnboardingStep, output: StepOutput, compensation: Compensation) {
        self.results.push(output);
        self.stack.push(CompletedStep { step, compensation });
    }

    /// Names of the completed steps, in completion order.
    pub fn completed_names(&self) -> Vec<String> {
        self.stack.iter().map(|c| c.step.name()).collect()
    }

    /// Marks the saga completed.
    pub fn complete(&mut self) {
        self.state = SagaState::Completed;
    }

    /// Moves to `Compensating` and hands over the stack in unwind order
    /// (most recent step first).
    pub fn begin_compensation(&mut self) -> Vec<CompletedStep> {
        if self.state.can_compensate() {
            self.state = SagaState::Compensating;
        }
        let mut stack = std::mem::take(&mut self.stack);
        stack.reverse();
        stack
    }

    /// Marks the saga failed after compensation.
    pub fn fail(&mut self) {
        self.state = SagaState::Failed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trials::{Phase, Trial};

    fn noop() -> Compensation {
        Box::new(|| Box::pin(async { Ok(()) }))
    }

    #[test]
    fn default_state_is_not_started() {
        assert_eq!(SagaState::default(), SagaState::NotStarted);
        assert!(SagaState::NotStarted.can_run());
        assert!(!SagaState::Running.can_run());
    }

    #[test]
    fn only_running_can_compensate() {
        assert!(SagaState::Running.can_compensate());
        assert!(!SagaState::NotStarted.can_compensate());
        assert!(!SagaState::Completed.can_compensate());
    }

    #[test]
    fn terminal_states() {
        assert!(SagaState::Completed.is_terminal());
        assert!(SagaState::Failed.is_terminal());
        assert!(!SagaState::Compensating.is_terminal());
        assert_eq!(SagaState::Compensating.to_string(), "Compensating");
    }

    #[test]
    fn stack_unwinds_most_recent_first() {
        let mut execution = SagaExecution::new();
        assert!(execution.start());
        assert!(!execution.start());

        let trial = Trial::new("Aspirin", Phase::PhaseI);
        execution.record(
            OnboardingStep::CreateTrial,
            StepOutput::TrialCreated(trial.clone()),
            noop(),
        );
        execution.record(
            OnboardingStep::RegisterSite { index: 0 },
            StepOutput::TrialCreated(trial),
            noop(),
        );
        assert_eq!(
            execution.completed_names(),
            vec!["create_trial", "register_site_1"]
        );

        let unwind = execution.begin_compensation();
        assert_eq!(execution.state(), SagaState::Compensating);
        let order: Vec<_> = unwind.iter().map(|c| c.step.name()).collect();
        assert_eq!(order, vec!["register_site_1", "create_trial"]);
        assert!(execution.completed_names().is_empty());
        assert!(execution.results().trial().is_some());

        execution.fail();
        assert!(execution.state().is_terminal());
    }
}
