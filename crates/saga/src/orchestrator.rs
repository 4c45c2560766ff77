//! Synchronous onboarding saga.

use std::sync::Arc;
use std::time::Instant;

use trials::{AuditSink, TrialError, TrialService, TrialStore};

use crate::error::{CompensationFailure, SagaError, StepError};
use crate::request::{OnboardingRequest, OnboardingResult};
use crate::state::{CompletedStep, SagaExecution};
use crate::steps::OnboardingStep;

/// Runs the onboarding steps in order on the caller's task and unwinds the
/// compensation stack when one of them fails.
///
/// The orchestrator holds no state between calls and takes no locks.
pub struct SagaOrchestrator<S: TrialStore, A: AuditSink> {
    service: Arc<TrialService<S, A>>,
}

impl<S: TrialStore, A: AuditSink> Clone for SagaOrchestrator<S, A> {
    fn clone(&self) -> Self {
        Self {
            service: Arc::clone(&self.service),
        }
    }
}

impl<S, A> SagaOrchestrator<S, A>
where
    S: TrialStore + 'static,
    A: AuditSink + 'static,
{
    /// Creates an orchestrator over a shared trial service.
    pub fn new(service: Arc<TrialService<S, A>>) -> Self {
        Self { service }
    }

    /// Returns the trial service the steps run against.
    pub fn service(&self) -> &Arc<TrialService<S, A>> {
        &self.service
    }

    /// Onboards a trial.
    ///
    /// Returns `Err` only when the request is invalid, in which case no step
    /// ran. A failing step produces `Ok` with `success == false` after every
    /// completed step has been compensated.
    #[tracing::instrument(
        skip(self, request),
        fields(name = %request.name, sites = request.sites.len())
    )]
    pub async fn execute(&self, request: OnboardingRequest) -> Result<OnboardingResult, SagaError> {
        if let Err(SagaError::Validation(msg)) = request.validate() {
            tracing::warn!(error = %msg, "onboarding request rejected");
            let error = TrialError::Validation(msg.clone());
            self.service
                .record_rejection("onboard_trial", "trial", &error)
                .await;
            return Err(SagaError::Validation(msg));
        }

        metrics::counter!("saga_executions_total").increment(1);
        let started = Instant::now();

        let mut execution = SagaExecution::new();
        execution.start();

        for step in OnboardingStep::plan(&request) {
            tracing::debug!(step = %step, "saga step started");
            match step
                .run(&self.service, &request, execution.results(), None)
                .await
            {
                Ok(output) => {
                    let compensation = output.compensation(Arc::clone(&self.service));
                    execution.record(step, output, compensation);
                }
                Err(error) => {
                    tracing::warn!(step = %step, %error, "saga step failed");
                    let result = self.unwind(&mut execution, step, error).await;
                    metrics::histogram!("saga_duration_seconds")
                        .record(started.elapsed().as_secs_f64());
                    return Ok(result);
                }
            }
        }

        execution.complete();
        let trial_id = execution.results().trial().map(|t| t.id);
        let duration = started.elapsed().as_secs_f64();
        metrics::histogram!("saga_duration_seconds").record(duration);
        metrics::counter!("saga_completed").increment(1);
        tracing::info!(?trial_id, duration, "saga completed");

        Ok(OnboardingResult {
            success: true,
            trial_id,
            message: format!(
                "Successfully onboarded trial '{}' with {} sites",
                request.name,
                request.sites.len()
            ),
            steps_completed: execution.completed_names(),
            compensation_failures: Vec::new(),
        })
    }

    /// Pops and runs every compensation, most recent first, and builds the
    /// failure result.
    async fn unwind(
        &self,
        execution: &mut SagaExecution,
        failed: OnboardingStep,
        error: StepError,
    ) -> OnboardingResult {
        let steps_completed = execution.completed_names();
        let stack = execution.begin_compensation();

        // The unwind runs on its own task so that dropping the caller's
        // future cannot stop it halfway.
        let failures = match tokio::spawn(run_compensations(stack)).await {
            Ok(failures) => failures,
            Err(join_error) => vec![CompensationFailure {
                step: "compensation".to_string(),
                error: StepError::Aborted(join_error.to_string()).to_string(),
            }],
        };
        execution.fail();
        metrics::counter!("saga_compensated").increment(1);

        let mut message = format!("Saga failed at step '{}': {}", failed.name(), error);
        if !failures.is_empty() {
            let joined = failures
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            message.push_str(&format!(". Compensation errors: {joined}"));
        }

        OnboardingResult {
            success: false,
            trial_id: None,
            message,
            steps_completed,
            compensation_failures: failures,
        }
    }
}

/// Runs compensations in the given order. A failing compensation is logged
/// and collected; the remaining ones still run.
async fn run_compensations(stack: Vec<CompletedStep>) -> Vec<CompensationFailure> {
    let mut failures = Vec::new();
    for CompletedStep { step, compensation } in stack {
        let name = step.compensation_name();
        match compensation().await {
            Ok(()) => tracing::info!(compensation = %name, "compensation completed"),
            Err(error) => {
                metrics::counter!("saga_compensation_failures").increment(1);
                tracing::error!(compensation = %name, %error, "compensation failed");
                failures.push(CompensationFailure {
                    step: name,
                    error: error.to_string(),
                });
            }
        }
    }
    failures
}
