//! Durable onboarding workflow: records each step before advancing.

use std::sync::Arc;

use common::WorkflowId;
use journal::{AppendOptions, Journal, JournalEntry, Sequence, StreamId};
use saga::{OnboardingRequest, SagaError};
use trials::{AuditSink, TrialError, TrialService, TrialStore};

use crate::error::{Result, WorkflowError};
use crate::events::WorkflowEvent;
use crate::instance::{NextAction, WorkflowInstance, WorkflowStatus};
use crate::progress::{ProgressEvent, ProgressPublisher};

/// Outcome of one `advance` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// A step or the completion was recorded; call again.
    Progressed,
    /// The workflow is terminal.
    Finished(WorkflowStatus),
}

/// Runs onboarding workflows against a journal.
///
/// Each `advance` call is one "execute the next step" instruction. It keeps no
/// state between calls: everything it needs is replayed from the journal, so
/// consecutive calls may run on different workers. A step whose completion is
/// recorded is never run again. A step that ran but whose record was lost is
/// re-run with the same idempotency key, which makes the storage return the
/// rows written by the first attempt.
pub struct OnboardingWorkflow<J, S, A, P>
where
    J: Journal,
    S: TrialStore,
    A: AuditSink,
    P: ProgressPublisher,
{
    journal: J,
    service: Arc<TrialService<S, A>>,
    publisher: P,
}

impl<J, S, A, P> OnboardingWorkflow<J, S, A, P>
where
    J: Journal,
    S: TrialStore,
    A: AuditSink,
    P: ProgressPublisher,
{
    pub fn new(journal: J, service: Arc<TrialService<S, A>>, publisher: P) -> Self {
        Self {
            journal,
            service,
            publisher,
        }
    }

    pub fn journal(&self) -> &J {
        &self.journal
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    /// Validates and records a new workflow. Does not run any step.
    #[tracing::instrument(skip(self, request), fields(name = %request.name))]
    pub async fn register(&self, request: OnboardingRequest) -> Result<WorkflowId> {
        if let Err(SagaError::Validation(msg)) = request.validate() {
            tracing::warn!(error = %msg, "onboarding request rejected");
            let error = TrialError::Validation(msg.clone());
            self.service
                .record_rejection("onboard_trial", "trial", &error)
                .await;
            return Err(WorkflowError::Validation(msg));
        }

        let workflow_id = WorkflowId::new();
        let event = WorkflowEvent::started(workflow_id, request);
        self.record(workflow_id, Sequence::initial(), &event).await?;

        metrics::counter!("workflow_started_total").increment(1);
        tracing::info!(%workflow_id, "workflow registered");
        Ok(workflow_id)
    }

    /// Replays a workflow from the journal.
    pub async fn load(&self, workflow_id: WorkflowId) -> Result<WorkflowInstance> {
        let entries = self.journal.read_stream(StreamId::from(workflow_id)).await?;
        if entries.is_empty() {
            return Err(WorkflowError::NotFound(workflow_id));
        }

        let mut events = Vec::with_capacity(entries.len());
        for entry in &entries {
            events.push((entry.sequence, entry.decode::<WorkflowEvent>()?));
        }
        WorkflowInstance::replay(events)
    }

    /// Executes the next unrecorded step, or records the terminal event.
    #[tracing::instrument(skip(self))]
    pub async fn advance(&self, workflow_id: WorkflowId) -> Result<Advance> {
        let instance = self.load(workflow_id).await?;

        match instance.next_action() {
            NextAction::Done => Ok(Advance::Finished(instance.status())),
            NextAction::Complete { trial_id } => {
                let event = WorkflowEvent::completed(trial_id);
                if self.record_and_publish(workflow_id, instance, &event).await? {
                    metrics::counter!("workflow_completed").increment(1);
                    tracing::info!(%workflow_id, %trial_id, "workflow completed");
                }
                Ok(Advance::Progressed)
            }
            NextAction::RunStep { index, step } => {
                if let Some(progress) = instance.starting_progress(&step) {
                    self.publish(workflow_id, progress).await;
                }

                let Some(request) = instance.request() else {
                    return Err(WorkflowError::NotFound(workflow_id));
                };
                let key = format!("{workflow_id}:{index}");
                let outcome = step
                    .run(&self.service, request, instance.results(), Some(key))
                    .await;

                let event = match outcome {
                    Ok(output) => WorkflowEvent::step_completed(index, step, output),
                    Err(error) => {
                        tracing::warn!(%workflow_id, step = %step, %error, "workflow step failed");
                        WorkflowEvent::failed(index, step, error.to_string())
                    }
                };
                let failed = matches!(event, WorkflowEvent::WorkflowFailed(_));

                if self.record_and_publish(workflow_id, instance, &event).await? {
                    if failed {
                        metrics::counter!("workflow_failed").increment(1);
                    } else {
                        metrics::counter!("workflow_steps_completed").increment(1);
                        tracing::debug!(%workflow_id, step = %step, "workflow step recorded");
                    }
                }
                Ok(Advance::Progressed)
            }
        }
    }

    /// Advances until the workflow is terminal.
    #[tracing::instrument(skip(self))]
    pub async fn drive(&self, workflow_id: WorkflowId) -> Result<WorkflowStatus> {
        loop {
            if let Advance::Finished(status) = self.advance(workflow_id).await? {
                return Ok(status);
            }
        }
    }

    /// Lists every workflow that is not terminal.
    pub async fn incomplete(&self) -> Result<Vec<WorkflowId>> {
        let streams = self
            .journal
            .list_streams(WorkflowInstance::STREAM_TYPE)
            .await?;

        let mut pending = Vec::new();
        for stream_id in streams {
            let workflow_id = WorkflowId::from(stream_id);
            match self.load(workflow_id).await {
                Ok(instance) if !instance.status().is_terminal() => pending.push(workflow_id),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(%workflow_id, error = %e, "skipping unreadable workflow");
                }
            }
        }
        Ok(pending)
    }

    /// Records an event and publishes the progress it produces.
    ///
    /// Returns false if another worker recorded this position first; the
    /// event is then dropped and the next `advance` replays the winner.
    async fn record_and_publish(
        &self,
        workflow_id: WorkflowId,
        mut instance: WorkflowInstance,
        event: &WorkflowEvent,
    ) -> Result<bool> {
        match self.record(workflow_id, instance.sequence(), event).await {
            Ok(_) => {}
            Err(WorkflowError::Journal(e)) if e.is_conflict() => {
                tracing::debug!(%workflow_id, "step recorded by another worker");
                return Ok(false);
            }
            Err(e) => return Err(e),
        }

        for progress in instance.apply(event)? {
            self.publish(workflow_id, progress).await;
        }
        Ok(true)
    }

    async fn record(
        &self,
        workflow_id: WorkflowId,
        current: Sequence,
        event: &WorkflowEvent,
    ) -> Result<Sequence> {
        let entry = JournalEntry::builder()
            .stream_id(StreamId::from(workflow_id))
            .stream_type(WorkflowInstance::STREAM_TYPE)
            .entry_type(event.event_type())
            .sequence(current.next())
            .payload(event)?
            .build()
            .ok_or_else(|| {
                WorkflowError::Journal(journal::JournalError::InvalidAppend(
                    "incomplete journal entry".to_string(),
                ))
            })?;

        Ok(self
            .journal
            .append(vec![entry], AppendOptions::expect_sequence(current))
            .await?)
    }

    async fn publish(&self, workflow_id: WorkflowId, event: ProgressEvent) {
        if let Err(e) = self.publisher.publish(workflow_id, event).await {
            tracing::warn!(%workflow_id, error = %e, "failed to publish progress");
        }
    }
}
