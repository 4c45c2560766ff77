//! In-process execution backend for onboarding workflows.

use std::sync::Arc;

use common::WorkflowId;
use journal::Journal;
use saga::OnboardingRequest;
use tokio::task::JoinHandle;
use trials::{AuditSink, TrialStore};

use crate::error::Result;
use crate::instance::{WorkflowStatus, WorkflowSummary};
use crate::progress::ProgressPublisher;
use crate::workflow::OnboardingWorkflow;

/// Drives workflows on background tasks.
///
/// `start` returns as soon as the workflow is recorded. If the process dies
/// mid-way, `resume_incomplete` on the next start re-drives every workflow
/// the journal still shows as running.
pub struct WorkflowEngine<J, S, A, P>
where
    J: Journal,
    S: TrialStore,
    A: AuditSink,
    P: ProgressPublisher,
{
    workflow: Arc<OnboardingWorkflow<J, S, A, P>>,
}

impl<J, S, A, P> Clone for WorkflowEngine<J, S, A, P>
where
    J: Journal,
    S: TrialStore,
    A: AuditSink,
    P: ProgressPublisher,
{
    fn clone(&self) -> Self {
        Self {
            workflow: Arc::clone(&self.workflow),
        }
    }
}

impl<J, S, A, P> WorkflowEngine<J, S, A, P>
where
    J: Journal + 'static,
    S: TrialStore + 'static,
    A: AuditSink + 'static,
    P: ProgressPublisher + 'static,
{
    pub fn new(workflow: OnboardingWorkflow<J, S, A, P>) -> Self {
        Self {
            workflow: Arc::new(workflow),
        }
    }

    /// Returns the underlying workflow adapter.
    pub fn workflow(&self) -> &OnboardingWorkflow<J, S, A, P> {
        &self.workflow
    }

    /// Records a workflow and starts driving it in the background.
    pub async fn start(&self, request: OnboardingRequest) -> Result<WorkflowId> {
        let workflow_id = self.workflow.register(request).await?;
        self.spawn_drive(workflow_id);
        Ok(workflow_id)
    }

    /// Drives a workflow to a terminal state on a background task.
    ///
    /// An infrastructure error stops the task and leaves the workflow
    /// running in the journal.
    pub fn spawn_drive(&self, workflow_id: WorkflowId) -> JoinHandle<Result<WorkflowStatus>> {
        let workflow = Arc::clone(&self.workflow);
        tokio::spawn(async move {
            let outcome = workflow.drive(workflow_id).await;
            if let Err(e) = &outcome {
                tracing::error!(%workflow_id, error = %e, "workflow driver stopped");
            }
            outcome
        })
    }

    /// Re-drives every workflow the journal shows as running. Returns their
    /// IDs.
    #[tracing::instrument(skip(self))]
    pub async fn resume_incomplete(&self) -> Result<Vec<WorkflowId>> {
        let pending = self.workflow.incomplete().await?;
        for workflow_id in &pending {
            tracing::info!(%workflow_id, "resuming workflow");
            self.spawn_drive(*workflow_id);
        }
        Ok(pending)
    }

    /// Returns a workflow's current status.
    pub async fn status(&self, workflow_id: WorkflowId) -> Result<WorkflowSummary> {
        let instance = self.workflow.load(workflow_id).await?;
        instance
            .summary()
            .ok_or(crate::WorkflowError::NotFound(workflow_id))
    }
}
