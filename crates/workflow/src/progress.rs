//! Progress events and their publishers.
//!
//! Delivery is at-least-once per active subscription. A subscriber that joins
//! late sees only the events published after it subscribed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{TrialId, WorkflowId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use trials::{Phase, Trial};

/// Fine-grained status carried by a progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    CreatingTrial,
    TrialCreated,
    ProtocolAdding,
    ProtocolAdded,
    SiteRegistering,
    SiteRegistered,
    Completed,
    Failed,
}

impl ProgressStatus {
    /// Returns true for the statuses that end a progress stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressStatus::Completed | ProgressStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressStatus::CreatingTrial => "creating_trial",
            ProgressStatus::TrialCreated => "trial_created",
            ProgressStatus::ProtocolAdding => "protocol_adding",
            ProgressStatus::ProtocolAdded => "protocol_added",
            ProgressStatus::SiteRegistering => "site_registering",
            ProgressStatus::SiteRegistered => "site_registered",
            ProgressStatus::Completed => "completed",
            ProgressStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trial summary attached to progress once the trial exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialSnapshot {
    pub id: TrialId,
    pub name: String,
    pub phase: Phase,
}

impl From<&Trial> for TrialSnapshot {
    fn from(trial: &Trial) -> Self {
        Self {
            id: trial.id,
            name: trial.name.clone(),
            phase: trial.phase,
        }
    }
}

/// Position within the site registration steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteProgress {
    /// 1-based.
    pub current_site_index: usize,
    pub total_sites: usize,
    pub site_name: String,
}

/// Failure details on a `failed` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressError {
    pub failed_step: String,
    pub error_message: String,
}

/// One progress notification for a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub workflow_id: WorkflowId,
    pub status: ProgressStatus,
    pub message: String,
    pub trial_id: Option<TrialId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trial: Option<TrialSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site_progress: Option<SiteProgress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ProgressError>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    /// Creates an event with only a status and a message.
    pub fn new(
        workflow_id: WorkflowId,
        status: ProgressStatus,
        message: impl Into<String>,
    ) -> Self {
        Self {
            workflow_id,
            status,
            message: message.into(),
            trial_id: None,
            trial: None,
            site_progress: None,
            error: None,
            timestamp: Utc::now(),
        }
    }

    /// Attaches the trial. Also sets `trial_id`.
    pub fn with_trial(mut self, trial: Option<&Trial>) -> Self {
        if let Some(trial) = trial {
            self.trial_id = Some(trial.id);
            self.trial = Some(TrialSnapshot::from(trial));
        }
        self
    }

    pub fn with_site_progress(mut self, progress: SiteProgress) -> Self {
        self.site_progress = Some(progress);
        self
    }

    pub fn with_error(
        mut self,
        failed_step: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        self.error = Some(ProgressError {
            failed_step: failed_step.into(),
            error_message: message.into(),
        });
        self
    }

    /// Returns true if no further event follows this one.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// A progress event could not be handed to the transport.
#[derive(Debug, Error)]
#[error("Progress publish failed: {0}")]
pub struct PublishError(pub String);

/// Fan-out of progress events to the subscribers of a workflow.
#[async_trait]
pub trait ProgressPublisher: Send + Sync {
    async fn publish(
        &self,
        workflow_id: WorkflowId,
        event: ProgressEvent,
    ) -> Result<(), PublishError>;
}

#[async_trait]
impl<T: ProgressPublisher + ?Sized> ProgressPublisher for Arc<T> {
    async fn publish(
        &self,
        workflow_id: WorkflowId,
        event: ProgressEvent,
    ) -> Result<(), PublishError> {
        (**self).publish(workflow_id, event).await
    }
}

/// In-process publisher backed by one broadcast channel per workflow.
///
/// The channel is dropped after a terminal event; receivers still drain what
/// was sent before and then observe the channel as closed.
#[derive(Debug, Clone)]
pub struct BroadcastPublisher {
    channels: Arc<RwLock<HashMap<WorkflowId, broadcast::Sender<ProgressEvent>>>>,
    capacity: usize,
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

impl BroadcastPublisher {
    /// Buffered events per workflow before slow subscribers start lagging.
    pub const DEFAULT_CAPACITY: usize = 64;

    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Subscribes to a workflow's future events.
    pub fn subscribe(&self, workflow_id: WorkflowId) -> broadcast::Receiver<ProgressEvent> {
        let mut channels = match self.channels.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        channels
            .entry(workflow_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Returns the number of live subscriptions for a workflow.
    pub fn subscriber_count(&self, workflow_id: WorkflowId) -> usize {
        self.channels
            .read()
            .ok()
            .and_then(|c| c.get(&workflow_id).map(|s| s.receiver_count()))
            .unwrap_or(0)
    }
}

#[async_trait]
impl ProgressPublisher for BroadcastPublisher {
    async fn publish(
        &self,
        workflow_id: WorkflowId,
        event: ProgressEvent,
    ) -> Result<(), PublishError> {
        let mut channels = self
            .channels
            .write()
            .map_err(|_| PublishError("progress channel lock poisoned".to_string()))?;

        let terminal = event.is_terminal();
        if let Some(sender) = channels.get(&workflow_id) {
            // No receivers is not an error: nobody is listening right now.
            let _ = sender.send(event);
        }
        if terminal {
            channels.remove(&workflow_id);
        }
        Ok(())
    }
}

/// Publisher that records every event, for tests.
#[derive(Debug, Clone, Default)]
pub struct InMemoryProgressPublisher {
    events: Arc<RwLock<Vec<ProgressEvent>>>,
    fail_on_publish: Arc<AtomicBool>,
}

impl InMemoryProgressPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent publish fail.
    pub fn set_fail_on_publish(&self, fail: bool) {
        self.fail_on_publish.store(fail, Ordering::SeqCst);
    }

    /// Returns the recorded events for a workflow, in publish order.
    pub fn events_for(&self, workflow_id: WorkflowId) -> Vec<ProgressEvent> {
        self.events
            .read()
            .map(|e| {
                e.iter()
                    .filter(|ev| ev.workflow_id == workflow_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Returns the recorded statuses for a workflow, in publish order.
    pub fn statuses_for(&self, workflow_id: WorkflowId) -> Vec<ProgressStatus> {
        self.events_for(workflow_id)
            .into_iter()
            .map(|e| e.status)
            .collect()
    }
}

#[async_trait]
impl ProgressPublisher for InMemoryProgressPublisher {
    async fn publish(
        &self,
        _workflow_id: WorkflowId,
        event: ProgressEvent,
    ) -> Result<(), PublishError> {
        if self.fail_on_publish.load(Ordering::SeqCst) {
            return Err(PublishError("progress transport rejected event".into()));
        }
        self.events
            .write()
            .map_err(|_| PublishError("progress log lock poisoned".to_string()))?
            .push(event);
        Ok(())
    }
}
