//! Durable onboarding workflows.
//!
//! The same steps as the synchronous saga, but every step's completion is
//! journaled before the workflow advances, so execution resumes after a crash
//! from the last recorded step. Failures are forward-only: the workflow ends
//! `FAILED` without compensation. Each transition emits progress events.

pub mod engine;
pub mod error;
pub mod events;
pub mod instance;
pub mod progress;
pub mod workflow;

pub use engine::WorkflowEngine;
pub use error::{Result, WorkflowError};
pub use events::WorkflowEvent;
pub use instance::{NextAction, WorkflowInstance, WorkflowStatus, WorkflowSummary};
pub use progress::{
    BroadcastPublisher, InMemoryProgressPublisher, ProgressError, ProgressEvent,
    ProgressPublisher, ProgressStatus, PublishError, SiteProgress, TrialSnapshot,
};
pub use workflow::{Advance, OnboardingWorkflow};
