//! Trial onboarding saga.
//!
//! This crate holds the onboarding step registry and the synchronous saga
//! orchestrator that runs it:
//! 1. Create the trial
//! 2. Add the initial protocol version
//! 3. Register each site
//!
//! If any step fails, previously completed steps are compensated in reverse order.

pub mod error;
pub mod orchestrator;
pub mod request;
pub mod state;
pub mod steps;

pub use error::{CompensationFailure, Result, SagaError, StepError};
pub use orchestrator::SagaOrchestrator;
pub use request::{OnboardingRequest, OnboardingResult, SiteInput};
pub use state::{CompletedStep, SagaExecution, SagaState};
pub use steps::{
    Compensation, OnboardingStep, PriorResults, STEP_ADD_PROTOCOL, STEP_CREATE_TRIAL, StepOutput,
};
