//! Shared identifier types used across the trial onboarding crates.

pub mod types;

pub use types::{EntityKey, ProtocolVersionId, SiteId, TrialId, WorkflowId};
