//! Trial registry.
//!
//! Holds the storage collaborator ([`TrialStore`]) and audit collaborator
//! ([`AuditSink`]) that onboarding steps write through, the phase rules, and
//! [`TrialService`], which wraps both collaborators with audited commands and
//! read-side queries.

pub mod audit;
pub mod commands;
pub mod error;
pub mod memory;
pub mod model;
pub mod phase;
pub mod postgres;
pub mod service;
pub mod store;

pub use audit::{AuditEntry, AuditQuery, AuditSink, InMemoryAuditLog, SYSTEM_ACTOR};
pub use commands::{AddProtocolVersion, CreateTrial, RegisterSiteToTrial, UpdateTrialMetadata};
pub use error::{Result, TrialError};
pub use memory::InMemoryTrialStore;
pub use model::{
    LinkedSite, ProtocolVersion, Site, SiteRegistration, Trial, TrialDetails, TrialFilter,
    TrialPage, TrialSiteLink, TrialSummary,
};
pub use phase::{LinkStatus, Phase, TrialStatus};
pub use postgres::{PgAuditLog, PgTrialStore};
pub use service::{MetadataUpdate, TrialService};
pub use store::TrialStore;
