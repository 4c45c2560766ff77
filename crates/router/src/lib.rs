//! Per-key serialized execution.
//!
//! Mutations that target the same entity are routed through a
//! [`KeyedExecutor`] under the entity's key, so at most one of them runs at
//! any instant without taking a row lock in storage. Two backends:
//!
//! - [`ActorRouter`]: one actor task per active key inside the process.
//! - [`LeaseRouter`]: a lease per key recorded in the shared journal, which
//!   serializes across every instance that uses the same journal.

pub mod actor;
pub mod error;
pub mod executor;
pub mod lease;

pub use actor::ActorRouter;
pub use error::{ConcurrencyRoutingError, Result};
pub use executor::{Job, KeyedExecutor, KeyedExecutorExt};
pub use lease::{LEASE_STREAM_TYPE, LeaseEvent, LeaseOptions, LeaseRouter};
