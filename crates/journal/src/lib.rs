//! Durable append-only journal.
//!
//! A journal is a set of independent streams. Each stream is an ordered list
//! of entries with strictly increasing sequence numbers, and appends can be
//! made conditional on the stream's current sequence. That conditional append
//! is the only coordination primitive the workflow engine and the lease router
//! rely on: whoever appends first at a given sequence wins.

pub mod entry;
pub mod error;
pub mod memory;
pub mod postgres;
pub mod store;

pub use entry::{EntryId, JournalEntry, JournalEntryBuilder, Sequence, StreamId};
pub use error::{JournalError, Result};
pub use memory::InMemoryJournal;
pub use postgres::PostgresJournal;
pub use store::{AppendOptions, Journal};
