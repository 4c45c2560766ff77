use thiserror::Error;

use crate::{Sequence, StreamId};

/// Errors that can occur when interacting with the journal.
#[derive(Debug, Error)]
pub enum JournalError {
    /// The stream advanced past the sequence the caller expected.
    #[error(
        "Sequence conflict on stream {stream_id}: expected sequence {expected}, found {actual}"
    )]
    SequenceConflict {
        stream_id: StreamId,
        expected: Sequence,
        actual: Sequence,
    },

    /// The entries handed to `append` were malformed.
    #[error("Invalid append: {0}")]
    InvalidAppend(String),

    /// The journal backend could not be reached.
    #[error("Journal unavailable: {0}")]
    Unavailable(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl JournalError {
    /// Returns true if the failure came from a concurrent writer rather than
    /// the backend itself.
    pub fn is_conflict(&self) -> bool {
        matches!(self, JournalError::SequenceConflict { .. })
    }
}

/// Result type for journal operations.
pub type Result<T> = std::result::Result<T, JournalError>;
