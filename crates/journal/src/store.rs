use async_trait::async_trait;

use crate::{JournalEntry, JournalError, Result, Sequence, StreamId};

/// Options for appending entries to a stream.
#[derive(Debug, Clone, Default)]
pub struct AppendOptions {
    /// The sequence the stream must currently be at for the append to succeed.
    /// If None, no check is performed.
    pub expected_sequence: Option<Sequence>,
}

impl AppendOptions {
    /// Creates options expecting the stream to be at a specific sequence.
    pub fn expect_sequence(sequence: Sequence) -> Self {
        Self {
            expected_sequence: Some(sequence),
        }
    }
}

/// Core trait for journal implementations.
///
/// Implementations must make `append` atomic: either every entry is recorded
/// or none is. Two writers racing on the same expected sequence must never
/// both succeed.
#[async_trait]
pub trait Journal: Send + Sync {
    /// Appends entries to a stream and returns the stream's new sequence.
    ///
    /// Fails with `SequenceConflict` if `options.expected_sequence` is set and
    /// does not match the stream's current sequence.
    async fn append(&self, entries: Vec<JournalEntry>, options: AppendOptions) -> Result<Sequence>;

    /// Reads every entry of a stream in sequence order.
    async fn read_stream(&self, stream_id: StreamId) -> Result<Vec<JournalEntry>>;

    /// Reads the entry with the highest sequence in a stream, or None if the
    /// stream has no entries. Costs the same however long the stream is.
    async fn read_last(&self, stream_id: StreamId) -> Result<Option<JournalEntry>>;

    /// Lists the IDs of every stream of the given type, oldest first.
    async fn list_streams(&self, stream_type: &str) -> Result<Vec<StreamId>>;
}

#[async_trait]
impl<T: Journal + ?Sized> Journal for std::sync::Arc<T> {
    async fn append(&self, entries: Vec<JournalEntry>, options: AppendOptions) -> Result<Sequence> {
        (**self).append(entries, options).await
    }

    async fn read_stream(&self, stream_id: StreamId) -> Result<Vec<JournalEntry>> {
        (**self).read_stream(stream_id).await
    }

    async fn read_last(&self, stream_id: StreamId) -> Result<Option<JournalEntry>> {
        (**self).read_last(stream_id).await
    }

    async fn list_streams(&self, stream_type: &str) -> Result<Vec<StreamId>> {
        (**self).list_streams(stream_type).await
    }
}

/// Checks that a batch of entries can be appended as one unit.
pub fn validate_entries_for_append(entries: &[JournalEntry]) -> Result<()> {
    let Some(first) = entries.first() else {
        return Err(JournalError::InvalidAppend(
            "Cannot append empty entry list".to_string(),
        ));
    };

    let mut expected = first.sequence;
    for entry in entries.iter().skip(1) {
        if entry.stream_id != first.stream_id || entry.stream_type != first.stream_type {
            return Err(JournalError::InvalidAppend(
                "All entries must belong to the same stream".to_string(),
            ));
        }
        expected = expected.next();
        if entry.sequence != expected {
            return Err(JournalError::InvalidAppend(format!(
                "Entry sequences must be contiguous. Expected {}, got {}",
                expected, entry.sequence
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(stream_id: StreamId, sequence: i64) -> JournalEntry {
        JournalEntry::builder()
            .stream_id(stream_id)
            .stream_type("Test")
            .entry_type("Tested")
            .sequence(Sequence::new(sequence))
            .payload_raw(serde_json::json!({}))
            .build()
            .unwrap()
    }

    #[test]
    fn empty_batches_are_rejected() {
        assert!(matches!(
            validate_entries_for_append(&[]),
            Err(JournalError::InvalidAppend(_))
        ));
    }

    #[test]
    fn mixed_streams_are_rejected() {
        let batch = vec![entry(StreamId::new(), 1), entry(StreamId::new(), 2)];
        assert!(validate_entries_for_append(&batch).is_err());
    }

    #[test]
    fn gaps_in_sequence_are_rejected() {
        let stream = StreamId::new();
        let batch = vec![entry(stream, 1), entry(stream, 3)];
        assert!(validate_entries_for_append(&batch).is_err());
    }

    #[test]
    fn contiguous_batches_are_accepted() {
        let stream = StreamId::new();
        let batch = vec![entry(stream, 4), entry(stream, 5), entry(stream, 6)];
        assert!(validate_entries_for_append(&batch).is_ok());
    }
}
