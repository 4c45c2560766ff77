use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{
    JournalEntry, JournalError, Result, Sequence, StreamId,
    store::{AppendOptions, Journal, validate_entries_for_append},
};

/// In-memory journal for tests and single-process deployments.
///
/// Clones share the same underlying storage, so a clone handed to a second
/// engine instance sees everything the first one recorded. That is how tests
/// simulate a process restart.
#[derive(Clone, Default)]
pub struct InMemoryJournal {
    entries: Arc<RwLock<Vec<JournalEntry>>>,
    fail_on_append: Arc<AtomicBool>,
}

impl InMemoryJournal {
    /// Creates a new empty journal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent append fail with `Unavailable` until reset.
    pub fn set_fail_on_append(&self, fail: bool) {
        self.fail_on_append.store(fail, Ordering::SeqCst);
    }

    /// Returns the total number of entries across all streams.
    pub async fn entry_count(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Returns the number of entries of a given type in a stream.
    pub async fn count_entries(&self, stream_id: StreamId, entry_type: &str) -> usize {
        self.entries
            .read()
            .await
            .iter()
            .filter(|e| e.stream_id == stream_id && e.entry_type == entry_type)
            .count()
    }
}

#[async_trait]
impl Journal for InMemoryJournal {
    async fn append(&self, entries: Vec<JournalEntry>, options: AppendOptions) -> Result<Sequence> {
        validate_entries_for_append(&entries)?;

        if self.fail_on_append.load(Ordering::SeqCst) {
            return Err(JournalError::Unavailable(
                "journal append rejected".to_string(),
            ));
        }

        let stream_id = entries[0].stream_id;
        let mut store = self.entries.write().await;

        let current = store
            .iter()
            .filter(|e| e.stream_id == stream_id)
            .map(|e| e.sequence)
            .max()
            .unwrap_or(Sequence::initial());

        if let Some(expected) = options.expected_sequence
            && current != expected
        {
            return Err(JournalError::SequenceConflict {
                stream_id,
                expected,
                actual: current,
            });
        }

        // Unique (stream, sequence) constraint
        if entries[0].sequence <= current {
            return Err(JournalError::SequenceConflict {
                stream_id,
                expected: options.expected_sequence.unwrap_or(current),
                actual: current,
            });
        }

        let last = entries
            .last()
            .map(|e| e.sequence)
            .unwrap_or(Sequence::initial());
        store.extend(entries);

        Ok(last)
    }

    async fn read_stream(&self, stream_id: StreamId) -> Result<Vec<JournalEntry>> {
        let store = self.entries.read().await;
        let mut entries: Vec<_> = store
            .iter()
            .filter(|e| e.stream_id == stream_id)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.sequence);
        Ok(entries)
    }

    async fn read_last(&self, stream_id: StreamId) -> Result<Option<JournalEntry>> {
        let store = self.entries.read().await;
        Ok(store
            .iter()
            .filter(|e| e.stream_id == stream_id)
            .max_by_key(|e| e.sequence)
            .cloned())
    }

    async fn list_streams(&self, stream_type: &str) -> Result<Vec<StreamId>> {
        let store = self.entries.read().await;
        let mut streams = Vec::new();
        for entry in store.iter().filter(|e| e.stream_type == stream_type) {
            if !streams.contains(&entry.stream_id) {
                streams.push(entry.stream_id);
            }
        }
        Ok(streams)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(stream_id: StreamId, stream_type: &str, sequence: i64) -> JournalEntry {
        JournalEntry::builder()
            .stream_id(stream_id)
            .stream_type(stream_type)
            .entry_type("StepCompleted")
            .sequence(Sequence::new(sequence))
            .payload_raw(serde_json::json!({"n": sequence}))
            .build()
            .unwrap()
    }

    fn expect(sequence: i64) -> AppendOptions {
        AppendOptions::expect_sequence(Sequence::new(sequence))
    }

    #[tokio::test]
    async fn append_and_read_back_in_order() {
        let journal = InMemoryJournal::new();
        let stream = StreamId::new();

        journal
            .append(
                vec![entry(stream, "Workflow", 1), entry(stream, "Workflow", 2)],
                expect(0),
            )
            .await
            .unwrap();
        let seq = journal
            .append(vec![entry(stream, "Workflow", 3)], expect(2))
            .await
            .unwrap();

        assert_eq!(seq, Sequence::new(3));
        let entries = journal.read_stream(stream).await.unwrap();
        let sequences: Vec<i64> = entries.iter().map(|e| e.sequence.as_i64()).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn stale_expected_sequence_conflicts() {
        let journal = InMemoryJournal::new();
        let stream = StreamId::new();
        journal
            .append(vec![entry(stream, "Workflow", 1)], expect(0))
            .await
            .unwrap();

        let result = journal
            .append(vec![entry(stream, "Workflow", 1)], expect(0))
            .await;
        assert!(matches!(result, Err(JournalError::SequenceConflict { .. })));
        assert_eq!(journal.entry_count().await, 1);
    }

    #[tokio::test]
    async fn unconditional_append_still_rejects_duplicate_sequences() {
        let journal = InMemoryJournal::new();
        let stream = StreamId::new();
        journal
            .append(vec![entry(stream, "Workflow", 1)], AppendOptions::default())
            .await
            .unwrap();
        let result = journal
            .append(vec![entry(stream, "Workflow", 1)], AppendOptions::default())
            .await;
        assert!(result.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn injected_failures_record_nothing() {
        let journal = InMemoryJournal::new();
        let stream = StreamId::new();
        journal.set_fail_on_append(true);

        let result = journal
            .append(vec![entry(stream, "Workflow", 1)], expect(0))
            .await;
        assert!(matches!(result, Err(JournalError::Unavailable(_))));
        assert!(journal.read_last(stream).await.unwrap().is_none());

        journal.set_fail_on_append(false);
        journal
            .append(vec![entry(stream, "Workflow", 1)], expect(0))
            .await
            .unwrap();
        assert!(journal.read_last(stream).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn read_last_returns_the_highest_sequence() {
        let journal = InMemoryJournal::new();
        let stream = StreamId::new();
        let other = StreamId::new();

        for sequence in 1..=5 {
            let next = entry(stream, "KeyLease", sequence);
            journal
                .append(vec![next], expect(sequence - 1))
                .await
                .unwrap();
        }
        journal
            .append(vec![entry(other, "KeyLease", 1)], expect(0))
            .await
            .unwrap();

        let last = journal.read_last(stream).await.unwrap().unwrap();
        assert_eq!(last.sequence, Sequence::new(5));
        assert_eq!(last.payload["n"], 5);
        assert!(journal.read_last(StreamId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_streams_filters_by_type_in_first_seen_order() {
        let journal = InMemoryJournal::new();
        let first = StreamId::new();
        let second = StreamId::new();
        let lease = StreamId::new();

        for (stream, stream_type, sequence) in [
            (first, "Workflow", 1),
            (lease, "KeyLease", 1),
            (second, "Workflow", 1),
            (first, "Workflow", 2),
        ] {
            journal
                .append(
                    vec![entry(stream, stream_type, sequence)],
                    AppendOptions::default(),
                )
                .await
                .unwrap();
        }

        assert_eq!(
            journal.list_streams("Workflow").await.unwrap(),
            vec![first, second]
        );
        assert_eq!(journal.list_streams("KeyLease").await.unwrap(), vec![lease]);
        assert_eq!(journal.count_entries(first, "StepCompleted").await, 2);
    }

    #[tokio::test]
    async fn clones_share_storage() {
        let journal = InMemoryJournal::new();
        let restarted = journal.clone();
        let stream = StreamId::new();

        journal
            .append(vec![entry(stream, "Workflow", 1)], AppendOptions::default())
            .await
            .unwrap();

        let last = restarted.read_last(stream).await.unwrap();
        assert_eq!(last.map(|e| e.sequence), Some(Sequence::new(1)));
    }
}
