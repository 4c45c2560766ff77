use std::collections::HashMap;

use chrono::{DateTime, Utc};
use common::WorkflowId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a journal stream.
///
/// Workflow streams reuse the workflow's UUID. Streams for arbitrary string
/// keys are derived deterministically so every process instance addresses the
/// same stream for the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(Uuid);

impl StreamId {
    /// Creates a new random stream ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a stream ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Derives a stable stream ID from a namespace and a name.
    pub fn derived(namespace: &str, name: &str) -> Self {
        let namespace = Uuid::new_v5(&Uuid::NAMESPACE_OID, namespace.as_bytes());
        Self(Uuid::new_v5(&namespace, name.as_bytes()))
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for StreamId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<WorkflowId> for StreamId {
    fn from(id: WorkflowId) -> Self {
        Self(id.as_uuid())
    }
}

impl From<StreamId> for WorkflowId {
    fn from(id: StreamId) -> Self {
        WorkflowId::from_uuid(id.0)
    }
}

/// Unique identifier for a journal entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(Uuid);

impl EntryId {
    /// Creates a new random entry ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an entry ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

/// Position of an entry within its stream.
///
/// A stream with no entries is at sequence 0; the first entry is written at
/// sequence 1.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Sequence(i64);

impl Sequence {
    /// Creates a sequence from a raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// The sequence of an empty stream.
    pub fn initial() -> Self {
        Self(0)
    }

    /// Returns the next sequence.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the raw sequence value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Sequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single durable record in a stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Unique identifier for this entry.
    pub entry_id: EntryId,

    /// The stream this entry belongs to.
    pub stream_id: StreamId,

    /// What kind of stream this is (e.g. "OnboardingWorkflow", "KeyLease").
    pub stream_type: String,

    /// The type of the entry (e.g. "StepCompleted").
    pub entry_type: String,

    /// Position of the entry in its stream.
    pub sequence: Sequence,

    /// When the entry was recorded.
    pub recorded_at: DateTime<Utc>,

    /// The entry payload as JSON.
    pub payload: serde_json::Value,

    /// Additional metadata about the entry.
    pub metadata: HashMap<String, serde_json::Value>,
}

impl JournalEntry {
    /// Creates a new entry builder.
    pub fn builder() -> JournalEntryBuilder {
        JournalEntryBuilder::default()
    }

    /// Deserializes the payload into a typed value.
    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// Builder for journal entries.
#[derive(Debug, Default)]
pub struct JournalEntryBuilder {
    stream_id: Option<StreamId>,
    stream_type: Option<String>,
    entry_type: Option<String>,
    sequence: Option<Sequence>,
    payload: Option<serde_json::Value>,
}

impl JournalEntryBuilder {
    /// Sets the stream ID.
    pub fn stream_id(mut self, id: StreamId) -> Self {
        self.stream_id = Some(id);
        self
    }

    /// Sets the stream type.
    pub fn stream_type(mut self, stream_type: impl Into<String>) -> Self {
        self.stream_type = Some(stream_type.into());
        self
    }

    /// Sets the entry type.
    pub fn entry_type(mut self, entry_type: impl Into<String>) -> Self {
        self.entry_type = Some(entry_type.into());
        self
    }

    /// Sets the sequence.
    pub fn sequence(mut self, sequence: Sequence) -> Self {
        self.sequence = Some(sequence);
        self
    }

    /// Sets the payload from a serializable value.
    pub fn payload<T: Serialize>(mut self, payload: &T) -> Result<Self, serde_json::Error> {
        self.payload = Some(serde_json::to_value(payload)?);
        Ok(self)
    }

    /// Sets the payload from a raw JSON value.
    pub fn payload_raw(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Builds the entry, returning None if a required field is missing.
    pub fn build(self) -> Option<JournalEntry> {
        Some(JournalEntry {
            entry_id: EntryId::new(),
            stream_id: self.stream_id?,
            stream_type: self.stream_type?,
            entry_type: self.entry_type?,
            sequence: self.sequence?,
            recorded_at: Utc::now(),
            payload: self.payload?,
            metadata: HashMap::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_stream_ids_are_deterministic() {
        let a = StreamId::derived("KeyLease", "trial/1");
        let b = StreamId::derived("KeyLease", "trial/1");
        let c = StreamId::derived("KeyLease", "trial/2");
        let d = StreamId::derived("Other", "trial/1");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn workflow_ids_map_onto_stream_ids() {
        let workflow_id = WorkflowId::new();
        let stream_id = StreamId::from(workflow_id);
        assert_eq!(WorkflowId::from(stream_id), workflow_id);
    }

    #[test]
    fn sequence_starts_at_zero_and_increments() {
        assert_eq!(Sequence::initial().as_i64(), 0);
        assert_eq!(Sequence::initial().next(), Sequence::new(1));
        assert!(Sequence::new(2) > Sequence::new(1));
    }

    #[test]
    fn builder_requires_all_fields() {
        let incomplete = JournalEntry::builder()
            .stream_id(StreamId::new())
            .entry_type("StepCompleted")
            .build();
        assert!(incomplete.is_none());

        let entry = JournalEntry::builder()
            .stream_id(StreamId::new())
            .stream_type("OnboardingWorkflow")
            .entry_type("StepCompleted")
            .sequence(Sequence::new(1))
            .payload_raw(serde_json::json!({"step": 0}))
            .build()
            .unwrap();
        assert_eq!(entry.sequence, Sequence::new(1));
        assert!(entry.metadata.is_empty());
    }

    #[test]
    fn decode_reads_typed_payloads() {
        #[derive(Debug, PartialEq, Deserialize, Serialize)]
        struct Payload {
            step: usize,
        }

        let entry = JournalEntry::builder()
            .stream_id(StreamId::new())
            .stream_type("OnboardingWorkflow")
            .entry_type("StepCompleted")
            .sequence(Sequence::new(1))
            .payload(&Payload { step: 3 })
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(entry.decode::<Payload>().unwrap(), Payload { step: 3 });
    }
}
