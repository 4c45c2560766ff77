use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    EntryId, JournalEntry, JournalError, Result, Sequence, StreamId,
    store::{AppendOptions, Journal, validate_entries_for_append},
};

/// PostgreSQL-backed journal.
///
/// The `unique_stream_sequence` constraint is the final arbiter between two
/// writers that both passed the expected-sequence check.
#[derive(Clone)]
pub struct PostgresJournal {
    pool: PgPool,
}

impl PostgresJournal {
    /// Creates a new PostgreSQL journal.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations for every table in the workspace.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_entry(row: PgRow) -> Result<JournalEntry> {
        let metadata_json: serde_json::Value = row.try_get("metadata")?;
        let metadata: HashMap<String, serde_json::Value> = serde_json::from_value(metadata_json)?;

        Ok(JournalEntry {
            entry_id: EntryId::from_uuid(row.try_get::<Uuid, _>("id")?),
            stream_id: StreamId::from_uuid(row.try_get::<Uuid, _>("stream_id")?),
            stream_type: row.try_get("stream_type")?,
            entry_type: row.try_get("entry_type")?,
            sequence: Sequence::new(row.try_get("sequence")?),
            recorded_at: row.try_get("recorded_at")?,
            payload: row.try_get("payload")?,
            metadata,
        })
    }
}

#[async_trait]
impl Journal for PostgresJournal {
    async fn append(&self, entries: Vec<JournalEntry>, options: AppendOptions) -> Result<Sequence> {
        validate_entries_for_append(&entries)?;

        let stream_id = entries[0].stream_id;
        let mut tx = self.pool.begin().await?;

        if let Some(expected) = options.expected_sequence {
            let current: Option<i64> = sqlx::query_scalar(
                "SELECT MAX(sequence) FROM journal_entries WHERE stream_id = $1",
            )
            .bind(stream_id.as_uuid())
            .fetch_one(&mut *tx)
            .await?;

            let actual = Sequence::new(current.unwrap_or(0));
            if actual != expected {
                tracing::debug!(%stream_id, %expected, %actual, "journal sequence conflict");
                return Err(JournalError::SequenceConflict {
                    stream_id,
                    expected,
                    actual,
                });
            }
        }

        let mut last = Sequence::initial();
        for entry in &entries {
            let metadata_json = serde_json::to_value(&entry.metadata)?;

            sqlx::query(
                r#"
                INSERT INTO journal_entries (id, stream_id, stream_type, entry_type, sequence, recorded_at, payload, metadata)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(entry.entry_id.as_uuid())
            .bind(entry.stream_id.as_uuid())
            .bind(&entry.stream_type)
            .bind(&entry.entry_type)
            .bind(entry.sequence.as_i64())
            .bind(entry.recorded_at)
            .bind(&entry.payload)
            .bind(metadata_json)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                if let sqlx::Error::Database(ref db_err) = e
                    && db_err.constraint() == Some("unique_stream_sequence")
                {
                    return JournalError::SequenceConflict {
                        stream_id,
                        expected: options.expected_sequence.unwrap_or(Sequence::initial()),
                        actual: entry.sequence,
                    };
                }
                JournalError::Database(e)
            })?;

            last = entry.sequence;
        }

        tx.commit().await?;
        metrics::counter!("journal_entries_appended").increment(entries.len() as u64);
        Ok(last)
    }

    async fn read_stream(&self, stream_id: StreamId) -> Result<Vec<JournalEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, stream_id, stream_type, entry_type, sequence, recorded_at, payload, metadata
            FROM journal_entries
            WHERE stream_id = $1
            ORDER BY sequence ASC
            "#,
        )
        .bind(stream_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_entry).collect()
    }

    async fn read_last(&self, stream_id: StreamId) -> Result<Option<JournalEntry>> {
        let row = sqlx::query(
            r#"
            SELECT id, stream_id, stream_type, entry_type, sequence, recorded_at, payload, metadata
            FROM journal_entries
            WHERE stream_id = $1
            ORDER BY sequence DESC
            LIMIT 1
            "#,
        )
        .bind(stream_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_entry).transpose()
    }

    async fn list_streams(&self, stream_type: &str) -> Result<Vec<StreamId>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT stream_id
            FROM journal_entries
            WHERE stream_type = $1
            GROUP BY stream_id
            ORDER BY MIN(recorded_at) ASC
            "#,
        )
        .bind(stream_type)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids.into_iter().map(StreamId::from_uuid).collect())
    }
}
