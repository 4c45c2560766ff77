//! PostgreSQL integration tests
//!
//! These tests share one PostgreSQL container and truncate the journal
//! between tests. Run with:
//!
//! ```bash
//! cargo test -p journal --test postgres_integration -- --test-threads=1
//! ```

use std::sync::Arc;

use journal::{
    AppendOptions, Journal, JournalEntry, JournalError, PostgresJournal, Sequence, StreamId,
};
use serial_test::serial;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::raw_sql(include_str!(
                "../../../migrations/001_create_journal_table.sql"
            ))
            .execute(&temp_pool)
            .await
            .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

async fn get_test_journal() -> PostgresJournal {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE journal_entries")
        .execute(&pool)
        .await
        .unwrap();

    PostgresJournal::new(pool)
}

fn step_entry(stream_id: StreamId, stream_type: &str, sequence: i64) -> JournalEntry {
    let mut entry = JournalEntry::builder()
        .stream_id(stream_id)
        .stream_type(stream_type)
        .entry_type("StepCompleted")
        .sequence(Sequence::new(sequence))
        .payload_raw(serde_json::json!({"index": sequence - 1}))
        .build()
        .unwrap();
    entry
        .metadata
        .insert("worker".to_string(), serde_json::json!("test"));
    entry
}

fn expect(sequence: i64) -> AppendOptions {
    AppendOptions::expect_sequence(Sequence::new(sequence))
}

#[tokio::test]
#[serial]
async fn append_and_read_stream() {
    let journal = get_test_journal().await;
    let stream = StreamId::new();

    let seq = journal
        .append(
            vec![
                step_entry(stream, "OnboardingWorkflow", 1),
                step_entry(stream, "OnboardingWorkflow", 2),
            ],
            expect(0),
        )
        .await
        .unwrap();
    assert_eq!(seq, Sequence::new(2));

    let entries = journal.read_stream(stream).await.unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].sequence, Sequence::new(1));
    assert_eq!(entries[1].payload["index"], 1);
    assert_eq!(entries[1].metadata["worker"], "test");
}

#[tokio::test]
#[serial]
async fn stale_expected_sequence_is_rejected() {
    let journal = get_test_journal().await;
    let stream = StreamId::new();

    journal
        .append(vec![step_entry(stream, "OnboardingWorkflow", 1)], expect(0))
        .await
        .unwrap();

    let result = journal
        .append(vec![step_entry(stream, "OnboardingWorkflow", 2)], expect(0))
        .await;
    assert!(matches!(result, Err(JournalError::SequenceConflict { .. })));

    let last = journal.read_last(stream).await.unwrap();
    assert_eq!(last.map(|e| e.sequence), Some(Sequence::new(1)));
}

#[tokio::test]
#[serial]
async fn duplicate_sequence_maps_to_conflict() {
    let journal = get_test_journal().await;
    let stream = StreamId::new();

    journal
        .append(
            vec![step_entry(stream, "KeyLease", 1)],
            AppendOptions::default(),
        )
        .await
        .unwrap();
    let result = journal
        .append(
            vec![step_entry(stream, "KeyLease", 1)],
            AppendOptions::default(),
        )
        .await;

    assert!(result.unwrap_err().is_conflict());
}

#[tokio::test]
#[serial]
async fn racing_writers_on_same_sequence_only_one_wins() {
    let journal = get_test_journal().await;
    let stream = StreamId::new();

    let a = journal.clone();
    let b = journal.clone();
    let (ra, rb) = tokio::join!(
        a.append(vec![step_entry(stream, "KeyLease", 1)], expect(0)),
        b.append(vec![step_entry(stream, "KeyLease", 1)], expect(0)),
    );

    assert_eq!(ra.is_ok() as u8 + rb.is_ok() as u8, 1);
    assert_eq!(journal.read_stream(stream).await.unwrap().len(), 1);
}

#[tokio::test]
#[serial]
async fn read_last_returns_only_the_newest_entry() {
    let journal = get_test_journal().await;
    let stream = StreamId::new();

    assert!(journal.read_last(stream).await.unwrap().is_none());
    for sequence in 1..=4 {
        let next = step_entry(stream, "KeyLease", sequence);
        journal
            .append(vec![next], expect(sequence - 1))
            .await
            .unwrap();
    }

    let last = journal.read_last(stream).await.unwrap().unwrap();
    assert_eq!(last.sequence, Sequence::new(4));
    assert_eq!(last.payload["index"], 3);
    assert_eq!(last.metadata["worker"], "test");
}

#[tokio::test]
#[serial]
async fn list_streams_by_type() {
    let journal = get_test_journal().await;
    let first = StreamId::new();
    let second = StreamId::new();

    for (stream, stream_type) in [
        (first, "OnboardingWorkflow"),
        (StreamId::new(), "KeyLease"),
        (second, "OnboardingWorkflow"),
    ] {
        journal
            .append(
                vec![step_entry(stream, stream_type, 1)],
                AppendOptions::default(),
            )
            .await
            .unwrap();
    }

    let streams = journal.list_streams("OnboardingWorkflow").await.unwrap();
    assert_eq!(streams, vec![first, second]);
}
