//! PostgreSQL integration tests for the trial store and audit log.
//!
//! Run with:
//!
//! ```bash
//! cargo test -p trials --test postgres_integration -- --test-threads=1
//! ```

use std::sync::Arc;

use serial_test::serial;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use trials::{
    AddProtocolVersion, AuditQuery, AuditSink, CreateTrial, PgAuditLog, PgTrialStore,
    RegisterSiteToTrial, TrialError, TrialFilter, TrialService, TrialStore, UpdateTrialMetadata,
};

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
                "../../../migrations/002_create_trial_tables.sql"
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

async fn get_test_service() -> TrialService<PgTrialStore, PgAuditLog> {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query(
        "TRUNCATE TABLE trial_sites, protocol_versions, sites, trials, audit_logs, idempotency_keys",
    )
    .execute(&pool)
    .await
    .unwrap();

    TrialService::new(PgTrialStore::new(pool.clone()), PgAuditLog::new(pool))
}

#[tokio::test]
#[serial]
async fn create_and_fetch_trial_with_children() {
    let service = get_test_service().await;

    let trial = service
        .create_trial(CreateTrial::new("Aspirin", "Phase I"))
        .await
        .unwrap();
    let protocol = AddProtocolVersion::new(trial.id, "v1.0").with_notes("first");
    service.add_protocol_version(protocol).await.unwrap();
    service
        .register_site_to_trial(RegisterSiteToTrial::new(trial.id, "Mayo", "US"))
        .await
        .unwrap();

    let details = service.get_trial(trial.id).await.unwrap();
    assert_eq!(details.trial.name, "Aspirin");
    assert_eq!(details.protocol_versions.len(), 1);
    assert_eq!(details.sites.len(), 1);
}

#[tokio::test]
#[serial]
async fn duplicate_site_link_is_rejected_without_side_effects() {
    let service = get_test_service().await;
    let trial = service
        .create_trial(CreateTrial::new("Aspirin", "Phase I"))
        .await
        .unwrap();

    service
        .register_site_to_trial(RegisterSiteToTrial::new(trial.id, "Mayo", "US"))
        .await
        .unwrap();
    let result = service
        .register_site_to_trial(RegisterSiteToTrial::new(trial.id, "Mayo", "US"))
        .await;

    assert!(matches!(result, Err(TrialError::DuplicateSiteLink { .. })));
    assert_eq!(service.get_trial(trial.id).await.unwrap().sites.len(), 1);
}

#[tokio::test]
#[serial]
async fn idempotency_key_replays_return_first_rows() {
    let service = get_test_service().await;

    let create = CreateTrial::new("Aspirin", "Phase I").with_idempotency_key("wf:0");
    let first = service.create_trial(create.clone()).await.unwrap();
    let replay = service.create_trial(create).await.unwrap();
    assert_eq!(first.id, replay.id);

    let site = RegisterSiteToTrial::new(first.id, "Mayo", "US").with_idempotency_key("wf:2");
    let a = service.register_site_to_trial(site.clone()).await.unwrap();
    let b = service.register_site_to_trial(site).await.unwrap();
    assert_eq!(a, b);

    let page = service.list_trials(&TrialFilter::default()).await.unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.items[0].site_count, 1);
}

#[tokio::test]
#[serial]
async fn optimistic_update_and_stale_rejection() {
    let service = get_test_service().await;
    let trial = service
        .create_trial(CreateTrial::new("Aspirin", "Phase I"))
        .await
        .unwrap();

    let update = service
        .update_trial_metadata(
            UpdateTrialMetadata::new(trial.id)
                .phase("Phase II")
                .expect_version(1),
        )
        .await
        .unwrap();
    assert_eq!(update.trial.version, 2);

    let mut stale = update.trial.clone();
    stale.name = "Late".into();
    let result = service.store().update_trial(stale, 1).await;
    assert!(matches!(
        result,
        Err(TrialError::StaleData { expected: 1, actual: 2 })
    ));
}

#[tokio::test]
#[serial]
async fn delete_trial_cascades_and_is_idempotent() {
    let service = get_test_service().await;
    let trial = service
        .create_trial(CreateTrial::new("Aspirin", "Phase I"))
        .await
        .unwrap();
    service
        .add_protocol_version(AddProtocolVersion::new(trial.id, "v1.0"))
        .await
        .unwrap();
    service
        .register_site_to_trial(RegisterSiteToTrial::new(trial.id, "Mayo", "US"))
        .await
        .unwrap();

    assert!(service.delete_trial(trial.id).await.unwrap());
    assert!(!service.delete_trial(trial.id).await.unwrap());
    let store = service.store();
    assert!(store.protocol_versions(trial.id).await.unwrap().is_empty());
    assert!(store.linked_sites(trial.id).await.unwrap().is_empty());
}

#[tokio::test]
#[serial]
async fn audit_log_is_filtered_and_newest_first() {
    let service = get_test_service().await;
    let trial = service
        .create_trial(CreateTrial::new("Aspirin", "Phase I"))
        .await
        .unwrap();
    let broken = CreateTrial::new("Broken", "Phase 9");
    let _ = service.create_trial(broken).await;

    let entries = service
        .audit()
        .entries(&AuditQuery {
            entity: Some("trial".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].action, "create_trial_failed");
    assert_eq!(entries[1].entity_id, trial.id.to_string());
}
