//! HTTP API server for trial onboarding.
//!
//! Provides REST endpoints for the trial registry, synchronous and durable
//! onboarding, and workflow progress streaming, with structured logging
//! (tracing) and Prometheus metrics.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use journal::{InMemoryJournal, Journal, PostgresJournal};
use metrics_exporter_prometheus::PrometheusHandle;
use router::{ActorRouter, KeyedExecutor, LeaseOptions, LeaseRouter};
use saga::SagaOrchestrator;
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use trials::{
    AuditSink, InMemoryAuditLog, InMemoryTrialStore, PgAuditLog, PgTrialStore, TrialService,
    TrialStore,
};
use workflow::{BroadcastPublisher, OnboardingWorkflow, WorkflowEngine};

use config::{Config, RouterBackend};
use error::StartupError;

pub type DynTrialStore = Arc<dyn TrialStore>;
pub type DynAuditSink = Arc<dyn AuditSink>;
pub type DynJournal = Arc<dyn Journal>;

/// Trial service over whichever storage backend is configured.
pub type Trials = TrialService<DynTrialStore, DynAuditSink>;
/// Durable onboarding engine over whichever storage backend is configured.
pub type Engine = WorkflowEngine<DynJournal, DynTrialStore, DynAuditSink, BroadcastPublisher>;

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub trials: Arc<Trials>,
    pub saga: SagaOrchestrator<DynTrialStore, DynAuditSink>,
    pub engine: Engine,
    pub progress: BroadcastPublisher,
    /// Serializes mutations of the same trial.
    pub router: Arc<dyn KeyedExecutor>,
}

/// Storage collaborators the application runs on.
#[derive(Clone)]
pub struct Backends {
    pub store: DynTrialStore,
    pub audit: DynAuditSink,
    pub journal: DynJournal,
}

impl Backends {
    /// Process-local stores; nothing survives a restart.
    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(InMemoryTrialStore::new()),
            audit: Arc::new(InMemoryAuditLog::new()),
            journal: Arc::new(InMemoryJournal::new()),
        }
    }

    /// Connects to PostgreSQL and runs the migrations.
    pub async fn postgres(database_url: &str) -> Result<Self, StartupError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;

        let journal = PostgresJournal::new(pool.clone());
        journal.run_migrations().await?;

        Ok(Self {
            store: Arc::new(PgTrialStore::new(pool.clone())),
            audit: Arc::new(PgAuditLog::new(pool)),
            journal: Arc::new(journal),
        })
    }

    /// Picks PostgreSQL when a database URL is configured.
    pub async fn from_config(config: &Config) -> Result<Self, StartupError> {
        match &config.database_url {
            Some(url) => Self::postgres(url).await,
            None => Ok(Self::in_memory()),
        }
    }
}

/// Builds the application state on top of the given backends.
pub fn create_state(backends: Backends, config: &Config) -> Arc<AppState> {
    let trials = Arc::new(TrialService::new(backends.store, backends.audit));
    let progress = BroadcastPublisher::default();

    let workflow = OnboardingWorkflow::new(
        Arc::clone(&backends.journal),
        Arc::clone(&trials),
        progress.clone(),
    );

    let router: Arc<dyn KeyedExecutor> = match config.router_backend {
        RouterBackend::Actor => Arc::new(ActorRouter::new()),
        RouterBackend::Lease => Arc::new(LeaseRouter::new(
            backends.journal,
            LeaseOptions {
                ttl: config.lease_ttl,
                acquire_timeout: config.router_acquire_timeout,
                ..LeaseOptions::default()
            },
        )),
    };
    tracing::info!(backend = router.backend(), "concurrency router ready");

    Arc::new(AppState {
        saga: SagaOrchestrator::new(Arc::clone(&trials)),
        engine: WorkflowEngine::new(workflow),
        trials,
        progress,
        router,
    })
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::system::metrics))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::system::health))
        .route(
            "/trials",
            post(routes::trials::create).get(routes::trials::list),
        )
        .route(
            "/trials/{id}",
            get(routes::trials::get).patch(routes::trials::update),
        )
        .route("/trials/{id}/sites", post(routes::trials::register_site))
        .route("/audit", get(routes::trials::audit))
        .route("/onboarding/sync", post(routes::onboarding::sync))
        .route("/onboarding/async", post(routes::onboarding::start))
        .route("/workflows/{id}", get(routes::workflows::get))
        .route("/workflows/{id}/progress", get(routes::workflows::progress))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
