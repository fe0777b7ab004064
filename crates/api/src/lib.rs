//! `api` crate — the ControlAPI: `StartRun`, `Cancel`,
//! `GetStatus`, `Subscribe`, plus webhook ingress and minimal workflow
//! ingestion (create + read only — authoring/editing workflows is not this
//! service's job).

pub mod handlers;
pub mod workflow_source;

use std::sync::Arc;

use db::{DbPool, PostgresStore};
use engine::{BusEventPublisher, Dispatcher, EngineConfig, EventPublisher, RateLimiter, Supervisor};
use queue::InMemoryBus;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use workflow_source::PgWorkflowSource;

#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
    pub store: Arc<PostgresStore>,
    pub bus: Arc<InMemoryBus>,
    pub dispatcher: Arc<Dispatcher<InMemoryBus>>,
    pub rate_limiter: Arc<RateLimiter>,
    pub publisher: Arc<dyn EventPublisher>,
    pub supervisor: Arc<Supervisor<PostgresStore, InMemoryBus>>,
    pub workflow_source: Arc<PgWorkflowSource>,
    pub config: EngineConfig,
}

impl AppState {
    pub fn new(pool: DbPool, config: EngineConfig) -> Self {
        let store = Arc::new(PostgresStore::new(pool.clone()));
        let bus = Arc::new(InMemoryBus::new());
        let dispatcher = Arc::new(Dispatcher::new(bus.clone()));
        let rate_limiter = Arc::new(RateLimiter::new(
            config.tenant_rate_limit_rps,
            config.tenant_rate_limit_burst,
            config.node_type_rate_limit_rps,
            config.node_type_rate_limit_burst,
        ));
        let publisher: Arc<dyn EventPublisher> = Arc::new(BusEventPublisher::new(bus.clone()));
        let workflow_source = Arc::new(PgWorkflowSource::new(pool.clone()));
        let workflow_source_dyn: Arc<dyn engine::WorkflowSource> = workflow_source.clone();
        let supervisor = Arc::new(Supervisor::new(
            hostname_owner(),
            store.clone(),
            dispatcher.clone(),
            rate_limiter.clone(),
            publisher.clone(),
            config.clone(),
            workflow_source_dyn,
        ));

        Self { pool, store, bus, dispatcher, rate_limiter, publisher, supervisor, workflow_source, config }
    }
}

/// Identifies this process as a lease owner — hostname plus pid, unique
/// enough for a single coordinator process to never collide with itself.
fn hostname_owner() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    format!("{host}-{}", std::process::id())
}

pub async fn serve(bind: &str, state: AppState) -> Result<(), std::io::Error> {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    let api_router = axum::Router::new()
        .route("/workflows", axum::routing::post(handlers::workflows::create))
        .route("/workflows/:id", axum::routing::get(handlers::workflows::get))
        .route("/runs", axum::routing::post(handlers::runs::start_run))
        .route("/runs/:id", axum::routing::get(handlers::runs::get_status))
        .route("/runs/:id/cancel", axum::routing::post(handlers::runs::cancel))
        .route("/runs/:id/wake", axum::routing::post(handlers::runs::wake))
        .route("/runs/:id/subscribe", axum::routing::get(handlers::runs::subscribe));

    let app = axum::Router::new()
        .nest("/api/v1", api_router)
        .route("/webhook/:path", axum::routing::post(handlers::webhooks::handle_webhook))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!("Server listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await
}
