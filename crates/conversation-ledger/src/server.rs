//! HTTP server startup and routing.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::info;

use crate::{api, config::Config, memory_db::MemoryDatabase, shared_state::SharedState};

/// Opens the database, builds the shared state and serves until shutdown.
pub async fn run_server(cfg: Config) -> anyhow::Result<()> {
    crate::metrics::init_metrics();
    cfg.print_config();

    let database = Arc::new(MemoryDatabase::new(&cfg.db_path)?);
    info!("Ledger database opened at {}", cfg.db_path.display());

    let timeout = Duration::from_secs(cfg.request_timeout_seconds);
    let addr = cfg.api_addr()?;
    let state = Arc::new(SharedState::new(cfg, database)?);

    info!("Starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, build_router(state, timeout)).await?;

    Ok(())
}

pub fn build_router(state: Arc<SharedState>, request_timeout: Duration) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::PUT,
            axum::http::Method::DELETE,
        ])
        .allow_headers(Any);

    Router::new()
        // Buffer
        .route("/users/:user_id/sync", post(api::buffer_api::sync))
        .route("/users/:user_id/buffer", get(api::buffer_api::buffer))
        .route("/users/:user_id/messages", delete(api::buffer_api::purge))
        // Topics
        .route("/users/:user_id/topics", get(api::topic_api::list))
        .route("/users/:user_id/topics/scan", post(api::topic_api::scan))
        .route("/topics/:id", get(api::topic_api::get).delete(api::topic_api::delete))
        .route("/topics/:id/assign", post(api::topic_api::assign))
        // Memories
        .route("/memories", post(api::memory_api::create))
        .route("/memories/search", post(api::memory_api::search))
        .route(
            "/memories/:id",
            get(api::memory_api::get)
                .put(api::memory_api::update)
                .delete(api::memory_api::delete),
        )
        .route(
            "/memories/:id/topics/:topic_id",
            post(api::memory_api::link_topic).delete(api::memory_api::unlink_topic),
        )
        // Heatmap
        .route("/heatmap/tick", post(api::heatmap_api::tick))
        .route("/heatmap/top", get(api::heatmap_api::top))
        // Operations
        .route("/dedup/run", post(api::admin_api::run_dedup))
        .route("/maintenance", post(api::admin_api::maintenance))
        .route("/stats", get(api::admin_api::stats))
        .route("/metrics", get(crate::metrics::get_metrics))
        .route("/healthz", get(api::admin_api::health))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(request_timeout))
        .with_state(state)
}
