//! HTTP server setup using Axum.

use axum::{
    Router,
    routing::{get, post},
};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tabreport_core::config::GatewayConfig;
use tabreport_scheduler::ScheduleStore;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::routes;

/// Shared state for the gateway server.
pub struct AppState {
    pub store: Arc<ScheduleStore>,
    /// Directory published report files are served from.
    pub reports_dir: PathBuf,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(store: Arc<ScheduleStore>, reports_dir: PathBuf) -> Self {
        Self {
            store,
            reports_dir,
            start_time: std::time::Instant::now(),
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    build_router_from_arc(Arc::new(state))
}

pub fn build_router_from_arc(shared: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(routes::health_check))
        .route("/api/schedule", get(routes::list_schedules))
        .route("/api/schedule/create", post(routes::create_schedule))
        .route(
            "/api/schedule/{id}",
            get(routes::get_schedule).delete(routes::delete_schedule),
        )
        .route("/api/schedule/{id}/pause", post(routes::pause_schedule))
        .route("/api/schedule/{id}/resume", post(routes::resume_schedule))
        .route("/api/schedule/{id}/runs", get(routes::list_runs))
        .nest_service("/reports", ServeDir::new(&shared.reports_dir))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(shared)
}

/// Serve the API until `shutdown` resolves.
pub async fn start<F>(config: &GatewayConfig, state: AppState, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = build_router(state);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("🌐 Gateway listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
