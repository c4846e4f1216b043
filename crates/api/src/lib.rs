//! `api` crate: HTTP REST API layer.
//!
//! Exposes:
//!   POST   /api/v1/workflows
//!   GET    /api/v1/workflows
//!   GET    /api/v1/workflows/:id
//!   DELETE /api/v1/workflows/:id
//!   POST   /api/v1/workflows/:id/execute
//!   POST   /api/v1/plans
//!   GET    /api/v1/plans/:id
//!   POST   /api/v1/plans/:id/execute
//!   GET    /api/v1/executions/:id
//!   POST   /api/v1/executions/:id/approval
//!   POST   /api/v1/executions/:id/cancel
//!   POST   /api/v1/webhook/:path

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tower_http::LatencyUnit;
use tracing::{info, Level};

use engine::ExecutionService;

pub mod error;
pub mod handlers;

pub use error::ApiError;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ExecutionService>,
}

impl AppState {
    pub fn new(service: Arc<ExecutionService>) -> Self {
        Self { service }
    }
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    use handlers::{executions, plans, webhooks, workflows};

    let v1 = Router::new()
        .route("/workflows", post(workflows::create).get(workflows::list))
        .route("/workflows/:id", get(workflows::get).delete(workflows::delete))
        .route("/workflows/:id/execute", post(workflows::execute))
        .route("/plans", post(plans::create))
        .route("/plans/:id", get(plans::get))
        .route("/plans/:id/execute", post(plans::execute))
        .route("/executions/:id", get(executions::get))
        .route("/executions/:id/approval", post(executions::approval))
        .route("/executions/:id/cancel", post(executions::cancel))
        .route("/webhook/:path", post(webhooks::handle_webhook))
        .with_state(state);

    let trace = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_response(
            DefaultOnResponse::new()
                .level(Level::INFO)
                .latency_unit(LatencyUnit::Millis),
        );

    Router::new()
        .nest("/api/v1", v1)
        .layer(CorsLayer::permissive())
        .layer(trace)
}

/// Bind `addr` and serve until `shutdown` resolves.
pub async fn serve<F>(addr: SocketAddr, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "http api listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
