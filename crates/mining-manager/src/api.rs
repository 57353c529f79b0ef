use crate::Manager;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use mining_events::EventHub;
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::error;

/// Daemon routes: event stream, Prometheus metrics and health
pub fn create_router(manager: Arc<Manager>, hub: EventHub) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_check))
        .with_state(manager)
        .merge(mining_events::ws::router(hub))
        .layer(TraceLayer::new_for_http())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    miners: usize,
    version: &'static str,
}

async fn health_check(State(manager): State<Arc<Manager>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: if manager.is_stopped() { "stopping" } else { "ok" },
        miners: manager.list_miners().len(),
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn metrics_handler(State(manager): State<Arc<Manager>>) -> Response {
    match manager.metrics_text() {
        Ok(body) => (
            [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to render metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}
