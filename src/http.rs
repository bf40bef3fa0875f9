//! HTTP Server for the Metrics Endpoint
//!
//! Serves the Prometheus text format on `/metrics`, with a small JSON
//! info document at the root.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};

use crate::metrics::ProxyMetrics;

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct HttpState {
    pub metrics: ProxyMetrics,
}

/// Creates the HTTP router with the metrics endpoints.
pub fn create_router(state: HttpState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/", get(root_handler))
        .with_state(state)
}

/// Root handler - returns basic info.
async fn root_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "service": "mqtt-throttle",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": ["/metrics"]
    }))
}

/// Renders all registered metrics in Prometheus text format.
async fn metrics_handler(State(state): State<HttpState>) -> impl IntoResponse {
    let metrics_text = state.metrics.encode();

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        metrics_text,
    )
}
