//! Gateway surface: endpoint selection and WebSocket session bridging

use std::sync::Arc;

use axum::Router;

use crate::metrics::GatewayMetrics;
use crate::state::AppState;

pub mod selection;
pub mod ws;

/// Build the gateway router: the WebSocket upgrade path plus operational endpoints
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // Downstream WebSocket sessions
        .route("/", axum::routing::get(ws::ws_handler))
        // Health endpoint for the gateway itself
        .route("/health", axum::routing::get(|| async { "OK" }))
        // Metrics endpoint for Prometheus
        .route(
            "/metrics",
            axum::routing::get(|| async { GatewayMetrics::render() }),
        )
        .with_state(state)
}
