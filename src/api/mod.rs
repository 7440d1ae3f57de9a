pub mod handlers;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use crate::AppState;

/// Versioned API surface. Legacy un-versioned aliases are added in the
/// server setup behind the deprecation middleware.
pub fn api_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/buscar", post(handlers::buscar))
        .route("/v1/search/:search_id/timeline", get(handlers::timeline))
        .route("/v1/search/:search_id/status", get(handlers::status))
        .route("/v1/search/:search_id/events", get(handlers::events))
        .route("/api/pncp-stats", get(handlers::pncp_stats))
        .route(
            "/v1/admin/search-trace/:search_id",
            get(handlers::search_trace),
        )
        .with_state(state)
}
