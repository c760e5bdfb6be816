use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use super::handlers;
use super::state::AppState;

// API Routes - REST API for programmatic access
pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(handlers::api::health))
        .nest(
            "/api",
            Router::new()
                // Query endpoint
                .route("/nl-query", post(handlers::api::nl_query))
                // Operational hooks
                .route("/credentials", get(handlers::api::credentials_status))
                .route("/refresh-schemas", post(handlers::api::refresh_schemas))
                .route("/status", get(handlers::api::system_status)),
        )
}
