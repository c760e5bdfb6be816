use axum::{
    extract::State,
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::session::{CoreResponse, CredentialsStatus, ModelsInfo, RefreshOutcome};
use crate::web::state::AppState;

#[derive(Debug, Deserialize)]
pub struct NlQueryRequest {
    pub question: String,
    pub db_type: String,
    pub strategy: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SystemStatus {
    pub version: String,
    pub uptime_seconds: i64,
    pub databases: Vec<String>,
    pub snapshots_cached: usize,
    pub credentials_configured: bool,
    pub models: ModelsInfo,
}

/// POST /api/nl-query. Validation failures surface in the response body;
/// the HTTP layer stays 200 for any processed request.
pub async fn nl_query(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<NlQueryRequest>,
) -> Json<CoreResponse> {
    info!("NL query against {}: {}", payload.db_type, payload.question);

    let response = state
        .session
        .process(
            &payload.question,
            &payload.db_type,
            payload.strategy.as_deref(),
        )
        .await;

    Json(response)
}

/// GET /api/credentials. Exposed to health checks and operators.
pub async fn credentials_status(State(state): State<Arc<AppState>>) -> Json<CredentialsStatus> {
    Json(state.session.credentials_status())
}

/// POST /api/refresh-schemas. Operational hook to rebuild snapshots.
pub async fn refresh_schemas(State(state): State<Arc<AppState>>) -> Json<RefreshOutcome> {
    info!("Schema refresh requested");
    Json(state.session.refresh_schemas().await)
}

/// GET /api/status.
pub async fn system_status(State(state): State<Arc<AppState>>) -> Json<SystemStatus> {
    let now = chrono::Utc::now();
    let uptime = now.signed_duration_since(state.startup_time).num_seconds();

    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: uptime,
        databases: state.session.configured_databases(),
        snapshots_cached: state.session.cached_snapshot_count().await,
        credentials_configured: state.session.credentials_status().configured,
        models: state.session.models(),
    })
}

/// GET /health. Ready only when the upstream database service is.
pub async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, &'static str) {
    match state.session.upstream_health().await {
        Ok(()) => (StatusCode::OK, "ok"),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "upstream unavailable"),
    }
}
