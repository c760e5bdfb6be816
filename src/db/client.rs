use crate::error::QueryError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client for the patent database service. The service owns the
/// SQLite files; this client only speaks its JSON API.
pub struct DbServiceClient {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
struct SqlQueryRequest<'a> {
    query: &'a str,
    db_type: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct SqlQueryResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub columns: Vec<String>,
    /// Row arrays aligned to `columns`.
    #[serde(default)]
    pub results: Vec<Vec<serde_json::Value>>,
    #[serde(default)]
    pub record_count: usize,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ServiceStatus {
    #[serde(default)]
    pub databases: HashMap<String, DatabaseStatus>,
}

#[derive(Debug, Deserialize)]
pub struct DatabaseStatus {
    #[serde(default)]
    pub tables: Vec<String>,
}

impl DbServiceClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// GET /health. 200 means the service is ready to take queries.
    pub async fn health(&self) -> Result<(), QueryError> {
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .map_err(|e| QueryError::UpstreamUnavailable(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(QueryError::UpstreamUnavailable(format!(
                "health check returned {}",
                response.status()
            )))
        }
    }

    /// GET /api/status. Per-database blocks including table name lists.
    pub async fn status(&self) -> Result<ServiceStatus, QueryError> {
        let response = self
            .client
            .get(format!("{}/api/status", self.base_url))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .map_err(|e| QueryError::UpstreamUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(QueryError::UpstreamUnavailable(format!(
                "status returned {}",
                response.status()
            )));
        }

        response
            .json::<ServiceStatus>()
            .await
            .map_err(|e| QueryError::UpstreamUnavailable(format!("bad status payload: {}", e)))
    }

    /// POST /api/sql-query. A service-reported failure becomes
    /// ExecutionError; a transport failure becomes UpstreamUnavailable.
    pub async fn sql_query(
        &self,
        query: &str,
        db_type: &str,
    ) -> Result<SqlQueryResponse, QueryError> {
        debug!("Forwarding SQL to {} ({}): {}", self.base_url, db_type, query);

        let response = self
            .client
            .post(format!("{}/api/sql-query", self.base_url))
            .timeout(QUERY_TIMEOUT)
            .json(&SqlQueryRequest { query, db_type })
            .send()
            .await
            .map_err(|e| QueryError::UpstreamUnavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!("SQL query failed with status {}: {}", status, body);
            return Err(QueryError::ExecutionError(if body.is_empty() {
                format!("service returned {}", status)
            } else {
                body
            }));
        }

        let payload: SqlQueryResponse = response
            .json()
            .await
            .map_err(|e| QueryError::UpstreamUnavailable(format!("bad query payload: {}", e)))?;

        if !payload.success {
            let message = payload
                .error
                .unwrap_or_else(|| "query failed without error detail".to_string());
            return Err(QueryError::ExecutionError(message));
        }

        Ok(payload)
    }
}
