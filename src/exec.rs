use crate::db::client::DbServiceClient;
use crate::error::QueryError;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Rows kept in the response payload; the full count is preserved
/// separately.
pub const RESPONSE_ROW_CAP: usize = 20;

/// The sole enforcement point for read-only access: after trimming and
/// case-folding, the statement must begin with SELECT or WITH.
pub fn is_read_only(sql: &str) -> bool {
    let upper = sql.trim_start().to_uppercase();
    upper.starts_with("SELECT") || upper.starts_with("WITH")
}

/// Shaped result of one executed statement.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    /// Physical column names as reported by the cursor.
    pub columns: Vec<String>,
    /// Human labels parallel to `columns`, when a display-name map exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_columns: Option<Vec<String>>,
    /// Rows as maps from physical column name to scalar value.
    pub rows: Vec<serde_json::Map<String, serde_json::Value>>,
    /// Total rows returned by the statement, independent of truncation.
    pub row_count: usize,
    pub duration_ms: u64,
}

impl ExecutionResult {
    /// Attaches display labels without rewriting SQL or row keys.
    pub fn apply_display_names(&mut self, map: &HashMap<String, String>) {
        self.display_columns = Some(
            self.columns
                .iter()
                .map(|c| map.get(c).cloned().unwrap_or_else(|| c.clone()))
                .collect(),
        );
    }

    /// Returns a copy capped at `cap` rows plus a truncation flag. The
    /// total row count is preserved on the copy.
    pub fn truncated(&self, cap: usize) -> (ExecutionResult, bool) {
        if self.rows.len() <= cap {
            return (self.clone(), false);
        }
        let mut capped = self.clone();
        capped.rows.truncate(cap);
        (capped, true)
    }
}

/// Seam between the orchestrator and the database service, mocked in tests.
#[async_trait]
pub trait SqlRunner: Send + Sync {
    async fn run(&self, sql: &str, db: &str) -> Result<ExecutionResult, QueryError>;
}

/// Validates, forwards and shapes. Statements failing the read-only
/// predicate are rejected before any downstream call.
pub struct SafeExecutor {
    client: Arc<DbServiceClient>,
}

impl SafeExecutor {
    pub fn new(client: Arc<DbServiceClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SqlRunner for SafeExecutor {
    async fn run(&self, sql: &str, db: &str) -> Result<ExecutionResult, QueryError> {
        if !is_read_only(sql) {
            warn!("Rejected non-read-only statement for {}: {}", db, sql);
            return Err(QueryError::DisallowedStatement(sql.to_string()));
        }

        let started = Instant::now();
        let payload = self.client.sql_query(sql, db).await?;
        let duration_ms = started.elapsed().as_millis() as u64;

        let rows: Vec<serde_json::Map<String, serde_json::Value>> = payload
            .results
            .iter()
            .map(|row| shape_row(&payload.columns, row))
            .collect();

        let row_count = rows.len();
        info!(
            "Executed against {}: {} rows in {}ms",
            db, row_count, duration_ms
        );

        Ok(ExecutionResult {
            columns: payload.columns,
            display_columns: None,
            rows,
            row_count,
            duration_ms,
        })
    }
}

/// Converts one row-array into a map keyed by physical column names.
/// Non-scalar values are stringified.
fn shape_row(
    columns: &[String],
    row: &[serde_json::Value],
) -> serde_json::Map<String, serde_json::Value> {
    let mut shaped = serde_json::Map::with_capacity(columns.len());
    for (i, column) in columns.iter().enumerate() {
        let value = match row.get(i) {
            Some(value @ (serde_json::Value::Array(_) | serde_json::Value::Object(_))) => {
                serde_json::Value::String(value.to_string())
            }
            Some(value) => value.clone(),
            None => serde_json::Value::Null,
        };
        shaped.insert(column.clone(), value);
    }
    shaped
}
