use crate::config::DatabaseProfile;
use crate::db::client::DbServiceClient;
use crate::error::QueryError;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const MAX_ATTEMPTS: usize = 5;
const RETRY_DELAY: Duration = Duration::from_secs(3);
const SAMPLE_ROWS: usize = 5;

#[derive(Debug, Clone, Serialize)]
pub struct ColumnInfo {
    pub name: String,
    pub decl_type: String,
    pub nullable: bool,
    pub primary_key: bool,
    pub default_value: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableEntry {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    /// First rows of the table, aligned to `columns`. Bounded at ingest.
    pub sample_rows: Vec<Vec<serde_json::Value>>,
    pub row_count: usize,
}

impl TableEntry {
    pub fn is_populated(&self) -> bool {
        !self.columns.is_empty()
    }
}

/// Immutable per-database schema description. Built once by the
/// introspector, shared read-only across requests, replaced wholesale on
/// refresh.
#[derive(Debug, Clone, Serialize)]
pub struct SchemaSnapshot {
    pub db: String,
    pub tables: Vec<TableEntry>,
    /// Physical column name -> human label (e.g. original Japanese CSV
    /// header). Advisory only; SQL is always emitted against physical names.
    pub display_names: Option<HashMap<String, String>>,
}

impl SchemaSnapshot {
    /// Usable means at least one table has column metadata.
    pub fn is_empty(&self) -> bool {
        !self.tables.iter().any(|t| t.is_populated())
    }

    pub fn table(&self, name: &str) -> Option<&TableEntry> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn display_name(&self, column: &str) -> Option<&str> {
        self.display_names
            .as_ref()
            .and_then(|map| map.get(column))
            .map(|s| s.as_str())
    }

    /// Finds the physical column in `table` best matching any of the
    /// candidate names: exact physical match first, then display-label
    /// match, then substring match. Candidates are ordered by preference.
    pub fn resolve_column(&self, table: &str, candidates: &[&str]) -> Option<String> {
        let entry = self.table(table)?;

        for candidate in candidates {
            for col in &entry.columns {
                if col.name.eq_ignore_ascii_case(candidate) {
                    return Some(col.name.clone());
                }
            }
        }

        if let Some(map) = &self.display_names {
            for candidate in candidates {
                for col in &entry.columns {
                    if let Some(label) = map.get(&col.name) {
                        if label.contains(candidate) {
                            return Some(col.name.clone());
                        }
                    }
                }
            }
        }

        for candidate in candidates {
            let lowered = candidate.to_lowercase();
            for col in &entry.columns {
                if col.name.to_lowercase().contains(&lowered) {
                    return Some(col.name.clone());
                }
            }
        }

        None
    }

    /// Renders the snapshot as a text block for LLM prompts: tables,
    /// columns with type and display label, sample rows, row counts.
    pub fn render_for_prompt(&self) -> String {
        let mut out = String::from("テーブル一覧:\n");

        for table in &self.tables {
            if !table.is_populated() {
                continue;
            }

            out.push_str(&format!(
                "\nテーブル: {} ({}行)\nカラム:\n",
                table.name, table.row_count
            ));
            for col in &table.columns {
                let label = self
                    .display_name(&col.name)
                    .map(|l| format!(" ({})", l))
                    .unwrap_or_default();
                out.push_str(&format!("- {} {}{}\n", col.name, col.decl_type, label));
            }

            if !table.sample_rows.is_empty() {
                out.push_str("サンプル行:\n");
                for row in &table.sample_rows {
                    let cells: Vec<String> = row.iter().map(render_scalar).collect();
                    out.push_str(&format!("| {} |\n", cells.join(" | ")));
                }
            }
        }

        out
    }
}

fn render_scalar(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => "NULL".to_string(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Parses one `PRAGMA table_info` row: [cid, name, type, notnull, dflt, pk].
pub fn column_from_pragma_row(row: &[serde_json::Value]) -> Option<ColumnInfo> {
    let name = row.get(1)?.as_str()?.to_string();
    let decl_type = row
        .get(2)
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let notnull = row.get(3).and_then(|v| v.as_i64()).unwrap_or(0);
    let default_value = row.get(4).and_then(|v| match v {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    });
    let pk = row.get(5).and_then(|v| v.as_i64()).unwrap_or(0);

    Some(ColumnInfo {
        name,
        decl_type,
        nullable: notnull == 0,
        primary_key: pk != 0,
        default_value,
    })
}

/// Discovers tables, columns and bounded samples for one database via the
/// database service.
pub struct SchemaIntrospector {
    client: Arc<DbServiceClient>,
}

impl SchemaIntrospector {
    pub fn new(client: Arc<DbServiceClient>) -> Self {
        Self { client }
    }

    /// Builds a snapshot, retrying on transport failure to absorb
    /// container startup races.
    pub async fn snapshot(&self, profile: &DatabaseProfile) -> Result<SchemaSnapshot, QueryError> {
        let mut last_error = QueryError::UpstreamUnavailable("no attempt made".to_string());

        for attempt in 1..=MAX_ATTEMPTS {
            match self.try_snapshot(profile).await {
                Ok(snapshot) => {
                    if snapshot.is_empty() {
                        return Err(QueryError::EmptySchema(profile.name.clone()));
                    }
                    return Ok(snapshot);
                }
                Err(QueryError::UpstreamUnavailable(msg)) => {
                    warn!(
                        "Schema introspection for {} failed (attempt {}/{}): {}",
                        profile.name, attempt, MAX_ATTEMPTS, msg
                    );
                    last_error = QueryError::UpstreamUnavailable(msg);
                    if attempt < MAX_ATTEMPTS {
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                }
                Err(other) => return Err(other),
            }
        }

        Err(last_error)
    }

    async fn try_snapshot(&self, profile: &DatabaseProfile) -> Result<SchemaSnapshot, QueryError> {
        let status = self.client.status().await?;

        let table_names = status
            .databases
            .get(&profile.name)
            .map(|db| db.tables.clone())
            .ok_or_else(|| QueryError::UnknownDatabase(profile.name.clone()))?;

        let mut tables = Vec::with_capacity(table_names.len());
        for table_name in &table_names {
            // Per-table failures degrade to empty entries instead of
            // aborting the whole snapshot.
            let entry = match self.introspect_table(&profile.name, table_name).await {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(
                        "Introspection of table {}.{} failed: {}",
                        profile.name, table_name, e
                    );
                    TableEntry {
                        name: table_name.clone(),
                        columns: Vec::new(),
                        sample_rows: Vec::new(),
                        row_count: 0,
                    }
                }
            };
            tables.push(entry);
        }

        let display_names = profile
            .column_mapping
            .as_deref()
            .and_then(load_display_names);

        info!(
            "Snapshot for {}: {} tables, {} populated",
            profile.name,
            tables.len(),
            tables.iter().filter(|t| t.is_populated()).count()
        );

        Ok(SchemaSnapshot {
            db: profile.name.clone(),
            tables,
            display_names,
        })
    }

    async fn introspect_table(&self, db: &str, table: &str) -> Result<TableEntry, QueryError> {
        let pragma = self
            .client
            .sql_query(&format!("PRAGMA table_info({})", table), db)
            .await?;

        let columns: Vec<ColumnInfo> = pragma
            .results
            .iter()
            .filter_map(|row| column_from_pragma_row(row))
            .collect();

        let sample = self
            .client
            .sql_query(&format!("SELECT * FROM {} LIMIT {}", table, SAMPLE_ROWS), db)
            .await
            .map(|r| r.results)
            .unwrap_or_default();

        let row_count = self
            .client
            .sql_query(&format!("SELECT COUNT(*) FROM {}", table), db)
            .await
            .ok()
            .and_then(|r| {
                r.results
                    .first()
                    .and_then(|row| row.first())
                    .and_then(|v| v.as_u64())
            })
            .unwrap_or(0) as usize;

        debug!("Table {}.{}: {} columns, {} rows", db, table, columns.len(), row_count);

        Ok(TableEntry {
            name: table.to_string(),
            columns,
            sample_rows: sample,
            row_count,
        })
    }
}

/// Loads the persisted display-name mapping if the file exists. Missing or
/// malformed files are advisory only and never fail introspection.
fn load_display_names(path: &str) -> Option<HashMap<String, String>> {
    match std::fs::read_to_string(path) {
        Ok(raw) => match serde_json::from_str::<HashMap<String, String>>(&raw) {
            Ok(map) if !map.is_empty() => Some(map),
            Ok(_) => None,
            Err(e) => {
                warn!("Could not parse column mapping {}: {}", path, e);
                None
            }
        },
        Err(_) => None,
    }
}
