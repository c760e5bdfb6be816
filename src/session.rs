use crate::config::{AppConfig, DatabaseProfile};
use crate::db::client::DbServiceClient;
use crate::db::schema::{SchemaIntrospector, SchemaSnapshot};
use crate::error::QueryError;
use crate::exec::{SafeExecutor, RESPONSE_ROW_CAP};
use crate::llm::{LlmError, LlmManager};
use crate::narrate::Narrator;
use crate::translate::llm::LlmTranslator;
use crate::translate::orchestrator::Orchestrator;
use crate::translate::rule::RuleTranslator;
use crate::translate::{Attempt, StepKind, Strategy, TranslationRequest};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info};

/// Presence-and-region check for the model service credentials. LLM-using
/// components degrade when `configured` is false; nothing aborts.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialsStatus {
    pub configured: bool,
    pub region: Option<String>,
}

impl CredentialsStatus {
    pub fn from_env() -> Self {
        let present = |name: &str| {
            std::env::var(name)
                .ok()
                .filter(|v| !v.trim().is_empty())
        };

        let access_key = present("AWS_ACCESS_KEY_ID");
        let secret_key = present("AWS_SECRET_ACCESS_KEY");
        // AWS_DEFAULT_REGION, deliberately not AWS_REGION.
        let region = present("AWS_DEFAULT_REGION");

        Self {
            configured: access_key.is_some() && secret_key.is_some() && region.is_some(),
            region,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RefreshOutcome {
    pub refreshed: Vec<String>,
    pub failed: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

/// The one response shape of the consumer surface: request echo, chosen
/// SQL, shaped (possibly truncated) rows, narration and the attempt trace.
#[derive(Debug, Serialize)]
pub struct CoreResponse {
    pub success: bool,
    pub question: String,
    pub db: String,
    pub strategy: Strategy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub produced_by: Option<StepKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_columns: Option<Vec<String>>,
    pub rows: Vec<serde_json::Map<String, serde_json::Value>>,
    pub row_count: usize,
    pub truncated: bool,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub narration: Option<String>,
    pub narration_fallback: bool,
    /// Diagnostic notes from the winning translator (extracted conjuncts,
    /// model id).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
    pub trace: Vec<Attempt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

/// Model identifiers carried by the session. The embedding model is
/// produced for other parts of the stack and is not part of the
/// translation contract.
#[derive(Debug, Clone, Serialize)]
pub struct ModelsInfo {
    pub translator: String,
    pub narrator: String,
    pub embedding: String,
}

/// Owns every long-lived component of the query core: the upstream
/// clients, the translators, and the per-database snapshot cache.
///
/// Each request walks introspect -> translate -> execute -> narrate, with
/// retries re-entering their own stage and two terminal outcomes: a
/// successful CoreResponse or a taxonomy-tagged failure.
pub struct Session {
    config: AppConfig,
    db_client: Arc<DbServiceClient>,
    introspector: SchemaIntrospector,
    executor: SafeExecutor,
    rule: RuleTranslator,
    llm_manager: Arc<LlmManager>,
    credentials: CredentialsStatus,
    snapshots: RwLock<HashMap<String, Arc<SchemaSnapshot>>>,
}

impl Session {
    pub fn new(config: AppConfig) -> Result<Self, LlmError> {
        let credentials = CredentialsStatus::from_env();
        let llm_manager = Arc::new(LlmManager::new(&config.models)?);
        Ok(Self::assemble(config, credentials, llm_manager))
    }

    /// Constructor with explicit credential state and model manager; the
    /// seam used by tests and by hosts that manage credentials themselves.
    pub fn with_components(
        config: AppConfig,
        credentials: CredentialsStatus,
        llm_manager: Arc<LlmManager>,
    ) -> Self {
        Self::assemble(config, credentials, llm_manager)
    }

    fn assemble(
        config: AppConfig,
        credentials: CredentialsStatus,
        llm_manager: Arc<LlmManager>,
    ) -> Self {
        let db_client = Arc::new(DbServiceClient::new(&config.upstream.base_url));
        if !credentials.configured {
            info!("Model credentials not configured; LLM translation and narration disabled");
        }
        Self {
            introspector: SchemaIntrospector::new(Arc::clone(&db_client)),
            executor: SafeExecutor::new(Arc::clone(&db_client)),
            rule: RuleTranslator::new(),
            db_client,
            config,
            credentials,
            llm_manager,
            snapshots: RwLock::new(HashMap::new()),
        }
    }

    pub fn credentials_status(&self) -> CredentialsStatus {
        self.credentials.clone()
    }

    pub async fn upstream_health(&self) -> Result<(), QueryError> {
        self.db_client.health().await
    }

    pub fn configured_databases(&self) -> Vec<String> {
        self.config.databases.iter().map(|d| d.name.clone()).collect()
    }

    pub fn models(&self) -> ModelsInfo {
        ModelsInfo {
            translator: self.config.models.translator.clone(),
            narrator: self.config.models.narrator.clone(),
            embedding: self.config.models.embedding.clone(),
        }
    }

    pub async fn cached_snapshot_count(&self) -> usize {
        self.snapshots.read().await.len()
    }

    /// The primary entry point: validates, introspects, translates through
    /// the strategy cascade, executes and narrates.
    pub async fn process(
        &self,
        question: &str,
        db_selector: &str,
        strategy: Option<&str>,
    ) -> CoreResponse {
        let question = question.trim().to_string();
        let strategy_name = strategy.unwrap_or(&self.config.default_strategy);

        let strategy = match strategy_name.parse::<Strategy>() {
            Ok(strategy) => strategy,
            Err(e) => {
                return failure_response(&question, db_selector, Strategy::RuleFirst, Vec::new(), &e);
            }
        };

        if question.is_empty() {
            let e = QueryError::InvalidInput("質問が空です。質問を入力してください。".to_string());
            return failure_response(&question, db_selector, strategy, Vec::new(), &e);
        }

        let profile = match self.config.database(db_selector) {
            Some(profile) => profile.clone(),
            None => {
                let e = QueryError::UnknownDatabase(db_selector.to_string());
                return failure_response(&question, db_selector, strategy, Vec::new(), &e);
            }
        };

        let snapshot = match self.snapshot_for(&profile).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!("Introspection failed for {}: {}", profile.name, e);
                return failure_response(&question, db_selector, strategy, Vec::new(), &e);
            }
        };

        let request = TranslationRequest {
            question: question.clone(),
            db: profile.name.clone(),
            strategy,
        };

        let llm_translator = LlmTranslator::new(
            Arc::clone(&self.llm_manager),
            self.config.models.translator.clone(),
            self.credentials.configured,
        );
        let orchestrator = Orchestrator::new(&self.rule, &llm_translator, &profile);

        let success = match orchestrator.run(&request, &snapshot, &self.executor).await {
            Ok(success) => success,
            Err(failure) => {
                info!(
                    "Query for '{}' failed after {} attempts: {}",
                    question,
                    failure.trace.len(),
                    failure.error
                );
                return failure_response(&question, db_selector, strategy, failure.trace, &failure.error);
            }
        };

        let mut execution = success.execution;
        if let Some(map) = &snapshot.display_names {
            execution.apply_display_names(map);
        }
        let (execution, truncated) = execution.truncated(RESPONSE_ROW_CAP);

        let narrator = Narrator::new(
            Arc::clone(&self.llm_manager),
            self.config.models.narrator.clone(),
            self.credentials.configured,
        );
        let (narration, narration_error) = narrator
            .narrate(&question, &success.sql, &execution)
            .await;

        CoreResponse {
            success: true,
            question,
            db: db_selector.to_string(),
            strategy,
            sql: Some(success.sql),
            produced_by: Some(success.step),
            columns: Some(execution.columns),
            display_columns: execution.display_columns,
            rows: execution.rows,
            row_count: execution.row_count,
            truncated,
            duration_ms: execution.duration_ms,
            narration: Some(narration),
            narration_fallback: narration_error.is_some(),
            notes: success.notes,
            trace: success.trace,
            error: None,
        }
    }

    /// Re-introspects every configured database, replacing cache entries
    /// wholesale. The operational hook behind POST /api/refresh-schemas.
    pub async fn refresh_schemas(&self) -> RefreshOutcome {
        let mut refreshed = Vec::new();
        let mut failed = Vec::new();

        for profile in &self.config.databases {
            match self.introspector.snapshot(profile).await {
                Ok(snapshot) => {
                    let mut cache = self.snapshots.write().await;
                    cache.insert(profile.name.clone(), Arc::new(snapshot));
                    refreshed.push(profile.name.clone());
                }
                Err(e) => {
                    error!("Schema refresh failed for {}: {}", profile.name, e);
                    failed.push(profile.name.clone());
                }
            }
        }

        RefreshOutcome { refreshed, failed }
    }

    /// Returns the cached snapshot, introspecting on miss. An empty cached
    /// snapshot triggers one refresh before being surfaced.
    async fn snapshot_for(&self, profile: &DatabaseProfile) -> Result<Arc<SchemaSnapshot>, QueryError> {
        {
            let cache = self.snapshots.read().await;
            if let Some(snapshot) = cache.get(&profile.name) {
                if !snapshot.is_empty() {
                    return Ok(Arc::clone(snapshot));
                }
            }
        }

        let snapshot = match self.introspector.snapshot(profile).await {
            Ok(snapshot) => snapshot,
            // One refresh on an empty schema, then surface.
            Err(QueryError::EmptySchema(_)) => self.introspector.snapshot(profile).await?,
            Err(e) => return Err(e),
        };

        let snapshot = Arc::new(snapshot);
        let mut cache = self.snapshots.write().await;
        cache.insert(profile.name.clone(), Arc::clone(&snapshot));
        Ok(snapshot)
    }
}

fn failure_response(
    question: &str,
    db: &str,
    strategy: Strategy,
    trace: Vec<Attempt>,
    error: &QueryError,
) -> CoreResponse {
    CoreResponse {
        success: false,
        question: question.to_string(),
        db: db.to_string(),
        strategy,
        sql: None,
        produced_by: None,
        columns: None,
        display_columns: None,
        rows: Vec::new(),
        row_count: 0,
        truncated: false,
        duration_ms: 0,
        narration: None,
        narration_fallback: false,
        notes: Vec::new(),
        trace,
        error: Some(ErrorBody {
            kind: error.kind().to_string(),
            message: error.user_message(),
        }),
    }
}
