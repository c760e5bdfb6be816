use crate::db::schema::SchemaSnapshot;
use crate::error::QueryError;
use crate::llm::{LlmError, LlmManager, ModelRequest};
use crate::translate::{PriorFailure, StepKind, Translation, TranslationRequest};
use std::sync::Arc;
use tracing::{debug, info};

const MAX_OUTPUT_TOKENS: usize = 1000;
const PRIMARY_TEMPERATURE: f32 = 0.0;
const REPAIR_TEMPERATURE: f32 = 0.2;

const SYSTEM_DIRECTIVE: &str = "あなたは特許データベースのSQLクエリ生成専門AIアシスタントです。\
ユーザーの質問に対して必ずSQLクエリのみを返します。説明文は一切出力しません。";

/// Model-backed translator. Renders the snapshot into the prompt and asks
/// for a single SQLite SELECT; performs no semantic checks beyond the
/// SELECT/WITH prefix. Disabled entirely when credentials are missing.
pub struct LlmTranslator {
    manager: Arc<LlmManager>,
    model_id: String,
    enabled: bool,
}

impl LlmTranslator {
    pub fn new(manager: Arc<LlmManager>, model_id: String, enabled: bool) -> Self {
        Self {
            manager,
            model_id,
            enabled,
        }
    }

    pub async fn translate(
        &self,
        request: &TranslationRequest,
        snapshot: &SchemaSnapshot,
        prior: Option<&PriorFailure>,
    ) -> Result<Translation, QueryError> {
        if !self.enabled {
            return Err(QueryError::CredentialsMissing);
        }
        if snapshot.is_empty() {
            return Err(QueryError::EmptySchema(request.db.clone()));
        }

        let step = if prior.is_some() {
            StepKind::LlmRepair
        } else {
            StepKind::Llm
        };

        let model_request = ModelRequest {
            model_id: self.model_id.clone(),
            system: SYSTEM_DIRECTIVE.to_string(),
            prompt: build_prompt(&request.question, snapshot, prior),
            temperature: if prior.is_some() {
                REPAIR_TEMPERATURE
            } else {
                PRIMARY_TEMPERATURE
            },
            max_tokens: MAX_OUTPUT_TOKENS,
        };

        let raw = self.manager.invoke(&model_request).await.map_err(|e| match e {
            LlmError::ConnectionError(msg) => QueryError::UpstreamUnavailable(msg),
            LlmError::ResponseError(msg) | LlmError::ConfigError(msg) => {
                QueryError::InvalidGeneration(msg)
            }
        })?;

        let sql = sanitize_sql(&raw);
        debug!("Model output for '{}': {}", request.question, sql);

        if !begins_read_only(&sql) {
            info!("Rejecting generated statement without SELECT/WITH prefix");
            return Err(QueryError::InvalidGeneration(format!(
                "generated statement does not begin with SELECT or WITH: {}",
                truncate_for_log(&sql)
            )));
        }

        Ok(Translation {
            sql,
            step,
            notes: vec![format!("model: {}", self.model_id)],
        })
    }
}

fn build_prompt(question: &str, snapshot: &SchemaSnapshot, prior: Option<&PriorFailure>) -> String {
    let mut prompt = format!(
        "あなたは特許データベースのSQLクエリ生成の専門家です。\n\
         次のSQL問い合わせを生成してください。\n\n\
         ### データベースの種類: SQLite\n\n\
         ### データベーススキーマ情報:\n{}\n\
         ### 質問:\n{}\n",
        snapshot.render_for_prompt(),
        question
    );

    if let Some(prior) = prior {
        prompt.push_str(&format!(
            "\n### 前回生成したSQL:\n{}\n\n### 実行時のエラー:\n{}\n\n\
             エラーを修正した動作するSQLクエリを生成してください。\n",
            prior.sql, prior.error
        ));
    }

    prompt.push_str(
        "\n### 応答:\nSQLクエリのみを出力してください。説明は不要です。\
         バックティック(```)も含めないでください。\n",
    );
    prompt
}

/// Strips code-fence markers and trailing semicolons from model output.
pub fn sanitize_sql(raw: &str) -> String {
    let trimmed = raw.trim();

    let inner = if let Some(start) = trimmed.find("```sql") {
        let after = &trimmed[start + 6..];
        match after.find("```") {
            Some(end) => &after[..end],
            None => after,
        }
    } else if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        match after.find("```") {
            Some(end) => &after[..end],
            None => after,
        }
    } else {
        trimmed
    };

    inner.trim().trim_end_matches(';').trim().to_string()
}

fn begins_read_only(sql: &str) -> bool {
    let upper = sql.trim_start().to_uppercase();
    upper.starts_with("SELECT") || upper.starts_with("WITH")
}

fn truncate_for_log(sql: &str) -> String {
    sql.chars().take(120).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::{ColumnInfo, SchemaSnapshot, TableEntry};
    use crate::llm::{LlmError, ModelInvoker, ModelRequest};
    use crate::translate::Strategy;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct MockInvoker {
        replies: Mutex<Vec<Result<String, String>>>,
        seen: Arc<Mutex<Vec<ModelRequest>>>,
    }

    impl MockInvoker {
        fn returning(replies: Vec<Result<String, String>>) -> Self {
            Self {
                replies: Mutex::new(replies),
                seen: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl ModelInvoker for MockInvoker {
        async fn invoke(&self, request: &ModelRequest) -> Result<String, LlmError> {
            self.seen.lock().unwrap().push(request.clone());
            let mut replies = self.replies.lock().unwrap();
            if replies.is_empty() {
                return Err(LlmError::ResponseError("no scripted reply".into()));
            }
            replies.remove(0).map_err(LlmError::ResponseError)
        }
    }

    fn snapshot() -> SchemaSnapshot {
        SchemaSnapshot {
            db: "inpit".to_string(),
            tables: vec![TableEntry {
                name: "inpit_data".to_string(),
                columns: vec![ColumnInfo {
                    name: "title".to_string(),
                    decl_type: "TEXT".to_string(),
                    nullable: true,
                    primary_key: false,
                    default_value: None,
                }],
                sample_rows: Vec::new(),
                row_count: 10,
            }],
            display_names: None,
        }
    }

    fn request() -> TranslationRequest {
        TranslationRequest {
            question: "トヨタの特許".to_string(),
            db: "inpit".to_string(),
            strategy: Strategy::LlmOnly,
        }
    }

    fn translator(invoker: MockInvoker, enabled: bool) -> LlmTranslator {
        LlmTranslator::new(
            Arc::new(LlmManager::with_invoker(Box::new(invoker))),
            "test-model".to_string(),
            enabled,
        )
    }

    #[test]
    fn sanitize_strips_sql_fence() {
        assert_eq!(
            sanitize_sql("```sql\nSELECT * FROM t;\n```"),
            "SELECT * FROM t"
        );
    }

    #[test]
    fn sanitize_strips_plain_fence_and_semicolon() {
        assert_eq!(sanitize_sql("```\nSELECT 1;\n```"), "SELECT 1");
        assert_eq!(sanitize_sql("  SELECT 1 ;  "), "SELECT 1");
    }

    #[test]
    fn sanitize_keeps_bare_sql() {
        assert_eq!(sanitize_sql("WITH x AS (SELECT 1) SELECT * FROM x"),
                   "WITH x AS (SELECT 1) SELECT * FROM x");
    }

    #[tokio::test]
    async fn disabled_translator_reports_credentials_missing() {
        let t = translator(MockInvoker::returning(vec![]), false);
        let err = t.translate(&request(), &snapshot(), None).await.unwrap_err();
        assert_eq!(err, QueryError::CredentialsMissing);
    }

    #[tokio::test]
    async fn accepts_fenced_select() {
        let t = translator(
            MockInvoker::returning(vec![Ok("```sql\nSELECT * FROM inpit_data LIMIT 5;\n```".into())]),
            true,
        );
        let translation = t.translate(&request(), &snapshot(), None).await.unwrap();
        assert_eq!(translation.sql, "SELECT * FROM inpit_data LIMIT 5");
        assert_eq!(translation.step, StepKind::Llm);
    }

    #[tokio::test]
    async fn rejects_mutating_statement() {
        let t = translator(
            MockInvoker::returning(vec![Ok("DELETE FROM inpit_data".into())]),
            true,
        );
        let err = t.translate(&request(), &snapshot(), None).await.unwrap_err();
        assert!(matches!(err, QueryError::InvalidGeneration(_)));
    }

    #[tokio::test]
    async fn repair_call_is_tagged_and_raises_temperature() {
        let mock = MockInvoker::returning(vec![Ok("SELECT * FROM inpit_data".into())]);
        let seen = Arc::clone(&mock.seen);
        let t = translator(mock, true);

        let prior = PriorFailure {
            sql: "SELECT bogus FROM inpit_data".to_string(),
            error: "no such column: bogus".to_string(),
        };
        let translation = t
            .translate(&request(), &snapshot(), Some(&prior))
            .await
            .unwrap();
        assert_eq!(translation.step, StepKind::LlmRepair);

        let requests = seen.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert!((requests[0].temperature - REPAIR_TEMPERATURE).abs() < f32::EPSILON);
        assert!(requests[0].prompt.contains("no such column: bogus"));
    }

    #[tokio::test]
    async fn primary_call_uses_temperature_zero() {
        let mock = MockInvoker::returning(vec![Ok("SELECT 1".into())]);
        let seen = Arc::clone(&mock.seen);
        let t = translator(mock, true);

        t.translate(&request(), &snapshot(), None).await.unwrap();

        let requests = seen.lock().unwrap();
        assert!((requests[0].temperature - PRIMARY_TEMPERATURE).abs() < f32::EPSILON);
        assert_eq!(requests[0].max_tokens, MAX_OUTPUT_TOKENS);
    }

    #[test]
    fn repair_prompt_carries_sql_and_error() {
        let prior = PriorFailure {
            sql: "SELECT bogus FROM inpit_data".to_string(),
            error: "no such column: bogus".to_string(),
        };
        let prompt = build_prompt("トヨタの特許", &snapshot(), Some(&prior));
        assert!(prompt.contains("SELECT bogus FROM inpit_data"));
        assert!(prompt.contains("no such column: bogus"));
        assert!(prompt.contains("テーブル: inpit_data"));
    }

    #[tokio::test]
    async fn empty_snapshot_is_reported() {
        let t = translator(MockInvoker::returning(vec![Ok("SELECT 1".into())]), true);
        let empty = SchemaSnapshot {
            db: "inpit".to_string(),
            tables: Vec::new(),
            display_names: None,
        };
        let err = t.translate(&request(), &empty, None).await.unwrap_err();
        assert_eq!(err, QueryError::EmptySchema("inpit".to_string()));
    }
}
