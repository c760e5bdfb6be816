use crate::error::QueryError;
use crate::exec::ExecutionResult;
use crate::llm::{LlmError, LlmManager, ModelRequest};
use std::sync::Arc;
use tracing::warn;

const NARRATION_ROW_CAP: usize = 10;
const NARRATION_TEMPERATURE: f32 = 0.1;
const MAX_OUTPUT_TOKENS: usize = 2000;

const SYSTEM_DIRECTIVE: &str =
    "あなたは特許データベース検索結果を日本語で簡潔に要約する専門家です。";

/// Summarises tabular output as prose. Model failures never propagate: the
/// deterministic fallback template always produces an answer.
pub struct Narrator {
    manager: Arc<LlmManager>,
    model_id: String,
    enabled: bool,
}

impl Narrator {
    pub fn new(manager: Arc<LlmManager>, model_id: String, enabled: bool) -> Self {
        Self {
            manager,
            model_id,
            enabled,
        }
    }

    /// Returns the narration plus the non-fatal error, if the model could
    /// not be used and the fallback was taken instead.
    pub async fn narrate(
        &self,
        question: &str,
        sql: &str,
        execution: &ExecutionResult,
    ) -> (String, Option<QueryError>) {
        if !self.enabled {
            return (
                fallback_summary(execution),
                Some(QueryError::NarrationUnavailable(
                    "credentials not configured".to_string(),
                )),
            );
        }

        let request = ModelRequest {
            model_id: self.model_id.clone(),
            system: SYSTEM_DIRECTIVE.to_string(),
            prompt: build_prompt(question, sql, execution),
            temperature: NARRATION_TEMPERATURE,
            max_tokens: MAX_OUTPUT_TOKENS,
        };

        match self.manager.invoke(&request).await {
            Ok(text) => (text.trim().to_string(), None),
            Err(e) => {
                warn!("Narration failed, using fallback: {}", e);
                let reason = match e {
                    LlmError::ConnectionError(msg)
                    | LlmError::ResponseError(msg)
                    | LlmError::ConfigError(msg) => msg,
                };
                (
                    fallback_summary(execution),
                    Some(QueryError::NarrationUnavailable(reason)),
                )
            }
        }
    }
}

fn build_prompt(question: &str, sql: &str, execution: &ExecutionResult) -> String {
    format!(
        "あなたは特許データベース検索結果のわかりやすい解説を行う専門家です。\n\
         次のSQL検索結果を、日本語で要約し説明してください。\n\n\
         ### ユーザーの質問:\n{}\n\n\
         ### 実行したSQL:\n{}\n\n\
         ### SQL検索結果:\n{}\n\
         ### 応答:\n\
         検索結果について、質問に直接答える形で簡潔に説明してください。\
         件数に触れ、結果が0件の場合はその旨を明記してください。\
         SQL文自体は繰り返さないでください。\n",
        question,
        sql,
        render_results(execution)
    )
}

fn render_results(execution: &ExecutionResult) -> String {
    if execution.row_count == 0 {
        return "結果は0件でした。\n".to_string();
    }

    let mut out = format!("結果 ({}件):\n\n", execution.row_count);

    out.push_str(&format!("| {} |\n", execution.columns.join(" | ")));
    out.push_str(&format!(
        "| {} |\n",
        execution
            .columns
            .iter()
            .map(|_| "---")
            .collect::<Vec<_>>()
            .join(" | ")
    ));

    for row in execution.rows.iter().take(NARRATION_ROW_CAP) {
        let cells: Vec<String> = execution
            .columns
            .iter()
            .map(|c| render_cell(row.get(c)))
            .collect();
        out.push_str(&format!("| {} |\n", cells.join(" | ")));
    }

    if execution.row_count > NARRATION_ROW_CAP {
        out.push_str(&format!(
            "...(他 {} 件省略)...\n",
            execution.row_count - NARRATION_ROW_CAP
        ));
    }

    out
}

fn render_cell(value: Option<&serde_json::Value>) -> String {
    match value {
        None | Some(serde_json::Value::Null) => "NULL".to_string(),
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Deterministic narration used when the model is unavailable: the row
/// count and, if any, the first row's values.
pub fn fallback_summary(execution: &ExecutionResult) -> String {
    if execution.row_count == 0 {
        return "検索結果は0件でした。該当するデータは見つかりませんでした。".to_string();
    }

    let first = execution
        .rows
        .first()
        .map(|row| {
            execution
                .columns
                .iter()
                .map(|c| format!("{}: {}", c, render_cell(row.get(c))))
                .collect::<Vec<_>>()
                .join(", ")
        })
        .unwrap_or_default();

    format!(
        "検索結果は{}件でした。最初の結果: {}",
        execution.row_count, first
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ModelInvoker;
    use async_trait::async_trait;
    use serde_json::json;

    struct FailingInvoker;

    #[async_trait]
    impl ModelInvoker for FailingInvoker {
        async fn invoke(&self, _request: &ModelRequest) -> Result<String, LlmError> {
            Err(LlmError::ConnectionError("timeout".into()))
        }
    }

    struct EchoInvoker;

    #[async_trait]
    impl ModelInvoker for EchoInvoker {
        async fn invoke(&self, _request: &ModelRequest) -> Result<String, LlmError> {
            Ok("2020年のトヨタの特許は5件見つかりました。".to_string())
        }
    }

    fn execution(n: usize) -> ExecutionResult {
        let columns = vec!["title".to_string(), "filing_date".to_string()];
        let rows = (0..n)
            .map(|i| {
                let mut row = serde_json::Map::new();
                row.insert("title".to_string(), json!(format!("特許{}", i)));
                row.insert("filing_date".to_string(), json!("2020-01-01"));
                row
            })
            .collect::<Vec<_>>();
        ExecutionResult {
            columns,
            display_columns: None,
            row_count: n,
            rows,
            duration_ms: 3,
        }
    }

    #[tokio::test]
    async fn disabled_narrator_uses_fallback_immediately() {
        let narrator = Narrator::new(
            Arc::new(LlmManager::with_invoker(Box::new(FailingInvoker))),
            "m".to_string(),
            false,
        );
        let (text, error) = narrator.narrate("質問", "SELECT 1", &execution(2)).await;
        assert!(text.contains("2件"));
        assert!(matches!(error, Some(QueryError::NarrationUnavailable(_))));
    }

    #[tokio::test]
    async fn model_failure_degrades_to_fallback() {
        let narrator = Narrator::new(
            Arc::new(LlmManager::with_invoker(Box::new(FailingInvoker))),
            "m".to_string(),
            true,
        );
        let (text, error) = narrator.narrate("質問", "SELECT 1", &execution(1)).await;
        assert!(text.contains("1件"));
        assert!(text.contains("特許0"));
        assert!(matches!(error, Some(QueryError::NarrationUnavailable(_))));
    }

    #[tokio::test]
    async fn model_success_is_returned_verbatim() {
        let narrator = Narrator::new(
            Arc::new(LlmManager::with_invoker(Box::new(EchoInvoker))),
            "m".to_string(),
            true,
        );
        let (text, error) = narrator.narrate("質問", "SELECT 1", &execution(5)).await;
        assert_eq!(text, "2020年のトヨタの特許は5件見つかりました。");
        assert!(error.is_none());
    }

    #[test]
    fn empty_result_fallback_mentions_zero() {
        let text = fallback_summary(&execution(0));
        assert!(text.contains("0件"));
    }

    #[test]
    fn prompt_table_caps_rows_and_notes_elision() {
        let rendered = render_results(&execution(15));
        assert!(rendered.contains("結果 (15件)"));
        assert!(rendered.contains("...(他 5 件省略)..."));
        assert_eq!(rendered.matches("| 特許").count(), 10);
    }

    #[test]
    fn prompt_mentions_question_and_sql_once() {
        let prompt = build_prompt("トヨタの特許", "SELECT * FROM t", &execution(1));
        assert!(prompt.contains("トヨタの特許"));
        assert!(prompt.contains("SELECT * FROM t"));
    }
}
