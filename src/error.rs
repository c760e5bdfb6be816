use std::error::Error;
use std::fmt;

/// Failure taxonomy for the query pipeline. Every stage reports its
/// failures as one of these values; the orchestrator decides whether a
/// kind is retryable, fatal for one cascade path, or fatal for the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// Requested database selector is not configured.
    UnknownDatabase(String),
    /// Database or model service unreachable after retries.
    UpstreamUnavailable(String),
    /// Introspection returned no usable tables.
    EmptySchema(String),
    /// LLM components are gated off because credentials are not configured.
    CredentialsMissing,
    /// Rule translator produced no conjunct.
    NoRuleMatch,
    /// LLM output did not begin with SELECT/WITH after sanitisation.
    InvalidGeneration(String),
    /// Statement failed the read-only predicate.
    DisallowedStatement(String),
    /// Database service returned an error for the SQL.
    ExecutionError(String),
    /// Narrator failed; the caller falls back to a deterministic summary.
    NarrationUnavailable(String),
    /// Consumer-surface validation failure (empty question, bad strategy).
    InvalidInput(String),
}

impl QueryError {
    /// Stable tag used in traces and API responses.
    pub fn kind(&self) -> &'static str {
        match self {
            QueryError::UnknownDatabase(_) => "unknown_database",
            QueryError::UpstreamUnavailable(_) => "upstream_unavailable",
            QueryError::EmptySchema(_) => "empty_schema",
            QueryError::CredentialsMissing => "credentials_missing",
            QueryError::NoRuleMatch => "no_rule_match",
            QueryError::InvalidGeneration(_) => "invalid_generation",
            QueryError::DisallowedStatement(_) => "disallowed_statement",
            QueryError::ExecutionError(_) => "execution_error",
            QueryError::NarrationUnavailable(_) => "narration_unavailable",
            QueryError::InvalidInput(_) => "invalid_input",
        }
    }

    /// Short message for API consumers, Japanese where the upstream
    /// services answered in Japanese.
    pub fn user_message(&self) -> String {
        match self {
            QueryError::UnknownDatabase(db) => {
                format!("指定されたデータベース '{}' は設定されていません。", db)
            }
            QueryError::UpstreamUnavailable(msg) => {
                format!("データベースサービスに接続できません: {}", msg)
            }
            QueryError::EmptySchema(db) => {
                format!("データベース '{}' のスキーマ情報を取得できませんでした。", db)
            }
            QueryError::CredentialsMissing => {
                "AWS認証情報が設定されていないか無効です。AWS_ACCESS_KEY_ID、\
                 AWS_SECRET_ACCESS_KEY、AWS_DEFAULT_REGIONを確認してください。"
                    .to_string()
            }
            QueryError::NoRuleMatch => {
                "質問からSQL条件を抽出できませんでした。別の表現を試してください。".to_string()
            }
            QueryError::InvalidGeneration(_) => {
                "SQLクエリの生成に失敗しました。別のクエリを試してください。".to_string()
            }
            QueryError::DisallowedStatement(_) => {
                "読み取り専用でないSQL文が生成されたため実行を拒否しました。".to_string()
            }
            QueryError::ExecutionError(msg) => format!("SQL実行エラー: {}", msg),
            QueryError::NarrationUnavailable(msg) => {
                format!("結果の説明生成中にエラーが発生しました: {}", msg)
            }
            QueryError::InvalidInput(msg) => msg.clone(),
        }
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryError::UnknownDatabase(db) => write!(f, "unknown database: {}", db),
            QueryError::UpstreamUnavailable(msg) => write!(f, "upstream unavailable: {}", msg),
            QueryError::EmptySchema(db) => write!(f, "empty schema for database: {}", db),
            QueryError::CredentialsMissing => write!(f, "model credentials missing"),
            QueryError::NoRuleMatch => write!(f, "no rule matched the question"),
            QueryError::InvalidGeneration(msg) => write!(f, "invalid generated SQL: {}", msg),
            QueryError::DisallowedStatement(sql) => {
                write!(f, "statement rejected by read-only predicate: {}", sql)
            }
            QueryError::ExecutionError(msg) => write!(f, "execution error: {}", msg),
            QueryError::NarrationUnavailable(msg) => write!(f, "narration unavailable: {}", msg),
            QueryError::InvalidInput(msg) => write!(f, "invalid input: {}", msg),
        }
    }
}

impl Error for QueryError {}
