pub mod llm;
pub mod orchestrator;
pub mod rule;

use crate::error::QueryError;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Translator ordering preference carried by each request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    RuleFirst,
    LlmFirst,
    RuleOnly,
    LlmOnly,
}

impl FromStr for Strategy {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rule_first" => Ok(Strategy::RuleFirst),
            "llm_first" => Ok(Strategy::LlmFirst),
            "rule_only" => Ok(Strategy::RuleOnly),
            "llm_only" => Ok(Strategy::LlmOnly),
            other => Err(QueryError::InvalidInput(format!(
                "unknown strategy '{}': expected rule_first, llm_first, rule_only or llm_only",
                other
            ))),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Strategy::RuleFirst => "rule_first",
            Strategy::LlmFirst => "llm_first",
            Strategy::RuleOnly => "rule_only",
            Strategy::LlmOnly => "llm_only",
        };
        write!(f, "{}", name)
    }
}

/// Immutable per-request value: the question, the database selector and the
/// strategy preference.
#[derive(Debug, Clone, Serialize)]
pub struct TranslationRequest {
    pub question: String,
    pub db: String,
    pub strategy: Strategy,
}

/// One concrete step of the strategy cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Rule,
    RuleSimplified,
    Llm,
    LlmRepair,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StepKind::Rule => "rule",
            StepKind::RuleSimplified => "rule_simplified",
            StepKind::Llm => "llm",
            StepKind::LlmRepair => "llm_repair",
        };
        write!(f, "{}", name)
    }
}

/// A candidate SQL statement together with the step that produced it and
/// its diagnostic notes (extracted conjuncts, sanitisation remarks).
#[derive(Debug, Clone)]
pub struct Translation {
    pub sql: String,
    pub step: StepKind,
    pub notes: Vec<String>,
}

/// Trace entry: one attempt of the cascade with its outcome.
#[derive(Debug, Clone, Serialize)]
pub struct Attempt {
    pub step: StepKind,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Attempt {
    pub fn succeeded(step: StepKind) -> Self {
        Self {
            step,
            ok: true,
            error_kind: None,
            detail: None,
        }
    }

    pub fn failed(step: StepKind, error: &QueryError) -> Self {
        Self {
            step,
            ok: false,
            error_kind: Some(error.kind().to_string()),
            detail: Some(error.to_string()),
        }
    }
}

/// Context for an LLM repair call: the SQL that failed and the database's
/// error message.
#[derive(Debug, Clone)]
pub struct PriorFailure {
    pub sql: String,
    pub error: String,
}
