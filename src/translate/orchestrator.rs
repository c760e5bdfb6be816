use crate::config::DatabaseProfile;
use crate::db::schema::SchemaSnapshot;
use crate::error::QueryError;
use crate::exec::{is_read_only, ExecutionResult, SqlRunner};
use crate::translate::llm::LlmTranslator;
use crate::translate::rule::RuleTranslator;
use crate::translate::{Attempt, PriorFailure, StepKind, Strategy, Translation, TranslationRequest};
use tracing::{info, warn};

/// Hard ceiling on cascade attempts; the static plans stay well below it.
const MAX_ATTEMPTS: usize = 6;

/// Successful cascade outcome: the accepted SQL, the step that produced
/// it, its execution, and the full attempt trace.
#[derive(Debug)]
pub struct CascadeSuccess {
    pub sql: String,
    pub step: StepKind,
    pub notes: Vec<String>,
    pub execution: ExecutionResult,
    pub trace: Vec<Attempt>,
}

/// Exhausted cascade: the last error of the last attempted step, plus the
/// trace of everything tried.
#[derive(Debug)]
pub struct CascadeFailure {
    pub error: QueryError,
    pub trace: Vec<Attempt>,
}

enum PlannedStep {
    Rule,
    RuleSimplified,
    Llm(Option<PriorFailure>),
}

enum StepOutcome {
    Done(Translation, ExecutionResult),
    TranslateFailed(QueryError),
    ExecFailed { sql: String, error: String },
    Fatal(QueryError),
}

enum UnitOutcome {
    Done(Translation, ExecutionResult),
    Failed(QueryError),
    Fatal(QueryError),
}

#[derive(Clone, Copy, PartialEq)]
enum Unit {
    Rule,
    Llm,
}

/// Applies the strategy cascade: translator order, bounded repair and
/// simplification retries, and the read-only re-check on every candidate.
pub struct Orchestrator<'a> {
    rule: &'a RuleTranslator,
    llm: &'a LlmTranslator,
    profile: &'a DatabaseProfile,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        rule: &'a RuleTranslator,
        llm: &'a LlmTranslator,
        profile: &'a DatabaseProfile,
    ) -> Self {
        Self { rule, llm, profile }
    }

    pub async fn run(
        &self,
        request: &TranslationRequest,
        snapshot: &SchemaSnapshot,
        runner: &dyn SqlRunner,
    ) -> Result<CascadeSuccess, CascadeFailure> {
        let units: &[Unit] = match request.strategy {
            Strategy::RuleOnly => &[Unit::Rule],
            Strategy::LlmOnly => &[Unit::Llm],
            Strategy::RuleFirst => &[Unit::Rule, Unit::Llm],
            Strategy::LlmFirst => &[Unit::Llm, Unit::Rule],
        };
        // Repair may answer a translation failure only when the LLM is the
        // sole translator; in mixed strategies a translation failure moves
        // to the next translator instead.
        let repair_on_translate_failure = request.strategy == Strategy::LlmOnly;

        let mut trace: Vec<Attempt> = Vec::new();
        let mut last_error = QueryError::NoRuleMatch;

        for unit in units {
            let outcome = match unit {
                Unit::Rule => self.run_rule_unit(request, snapshot, runner, &mut trace).await,
                Unit::Llm => {
                    self.run_llm_unit(
                        request,
                        snapshot,
                        runner,
                        repair_on_translate_failure,
                        &mut trace,
                    )
                    .await
                }
            };

            match outcome {
                UnitOutcome::Done(translation, execution) => {
                    info!(
                        "Cascade for '{}' succeeded via {} after {} attempts",
                        request.question,
                        translation.step,
                        trace.len()
                    );
                    return Ok(CascadeSuccess {
                        sql: translation.sql,
                        step: translation.step,
                        notes: translation.notes,
                        execution,
                        trace,
                    });
                }
                UnitOutcome::Failed(error) => {
                    last_error = error;
                }
                UnitOutcome::Fatal(error) => {
                    return Err(CascadeFailure { error, trace });
                }
            }
        }

        Err(CascadeFailure {
            error: last_error,
            trace,
        })
    }

    /// Rule translator, with one simplified retry on execution failure.
    async fn run_rule_unit(
        &self,
        request: &TranslationRequest,
        snapshot: &SchemaSnapshot,
        runner: &dyn SqlRunner,
        trace: &mut Vec<Attempt>,
    ) -> UnitOutcome {
        match self
            .try_step(PlannedStep::Rule, request, snapshot, runner, trace)
            .await
        {
            StepOutcome::Done(t, e) => UnitOutcome::Done(t, e),
            StepOutcome::Fatal(e) => UnitOutcome::Fatal(e),
            StepOutcome::TranslateFailed(e) => UnitOutcome::Failed(e),
            StepOutcome::ExecFailed { .. } => {
                match self
                    .try_step(PlannedStep::RuleSimplified, request, snapshot, runner, trace)
                    .await
                {
                    StepOutcome::Done(t, e) => UnitOutcome::Done(t, e),
                    StepOutcome::Fatal(e) => UnitOutcome::Fatal(e),
                    StepOutcome::TranslateFailed(e) => UnitOutcome::Failed(e),
                    StepOutcome::ExecFailed { error, .. } => {
                        UnitOutcome::Failed(QueryError::ExecutionError(error))
                    }
                }
            }
        }
    }

    /// LLM translator, with one repair retry. Repair reacts to execution
    /// failures always, and to translation failures only when requested.
    async fn run_llm_unit(
        &self,
        request: &TranslationRequest,
        snapshot: &SchemaSnapshot,
        runner: &dyn SqlRunner,
        repair_on_translate_failure: bool,
        trace: &mut Vec<Attempt>,
    ) -> UnitOutcome {
        let prior = match self
            .try_step(PlannedStep::Llm(None), request, snapshot, runner, trace)
            .await
        {
            StepOutcome::Done(t, e) => return UnitOutcome::Done(t, e),
            StepOutcome::Fatal(e) => return UnitOutcome::Fatal(e),
            StepOutcome::TranslateFailed(QueryError::CredentialsMissing) => {
                return UnitOutcome::Failed(QueryError::CredentialsMissing);
            }
            StepOutcome::TranslateFailed(e) => {
                if !repair_on_translate_failure {
                    return UnitOutcome::Failed(e);
                }
                PriorFailure {
                    sql: String::new(),
                    error: e.to_string(),
                }
            }
            StepOutcome::ExecFailed { sql, error } => PriorFailure { sql, error },
        };

        match self
            .try_step(PlannedStep::Llm(Some(prior)), request, snapshot, runner, trace)
            .await
        {
            StepOutcome::Done(t, e) => UnitOutcome::Done(t, e),
            StepOutcome::Fatal(e) => UnitOutcome::Fatal(e),
            StepOutcome::TranslateFailed(e) => UnitOutcome::Failed(e),
            StepOutcome::ExecFailed { error, .. } => {
                UnitOutcome::Failed(QueryError::ExecutionError(error))
            }
        }
    }

    async fn try_step(
        &self,
        step: PlannedStep,
        request: &TranslationRequest,
        snapshot: &SchemaSnapshot,
        runner: &dyn SqlRunner,
        trace: &mut Vec<Attempt>,
    ) -> StepOutcome {
        if trace.len() >= MAX_ATTEMPTS {
            return StepOutcome::Fatal(QueryError::InvalidInput(
                "cascade attempt budget exhausted".to_string(),
            ));
        }

        let (step_kind, translated) = match &step {
            PlannedStep::Rule => (
                StepKind::Rule,
                self.rule.translate(request, snapshot, self.profile),
            ),
            PlannedStep::RuleSimplified => (
                StepKind::RuleSimplified,
                self.rule.simplified(request, snapshot, self.profile),
            ),
            PlannedStep::Llm(prior) => {
                let kind = if prior.is_some() {
                    StepKind::LlmRepair
                } else {
                    StepKind::Llm
                };
                (kind, self.llm.translate(request, snapshot, prior.as_ref()).await)
            }
        };

        let translation = match translated {
            Ok(translation) => translation,
            Err(error) => {
                trace.push(Attempt::failed(step_kind, &error));
                return match error {
                    QueryError::UpstreamUnavailable(_) | QueryError::EmptySchema(_) => {
                        StepOutcome::Fatal(error)
                    }
                    other => StepOutcome::TranslateFailed(other),
                };
            }
        };

        // Belt-and-braces re-check before anything reaches the executor.
        if !is_read_only(&translation.sql) {
            let error = QueryError::DisallowedStatement(translation.sql.clone());
            warn!("Translator {} produced unsafe output: {}", step_kind, translation.sql);
            trace.push(Attempt::failed(step_kind, &error));
            return StepOutcome::TranslateFailed(error);
        }

        match runner.run(&translation.sql, &request.db).await {
            Ok(execution) => {
                trace.push(Attempt::succeeded(step_kind));
                StepOutcome::Done(translation, execution)
            }
            Err(QueryError::ExecutionError(message)) => {
                let error = QueryError::ExecutionError(message.clone());
                trace.push(Attempt::failed(step_kind, &error));
                StepOutcome::ExecFailed {
                    sql: translation.sql,
                    error: message,
                }
            }
            Err(QueryError::DisallowedStatement(sql)) => {
                let error = QueryError::DisallowedStatement(sql);
                warn!("Executor rejected statement from {}", step_kind);
                trace.push(Attempt::failed(step_kind, &error));
                StepOutcome::TranslateFailed(error)
            }
            Err(other) => {
                trace.push(Attempt::failed(step_kind, &other));
                StepOutcome::Fatal(other)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::{ColumnInfo, SchemaSnapshot, TableEntry};
    use crate::llm::{LlmError, LlmManager, ModelInvoker, ModelRequest};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    struct MockInvoker {
        replies: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ModelInvoker for MockInvoker {
        async fn invoke(&self, _request: &ModelRequest) -> Result<String, LlmError> {
            let mut replies = self.replies.lock().unwrap();
            if replies.is_empty() {
                return Err(LlmError::ResponseError("out of scripted replies".into()));
            }
            Ok(replies.remove(0))
        }
    }

    /// Scripted runner: pops one result per call and counts invocations.
    struct MockRunner {
        results: Mutex<Vec<Result<ExecutionResult, QueryError>>>,
        calls: AtomicUsize,
    }

    impl MockRunner {
        fn new(results: Vec<Result<ExecutionResult, QueryError>>) -> Self {
            Self {
                results: Mutex::new(results),
                calls: AtomicUsize::new(0),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SqlRunner for MockRunner {
        async fn run(&self, _sql: &str, _db: &str) -> Result<ExecutionResult, QueryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut results = self.results.lock().unwrap();
            if results.is_empty() {
                return Err(QueryError::ExecutionError("no scripted result".into()));
            }
            results.remove(0)
        }
    }

    fn ok_result() -> ExecutionResult {
        let columns = vec!["title".to_string()];
        let mut row = serde_json::Map::new();
        row.insert("title".to_string(), json!("特許X"));
        ExecutionResult {
            columns,
            display_columns: None,
            rows: vec![row],
            row_count: 1,
            duration_ms: 2,
        }
    }

    fn snapshot() -> SchemaSnapshot {
        let columns = [
            "application_number",
            "publication_number",
            "applicant_name",
            "inventor_name",
            "title",
            "abstract",
            "filing_date",
            "ipc_code",
        ];
        SchemaSnapshot {
            db: "inpit".to_string(),
            tables: vec![TableEntry {
                name: "inpit_data".to_string(),
                columns: columns
                    .iter()
                    .map(|c| ColumnInfo {
                        name: c.to_string(),
                        decl_type: "TEXT".to_string(),
                        nullable: true,
                        primary_key: false,
                        default_value: None,
                    })
                    .collect(),
                sample_rows: Vec::new(),
                row_count: 50,
            }],
            display_names: None,
        }
    }

    fn profile() -> DatabaseProfile {
        DatabaseProfile {
            name: "inpit".to_string(),
            primary_table: "inpit_data".to_string(),
            column_mapping: None,
        }
    }

    fn request(question: &str, strategy: Strategy) -> TranslationRequest {
        TranslationRequest {
            question: question.to_string(),
            db: "inpit".to_string(),
            strategy,
        }
    }

    fn llm_translator(replies: Vec<&str>, enabled: bool) -> LlmTranslator {
        LlmTranslator::new(
            Arc::new(LlmManager::with_invoker(Box::new(MockInvoker {
                replies: Mutex::new(replies.into_iter().map(String::from).collect()),
            }))),
            "test-model".to_string(),
            enabled,
        )
    }

    #[tokio::test]
    async fn rule_only_success_in_one_attempt() {
        let rule = RuleTranslator::new();
        let llm = llm_translator(vec![], false);
        let profile = profile();
        let orchestrator = Orchestrator::new(&rule, &llm, &profile);
        let runner = MockRunner::new(vec![Ok(ok_result())]);

        let success = orchestrator
            .run(
                &request("トヨタの2020年の特許を5件", Strategy::RuleOnly),
                &snapshot(),
                &runner,
            )
            .await
            .unwrap();

        assert_eq!(success.step, StepKind::Rule);
        assert!(success.sql.starts_with("SELECT"));
        assert_eq!(success.trace.len(), 1);
        assert!(success.trace[0].ok);
    }

    #[tokio::test]
    async fn rule_only_execution_error_triggers_exactly_one_simplified_retry() {
        let rule = RuleTranslator::new();
        let llm = llm_translator(vec![], false);
        let profile = profile();
        let orchestrator = Orchestrator::new(&rule, &llm, &profile);
        let runner = MockRunner::new(vec![
            Err(QueryError::ExecutionError("no such column".into())),
            Err(QueryError::ExecutionError("still broken".into())),
        ]);

        let failure = orchestrator
            .run(
                &request("トヨタの2020年の特許を5件", Strategy::RuleOnly),
                &snapshot(),
                &runner,
            )
            .await
            .unwrap_err();

        assert_eq!(runner.call_count(), 2);
        assert_eq!(failure.trace.len(), 2);
        assert_eq!(failure.trace[0].step, StepKind::Rule);
        assert_eq!(failure.trace[1].step, StepKind::RuleSimplified);
        assert!(matches!(failure.error, QueryError::ExecutionError(_)));
    }

    #[tokio::test]
    async fn llm_first_with_missing_credentials_falls_back_to_rule() {
        let rule = RuleTranslator::new();
        let llm = llm_translator(vec![], false);
        let profile = profile();
        let orchestrator = Orchestrator::new(&rule, &llm, &profile);
        let runner = MockRunner::new(vec![Ok(ok_result())]);

        let success = orchestrator
            .run(
                &request("Find patents in G06N published after 2018, show 3", Strategy::LlmFirst),
                &snapshot(),
                &runner,
            )
            .await
            .unwrap();

        assert_eq!(success.trace.len(), 2);
        assert_eq!(success.trace[0].step, StepKind::Llm);
        assert_eq!(
            success.trace[0].error_kind.as_deref(),
            Some("credentials_missing")
        );
        assert_eq!(success.trace[1].step, StepKind::Rule);
        assert!(success.sql.contains("ipc_code LIKE '%G06N%'"), "sql: {}", success.sql);
        assert!(success.sql.contains(">= '2018'"), "sql: {}", success.sql);
        assert!(success.sql.contains("LIMIT 3"), "sql: {}", success.sql);
    }

    #[tokio::test]
    async fn llm_only_repairs_after_execution_error() {
        let rule = RuleTranslator::new();
        let llm = llm_translator(
            vec![
                "SELECT bogus FROM inpit_data",
                "SELECT * FROM inpit_data LIMIT 10",
            ],
            true,
        );
        let profile = profile();
        let orchestrator = Orchestrator::new(&rule, &llm, &profile);
        let runner = MockRunner::new(vec![
            Err(QueryError::ExecutionError("no such column: bogus".into())),
            Ok(ok_result()),
        ]);

        let success = orchestrator
            .run(&request("some question", Strategy::LlmOnly), &snapshot(), &runner)
            .await
            .unwrap();

        assert_eq!(success.trace.len(), 2);
        assert_eq!(success.trace[0].step, StepKind::Llm);
        assert!(!success.trace[0].ok);
        assert_eq!(success.trace[1].step, StepKind::LlmRepair);
        assert!(success.trace[1].ok);
        assert!(success.sql.starts_with("SELECT"));
    }

    #[tokio::test]
    async fn mutating_generation_never_reaches_the_runner() {
        let rule = RuleTranslator::new();
        let llm = llm_translator(vec!["DELETE FROM inpit_data"], true);
        let profile = profile();
        let orchestrator = Orchestrator::new(&rule, &llm, &profile);
        let runner = MockRunner::new(vec![]);

        // A question no extraction rule matches, so the fallback also fails.
        let failure = orchestrator
            .run(&request("hello there", Strategy::LlmFirst), &snapshot(), &runner)
            .await
            .unwrap_err();

        assert_eq!(runner.call_count(), 0);
        assert_eq!(failure.trace[0].step, StepKind::Llm);
        assert_eq!(
            failure.trace[0].error_kind.as_deref(),
            Some("invalid_generation")
        );
        assert_eq!(failure.error, QueryError::NoRuleMatch);
    }

    #[tokio::test]
    async fn rule_first_full_execution_failure_chain() {
        let rule = RuleTranslator::new();
        let llm = llm_translator(
            vec![
                "SELECT a FROM inpit_data",
                "SELECT b FROM inpit_data",
            ],
            true,
        );
        let profile = profile();
        let orchestrator = Orchestrator::new(&rule, &llm, &profile);
        let runner = MockRunner::new(vec![
            Err(QueryError::ExecutionError("e1".into())),
            Err(QueryError::ExecutionError("e2".into())),
            Err(QueryError::ExecutionError("e3".into())),
            Ok(ok_result()),
        ]);

        let success = orchestrator
            .run(&request("トヨタの特許を5件", Strategy::RuleFirst), &snapshot(), &runner)
            .await
            .unwrap();

        let steps: Vec<StepKind> = success.trace.iter().map(|a| a.step).collect();
        assert_eq!(
            steps,
            vec![
                StepKind::Rule,
                StepKind::RuleSimplified,
                StepKind::Llm,
                StepKind::LlmRepair
            ]
        );
        assert_eq!(success.step, StepKind::LlmRepair);
        assert!(success.trace.len() <= 6);
    }

    #[tokio::test]
    async fn upstream_failure_aborts_the_cascade() {
        let rule = RuleTranslator::new();
        let llm = llm_translator(vec![], false);
        let profile = profile();
        let orchestrator = Orchestrator::new(&rule, &llm, &profile);
        let runner = MockRunner::new(vec![Err(QueryError::UpstreamUnavailable(
            "connection refused".into(),
        ))]);

        let failure = orchestrator
            .run(&request("トヨタの特許", Strategy::RuleFirst), &snapshot(), &runner)
            .await
            .unwrap_err();

        assert_eq!(runner.call_count(), 1);
        assert!(matches!(failure.error, QueryError::UpstreamUnavailable(_)));
    }

    #[tokio::test]
    async fn cascade_is_deterministic_for_rule_only() {
        let rule = RuleTranslator::new();
        let llm = llm_translator(vec![], false);
        let profile = profile();
        let orchestrator = Orchestrator::new(&rule, &llm, &profile);

        let mut seen = Vec::new();
        for _ in 0..2 {
            let runner = MockRunner::new(vec![Ok(ok_result())]);
            let success = orchestrator
                .run(
                    &request("トヨタの2020年の特許を5件", Strategy::RuleOnly),
                    &snapshot(),
                    &runner,
                )
                .await
                .unwrap();
            seen.push(success.sql);
        }
        assert_eq!(seen[0], seen[1]);
    }
}
