//! Self-Repair Orchestrator
//!
//! Drives the slow path as a bounded state machine: one generation, then at
//! most `max_repairs` regenerations, each fed the offending SQL and the exact
//! failure. Attempts run strictly one after another. The request deadline is
//! checked before every step and a timeout ends the run.

use crate::application::use_cases::execution_gate::{ExecutionGate, ExecutionOutcome};
use crate::application::use_cases::safety_validator::{SafetyValidator, ValidatedStatement};
use crate::application::use_cases::sql_generator::SqlGenerator;
use crate::application::use_cases::sql_normalizer::SqlNormalizer;
use crate::domain::error::{AppError, ExecutionErrorKind, Result};
use crate::domain::prompt::GenerationPrompt;
use crate::domain::query::{BoundStatement, GenerationOutput, NormalizedQuery, RuleCode, SqlDraft};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairConfig {
    /// Regenerations allowed after the first draft.
    #[serde(default = "default_max_repairs")]
    pub max_repairs: u32,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_generation_timeout_ms")]
    pub generation_timeout_ms: u64,
}

fn default_max_repairs() -> u32 {
    1
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_generation_timeout_ms() -> u64 {
    15_000
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            max_repairs: default_max_repairs(),
            request_timeout_ms: default_request_timeout_ms(),
            generation_timeout_ms: default_generation_timeout_ms(),
        }
    }
}

/// Where the slow path picks up.
#[derive(Debug, Clone)]
pub enum SlowPathStart {
    /// Nothing generated yet.
    Fresh,
    /// A draft already produced by the caller's generation call.
    Draft(SqlDraft),
    /// The caller's generation output failed; the next call is a repair.
    Failed {
        sql: Option<String>,
        reason: String,
    },
}

#[derive(Debug)]
pub struct RepairSuccess {
    pub normalized: NormalizedQuery,
    pub statement: ValidatedStatement,
    pub execution: ExecutionOutcome,
}

#[derive(Debug)]
pub struct SlowPathRun {
    pub outcome: Result<RepairSuccess>,
    /// Total generation calls, including any the caller already made.
    pub generation_calls: u32,
    /// SQL of the most recent failed draft.
    pub last_failed_sql: Option<String>,
}

pub struct SelfRepairOrchestrator {
    generator: Arc<dyn SqlGenerator>,
    normalizer: SqlNormalizer,
    validator: Arc<SafetyValidator>,
    gate: Arc<ExecutionGate>,
    config: RepairConfig,
}

impl SelfRepairOrchestrator {
    pub fn new(
        generator: Arc<dyn SqlGenerator>,
        validator: Arc<SafetyValidator>,
        gate: Arc<ExecutionGate>,
        config: RepairConfig,
    ) -> Self {
        Self {
            generator,
            normalizer: SqlNormalizer::new(),
            validator,
            gate,
            config,
        }
    }

    pub fn config(&self) -> &RepairConfig {
        &self.config
    }

    /// Upper bound on generation calls for one request.
    pub fn max_generation_calls(&self) -> u32 {
        self.config.max_repairs + 1
    }

    pub async fn run(
        &self,
        prompt: &GenerationPrompt,
        start: SlowPathStart,
        calls_used: u32,
        deadline: Instant,
    ) -> SlowPathRun {
        let mut calls = calls_used;
        let mut last_failed_sql = None;
        let mut current_prompt = prompt.clone();
        let mut pending = None;

        match start {
            SlowPathStart::Fresh => {}
            SlowPathStart::Draft(draft) => pending = Some(draft),
            SlowPathStart::Failed { sql, reason } => {
                let previous = sql.clone().unwrap_or_default();
                current_prompt = prompt.with_repair(&previous, &reason);
                last_failed_sql = sql;
            }
        }

        let outcome = loop {
            if Instant::now() >= deadline {
                break Err(AppError::RequestTimeout(self.config.request_timeout_ms));
            }

            let draft = match pending.take() {
                Some(draft) => draft,
                None => {
                    if calls >= self.max_generation_calls() {
                        warn!(attempts = calls, "Repair budget exhausted");
                        break Err(AppError::RepairExhausted { attempts: calls });
                    }
                    calls += 1;
                    match self.generate(&current_prompt, deadline).await {
                        Ok(GenerationOutput::Sql(draft)) => draft,
                        Ok(GenerationOutput::TemplateChoice { template_id, .. }) => {
                            let reason = format!(
                                "Template {} is not usable here. Write the SQL query instead.",
                                template_id
                            );
                            current_prompt = prompt.with_repair("", &reason);
                            continue;
                        }
                        Err(e) => break Err(e),
                    }
                }
            };

            info!(attempt = calls, "Trying slow-path draft");
            match self.attempt(draft.as_str(), deadline).await {
                Ok(success) => break Ok(success),
                Err((err, reason)) => {
                    last_failed_sql = Some(draft.as_str().to_string());
                    if !err.is_repairable() {
                        warn!(attempt = calls, error = %err, "Slow-path attempt failed terminally");
                        break Err(err);
                    }
                    warn!(attempt = calls, "Slow-path attempt failed: {}", reason);
                    current_prompt = prompt.with_repair(draft.as_str(), &reason);
                }
            }
        };

        SlowPathRun {
            outcome,
            generation_calls: calls,
            last_failed_sql,
        }
    }

    /// One generation call bounded by the generation timeout and the deadline.
    pub async fn generate(
        &self,
        prompt: &GenerationPrompt,
        deadline: Instant,
    ) -> Result<GenerationOutput> {
        let limit = Duration::from_millis(self.config.generation_timeout_ms);
        let budget = limit.min(deadline.saturating_duration_since(Instant::now()));
        match tokio::time::timeout(budget, self.generator.generate(prompt)).await {
            Ok(result) => result,
            Err(_) if Instant::now() >= deadline => {
                Err(AppError::RequestTimeout(self.config.request_timeout_ms))
            }
            Err(_) => Err(AppError::Generation(format!(
                "generation exceeded {} ms",
                budget.as_millis()
            ))),
        }
    }

    /// Normalizer, validator and gate for one draft. The error comes with the
    /// text fed back to the generator.
    async fn attempt(
        &self,
        sql: &str,
        deadline: Instant,
    ) -> std::result::Result<RepairSuccess, (AppError, String)> {
        // Literal strings become bind values after normalization, so the raw
        // text is checked first.
        let verdict = self.validator.validate(sql);
        if !verdict.passed() && verdict.codes() != [RuleCode::ParseFailure] {
            let reason = format!("Safety violation: {}", verdict.describe());
            return Err((AppError::SafetyViolation(verdict.codes()), reason));
        }

        let normalized = self.normalizer.normalize(sql).map_err(with_reason)?;
        if !normalized.is_self_contained() {
            let err = AppError::Parse(
                "query contains placeholders without values; inline the literal values".to_string(),
            );
            return Err(with_reason(err));
        }

        let statement = self
            .validator
            .approve(BoundStatement::from_normalized(&normalized))
            .map_err(with_reason)?;

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            let err = AppError::RequestTimeout(self.config.request_timeout_ms);
            return Err(with_reason(err));
        }

        let execution = self
            .gate
            .execute_within(&statement, remaining)
            .await
            .map_err(|err| match err {
                AppError::Execution {
                    kind: ExecutionErrorKind::Timeout,
                    ..
                } if Instant::now() >= deadline => {
                    with_reason(AppError::RequestTimeout(self.config.request_timeout_ms))
                }
                other => with_reason(other),
            })?;

        Ok(RepairSuccess {
            normalized,
            statement,
            execution,
        })
    }
}

fn with_reason(err: AppError) -> (AppError, String) {
    let reason = err.to_string();
    (err, reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::use_cases::execution_gate::QueryExecutor;
    use crate::application::use_cases::safety_validator::SafetyRules;
    use crate::domain::parameter::ParameterSet;
    use crate::domain::query::RowSet;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedGenerator {
        replies: Mutex<VecDeque<String>>,
        prompts: Mutex<Vec<GenerationPrompt>>,
    }

    impl ScriptedGenerator {
        fn new(replies: &[&str]) -> Self {
            Self {
                replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
                prompts: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> usize {
            self.prompts.lock().len()
        }
    }

    #[async_trait]
    impl SqlGenerator for ScriptedGenerator {
        async fn generate(&self, prompt: &GenerationPrompt) -> Result<GenerationOutput> {
            self.prompts.lock().push(prompt.clone());
            let reply = self
                .replies
                .lock()
                .pop_front()
                .unwrap_or_else(|| "SELEC broken".to_string());
            crate::application::use_cases::sql_generator::parse_generation_output(&reply)
        }
    }

    struct CountingExecutor {
        calls: AtomicUsize,
        fail_with: Option<ExecutionErrorKind>,
    }

    #[async_trait]
    impl QueryExecutor for CountingExecutor {
        async fn execute(&self, _sql: &str, _params: &ParameterSet) -> Result<RowSet> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.fail_with {
                Some(kind) => Err(AppError::execution(kind, "column \"zip\" does not exist")),
                None => Ok(RowSet::default()),
            }
        }
    }

    fn orchestrator(
        generator: Arc<ScriptedGenerator>,
        executor: Arc<CountingExecutor>,
        max_repairs: u32,
    ) -> SelfRepairOrchestrator {
        let gate = ExecutionGate::new(executor, Duration::from_secs(1), 100);
        SelfRepairOrchestrator::new(
            generator,
            Arc::new(SafetyValidator::new(SafetyRules::default())),
            Arc::new(gate),
            RepairConfig {
                max_repairs,
                ..RepairConfig::default()
            },
        )
    }

    fn executor(fail_with: Option<ExecutionErrorKind>) -> Arc<CountingExecutor> {
        Arc::new(CountingExecutor {
            calls: AtomicUsize::new(0),
            fail_with,
        })
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[tokio::test]
    async fn test_parse_error_is_repaired_once() {
        let generator = Arc::new(ScriptedGenerator::new(&[
            "SELEC provider_name FROM providers",
            "SELECT provider_name FROM providers WHERE provider_state = 'NY' LIMIT 5",
        ]));
        let executor = executor(None);
        let run = orchestrator(generator.clone(), executor.clone(), 1)
            .run(&GenerationPrompt::new("s", "q"), SlowPathStart::Fresh, 0, deadline())
            .await;

        assert!(run.outcome.is_ok());
        assert_eq!(run.generation_calls, 2);
        assert_eq!(generator.calls(), 2);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);

        let second = &generator.prompts.lock()[1];
        let repair = second.repair.as_ref().unwrap();
        assert_eq!(repair.previous_sql, "SELEC provider_name FROM providers");
        assert!(repair.failure_reason.starts_with("Parse error"));
    }

    #[tokio::test]
    async fn test_persistent_failure_is_bounded() {
        let generator = Arc::new(ScriptedGenerator::new(&[]));
        let executor = executor(None);
        let run = orchestrator(generator.clone(), executor.clone(), 2)
            .run(&GenerationPrompt::new("s", "q"), SlowPathStart::Fresh, 0, deadline())
            .await;

        assert!(matches!(
            run.outcome,
            Err(AppError::RepairExhausted { attempts: 3 })
        ));
        assert_eq!(generator.calls(), 3);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
        assert_eq!(run.last_failed_sql.as_deref(), Some("SELEC broken"));
    }

    #[tokio::test]
    async fn test_unsafe_draft_never_executes() {
        let generator = Arc::new(ScriptedGenerator::new(&[
            "DELETE FROM providers WHERE drg_code = '470'",
            "SELECT 1; DROP TABLE providers",
        ]));
        let executor = executor(None);
        let run = orchestrator(generator.clone(), executor.clone(), 1)
            .run(&GenerationPrompt::new("s", "q"), SlowPathStart::Fresh, 0, deadline())
            .await;

        assert!(matches!(run.outcome, Err(AppError::RepairExhausted { .. })));
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
        let prompts = generator.prompts.lock();
        assert!(prompts[1]
            .repair
            .as_ref()
            .unwrap()
            .failure_reason
            .contains("forbidden_statement_type"));
    }

    #[tokio::test]
    async fn test_existing_draft_counts_as_first_call() {
        let generator = Arc::new(ScriptedGenerator::new(&[
            "SELECT provider_name FROM providers WHERE provider_state = 'CA' LIMIT 5",
        ]));
        let executor = executor(None);
        let run = orchestrator(generator.clone(), executor.clone(), 1)
            .run(
                &GenerationPrompt::new("s", "q"),
                SlowPathStart::Draft(SqlDraft::new("SELECT nope FROM")),
                1,
                deadline(),
            )
            .await;

        assert!(run.outcome.is_ok());
        assert_eq!(run.generation_calls, 2);
        assert_eq!(generator.calls(), 1);
    }

    #[tokio::test]
    async fn test_execution_timeout_is_terminal() {
        let generator = Arc::new(ScriptedGenerator::new(&[
            "SELECT provider_name FROM providers LIMIT 5",
            "SELECT provider_name FROM providers LIMIT 6",
        ]));
        let executor = executor(Some(ExecutionErrorKind::Timeout));
        let run = orchestrator(generator.clone(), executor.clone(), 1)
            .run(&GenerationPrompt::new("s", "q"), SlowPathStart::Fresh, 0, deadline())
            .await;

        assert!(matches!(
            run.outcome,
            Err(AppError::Execution {
                kind: ExecutionErrorKind::Timeout,
                ..
            })
        ));
        assert_eq!(generator.calls(), 1);
    }

    #[tokio::test]
    async fn test_unknown_column_gets_repair_context() {
        let generator = Arc::new(ScriptedGenerator::new(&[
            "SELECT zip FROM providers LIMIT 5",
            "SELECT provider_zip_code FROM providers LIMIT 5",
        ]));
        let executor = executor(Some(ExecutionErrorKind::UnknownColumn));
        let run = orchestrator(generator.clone(), executor.clone(), 1)
            .run(&GenerationPrompt::new("s", "q"), SlowPathStart::Fresh, 0, deadline())
            .await;

        assert!(matches!(run.outcome, Err(AppError::RepairExhausted { attempts: 2 })));
        assert_eq!(executor.calls.load(Ordering::SeqCst), 2);
        let prompts = generator.prompts.lock();
        assert!(prompts[1]
            .repair
            .as_ref()
            .unwrap()
            .failure_reason
            .contains("unknown_column"));
    }

    #[tokio::test]
    async fn test_expired_deadline_stops_before_generation() {
        let generator = Arc::new(ScriptedGenerator::new(&["SELECT 1"]));
        let run = orchestrator(generator.clone(), executor(None), 1)
            .run(
                &GenerationPrompt::new("s", "q"),
                SlowPathStart::Fresh,
                0,
                Instant::now(),
            )
            .await;

        assert!(matches!(run.outcome, Err(AppError::RequestTimeout(_))));
        assert_eq!(generator.calls(), 0);
    }

    #[tokio::test]
    async fn test_failed_start_sends_repair_first() {
        let generator = Arc::new(ScriptedGenerator::new(&[
            "SELECT provider_name FROM providers WHERE provider_state = 'TX' LIMIT 5",
        ]));
        let run = orchestrator(generator.clone(), executor(None), 1)
            .run(
                &GenerationPrompt::new("s", "q"),
                SlowPathStart::Failed {
                    sql: None,
                    reason: "Parameter arity mismatch: template expects 3, got 1".to_string(),
                },
                1,
                deadline(),
            )
            .await;

        assert!(run.outcome.is_ok());
        assert_eq!(run.generation_calls, 2);
        assert!(generator.prompts.lock()[0].repair.is_some());
    }
}
