//! Question to answer, fast path first.
//!
//! One generation call yields either a template choice or a SQL draft. A
//! choice is bound directly; a draft is matched against the catalog. Any
//! recoverable fast-path failure falls back to the self-repair loop, which
//! validates and runs the draft itself. Every statement reaches the database
//! through the safety validator and the execution gate.

use crate::application::use_cases::answer_writer::AnswerWriter;
use crate::application::use_cases::candidate_ranker::{CandidateRanker, MatchingConfig};
use crate::application::use_cases::embedding_service::Embedder;
use crate::application::use_cases::execution_gate::{
    ExecutionConfig, ExecutionGate, ExecutionOutcome, QueryExecutor,
};
use crate::application::use_cases::growth_monitor::GrowthMonitor;
use crate::application::use_cases::parameter_binder::ParameterBinder;
use crate::application::use_cases::prompt_builder::PromptBuilder;
use crate::application::use_cases::safety_validator::{
    SafetyRules, SafetyValidator, ValidatedStatement,
};
use crate::application::use_cases::self_repair::{
    RepairConfig, SelfRepairOrchestrator, SlowPathStart,
};
use crate::application::use_cases::sql_generator::SqlGenerator;
use crate::application::use_cases::sql_normalizer::SqlNormalizer;
use crate::application::use_cases::template_catalog::TemplateCatalog;
use crate::domain::error::{AppError, Result};
use crate::domain::prompt::GenerationPrompt;
use crate::domain::query::{
    BoundStatement, GenerationOutput, PipelineResponse, QuestionRequest, ResolutionPath,
    RuleCode, SqlDraft,
};
use crate::domain::template::{FingerprintOccurrence, Template};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_max_question_chars")]
    pub max_question_chars: usize,
    /// Used when a request does not say whether the slow path is allowed.
    #[serde(default = "default_allow_slow_path")]
    pub allow_slow_path_default: bool,
    #[serde(default = "default_few_shot_examples")]
    pub few_shot_examples: usize,
    #[serde(default = "default_explain_results")]
    pub explain_results: bool,
    #[serde(default = "default_limit")]
    pub default_limit: u64,
}

fn default_max_question_chars() -> usize {
    1000
}

fn default_allow_slow_path() -> bool {
    true
}

fn default_few_shot_examples() -> usize {
    3
}

fn default_explain_results() -> bool {
    true
}

fn default_limit() -> u64 {
    20
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_question_chars: default_max_question_chars(),
            allow_slow_path_default: default_allow_slow_path(),
            few_shot_examples: default_few_shot_examples(),
            explain_results: default_explain_results(),
            default_limit: default_limit(),
        }
    }
}

/// Policy sections the pipeline is built from.
#[derive(Debug, Clone, Default)]
pub struct PipelineSettings {
    pub matching: MatchingConfig,
    pub safety: SafetyRules,
    pub execution: ExecutionConfig,
    pub repair: RepairConfig,
    pub pipeline: PipelineConfig,
}

/// Collaborators injected into the pipeline.
pub struct PipelineDeps {
    pub catalog: Arc<TemplateCatalog>,
    pub embedder: Arc<dyn Embedder>,
    pub generator: Arc<dyn SqlGenerator>,
    pub executor: Arc<dyn QueryExecutor>,
    pub growth: Option<GrowthMonitor>,
    pub answers: AnswerWriter,
}

/// A statement that ran, and how it was resolved.
struct Resolved {
    statement: ValidatedStatement,
    execution: ExecutionOutcome,
    resolution: ResolutionPath,
    template_id: Option<i64>,
    confidence: Option<f32>,
}

/// A resolution that did not produce rows.
struct Failure {
    error: AppError,
    diagnostic_sql: Option<String>,
}

impl From<AppError> for Failure {
    fn from(error: AppError) -> Self {
        Self {
            error,
            diagnostic_sql: None,
        }
    }
}

pub struct QueryPipeline {
    catalog: Arc<TemplateCatalog>,
    embedder: Arc<dyn Embedder>,
    growth: Option<GrowthMonitor>,
    answers: AnswerWriter,
    normalizer: SqlNormalizer,
    ranker: CandidateRanker,
    binder: ParameterBinder,
    validator: Arc<SafetyValidator>,
    gate: Arc<ExecutionGate>,
    repair: SelfRepairOrchestrator,
    prompts: PromptBuilder,
    settings: PipelineSettings,
}

impl QueryPipeline {
    pub fn new(deps: PipelineDeps, settings: PipelineSettings) -> Self {
        let validator = Arc::new(SafetyValidator::new(settings.safety.clone()));
        let gate = Arc::new(ExecutionGate::from_config(deps.executor, &settings.execution));
        let repair = SelfRepairOrchestrator::new(
            deps.generator,
            Arc::clone(&validator),
            Arc::clone(&gate),
            settings.repair.clone(),
        );
        Self {
            ranker: CandidateRanker::new(Arc::clone(&deps.catalog), settings.matching.clone()),
            prompts: PromptBuilder::new(
                settings.pipeline.few_shot_examples,
                settings.pipeline.default_limit,
            ),
            catalog: deps.catalog,
            embedder: deps.embedder,
            growth: deps.growth,
            answers: deps.answers,
            normalizer: SqlNormalizer::new(),
            binder: ParameterBinder::new(),
            validator,
            gate,
            repair,
            settings,
        }
    }

    pub fn catalog(&self) -> &Arc<TemplateCatalog> {
        &self.catalog
    }

    pub fn validator(&self) -> &SafetyValidator {
        &self.validator
    }

    /// Answers one question. Failures are folded into the response as a
    /// user-safe message.
    pub async fn ask(&self, request: QuestionRequest) -> PipelineResponse {
        let span = info_span!("ask", request_id = %Uuid::new_v4());
        self.ask_inner(request).instrument(span).await
    }

    async fn ask_inner(&self, request: QuestionRequest) -> PipelineResponse {
        let started = Instant::now();
        let deadline = started + Duration::from_millis(self.settings.repair.request_timeout_ms);

        if let Err(e) = self.check_question(&request) {
            return failure_response(e, None, 0, started);
        }
        let question = request.question.trim().to_string();
        let allow_slow_path = request
            .allow_slow_path
            .unwrap_or(self.settings.pipeline.allow_slow_path_default);

        let prompt = self.build_prompt(&question).await;

        let first = match self.repair.generate(&prompt, deadline).await {
            Ok(output) => output,
            Err(e) => {
                warn!("Generation failed: {}", e);
                return failure_response(e, None, 1, started);
            }
        };

        let fast = self.fast_path(&first, deadline).await;
        let (result, generation_calls) = match fast {
            Ok(resolved) => (Ok(resolved), 1),
            Err(e) if e.is_fast_path_recoverable() && allow_slow_path => {
                info!(reason = e.code(), "Fast path missed, falling back to generation");
                let start = match first {
                    GenerationOutput::Sql(draft) => SlowPathStart::Draft(draft),
                    GenerationOutput::TemplateChoice { template_id, .. } => {
                        SlowPathStart::Failed {
                            sql: None,
                            reason: format!("Template {} could not be used: {}", template_id, e),
                        }
                    }
                };
                self.slow_path(&prompt, start, deadline, &question).await
            }
            Err(e) if e.is_fast_path_recoverable() => {
                info!(reason = e.code(), "Fast path missed and fallback is disabled");
                (Err(Failure::from(AppError::NoTemplateMatch)), 1)
            }
            Err(e) => (Err(Failure::from(e)), 1),
        };

        match result {
            Ok(resolved) => {
                self.success_response(&question, resolved, generation_calls, started)
                    .await
            }
            Err(failure) => failure_response(
                failure.error,
                failure.diagnostic_sql,
                generation_calls,
                started,
            ),
        }
    }

    fn check_question(&self, request: &QuestionRequest) -> Result<()> {
        request.validate()?;
        if request.question.trim().is_empty() {
            return Err(AppError::Validation("question is empty".to_string()));
        }
        let chars = request.question.chars().count();
        if chars > self.settings.pipeline.max_question_chars {
            return Err(AppError::Validation(format!(
                "question is {} characters, limit is {}",
                chars, self.settings.pipeline.max_question_chars
            )));
        }
        Ok(())
    }

    /// Catalog entries offered to the generator, closest to the question first.
    async fn build_prompt(&self, question: &str) -> GenerationPrompt {
        let k = self.settings.matching.top_k.clamp(3, 5);
        let templates: Vec<Template> = match self.embedder.embed(question).await {
            Ok(embedding) => match self.catalog.nearest_neighbors(&embedding, k) {
                Ok(neighbours) => neighbours
                    .into_iter()
                    .filter_map(|(id, _)| self.catalog.get(id))
                    .collect(),
                Err(e) => {
                    debug!("Template lookup for prompt failed: {}", e);
                    self.most_used(k)
                }
            },
            Err(e) => {
                warn!("Question embedding failed: {}", e);
                self.most_used(k)
            }
        };
        self.prompts.build(question, &templates)
    }

    fn most_used(&self, k: usize) -> Vec<Template> {
        self.catalog
            .stats(k)
            .most_used
            .into_iter()
            .filter_map(|usage| self.catalog.get(usage.template_id))
            .collect()
    }

    async fn fast_path(&self, output: &GenerationOutput, deadline: Instant) -> Result<Resolved> {
        let (bound, resolution, confidence) = match output {
            GenerationOutput::TemplateChoice {
                template_id,
                arguments,
            } => {
                let template = self
                    .catalog
                    .get(*template_id)
                    .ok_or_else(|| AppError::NotFound(format!("template {}", template_id)))?;
                let bound = self.binder.bind_arguments(&template, arguments)?;
                info!(template_id, "Generator chose a catalog template");
                (bound, ResolutionPath::ToolChoice, None)
            }
            GenerationOutput::Sql(draft) => {
                let (bound, confidence) = self.match_draft(draft).await?;
                (bound, ResolutionPath::TemplateMatch, Some(confidence))
            }
        };

        let template_id = bound.template_id;
        let statement = self.validator.approve(bound)?;
        let execution = self.execute(&statement, deadline).await?;
        if let Some(id) = template_id {
            self.catalog.increment_usage(id);
        }

        Ok(Resolved {
            statement,
            execution,
            resolution,
            template_id,
            confidence,
        })
    }

    /// Normalizes a draft, finds its template and binds the draft's literals.
    async fn match_draft(&self, draft: &SqlDraft) -> Result<(BoundStatement, f32)> {
        let verdict = self.validator.validate(draft.as_str());
        if !verdict.passed() && verdict.codes() != [RuleCode::ParseFailure] {
            return Err(AppError::SafetyViolation(verdict.codes()));
        }

        let normalized = self.normalizer.normalize(draft.as_str())?;
        if !normalized.is_self_contained() {
            return Err(AppError::Parse(
                "draft carries placeholders without values".to_string(),
            ));
        }

        let embedding = match self.embedder.embed(&normalized.canonical_sql).await {
            Ok(embedding) => embedding,
            Err(e) => {
                warn!("Draft embedding failed, skipping template match: {}", e);
                return Err(AppError::NoTemplateMatch);
            }
        };

        let candidate = self
            .ranker
            .best_match(&normalized.canonical_sql, &embedding)?;
        let template = self
            .catalog
            .get(candidate.template_id)
            .ok_or_else(|| AppError::NotFound(format!("template {}", candidate.template_id)))?;
        let bound = self.binder.bind(&template, &normalized.parameters)?;
        Ok((bound, candidate.confidence))
    }

    async fn execute(
        &self,
        statement: &ValidatedStatement,
        deadline: Instant,
    ) -> Result<ExecutionOutcome> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(AppError::RequestTimeout(self.settings.repair.request_timeout_ms));
        }
        self.gate.execute_within(statement, remaining).await
    }

    async fn slow_path(
        &self,
        prompt: &GenerationPrompt,
        start: SlowPathStart,
        deadline: Instant,
        question: &str,
    ) -> (std::result::Result<Resolved, Failure>, u32) {
        let run = self.repair.run(prompt, start, 1, deadline).await;
        let calls = run.generation_calls;

        match run.outcome {
            Ok(success) => {
                self.observe_growth(&success.normalized, question);
                (
                    Ok(Resolved {
                        statement: success.statement,
                        execution: success.execution,
                        resolution: ResolutionPath::Generated,
                        template_id: None,
                        confidence: None,
                    }),
                    calls,
                )
            }
            Err(error) => (
                Err(Failure {
                    error,
                    diagnostic_sql: run.last_failed_sql,
                }),
                calls,
            ),
        }
    }

    fn observe_growth(&self, normalized: &crate::domain::query::NormalizedQuery, question: &str) {
        if let Some(growth) = &self.growth {
            growth.observe(FingerprintOccurrence {
                fingerprint: normalized.fingerprint.clone(),
                canonical_sql: normalized.canonical_sql.clone(),
                raw_sql: normalized.raw_sql.clone(),
                parameter_types: normalized.parameters.slot_types(),
                placeholder_count: normalized.placeholder_count,
                question: question.to_string(),
                observed_at: Utc::now(),
            });
        }
    }

    async fn success_response(
        &self,
        question: &str,
        resolved: Resolved,
        generation_calls: u32,
        started: Instant,
    ) -> PipelineResponse {
        let sql = resolved.statement.sql().to_string();
        let rows = resolved.execution.rows;
        let answer_text = self.answers.write(question, &sql, &rows).await;

        info!(
            resolution = ?resolved.resolution,
            template_id = ?resolved.template_id,
            generation_calls,
            rows = rows.row_count,
            "Question answered"
        );

        PipelineResponse {
            answer_text,
            sql_query: Some(sql),
            template_id: resolved.template_id,
            confidence_score: resolved.confidence,
            execution_time_ms: started.elapsed().as_millis() as u64,
            success: true,
            error: None,
            resolution: Some(resolved.resolution),
            rows: Some(rows),
            generation_calls,
            diagnostic_sql: None,
        }
    }
}

fn failure_response(
    error: AppError,
    diagnostic_sql: Option<String>,
    generation_calls: u32,
    started: Instant,
) -> PipelineResponse {
    warn!(error = %error, generation_calls, "Question failed");
    let answer_text = match &error {
        AppError::NoTemplateMatch => {
            "No vetted query answers this question and generated queries are not allowed for this request.".to_string()
        }
        other => other.user_message(),
    };
    PipelineResponse {
        answer_text,
        sql_query: None,
        template_id: None,
        confidence_score: None,
        execution_time_ms: started.elapsed().as_millis() as u64,
        success: false,
        error: Some(error.code().to_string()),
        resolution: None,
        rows: None,
        generation_calls,
        diagnostic_sql,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::use_cases::ivf_index::IvfConfig;
    use crate::application::use_cases::growth_monitor::{GrowthConfig, GrowthWorker};
    use crate::application::use_cases::test_support::{FakeExecutor, HashEmbedder, ScriptedGenerator};
    use crate::domain::error::ExecutionErrorKind;
    use crate::domain::parameter::ParamValue;
    use crate::domain::template::NewTemplate;

    const TEMPLATE_SQL: &str = "SELECT p.provider_name, pp.average_covered_charges FROM providers p JOIN provider_procedures pp ON p.provider_id = pp.provider_id WHERE pp.drg_code = '470' AND p.provider_state = 'NY' ORDER BY pp.average_covered_charges LIMIT 10";

    async fn catalog_with_template() -> (Arc<TemplateCatalog>, i64) {
        let catalog = Arc::new(TemplateCatalog::new(IvfConfig::default()));
        let normalized = SqlNormalizer::new().normalize(TEMPLATE_SQL).unwrap();
        let id = catalog
            .insert(NewTemplate {
                embedding: HashEmbedder::vector(&normalized.canonical_sql),
                parameter_types: normalized.parameters.slot_types(),
                placeholder_count: normalized.placeholder_count,
                raw_sql: normalized.raw_sql,
                canonical_sql: normalized.canonical_sql,
                fingerprint: normalized.fingerprint,
                description: "Cheapest providers for a DRG in a state".to_string(),
            })
            .await
            .unwrap();
        (catalog, id)
    }

    fn pipeline(
        catalog: Arc<TemplateCatalog>,
        generator: Arc<ScriptedGenerator>,
        executor: Arc<FakeExecutor>,
        growth: Option<GrowthMonitor>,
    ) -> QueryPipeline {
        QueryPipeline::new(
            PipelineDeps {
                catalog,
                embedder: Arc::new(HashEmbedder::new()),
                generator,
                executor,
                growth,
                answers: AnswerWriter::deterministic(),
            },
            PipelineSettings::default(),
        )
    }

    #[tokio::test]
    async fn test_tool_choice_executes_template_with_one_call() {
        let (catalog, id) = catalog_with_template().await;
        let reply = format!(
            "{{\"template_id\": {}, \"parameters\": [\"CA\", \"291\", 5]}}",
            id
        );
        let generator = Arc::new(ScriptedGenerator::new(&[&reply]));
        let executor = Arc::new(FakeExecutor::new());
        let pipeline = pipeline(catalog.clone(), generator.clone(), executor.clone(), None);

        let response = pipeline.ask(QuestionRequest::new("Cheapest DRG 291 in CA")).await;

        assert!(response.success, "{:?}", response.error);
        assert_eq!(response.template_id, Some(id));
        assert_eq!(response.resolution, Some(ResolutionPath::ToolChoice));
        assert_eq!(response.generation_calls, 1);
        assert_eq!(generator.calls(), 1);

        let executed = executor.executed.lock();
        assert_eq!(executed.len(), 1);
        assert_eq!(executed[0].0, catalog.get(id).unwrap().raw_sql);
        assert!(executed[0]
            .1
            .iter()
            .any(|v| *v == ParamValue::String("CA".to_string())));
        drop(executed);
        assert_eq!(catalog.stats(1).most_used[0].usage_count, 1);
    }

    #[tokio::test]
    async fn test_draft_matching_template_runs_template() {
        let (catalog, id) = catalog_with_template().await;
        let draft = TEMPLATE_SQL.replace("'470'", "'291'").replace("'NY'", "'MA'");
        let generator = Arc::new(ScriptedGenerator::new(&[&draft]));
        let executor = Arc::new(FakeExecutor::new());
        let pipeline = pipeline(catalog.clone(), generator.clone(), executor.clone(), None);

        let response = pipeline
            .ask(QuestionRequest::new("Cheapest hip replacement in Massachusetts"))
            .await;

        assert!(response.success);
        assert_eq!(response.template_id, Some(id));
        assert_eq!(response.resolution, Some(ResolutionPath::TemplateMatch));
        assert!(response.confidence_score.unwrap() > 0.9);
        assert_eq!(generator.calls(), 1);
        let executed = executor.executed.lock();
        assert_eq!(executed[0].0, catalog.get(id).unwrap().raw_sql);
        assert!(executed[0]
            .1
            .iter()
            .any(|v| *v == ParamValue::String("MA".to_string())));
    }

    #[tokio::test]
    async fn test_unparseable_draft_is_repaired_with_two_calls() {
        let (catalog, _) = catalog_with_template().await;
        let generator = Arc::new(ScriptedGenerator::new(&[
            "SELEC provider_name FROM providers WHERE",
            "SELECT p.provider_name, r.overall_rating FROM providers p JOIN provider_ratings r ON p.provider_id = r.provider_id WHERE p.provider_city = 'Denver' ORDER BY r.overall_rating DESC LIMIT 5",
        ]));
        let executor = Arc::new(FakeExecutor::new());
        let pipeline = pipeline(catalog, generator.clone(), executor.clone(), None);

        let response = pipeline
            .ask(QuestionRequest::new("Best rated hospitals in Denver"))
            .await;

        assert!(response.success, "{}", response.answer_text);
        assert_eq!(response.resolution, Some(ResolutionPath::Generated));
        assert_eq!(response.generation_calls, 2);
        assert_eq!(generator.calls(), 2);
        assert_eq!(executor.calls(), 1);
        let repair = generator.prompts.lock()[1].repair.clone().unwrap();
        assert_eq!(repair.previous_sql, "SELEC provider_name FROM providers WHERE");
    }

    #[tokio::test]
    async fn test_unsafe_drafts_never_reach_executor() {
        let (catalog, _) = catalog_with_template().await;
        let generator = Arc::new(ScriptedGenerator::new(&[
            "DELETE FROM providers WHERE drg_code = '470'",
            "SELECT * FROM providers WHERE 1=1 UNION SELECT password FROM users",
        ]));
        let executor = Arc::new(FakeExecutor::new());
        let pipeline = pipeline(catalog, generator.clone(), executor.clone(), None);

        let response = pipeline.ask(QuestionRequest::new("delete everything")).await;

        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some("repair_exhausted"));
        assert_eq!(response.generation_calls, 2);
        assert_eq!(executor.calls(), 0);
        assert!(response.diagnostic_sql.unwrap().contains("UNION"));
        assert!(!response.answer_text.contains("forbidden"));
    }

    #[tokio::test]
    async fn test_fast_path_only_does_not_fall_back() {
        let (catalog, _) = catalog_with_template().await;
        let generator = Arc::new(ScriptedGenerator::new(&[
            "SELECT provider_name FROM providers WHERE provider_city = 'Austin' LIMIT 5",
        ]));
        let executor = Arc::new(FakeExecutor::new());
        let pipeline = pipeline(catalog, generator.clone(), executor.clone(), None);

        let response = pipeline
            .ask(QuestionRequest::new("Hospitals in Austin").fast_path_only())
            .await;

        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some("no_template_match"));
        assert_eq!(executor.calls(), 0);
        assert_eq!(generator.calls(), 1);
    }

    #[tokio::test]
    async fn test_bad_tool_arguments_fall_back_to_generation() {
        let (catalog, id) = catalog_with_template().await;
        let reply = format!("{{\"template_id\": {}, \"parameters\": [\"knee\"]}}", id);
        let generator = Arc::new(ScriptedGenerator::new(&[
            &reply,
            "SELECT provider_name FROM providers WHERE provider_state = 'NY' LIMIT 5",
        ]));
        let executor = Arc::new(FakeExecutor::new());
        let pipeline = pipeline(catalog, generator.clone(), executor.clone(), None);

        let response = pipeline.ask(QuestionRequest::new("knee surgery in NY")).await;

        assert!(response.success);
        assert_eq!(response.resolution, Some(ResolutionPath::Generated));
        assert_eq!(response.generation_calls, 2);
        let repair = generator.prompts.lock()[1].repair.clone().unwrap();
        assert!(repair.failure_reason.contains("arity"));
    }

    #[tokio::test]
    async fn test_execution_failure_on_fast_path_falls_back() {
        let (catalog, id) = catalog_with_template().await;
        let reply = format!(
            "{{\"template_id\": {}, \"parameters\": [\"NY\", \"470\", 10]}}",
            id
        );
        let generator = Arc::new(ScriptedGenerator::new(&[
            &reply,
            "SELECT provider_name FROM providers WHERE provider_state = 'NY' LIMIT 5",
        ]));
        let executor = Arc::new(FakeExecutor::failing_with(vec![AppError::execution(
            ExecutionErrorKind::UnknownRelation,
            "relation \"provider_procedures\" does not exist",
        )]));
        let pipeline = pipeline(catalog, generator.clone(), executor.clone(), None);

        let response = pipeline.ask(QuestionRequest::new("cheapest 470 in NY")).await;

        assert!(response.success);
        assert_eq!(response.resolution, Some(ResolutionPath::Generated));
        assert_eq!(executor.calls(), 2);
    }

    #[tokio::test]
    async fn test_fast_path_timeout_is_terminal() {
        let (catalog, id) = catalog_with_template().await;
        let reply = format!(
            "{{\"template_id\": {}, \"parameters\": [\"NY\", \"470\", 10]}}",
            id
        );
        let generator = Arc::new(ScriptedGenerator::new(&[
            &reply,
            "SELECT provider_name FROM providers WHERE provider_state = 'NY' LIMIT 5",
        ]));
        let executor = Arc::new(FakeExecutor::failing_with(vec![AppError::execution(
            ExecutionErrorKind::Timeout,
            "canceling statement due to statement timeout",
        )]));
        let pipeline = pipeline(catalog.clone(), generator.clone(), executor.clone(), None);

        let response = pipeline.ask(QuestionRequest::new("cheapest 470 in NY")).await;

        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some("execution_error"));
        assert_eq!(response.generation_calls, 1);
        assert_eq!(generator.calls(), 1);
        assert_eq!(executor.calls(), 1);
        assert!(response.answer_text.contains("too long"));
        assert_eq!(catalog.stats(1).most_used[0].usage_count, 0);
    }

    #[tokio::test]
    async fn test_overlong_question_is_rejected_before_generation() {
        let (catalog, _) = catalog_with_template().await;
        let generator = Arc::new(ScriptedGenerator::new(&["SELECT 1"]));
        let executor = Arc::new(FakeExecutor::new());
        let pipeline = pipeline(catalog, generator.clone(), executor, None);

        let response = pipeline.ask(QuestionRequest::new("x".repeat(1500))).await;

        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some("validation_error"));
        assert_eq!(generator.calls(), 0);
    }

    #[tokio::test]
    async fn test_generated_success_is_observed_for_growth() {
        let (catalog, _) = catalog_with_template().await;
        let worker = GrowthWorker::new(
            catalog.clone(),
            Arc::new(HashEmbedder::new()),
            None,
            GrowthConfig {
                promotion_threshold: 2,
                ..GrowthConfig::default()
            },
        );
        let (monitor, handle) = GrowthMonitor::spawn(worker);
        let drafts = [
            "SELECT provider_name FROM providers WHERE provider_city = 'Austin' LIMIT 5",
            "SELECT provider_name FROM providers WHERE provider_city = 'Dallas' LIMIT 8",
        ];
        for draft in drafts {
            let generator = Arc::new(ScriptedGenerator::new(&[draft]));
            let pipeline = pipeline(
                catalog.clone(),
                generator,
                Arc::new(FakeExecutor::new()),
                Some(monitor.clone()),
            );
            let response = pipeline.ask(QuestionRequest::new("Hospitals in a city")).await;
            assert!(response.success);
            assert_eq!(response.resolution, Some(ResolutionPath::Generated));
        }
        drop(monitor);
        handle.await.unwrap();
        assert_eq!(catalog.len(), 2);
    }
}
