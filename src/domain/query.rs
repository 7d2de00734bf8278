use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use validator::Validate;

use super::parameter::ParameterSet;

/// Rule identifiers reported by the safety validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleCode {
    EmptyQuery,
    QueryTooLong,
    ParseFailure,
    MultipleStatements,
    ForbiddenStatementType,
    ForbiddenKeyword,
    EmbeddedForbiddenKeyword,
    CommentNotAllowed,
    EncodedTerminator,
    SetOperationNotAllowed,
    SelectInto,
    LockingClause,
    ForbiddenFunction,
    TableNotAllowed,
    JoinDepthExceeded,
    PredicateCountExceeded,
    LimitExceeded,
    MissingLimit,
}

impl RuleCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleCode::EmptyQuery => "empty_query",
            RuleCode::QueryTooLong => "query_too_long",
            RuleCode::ParseFailure => "parse_failure",
            RuleCode::MultipleStatements => "multiple_statements",
            RuleCode::ForbiddenStatementType => "forbidden_statement_type",
            RuleCode::ForbiddenKeyword => "forbidden_keyword",
            RuleCode::EmbeddedForbiddenKeyword => "embedded_forbidden_keyword",
            RuleCode::CommentNotAllowed => "comment_not_allowed",
            RuleCode::EncodedTerminator => "encoded_terminator",
            RuleCode::SetOperationNotAllowed => "set_operation_not_allowed",
            RuleCode::SelectInto => "select_into",
            RuleCode::LockingClause => "locking_clause",
            RuleCode::ForbiddenFunction => "forbidden_function",
            RuleCode::TableNotAllowed => "table_not_allowed",
            RuleCode::JoinDepthExceeded => "join_depth_exceeded",
            RuleCode::PredicateCountExceeded => "predicate_count_exceeded",
            RuleCode::LimitExceeded => "limit_exceeded",
            RuleCode::MissingLimit => "missing_limit",
        }
    }
}

impl fmt::Display for RuleCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleViolation {
    pub code: RuleCode,
    pub message: String,
}

/// Verdict of the safety validator. A failing result always names at least one rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub violations: Vec<RuleViolation>,
}

impl ValidationResult {
    pub fn pass() -> Self {
        Self {
            violations: Vec::new(),
        }
    }

    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn add(&mut self, code: RuleCode, message: impl Into<String>) {
        if self.violations.iter().any(|v| v.code == code) {
            return;
        }
        self.violations.push(RuleViolation {
            code,
            message: message.into(),
        });
    }

    pub fn has(&self, code: RuleCode) -> bool {
        self.violations.iter().any(|v| v.code == code)
    }

    pub fn codes(&self) -> Vec<RuleCode> {
        self.violations.iter().map(|v| v.code).collect()
    }

    /// One line per violation, used as repair context.
    pub fn describe(&self) -> String {
        self.violations
            .iter()
            .map(|v| format!("{}: {}", v.code, v.message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Untrusted SQL text returned by the generation collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SqlDraft(pub String);

impl SqlDraft {
    pub fn new(sql: impl Into<String>) -> Self {
        Self(sql.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// What the generation collaborator handed back.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationOutput {
    Sql(SqlDraft),
    TemplateChoice {
        template_id: i64,
        arguments: Vec<serde_json::Value>,
    },
}

/// Output of the normalizer.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedQuery {
    pub canonical_sql: String,
    /// Same structure as the input with literals lifted into `$n` placeholders.
    pub raw_sql: String,
    pub parameters: ParameterSet,
    /// Distinct placeholders in `raw_sql`. Equals `parameters.len()` unless the
    /// input already carried placeholders.
    pub placeholder_count: usize,
    pub fingerprint: String,
}

impl NormalizedQuery {
    /// True when every placeholder has an extracted value to bind.
    pub fn is_self_contained(&self) -> bool {
        self.placeholder_count == self.parameters.len()
    }
}

/// Parameterized statement ready for validation. Values travel beside the
/// text and are bound by the driver.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundStatement {
    pub sql: String,
    pub params: ParameterSet,
    pub template_id: Option<i64>,
}

impl BoundStatement {
    pub fn from_normalized(query: &NormalizedQuery) -> Self {
        Self {
            sql: query.raw_sql.clone(),
            params: query.parameters.clone(),
            template_id: None,
        }
    }
}

/// Scored template candidate, alive only for one ranking pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateMatch {
    pub template_id: i64,
    pub similarity: f32,
    pub edit_distance: f32,
    pub jaccard: f32,
    pub confidence: f32,
    pub usage_count: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<HashMap<String, serde_json::Value>>,
    pub row_count: usize,
    /// Set when rows beyond the configured cap were dropped.
    pub truncated: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct QuestionRequest {
    #[validate(length(min = 1, max = 4000))]
    pub question: String,
    #[serde(default)]
    pub allow_slow_path: Option<bool>,
}

impl QuestionRequest {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            allow_slow_path: None,
        }
    }

    pub fn fast_path_only(mut self) -> Self {
        self.allow_slow_path = Some(false);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionPath {
    ToolChoice,
    TemplateMatch,
    Generated,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineResponse {
    pub answer_text: String,
    pub sql_query: Option<String>,
    pub template_id: Option<i64>,
    pub confidence_score: Option<f32>,
    pub execution_time_ms: u64,
    pub success: bool,
    pub error: Option<String>,
    pub resolution: Option<ResolutionPath>,
    pub rows: Option<RowSet>,
    pub generation_calls: u32,
    /// Offending SQL from the last failed attempt, never error internals.
    pub diagnostic_sql: Option<String>,
}
