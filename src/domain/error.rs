use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use super::query::RuleCode;

/// Classification of a failed statement execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionErrorKind {
    UnknownRelation,
    UnknownColumn,
    TypeError,
    Timeout,
    Connection,
    Syntax,
    PermissionDenied,
    Other,
}

impl ExecutionErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionErrorKind::UnknownRelation => "unknown_relation",
            ExecutionErrorKind::UnknownColumn => "unknown_column",
            ExecutionErrorKind::TypeError => "type_error",
            ExecutionErrorKind::Timeout => "timeout",
            ExecutionErrorKind::Connection => "connection",
            ExecutionErrorKind::Syntax => "syntax",
            ExecutionErrorKind::PermissionDenied => "permission_denied",
            ExecutionErrorKind::Other => "other",
        }
    }

    /// Maps a Postgres SQLSTATE code onto an execution error kind.
    pub fn from_sqlstate(code: &str) -> Self {
        match code {
            "42P01" => ExecutionErrorKind::UnknownRelation,
            "42703" => ExecutionErrorKind::UnknownColumn,
            "42804" | "42883" | "42846" | "22P02" => ExecutionErrorKind::TypeError,
            "57014" => ExecutionErrorKind::Timeout,
            "42601" => ExecutionErrorKind::Syntax,
            "42501" | "25006" => ExecutionErrorKind::PermissionDenied,
            c if c.starts_with("22") => ExecutionErrorKind::TypeError,
            c if c.starts_with("08") => ExecutionErrorKind::Connection,
            _ => ExecutionErrorKind::Other,
        }
    }
}

impl fmt::Display for ExecutionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Safety violation: {}", join_codes(.0))]
    SafetyViolation(Vec<RuleCode>),

    #[error("No template matched the draft query")]
    NoTemplateMatch,

    #[error("Parameter arity mismatch: template expects {expected}, got {actual}")]
    ParameterArityMismatch { expected: usize, actual: usize },

    #[error("Parameter type mismatch at ${position}: expected {expected}, got {actual}")]
    ParameterTypeMismatch {
        position: usize,
        expected: String,
        actual: String,
    },

    #[error("Execution error ({kind}): {message}")]
    Execution {
        kind: ExecutionErrorKind,
        message: String,
    },

    #[error("Repair exhausted after {attempts} generation attempts")]
    RepairExhausted { attempts: u32 },

    #[error("Request timed out after {0} ms")]
    RequestTimeout(u64),

    #[error("Generation error: {0}")]
    Generation(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Security error: {0}")]
    Security(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn join_codes(codes: &[RuleCode]) -> String {
    codes
        .iter()
        .map(|c| c.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

impl AppError {
    pub fn execution(kind: ExecutionErrorKind, message: impl Into<String>) -> Self {
        AppError::Execution {
            kind,
            message: message.into(),
        }
    }

    /// Failures that earn a regeneration attempt on the slow path.
    pub fn is_repairable(&self) -> bool {
        match self {
            AppError::Parse(_) | AppError::SafetyViolation(_) => true,
            AppError::Execution { kind, .. } => *kind != ExecutionErrorKind::Timeout,
            _ => false,
        }
    }

    /// Failures that send a fast-path attempt quietly to the slow path.
    /// Timeouts and lost connections are terminal.
    pub fn is_fast_path_recoverable(&self) -> bool {
        match self {
            AppError::Parse(_)
            | AppError::SafetyViolation(_)
            | AppError::NoTemplateMatch
            | AppError::ParameterArityMismatch { .. }
            | AppError::ParameterTypeMismatch { .. }
            | AppError::NotFound(_) => true,
            AppError::Execution { kind, .. } => !matches!(
                kind,
                ExecutionErrorKind::Timeout | ExecutionErrorKind::Connection
            ),
            _ => false,
        }
    }

    /// Short machine-readable kind, safe to hand to callers.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Parse(_) => "parse_error",
            AppError::SafetyViolation(_) => "safety_violation",
            AppError::NoTemplateMatch => "no_template_match",
            AppError::ParameterArityMismatch { .. } => "parameter_arity_mismatch",
            AppError::ParameterTypeMismatch { .. } => "parameter_type_mismatch",
            AppError::Execution { .. } => "execution_error",
            AppError::RepairExhausted { .. } => "repair_exhausted",
            AppError::RequestTimeout(_) => "request_timeout",
            AppError::Generation(_) => "generation_error",
            AppError::Embedding(_) => "embedding_error",
            AppError::Database(_) => "database_error",
            AppError::Config(_) => "config_error",
            AppError::Security(_) => "security_error",
            AppError::NotFound(_) => "not_found",
            AppError::Validation(_) => "validation_error",
            AppError::Io(_) => "io_error",
            AppError::Internal(_) => "internal_error",
        }
    }

    /// Caller-facing sentence. Carries no driver messages, stack traces or secrets.
    pub fn user_message(&self) -> String {
        match self {
            AppError::RepairExhausted { .. } => {
                "I couldn't build a safe query that answers this question. Try rephrasing it or adding more detail.".to_string()
            }
            AppError::RequestTimeout(_) => {
                "The question took too long to answer. Please try again or narrow it down.".to_string()
            }
            AppError::Execution {
                kind: ExecutionErrorKind::Timeout,
                ..
            } => "The query took too long to run. Try a narrower question.".to_string(),
            AppError::Execution {
                kind: ExecutionErrorKind::Connection,
                ..
            } => "The data source is unavailable right now. Please try again shortly.".to_string(),
            AppError::SafetyViolation(_) => {
                "That request would need a query this service is not allowed to run.".to_string()
            }
            AppError::Validation(msg) => format!("The question could not be accepted: {}", msg),
            AppError::Generation(_) | AppError::Embedding(_) => {
                "The language service is unavailable right now. Please try again shortly.".to_string()
            }
            _ => "Something went wrong while answering this question.".to_string(),
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Database(err.to_string())
    }
}

impl From<figment::Error> for AppError {
    fn from(err: figment::Error) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(err: validator::ValidationErrors) -> Self {
        AppError::Validation(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlstate_mapping() {
        assert_eq!(
            ExecutionErrorKind::from_sqlstate("42P01"),
            ExecutionErrorKind::UnknownRelation
        );
        assert_eq!(
            ExecutionErrorKind::from_sqlstate("42703"),
            ExecutionErrorKind::UnknownColumn
        );
        assert_eq!(
            ExecutionErrorKind::from_sqlstate("22003"),
            ExecutionErrorKind::TypeError
        );
        assert_eq!(
            ExecutionErrorKind::from_sqlstate("08006"),
            ExecutionErrorKind::Connection
        );
        assert_eq!(
            ExecutionErrorKind::from_sqlstate("57014"),
            ExecutionErrorKind::Timeout
        );
        assert_eq!(
            ExecutionErrorKind::from_sqlstate("XX000"),
            ExecutionErrorKind::Other
        );
    }

    #[test]
    fn test_repairable_errors() {
        assert!(AppError::Parse("bad".into()).is_repairable());
        assert!(AppError::SafetyViolation(vec![RuleCode::ForbiddenKeyword]).is_repairable());
        assert!(AppError::execution(ExecutionErrorKind::UnknownColumn, "x").is_repairable());
        assert!(!AppError::execution(ExecutionErrorKind::Timeout, "x").is_repairable());
        assert!(!AppError::RepairExhausted { attempts: 2 }.is_repairable());
        assert!(!AppError::NoTemplateMatch.is_repairable());
    }

    #[test]
    fn test_fast_path_fallback_excludes_timeouts() {
        assert!(AppError::NoTemplateMatch.is_fast_path_recoverable());
        assert!(AppError::ParameterArityMismatch {
            expected: 3,
            actual: 1
        }
        .is_fast_path_recoverable());
        assert!(AppError::execution(ExecutionErrorKind::UnknownRelation, "x").is_fast_path_recoverable());
        assert!(!AppError::execution(ExecutionErrorKind::Timeout, "x").is_fast_path_recoverable());
        assert!(!AppError::execution(ExecutionErrorKind::Connection, "x").is_fast_path_recoverable());
        assert!(!AppError::RequestTimeout(30_000).is_fast_path_recoverable());
    }

    #[test]
    fn test_safety_violation_display_lists_codes() {
        let err = AppError::SafetyViolation(vec![
            RuleCode::ForbiddenStatementType,
            RuleCode::ForbiddenKeyword,
        ]);
        assert_eq!(
            err.to_string(),
            "Safety violation: forbidden_statement_type, forbidden_keyword"
        );
    }

    #[test]
    fn test_user_message_hides_internals() {
        let err = AppError::execution(
            ExecutionErrorKind::Connection,
            "password authentication failed for user \"reader\"",
        );
        let message = err.user_message();
        assert!(!message.contains("password"));
        assert!(!message.contains("reader"));
    }
}
