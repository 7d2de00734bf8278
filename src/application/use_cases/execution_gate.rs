//! Execution Gate
//!
//! The only path to the database. Accepts nothing but a [`ValidatedStatement`],
//! which can only be minted by the safety validator, so an unvalidated string
//! has no way through. Every call carries a timeout; dropping the executor
//! future on expiry cancels the in-flight query.

use crate::application::use_cases::safety_validator::ValidatedStatement;
use crate::domain::error::{AppError, ExecutionErrorKind, Result};
use crate::domain::parameter::ParameterSet;
use crate::domain::query::RowSet;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Connection and limit settings for the read-only data source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_username")]
    pub username: String,
    /// `env:NAME`, `keychain:KEY` or `plain:VALUE`.
    #[serde(default = "default_password_ref")]
    pub password_ref: String,
    #[serde(default = "default_ssl_mode")]
    pub ssl_mode: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
    #[serde(default = "default_max_rows")]
    pub max_rows: usize,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5432
}

fn default_database() -> String {
    "healthcare".to_string()
}

fn default_username() -> String {
    "sqlnav_reader".to_string()
}

fn default_password_ref() -> String {
    "env:SQLNAV_DB_PASSWORD".to_string()
}

fn default_ssl_mode() -> String {
    "prefer".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_query_timeout_ms() -> u64 {
    10_000
}

fn default_max_rows() -> usize {
    1000
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            database: default_database(),
            username: default_username(),
            password_ref: default_password_ref(),
            ssl_mode: default_ssl_mode(),
            max_connections: default_max_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
            query_timeout_ms: default_query_timeout_ms(),
            max_rows: default_max_rows(),
        }
    }
}

/// Runs a parameterized, read-only statement. Values are bound by the driver,
/// never spliced into the text.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, sql: &str, params: &ParameterSet) -> Result<RowSet>;
}

#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub rows: RowSet,
    pub elapsed_ms: u64,
}

pub struct ExecutionGate {
    executor: Arc<dyn QueryExecutor>,
    timeout: Duration,
    max_rows: usize,
}

impl ExecutionGate {
    pub fn new(executor: Arc<dyn QueryExecutor>, timeout: Duration, max_rows: usize) -> Self {
        Self {
            executor,
            timeout,
            max_rows,
        }
    }

    pub fn from_config(executor: Arc<dyn QueryExecutor>, config: &ExecutionConfig) -> Self {
        Self::new(
            executor,
            Duration::from_millis(config.query_timeout_ms),
            config.max_rows,
        )
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Executes within the gate timeout, capping the row count.
    pub async fn execute(&self, statement: &ValidatedStatement) -> Result<ExecutionOutcome> {
        self.execute_within(statement, self.timeout).await
    }

    /// Like [`execute`](Self::execute) with a caller-imposed ceiling, used when
    /// the request deadline is closer than the gate timeout.
    pub async fn execute_within(
        &self,
        statement: &ValidatedStatement,
        budget: Duration,
    ) -> Result<ExecutionOutcome> {
        let timeout = budget.min(self.timeout);
        let started = Instant::now();
        debug!(
            template_id = ?statement.template_id(),
            params = statement.params().len(),
            "Executing validated statement"
        );

        let result = tokio::time::timeout(
            timeout,
            self.executor.execute(statement.sql(), statement.params()),
        )
        .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let mut rows = match result {
            Err(_) => {
                warn!(elapsed_ms, "Statement cancelled after timeout");
                return Err(AppError::execution(
                    ExecutionErrorKind::Timeout,
                    format!("Query exceeded {} ms", timeout.as_millis()),
                ));
            }
            Ok(Err(err)) => {
                let err = classify(err);
                warn!(elapsed_ms, error = %err, "Statement failed");
                return Err(err);
            }
            Ok(Ok(rows)) => rows,
        };

        if rows.rows.len() > self.max_rows {
            rows.rows.truncate(self.max_rows);
            rows.truncated = true;
        }
        rows.row_count = rows.rows.len();

        info!(
            elapsed_ms,
            row_count = rows.row_count,
            truncated = rows.truncated,
            "Statement executed"
        );

        Ok(ExecutionOutcome { rows, elapsed_ms })
    }
}

/// Every failure leaving the gate is an execution error with a kind.
fn classify(err: AppError) -> AppError {
    match err {
        AppError::Execution { .. } => err,
        AppError::Database(message) => AppError::execution(ExecutionErrorKind::Connection, message),
        AppError::Io(e) => AppError::execution(ExecutionErrorKind::Connection, e.to_string()),
        other => AppError::execution(ExecutionErrorKind::Other, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::use_cases::safety_validator::{SafetyRules, SafetyValidator};
    use crate::domain::parameter::ParamValue;
    use crate::domain::query::BoundStatement;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubExecutor {
        rows: usize,
        delay: Duration,
        failure: Option<ExecutionErrorKind>,
        calls: AtomicUsize,
    }

    impl StubExecutor {
        fn rows(rows: usize) -> Self {
            Self {
                rows,
                delay: Duration::ZERO,
                failure: None,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl QueryExecutor for StubExecutor {
        async fn execute(&self, _sql: &str, _params: &ParameterSet) -> Result<RowSet> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if let Some(kind) = self.failure {
                return Err(AppError::execution(kind, "relation \"nope\" does not exist"));
            }
            let rows = (0..self.rows)
                .map(|i| {
                    let mut row = HashMap::new();
                    row.insert("n".to_string(), serde_json::json!(i));
                    row
                })
                .collect::<Vec<_>>();
            Ok(RowSet {
                columns: vec!["n".to_string()],
                row_count: rows.len(),
                rows,
                truncated: false,
            })
        }
    }

    fn validated(sql: &str) -> ValidatedStatement {
        let validator = SafetyValidator::new(SafetyRules::default());
        validator
            .approve(BoundStatement {
                sql: sql.to_string(),
                params: ParameterSet::new(vec![ParamValue::String("NY".to_string())]),
                template_id: Some(1),
            })
            .unwrap()
    }

    #[tokio::test]
    async fn test_rows_are_capped() {
        let executor = Arc::new(StubExecutor::rows(12));
        let gate = ExecutionGate::new(executor.clone(), Duration::from_secs(1), 10);
        let outcome = gate
            .execute(&validated(
                "SELECT provider_name FROM providers WHERE provider_state = $1 LIMIT 50",
            ))
            .await
            .unwrap();
        assert_eq!(outcome.rows.row_count, 10);
        assert!(outcome.rows.truncated);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_execution_timeout() {
        let executor = Arc::new(StubExecutor {
            delay: Duration::from_millis(200),
            ..StubExecutor::rows(1)
        });
        let gate = ExecutionGate::new(executor, Duration::from_millis(20), 10);
        let err = gate
            .execute(&validated(
                "SELECT provider_name FROM providers WHERE provider_state = $1 LIMIT 5",
            ))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Execution {
                kind: ExecutionErrorKind::Timeout,
                ..
            }
        ));
        assert!(!err.is_repairable());
    }

    #[tokio::test]
    async fn test_executor_errors_keep_their_kind() {
        let executor = Arc::new(StubExecutor {
            failure: Some(ExecutionErrorKind::UnknownRelation),
            ..StubExecutor::rows(0)
        });
        let gate = ExecutionGate::new(executor, Duration::from_secs(1), 10);
        let err = gate
            .execute(&validated(
                "SELECT provider_name FROM providers WHERE provider_state = $1 LIMIT 5",
            ))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Execution {
                kind: ExecutionErrorKind::UnknownRelation,
                ..
            }
        ));
        assert!(err.is_repairable());
    }

    #[test]
    fn test_classify_maps_database_to_connection() {
        let err = classify(AppError::Database("pool timed out".to_string()));
        assert!(matches!(
            err,
            AppError::Execution {
                kind: ExecutionErrorKind::Connection,
                ..
            }
        ));
    }
}
