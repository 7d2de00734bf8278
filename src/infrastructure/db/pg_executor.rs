//! Read-only PostgreSQL executor
//!
//! Sessions are opened with `default_transaction_read_only=on` and a server
//! side `statement_timeout`, and every statement runs inside a READ ONLY
//! transaction that is always rolled back. Credentials come from a secret
//! reference, never from the configuration file itself.

use crate::application::use_cases::execution_gate::{ExecutionConfig, QueryExecutor};
use crate::domain::error::{AppError, ExecutionErrorKind, Result};
use crate::domain::parameter::{ParamValue, ParameterSet};
use crate::domain::query::RowSet;
use crate::infrastructure::security::keyring::KeyringManager;
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use futures::TryStreamExt;
use sqlx::postgres::{PgArguments, PgConnectOptions, PgPoolOptions, PgRow, PgSslMode};
use sqlx::query::Query;
use sqlx::{Column, Pool, Postgres, Row, TypeInfo};
use std::collections::HashMap;
use std::time::Duration;
use tracing::info;

pub struct PgExecutor {
    pool: Pool<Postgres>,
    /// Rows read per statement. One more is requested to detect truncation.
    max_rows: usize,
}

impl PgExecutor {
    /// Builds a lazily connecting pool; the first statement opens the session.
    pub fn connect_lazy(config: &ExecutionConfig, keyring: &KeyringManager) -> Result<Self> {
        let password = keyring.resolve(&config.password_ref)?;
        let options = Self::build_pg_options(config, &password);

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Duration::from_secs(300))
            .connect_lazy_with(options);

        info!(
            "Configured read-only PostgreSQL pool (host: {}, database: {})",
            config.host, config.database
        );

        Ok(Self {
            pool,
            max_rows: config.max_rows.max(1),
        })
    }

    pub fn from_pool(pool: Pool<Postgres>, max_rows: usize) -> Self {
        Self {
            pool,
            max_rows: max_rows.max(1),
        }
    }

    fn parse_ssl_mode(ssl_mode: &str) -> PgSslMode {
        match ssl_mode.to_lowercase().as_str() {
            "disable" => PgSslMode::Disable,
            "allow" => PgSslMode::Allow,
            "prefer" => PgSslMode::Prefer,
            "require" => PgSslMode::Require,
            "verify-ca" => PgSslMode::VerifyCa,
            "verify-full" => PgSslMode::VerifyFull,
            _ => PgSslMode::Prefer,
        }
    }

    fn build_pg_options(config: &ExecutionConfig, password: &str) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .database(&config.database)
            .username(&config.username)
            .password(password)
            .ssl_mode(Self::parse_ssl_mode(&config.ssl_mode))
            .application_name("sqlnav")
            .options([
                ("default_transaction_read_only", "on".to_string()),
                ("statement_timeout", config.query_timeout_ms.to_string()),
            ])
    }

    fn bind_param<'q>(
        query: Query<'q, Postgres, PgArguments>,
        param: &ParamValue,
    ) -> Query<'q, Postgres, PgArguments> {
        match param {
            ParamValue::Number(text) => {
                if let Ok(i) = text.parse::<i64>() {
                    query.bind(i)
                } else if let Ok(f) = text.parse::<f64>() {
                    query.bind(f)
                } else {
                    query.bind(text.clone())
                }
            }
            ParamValue::String(s) => query.bind(s.clone()),
            ParamValue::Boolean(b) => query.bind(*b),
            ParamValue::Array(items) => {
                let ints: Option<Vec<i64>> = items
                    .iter()
                    .map(|item| match item {
                        ParamValue::Number(n) => n.parse::<i64>().ok(),
                        _ => None,
                    })
                    .collect();
                if let Some(ints) = ints {
                    return query.bind(ints);
                }
                let floats: Option<Vec<f64>> = items
                    .iter()
                    .map(|item| match item {
                        ParamValue::Number(n) => n.parse::<f64>().ok(),
                        _ => None,
                    })
                    .collect();
                if let Some(floats) = floats {
                    return query.bind(floats);
                }
                let texts: Vec<String> = items
                    .iter()
                    .map(|item| match item {
                        ParamValue::String(s) | ParamValue::Number(s) => s.clone(),
                        other => other.to_json().to_string(),
                    })
                    .collect();
                query.bind(texts)
            }
        }
    }

    fn classify_error(err: sqlx::Error) -> AppError {
        match err {
            sqlx::Error::Database(db_err) => {
                let kind = db_err
                    .code()
                    .map(|code| ExecutionErrorKind::from_sqlstate(&code))
                    .unwrap_or(ExecutionErrorKind::Other);
                AppError::execution(kind, db_err.message().to_string())
            }
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::WorkerCrashed => {
                AppError::execution(ExecutionErrorKind::Connection, err.to_string())
            }
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                AppError::execution(ExecutionErrorKind::TypeError, err.to_string())
            }
            other => AppError::execution(ExecutionErrorKind::Other, other.to_string()),
        }
    }

    /// Decodes one cell by its Postgres type name. Types without a JSON
    /// mapping are read as text when the driver allows it, else null.
    fn cell_to_json(row: &PgRow, index: usize) -> serde_json::Value {
        use serde_json::Value;

        fn get<'r, T>(row: &'r PgRow, index: usize) -> Option<T>
        where
            T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
        {
            row.try_get::<Option<T>, _>(index).ok().flatten()
        }

        let type_name = row.column(index).type_info().name().to_ascii_uppercase();
        let value = match type_name.as_str() {
            "INT2" => get::<i16>(row, index).map(Value::from),
            "INT4" => get::<i32>(row, index).map(Value::from),
            "INT8" => get::<i64>(row, index).map(Value::from),
            "FLOAT4" => get::<f32>(row, index).map(|n| Value::from(n as f64)),
            "FLOAT8" => get::<f64>(row, index).map(Value::from),
            "NUMERIC" => get::<BigDecimal>(row, index).map(decimal_to_json),
            "BOOL" => get::<bool>(row, index).map(Value::Bool),
            "TIMESTAMPTZ" => get::<chrono::DateTime<chrono::Utc>>(row, index)
                .map(|dt| Value::String(dt.to_rfc3339())),
            "TIMESTAMP" => get::<chrono::NaiveDateTime>(row, index)
                .map(|dt| Value::String(dt.to_string())),
            "DATE" => get::<chrono::NaiveDate>(row, index).map(|d| Value::String(d.to_string())),
            _ => get::<String>(row, index).map(Value::String),
        };
        value.unwrap_or(Value::Null)
    }

    fn rows_to_set(rows: &[PgRow]) -> RowSet {
        let columns: Vec<String> = rows
            .first()
            .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
            .unwrap_or_default();

        let rows: Vec<HashMap<String, serde_json::Value>> = rows
            .iter()
            .map(|row| {
                columns
                    .iter()
                    .enumerate()
                    .map(|(i, name)| (name.clone(), Self::cell_to_json(row, i)))
                    .collect()
            })
            .collect();

        RowSet {
            columns,
            row_count: rows.len(),
            rows,
            truncated: false,
        }
    }
}

/// Reads at most `max_rows` rows and reports whether more were available.
async fn read_bounded<S, T, E>(
    mut stream: S,
    max_rows: usize,
) -> std::result::Result<(Vec<T>, bool), E>
where
    S: futures::Stream<Item = std::result::Result<T, E>> + Unpin,
{
    let mut rows = Vec::new();
    while let Some(row) = stream.try_next().await? {
        if rows.len() == max_rows {
            return Ok((rows, true));
        }
        rows.push(row);
    }
    Ok((rows, false))
}

fn decimal_to_json(value: BigDecimal) -> serde_json::Value {
    let text = value.normalized().to_string();
    if let Ok(i) = text.parse::<i64>() {
        return serde_json::Value::Number(i.into());
    }
    text.parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(serde_json::Value::Number)
        .unwrap_or(serde_json::Value::String(text))
}

#[async_trait]
impl QueryExecutor for PgExecutor {
    async fn execute(&self, sql: &str, params: &ParameterSet) -> Result<RowSet> {
        let mut tx = self.pool.begin().await.map_err(Self::classify_error)?;

        sqlx::query("SET TRANSACTION READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(Self::classify_error)?;

        let mut query = sqlx::query(sql);
        for param in params.iter() {
            query = Self::bind_param(query, param);
        }

        let result = read_bounded(query.fetch(&mut *tx), self.max_rows).await;

        // Nothing to keep; a failed rollback just drops the connection.
        let _ = tx.rollback().await;

        let (rows, truncated) = result.map_err(Self::classify_error)?;
        let mut set = Self::rows_to_set(&rows);
        set.truncated = truncated;
        Ok(set)
    }
}
