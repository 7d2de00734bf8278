use crate::application::use_cases::embedding_service::EmbeddingService;
use crate::domain::error::{AppError, Result};
use crate::domain::parameter::ParamType;
use crate::domain::template::{FingerprintOccurrence, NewTemplate, Template};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::SqlitePool;
use std::path::Path;

use super::connection::{init_catalog_db, init_in_memory_catalog_db};

pub struct StoredTemplate {
    pub template: Template,
    /// False when the fingerprint was already stored.
    pub created: bool,
}

/// Durable side of the template catalog and the growth monitor's occurrence log.
pub struct CatalogRepository {
    pool: SqlitePool,
}

impl CatalogRepository {
    pub async fn connect(db_path: &Path) -> Result<Self> {
        let pool = init_catalog_db(db_path).await?;
        Ok(Self { pool })
    }

    pub async fn in_memory() -> Result<Self> {
        let pool = init_in_memory_catalog_db().await?;
        Ok(Self { pool })
    }

    pub async fn load_templates(&self) -> Result<Vec<Template>> {
        let rows = sqlx::query_as::<_, TemplateEntity>(
            "SELECT id, canonical_sql, raw_sql, fingerprint, embedding, description, parameter_types, placeholder_count, usage_count, created_at, updated_at FROM template_catalog ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::Database(format!("Failed to load templates: {}", e)))?;

        rows.into_iter().map(Template::try_from).collect()
    }

    /// Inserts a template. When the fingerprint is already stored, the
    /// existing row is returned with `created == false`.
    pub async fn insert_template(&self, input: &NewTemplate) -> Result<StoredTemplate> {
        let now = format_timestamp(Utc::now());
        let parameter_types = serde_json::to_string(&input.parameter_types)
            .map_err(|e| AppError::Internal(format!("Failed to encode parameter types: {}", e)))?;

        let inserted = sqlx::query_as::<_, TemplateEntity>(
            "INSERT INTO template_catalog (canonical_sql, raw_sql, fingerprint, embedding, description, parameter_types, placeholder_count, usage_count, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?) RETURNING *",
        )
        .bind(&input.canonical_sql)
        .bind(&input.raw_sql)
        .bind(&input.fingerprint)
        .bind(EmbeddingService::embedding_to_bytes(&input.embedding))
        .bind(&input.description)
        .bind(parameter_types)
        .bind(input.placeholder_count as i64)
        .bind(&now)
        .bind(&now)
        .fetch_one(&self.pool)
        .await;

        match inserted {
            Ok(entity) => Ok(StoredTemplate {
                template: Template::try_from(entity)?,
                created: true,
            }),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                let existing = self
                    .find_template_by_fingerprint(&input.fingerprint)
                    .await?
                    .ok_or_else(|| {
                        AppError::Database(format!(
                            "Template fingerprint conflict without a stored row: {}",
                            db
                        ))
                    })?;
                Ok(StoredTemplate {
                    template: existing,
                    created: false,
                })
            }
            Err(e) => Err(AppError::Database(format!("Failed to insert template: {}", e))),
        }
    }

    pub async fn find_template_by_fingerprint(&self, fingerprint: &str) -> Result<Option<Template>> {
        let row = sqlx::query_as::<_, TemplateEntity>(
            "SELECT id, canonical_sql, raw_sql, fingerprint, embedding, description, parameter_types, placeholder_count, usage_count, created_at, updated_at FROM template_catalog WHERE fingerprint = ?",
        )
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Database(format!("Failed to look up template: {}", e)))?;

        row.map(Template::try_from).transpose()
    }

    pub async fn delete_template(&self, template_id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM template_catalog WHERE id = ?")
            .bind(template_id)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Database(format!("Failed to delete template: {}", e)))?;
        Ok(result.rows_affected() > 0)
    }

    /// Writes the in-memory counter value. Last writer wins.
    pub async fn set_usage(&self, template_id: i64, usage_count: u64) -> Result<()> {
        sqlx::query("UPDATE template_catalog SET usage_count = ?, updated_at = ? WHERE id = ?")
            .bind(usage_count as i64)
            .bind(format_timestamp(Utc::now()))
            .bind(template_id)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Database(format!("Failed to update template usage: {}", e)))?;
        Ok(())
    }

    pub async fn record_occurrence(&self, occurrence: &FingerprintOccurrence) -> Result<()> {
        let parameter_types = serde_json::to_string(&occurrence.parameter_types)
            .map_err(|e| AppError::Internal(format!("Failed to encode parameter types: {}", e)))?;

        sqlx::query(
            "INSERT INTO fingerprint_occurrences (fingerprint, canonical_sql, raw_sql, parameter_types, placeholder_count, question, observed_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&occurrence.fingerprint)
        .bind(&occurrence.canonical_sql)
        .bind(&occurrence.raw_sql)
        .bind(parameter_types)
        .bind(occurrence.placeholder_count as i64)
        .bind(&occurrence.question)
        .bind(format_timestamp(occurrence.observed_at))
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Database(format!("Failed to record occurrence: {}", e)))?;
        Ok(())
    }

    /// Occurrences observed at or after `since`, oldest first.
    pub async fn load_occurrences_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<FingerprintOccurrence>> {
        let rows = sqlx::query_as::<_, OccurrenceEntity>(
            "SELECT fingerprint, canonical_sql, raw_sql, parameter_types, placeholder_count, question, observed_at FROM fingerprint_occurrences WHERE observed_at >= ? ORDER BY observed_at, id",
        )
        .bind(format_timestamp(since))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::Database(format!("Failed to load occurrences: {}", e)))?;

        rows.into_iter().map(FingerprintOccurrence::try_from).collect()
    }

    pub async fn prune_occurrences_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM fingerprint_occurrences WHERE observed_at < ?")
            .bind(format_timestamp(cutoff))
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Database(format!("Failed to prune occurrences: {}", e)))?;
        Ok(result.rows_affected())
    }

    pub async fn delete_occurrences(&self, fingerprint: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM fingerprint_occurrences WHERE fingerprint = ?")
            .bind(fingerprint)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Database(format!("Failed to delete occurrences: {}", e)))?;
        Ok(result.rows_affected())
    }
}

// Fixed-width so that text comparison in SQL matches time order.
fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_parameter_types(value: &str) -> Result<Vec<Option<ParamType>>> {
    serde_json::from_str(value)
        .map_err(|e| AppError::Database(format!("Corrupt parameter_types column: {}", e)))
}

#[derive(sqlx::FromRow)]
struct TemplateEntity {
    id: i64,
    canonical_sql: String,
    raw_sql: String,
    fingerprint: String,
    embedding: Vec<u8>,
    description: String,
    parameter_types: String,
    placeholder_count: i64,
    usage_count: i64,
    created_at: String,
    updated_at: String,
}

impl TryFrom<TemplateEntity> for Template {
    type Error = AppError;

    fn try_from(entity: TemplateEntity) -> Result<Self> {
        Ok(Self {
            id: entity.id,
            canonical_sql: entity.canonical_sql,
            raw_sql: entity.raw_sql,
            fingerprint: entity.fingerprint,
            embedding: EmbeddingService::bytes_to_embedding(&entity.embedding)?,
            description: entity.description,
            parameter_types: parse_parameter_types(&entity.parameter_types)?,
            placeholder_count: entity.placeholder_count.max(0) as usize,
            usage_count: entity.usage_count.max(0) as u64,
            created_at: parse_timestamp(&entity.created_at),
            updated_at: parse_timestamp(&entity.updated_at),
        })
    }
}

#[derive(sqlx::FromRow)]
struct OccurrenceEntity {
    fingerprint: String,
    canonical_sql: String,
    raw_sql: String,
    parameter_types: String,
    placeholder_count: i64,
    question: String,
    observed_at: String,
}

impl TryFrom<OccurrenceEntity> for FingerprintOccurrence {
    type Error = AppError;

    fn try_from(entity: OccurrenceEntity) -> Result<Self> {
        Ok(Self {
            fingerprint: entity.fingerprint,
            canonical_sql: entity.canonical_sql,
            raw_sql: entity.raw_sql,
            parameter_types: parse_parameter_types(&entity.parameter_types)?,
            placeholder_count: entity.placeholder_count.max(0) as usize,
            question: entity.question,
            observed_at: parse_timestamp(&entity.observed_at),
        })
    }
}
