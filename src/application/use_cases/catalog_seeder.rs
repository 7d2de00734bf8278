use crate::application::use_cases::embedding_service::Embedder;
use crate::application::use_cases::safety_validator::SafetyValidator;
use crate::application::use_cases::sql_normalizer::SqlNormalizer;
use crate::application::use_cases::template_catalog::TemplateCatalog;
use crate::domain::error::{AppError, Result};
use crate::domain::template::NewTemplate;
use figment::providers::{Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

const BUNDLED_SEEDS: &str = include_str!("../../../resources/catalog/seed_templates.toml");

/// A seed query written with representative literal values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedTemplate {
    pub description: String,
    pub sql: String,
}

#[derive(Debug, Deserialize)]
struct SeedFile {
    #[serde(default)]
    templates: Vec<SeedTemplate>,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct SeedReport {
    pub inserted: usize,
    pub already_present: usize,
    pub rejected: usize,
}

pub fn bundled_seeds() -> Result<Vec<SeedTemplate>> {
    parse_seeds(BUNDLED_SEEDS)
}

pub fn parse_seeds(toml: &str) -> Result<Vec<SeedTemplate>> {
    let file: SeedFile = Figment::from(Toml::string(toml)).extract()?;
    Ok(file.templates)
}

pub struct CatalogSeeder {
    catalog: Arc<TemplateCatalog>,
    embedder: Arc<dyn Embedder>,
    validator: Arc<SafetyValidator>,
    normalizer: SqlNormalizer,
}

impl CatalogSeeder {
    pub fn new(
        catalog: Arc<TemplateCatalog>,
        embedder: Arc<dyn Embedder>,
        validator: Arc<SafetyValidator>,
    ) -> Self {
        Self {
            catalog,
            embedder,
            validator,
            normalizer: SqlNormalizer::new(),
        }
    }

    /// Inserts every seed whose fingerprint is not yet catalogued. Seeds that
    /// fail normalization or validation are skipped with a warning.
    pub async fn seed(&self, seeds: &[SeedTemplate]) -> Result<SeedReport> {
        let mut report = SeedReport::default();

        for seed in seeds {
            let normalized = match self.normalizer.normalize(&seed.sql) {
                Ok(n) => n,
                Err(e) => {
                    warn!("Seed '{}' does not normalize: {}", seed.description, e);
                    report.rejected += 1;
                    continue;
                }
            };

            if self.catalog.find_by_fingerprint(&normalized.fingerprint).is_some() {
                report.already_present += 1;
                continue;
            }

            let verdict = self.validator.validate(&seed.sql);
            if !verdict.passed() {
                warn!("Seed '{}' rejected: {}", seed.description, verdict.describe());
                report.rejected += 1;
                continue;
            }

            let embedding = self
                .embedder
                .embed(&normalized.canonical_sql)
                .await
                .map_err(|e| AppError::Embedding(format!("seed '{}': {}", seed.description, e)))?;

            self.catalog
                .insert(NewTemplate {
                    parameter_types: normalized.parameters.slot_types(),
                    placeholder_count: normalized.placeholder_count,
                    raw_sql: normalized.raw_sql,
                    canonical_sql: normalized.canonical_sql,
                    fingerprint: normalized.fingerprint,
                    embedding,
                    description: seed.description.clone(),
                })
                .await?;
            report.inserted += 1;
        }

        info!(
            inserted = report.inserted,
            already_present = report.already_present,
            rejected = report.rejected,
            "Catalog seeding finished"
        );
        Ok(report)
    }
}
