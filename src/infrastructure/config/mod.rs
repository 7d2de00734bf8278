//! Layered configuration
//!
//! Built-in defaults, then an optional `sqlnav.toml` (or the file named by
//! `SQLNAV_CONFIG`), then `SQLNAV_*` environment variables with `__` as the
//! section separator, e.g. `SQLNAV_REPAIR__MAX_REPAIRS=2`.

use crate::application::use_cases::candidate_ranker::MatchingConfig;
use crate::application::use_cases::execution_gate::ExecutionConfig;
use crate::application::use_cases::growth_monitor::GrowthConfig;
use crate::application::use_cases::ivf_index::IvfConfig;
use crate::application::use_cases::query_pipeline::{PipelineConfig, PipelineSettings};
use crate::application::use_cases::safety_validator::SafetyRules;
use crate::application::use_cases::self_repair::RepairConfig;
use crate::domain::error::{AppError, Result};
use crate::domain::llm_config::{LLMConfig, LLMProvider};
use crate::infrastructure::security::keyring::KeyringManager;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const CONFIG_PATH_ENV: &str = "SQLNAV_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "sqlnav.toml";
const ENV_PREFIX: &str = "SQLNAV_";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    pub db_path: PathBuf,
    pub nlist: usize,
    pub nprobe: usize,
    pub kmeans_iterations: usize,
    /// Insert the bundled seed templates that are not yet catalogued.
    pub seed_on_start: bool,
}

impl CatalogConfig {
    pub fn index(&self) -> IvfConfig {
        IvfConfig {
            nlist: self.nlist,
            nprobe: self.nprobe,
            kmeans_iterations: self.kmeans_iterations,
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        let index = IvfConfig::default();
        Self {
            db_path: PathBuf::from("sqlnav-catalog.db"),
            nlist: index.nlist,
            nprobe: index.nprobe,
            kmeans_iterations: index.kmeans_iterations,
            seed_on_start: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(flatten)]
    pub llm: LLMConfig,
    /// Expected vector length. Vectors of any other length are rejected.
    pub dimension: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            llm: LLMConfig::embedding_default(),
            dimension: 1536,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub log_level: String,
    pub catalog: CatalogConfig,
    pub matching: MatchingConfig,
    pub safety: SafetyRules,
    pub execution: ExecutionConfig,
    pub repair: RepairConfig,
    pub growth: GrowthConfig,
    pub generation: LLMConfig,
    pub embedding: EmbeddingConfig,
    pub pipeline: PipelineConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            catalog: CatalogConfig::default(),
            matching: MatchingConfig::default(),
            safety: SafetyRules::default(),
            execution: ExecutionConfig::default(),
            repair: RepairConfig::default(),
            growth: GrowthConfig::default(),
            generation: LLMConfig::generation_default(),
            embedding: EmbeddingConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl AppConfig {
    /// Loads `.env`, then every configuration layer.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        let path = std::env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE));
        Self::load_from(&path)
    }

    /// A missing file is not an error; its layer is simply empty.
    pub fn load_from(path: &Path) -> Result<Self> {
        let config: AppConfig = Self::figment(path).extract()?;
        config.check()?;
        debug!(
            "Loaded configuration (file: {}, catalog: {})",
            path.display(),
            config.catalog.db_path.display()
        );
        Ok(config)
    }

    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    fn check(&self) -> Result<()> {
        if self.catalog.nlist == 0 || self.catalog.nprobe == 0 {
            return Err(AppError::Config(
                "catalog.nlist and catalog.nprobe must be at least 1".to_string(),
            ));
        }
        if self.growth.promotion_threshold == 0 || self.growth.channel_capacity == 0 {
            return Err(AppError::Config(
                "growth.promotion_threshold and growth.channel_capacity must be at least 1"
                    .to_string(),
            ));
        }
        if self.execution.max_rows == 0 {
            return Err(AppError::Config(
                "execution.max_rows must be at least 1".to_string(),
            ));
        }
        if self.embedding.dimension == 0 {
            return Err(AppError::Config(
                "embedding.dimension must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Replaces API key references with the secrets they point at.
    /// Local providers may run without a key, so an unresolvable reference
    /// there is dropped instead of failing.
    pub fn resolve_secrets(&mut self, keyring: &KeyringManager) -> Result<()> {
        resolve_api_key(&mut self.generation, keyring)?;
        resolve_api_key(&mut self.embedding.llm, keyring)
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            matching: self.matching.clone(),
            safety: self.safety.clone(),
            execution: self.execution.clone(),
            repair: self.repair.clone(),
            pipeline: self.pipeline.clone(),
        }
    }
}

fn resolve_api_key(config: &mut LLMConfig, keyring: &KeyringManager) -> Result<()> {
    let Some(reference) = config.api_key.take() else {
        return Ok(());
    };
    match keyring.resolve(&reference) {
        Ok(secret) => {
            config.api_key = Some(secret);
            Ok(())
        }
        Err(_) if matches!(config.provider, LLMProvider::Local | LLMProvider::Ollama) => Ok(()),
        Err(e) => Err(e),
    }
}
