use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::application::use_cases::answer_writer::{AnswerWriter, Summarizer};
use crate::application::use_cases::catalog_seeder::{bundled_seeds, CatalogSeeder, SeedReport};
use crate::application::use_cases::embedding_service::{Embedder, EmbeddingService};
use crate::application::use_cases::growth_monitor::{GrowthMonitor, GrowthWorker};
use crate::application::use_cases::safety_validator::SafetyValidator;
use crate::application::use_cases::sql_generator::LlmSqlGenerator;
use crate::application::use_cases::template_catalog::TemplateCatalog;
use crate::application::{PipelineDeps, QueryPipeline};
use crate::domain::error::Result;
use crate::infrastructure::config::AppConfig;
use crate::infrastructure::db::catalog::CatalogRepository;
use crate::infrastructure::db::pg_executor::PgExecutor;
use crate::infrastructure::llm_clients::{LLMClient, RouterClient};
use crate::infrastructure::security::keyring::{KeyringManager, KEYCHAIN_SERVICE};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// The persisted store and the in-memory catalog built from it.
pub struct CatalogHandle {
    pub store: Arc<CatalogRepository>,
    pub catalog: Arc<TemplateCatalog>,
}

pub async fn open_catalog(config: &AppConfig) -> Result<CatalogHandle> {
    let store = Arc::new(CatalogRepository::connect(&config.catalog.db_path).await?);
    let catalog =
        Arc::new(TemplateCatalog::load(config.catalog.index(), Arc::clone(&store)).await?);
    Ok(CatalogHandle { store, catalog })
}

pub fn build_embedder(config: &AppConfig) -> Arc<dyn Embedder> {
    Arc::new(EmbeddingService::new(
        config.embedding.llm.clone(),
        Some(config.embedding.dimension),
    ))
}

pub async fn seed_catalog(
    config: &AppConfig,
    catalog: Arc<TemplateCatalog>,
    embedder: Arc<dyn Embedder>,
) -> Result<SeedReport> {
    let validator = Arc::new(SafetyValidator::new(config.safety.clone()));
    CatalogSeeder::new(catalog, embedder, validator)
        .seed(&bundled_seeds()?)
        .await
}

/// A running pipeline plus the background growth worker.
pub struct App {
    pipeline: QueryPipeline,
    catalog: Arc<TemplateCatalog>,
    growth_task: JoinHandle<()>,
}

impl App {
    pub async fn start(mut config: AppConfig) -> Result<Self> {
        let keyring = KeyringManager::new(KEYCHAIN_SERVICE);
        config.resolve_secrets(&keyring)?;

        let CatalogHandle { store, catalog } = open_catalog(&config).await?;
        let embedder = build_embedder(&config);

        if config.catalog.seed_on_start {
            if let Err(e) = seed_catalog(&config, Arc::clone(&catalog), Arc::clone(&embedder)).await
            {
                warn!("Catalog seeding skipped: {}", e);
            }
        }

        let llm_client: Arc<dyn LLMClient> = Arc::new(RouterClient::new());
        let generator = Arc::new(LlmSqlGenerator::new(llm_client, config.generation.clone()));
        let executor = Arc::new(PgExecutor::connect_lazy(&config.execution, &keyring)?);

        // The worker restores its occurrence window before reading the channel.
        let worker = GrowthWorker::new(
            Arc::clone(&catalog),
            Arc::clone(&embedder),
            Some(Arc::clone(&store)),
            config.growth.clone(),
        );
        let (growth, growth_task) = GrowthMonitor::spawn(worker);

        let answers = if config.pipeline.explain_results {
            let summarizer: Arc<dyn Summarizer> = generator.clone();
            AnswerWriter::new(
                Some(summarizer),
                Duration::from_millis(config.repair.generation_timeout_ms),
            )
        } else {
            AnswerWriter::deterministic()
        };

        let pipeline = QueryPipeline::new(
            PipelineDeps {
                catalog: Arc::clone(&catalog),
                embedder,
                generator,
                executor,
                growth: Some(growth),
                answers,
            },
            config.pipeline_settings(),
        );

        info!(templates = catalog.len(), "sqlnav pipeline ready");
        Ok(Self {
            pipeline,
            catalog,
            growth_task,
        })
    }

    pub fn pipeline(&self) -> &QueryPipeline {
        &self.pipeline
    }

    pub fn catalog(&self) -> &Arc<TemplateCatalog> {
        &self.catalog
    }

    /// Drops the request side so the growth worker drains its queue and exits.
    pub async fn shutdown(self) {
        let Self {
            pipeline,
            growth_task,
            ..
        } = self;
        drop(pipeline);
        match tokio::time::timeout(SHUTDOWN_GRACE, growth_task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Growth worker ended abnormally: {}", e),
            Err(_) => warn!("Growth worker still busy at shutdown"),
        }
    }
}
