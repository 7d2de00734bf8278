use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::error;
use tracing_subscriber::EnvFilter;

use sqlnav_lib::app::{build_embedder, open_catalog, seed_catalog, App};
use sqlnav_lib::application::use_cases::safety_validator::SafetyValidator;
use sqlnav_lib::application::use_cases::sql_normalizer::SqlNormalizer;
use sqlnav_lib::domain::error::{AppError, Result};
use sqlnav_lib::domain::query::QuestionRequest;
use sqlnav_lib::infrastructure::config::AppConfig;
use sqlnav_lib::infrastructure::security::keyring::KeyringManager;

#[derive(Parser, Debug)]
#[command(name = "sqlnav", version, about = "Answer questions over a read-only SQL database")]
struct Cli {
    /// Configuration file; defaults to $SQLNAV_CONFIG or ./sqlnav.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Answer a natural-language question
    Ask {
        question: String,
        /// Only use the template path; never execute generated SQL
        #[arg(long)]
        no_fallback: bool,
    },
    /// Insert the bundled seed templates that are not yet catalogued
    Seed,
    /// Print catalog statistics
    Stats {
        #[arg(long, default_value_t = 10)]
        top: usize,
    },
    /// Run the safety validator over a statement
    Validate { sql: String },
    /// Print the canonical form, placeholders and fingerprint of a statement
    Normalize { sql: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("sqlnav: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match run(cli.command, config).await {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            eprintln!("sqlnav: {}", e.user_message());
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    match path {
        Some(path) => AppConfig::load_from(path),
        None => AppConfig::load(),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| AppError::Internal(format!("Failed to render output: {}", e)))?;
    println!("{}", text);
    Ok(())
}

fn exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

async fn run(command: Command, mut config: AppConfig) -> Result<ExitCode> {
    match command {
        Command::Ask {
            question,
            no_fallback,
        } => {
            let app = App::start(config).await?;
            let mut request = QuestionRequest::new(question);
            if no_fallback {
                request = request.fast_path_only();
            }
            let response = app.pipeline().ask(request).await;
            app.shutdown().await;
            print_json(&response)?;
            Ok(exit_code(response.success))
        }
        Command::Seed => {
            config.resolve_secrets(&KeyringManager::default())?;
            let handle = open_catalog(&config).await?;
            let report = seed_catalog(&config, handle.catalog, build_embedder(&config)).await?;
            print_json(&report)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Stats { top } => {
            let handle = open_catalog(&config).await?;
            print_json(&handle.catalog.stats(top))?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Validate { sql } => {
            let verdict = SafetyValidator::new(config.safety).validate(&sql);
            print_json(&verdict)?;
            Ok(exit_code(verdict.passed()))
        }
        Command::Normalize { sql } => {
            let normalizer = SqlNormalizer::new();
            let normalized = normalizer.normalize(&sql)?;
            print_json(&serde_json::json!({
                "canonical_sql": normalized.canonical_sql,
                "raw_sql": normalized.raw_sql,
                "parameters": normalized.parameters,
                "placeholder_count": normalized.placeholder_count,
                "fingerprint": normalized.fingerprint,
                "tables": normalizer.extract_table_references(&sql)?,
                "complexity": normalizer.complexity_score(&sql)?,
            }))?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
