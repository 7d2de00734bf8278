use crate::domain::error::{AppError, Result};
use crate::domain::llm_config::LLMConfig;
use crate::domain::prompt::GenerationPrompt;
use crate::domain::query::{GenerationOutput, SqlDraft};
use crate::infrastructure::llm_clients::LLMClient;
use crate::infrastructure::response::clean_generated_sql;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

/// Untrusted text producer. Whatever comes back still has to pass the
/// normalizer and the safety validator.
#[async_trait]
pub trait SqlGenerator: Send + Sync {
    async fn generate(&self, prompt: &GenerationPrompt) -> Result<GenerationOutput>;
}

#[derive(Debug, Deserialize)]
struct ToolChoicePayload {
    template_id: i64,
    #[serde(default, alias = "arguments")]
    parameters: Vec<serde_json::Value>,
}

pub struct LlmSqlGenerator {
    llm_client: Arc<dyn LLMClient>,
    config: LLMConfig,
}

impl LlmSqlGenerator {
    pub fn new(llm_client: Arc<dyn LLMClient>, config: LLMConfig) -> Self {
        Self { llm_client, config }
    }

    /// Free-form completion used for answer summaries.
    pub async fn complete(&self, system: &str, user: &str) -> Result<String> {
        self.llm_client.generate(&self.config, system, user).await
    }
}

#[async_trait]
impl SqlGenerator for LlmSqlGenerator {
    async fn generate(&self, prompt: &GenerationPrompt) -> Result<GenerationOutput> {
        let raw = self
            .llm_client
            .generate(&self.config, &prompt.system, &prompt.render_user())
            .await?;
        let output = parse_generation_output(&raw)?;
        debug!(
            tool_choice = matches!(output, GenerationOutput::TemplateChoice { .. }),
            "Generator replied"
        );
        Ok(output)
    }
}

/// Reads a reply as either a template choice (`{"template_id": n, "parameters": [...]}`)
/// or a SQL draft.
pub fn parse_generation_output(raw: &str) -> Result<GenerationOutput> {
    let body = clean_generated_sql(raw);
    if body.is_empty() {
        return Err(AppError::Generation("empty reply".to_string()));
    }

    if body.starts_with('{') {
        if let Ok(choice) = serde_json::from_str::<ToolChoicePayload>(&body) {
            return Ok(GenerationOutput::TemplateChoice {
                template_id: choice.template_id,
                arguments: choice.parameters,
            });
        }
    }

    Ok(GenerationOutput::Sql(SqlDraft::new(body)))
}
