pub mod gemini;
pub mod http;
pub mod openai;

use crate::domain::error::Result;
use crate::domain::llm_config::LLMConfig;
use crate::domain::llm_config::LLMProvider;
use async_trait::async_trait;
use gemini::GeminiClient;
use openai::OpenAICompatibleClient;

/// Single-turn chat completion against a configured provider.
#[async_trait]
pub trait LLMClient: Send + Sync {
    async fn generate(&self, config: &LLMConfig, system: &str, user: &str) -> Result<String>;
}

/// Dispatches on `config.provider`. Everything except Google speaks the
/// OpenAI chat-completions dialect.
pub struct RouterClient {
    openai: OpenAICompatibleClient,
    gemini: GeminiClient,
}

impl RouterClient {
    pub fn new() -> Self {
        Self {
            openai: OpenAICompatibleClient::new(),
            gemini: GeminiClient::new(),
        }
    }
}

impl Default for RouterClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LLMClient for RouterClient {
    async fn generate(&self, config: &LLMConfig, system: &str, user: &str) -> Result<String> {
        match config.provider {
            LLMProvider::Google => self.gemini.generate(config, system, user).await,
            _ => self.openai.generate(config, system, user).await,
        }
    }
}
