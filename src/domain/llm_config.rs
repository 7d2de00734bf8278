use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum LLMProvider {
    Local,
    OpenAI,
    OpenRouter,
    Google,
    Ollama,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LLMConfig {
    pub provider: LLMProvider,
    pub base_url: String,
    pub model: String,
    /// Plain key or a reference such as `env:OPENAI_API_KEY` / `keychain:openai`.
    pub api_key: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl LLMConfig {
    pub fn generation_default() -> Self {
        Self {
            provider: LLMProvider::OpenAI,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: Some("env:OPENAI_API_KEY".to_string()),
            max_tokens: Some(1024),
            temperature: Some(0.0),
        }
    }

    pub fn embedding_default() -> Self {
        Self {
            provider: LLMProvider::OpenAI,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "text-embedding-3-small".to_string(),
            api_key: Some("env:OPENAI_API_KEY".to_string()),
            max_tokens: None,
            temperature: None,
        }
    }
}

impl Default for LLMConfig {
    fn default() -> Self {
        Self {
            provider: LLMProvider::Local,
            base_url: "http://localhost:1234/v1".to_string(),
            model: "local-model".to_string(),
            api_key: None,
            max_tokens: Some(1024),
            temperature: Some(0.0),
        }
    }
}
