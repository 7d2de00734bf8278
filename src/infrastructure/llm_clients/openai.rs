use super::http::{http_client, join_url, send_json};
use super::LLMClient;
use crate::domain::error::{AppError, Result};
use crate::domain::llm_config::{LLMConfig, LLMProvider};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

/// Client for OpenAI, OpenRouter, Ollama and local servers exposing
/// `/chat/completions`.
pub struct OpenAICompatibleClient {
    client: reqwest::Client,
}

impl OpenAICompatibleClient {
    pub fn new() -> Self {
        Self {
            client: http_client(Duration::from_secs(120)),
        }
    }

    /// Hosted providers need a key; local servers accept anonymous calls.
    fn api_key(config: &LLMConfig) -> Result<Option<&str>> {
        match (config.api_key.as_deref(), config.provider) {
            (Some(key), _) if !key.trim().is_empty() => Ok(Some(key)),
            (_, LLMProvider::OpenAI | LLMProvider::OpenRouter) => Err(AppError::Config(format!(
                "Missing API key for {:?}",
                config.provider
            ))),
            _ => Ok(None),
        }
    }

    fn build_request<'a>(config: &'a LLMConfig, system: &'a str, user: &'a str) -> ChatRequest<'a> {
        ChatRequest {
            model: &config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        }
    }

    fn first_choice(response: ChatResponse) -> Result<String> {
        response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| AppError::Generation("Completion carried no message content".to_string()))
    }
}

impl Default for OpenAICompatibleClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LLMClient for OpenAICompatibleClient {
    async fn generate(&self, config: &LLMConfig, system: &str, user: &str) -> Result<String> {
        let api_key = Self::api_key(config)?;
        let url = join_url(&config.base_url, "chat/completions");

        let mut request = self.client.post(&url);
        if let Some(key) = api_key {
            request = request.bearer_auth(key);
        }
        let body = Self::build_request(config, system, user);
        let response: ChatResponse = send_json(request, &body, AppError::Generation).await?;

        Self::first_choice(response)
    }
}
