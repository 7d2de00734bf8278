use super::http::{http_client, join_url, send_json};
use super::LLMClient;
use crate::domain::error::{AppError, Result};
use crate::domain::llm_config::LLMConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    generation_config: SamplingConfig,
}

#[derive(Serialize, Deserialize, Default)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

impl Content {
    fn text(role: Option<&str>, text: &str) -> Self {
        Self {
            role: role.map(str::to_string),
            parts: vec![Part {
                text: text.to_string(),
            }],
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SamplingConfig {
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Content,
}

/// Google Generative Language API. The key travels as a query parameter.
pub struct GeminiClient {
    client: reqwest::Client,
}

impl GeminiClient {
    pub fn new() -> Self {
        Self {
            client: http_client(Duration::from_secs(120)),
        }
    }

    fn model_id(model: &str) -> &str {
        model.trim().trim_start_matches("models/")
    }

    fn build_request(config: &LLMConfig, system: &str, user: &str) -> GenerateContentRequest {
        GenerateContentRequest {
            contents: vec![Content::text(Some("user"), user)],
            system_instruction: (!system.trim().is_empty()).then(|| Content::text(None, system)),
            generation_config: SamplingConfig {
                temperature: config.temperature.unwrap_or(0.0),
                max_output_tokens: config.max_tokens,
            },
        }
    }

    fn first_candidate_text(response: GenerateContentResponse) -> Result<String> {
        let text: String = response
            .candidates
            .into_iter()
            .next()
            .map(|c| c.content.parts.into_iter().map(|p| p.text).collect())
            .unwrap_or_default();
        if text.trim().is_empty() {
            return Err(AppError::Generation(
                "Gemini returned no candidate text".to_string(),
            ));
        }
        Ok(text)
    }
}

impl Default for GeminiClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LLMClient for GeminiClient {
    async fn generate(&self, config: &LLMConfig, system: &str, user: &str) -> Result<String> {
        let api_key = config
            .api_key
            .as_deref()
            .ok_or_else(|| AppError::Config("Missing API key for Google provider".to_string()))?;
        let url = join_url(
            &config.base_url,
            &format!("{}:generateContent", Self::model_id(&config.model)),
        );

        let request = self.client.post(&url).query(&[("key", api_key)]);
        let body = Self::build_request(config, system, user);
        let response: GenerateContentResponse =
            send_json(request, &body, AppError::Generation).await?;

        Self::first_candidate_text(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::llm_config::LLMProvider;

    #[test]
    fn test_request_puts_system_prompt_in_instruction() {
        let config = LLMConfig {
            provider: LLMProvider::Google,
            base_url: "https://generativelanguage.googleapis.com/v1beta/models".to_string(),
            model: "models/gemini-1.5-flash".to_string(),
            api_key: Some("k".to_string()),
            max_tokens: Some(256),
            temperature: None,
        };
        let request = GeminiClient::build_request(&config, "You write SQL.", "Question: x");
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["systemInstruction"]["parts"][0]["text"], "You write SQL.");
        assert!(json["systemInstruction"].get("role").is_none());
        assert_eq!(json["contents"][0]["role"], "user");
        assert_eq!(json["generationConfig"]["maxOutputTokens"], 256);
        assert_eq!(GeminiClient::model_id(&config.model), "gemini-1.5-flash");
    }

    #[test]
    fn test_blank_system_prompt_is_omitted() {
        let request = GeminiClient::build_request(&LLMConfig::default(), "  ", "Question: x");
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("systemInstruction").is_none());
    }

    #[test]
    fn test_candidate_parts_are_joined() {
        let response: GenerateContentResponse = serde_json::from_value(serde_json::json!({
            "candidates": [{"content": {"role": "model", "parts": [{"text": "SELECT "}, {"text": "1"}]}}]
        }))
        .unwrap();
        assert_eq!(GeminiClient::first_candidate_text(response).unwrap(), "SELECT 1");

        let empty: GenerateContentResponse =
            serde_json::from_value(serde_json::json!({"candidates": []})).unwrap();
        assert!(GeminiClient::first_candidate_text(empty).is_err());
    }
}
