use crate::domain::error::{AppError, Result};
use crate::domain::llm_config::{LLMConfig, LLMProvider};
use crate::infrastructure::llm_clients::http::{http_client, join_url, send_json};
use async_trait::async_trait;
#[cfg(feature = "local-embeddings")]
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
#[cfg(feature = "local-embeddings")]
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Turns canonical SQL text into a vector. Implementations must be
/// deterministic for identical input within one process.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

#[derive(Serialize)]
struct OpenAIEmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct OpenAIEmbeddingResponse {
    #[serde(default)]
    data: Vec<OpenAIEmbedding>,
}

#[derive(Deserialize)]
struct OpenAIEmbedding {
    embedding: Vec<f32>,
}

#[derive(Serialize)]
struct GeminiEmbedRequest<'a> {
    content: GeminiEmbedContent<'a>,
}

#[derive(Serialize)]
struct GeminiEmbedContent<'a> {
    parts: [GeminiEmbedPart<'a>; 1],
}

#[derive(Serialize)]
struct GeminiEmbedPart<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct GeminiEmbedResponse {
    embedding: GeminiValues,
}

#[derive(Deserialize)]
struct GeminiValues {
    values: Vec<f32>,
}

#[derive(Serialize)]
struct OllamaEmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct OllamaEmbeddingResponse {
    embedding: Vec<f32>,
}

/// Embeds text through the configured provider. `Local` runs an in-process
/// model and needs the `local-embeddings` feature.
pub struct EmbeddingService {
    client: Client,
    config: LLMConfig,
    /// Expected vector length; responses of any other length are rejected.
    dimension: Option<usize>,
    #[cfg(feature = "local-embeddings")]
    local_model: Mutex<Option<TextEmbedding>>,
}

impl EmbeddingService {
    pub fn new(config: LLMConfig, dimension: Option<usize>) -> Self {
        Self {
            client: http_client(Duration::from_secs(60)),
            config,
            dimension,
            #[cfg(feature = "local-embeddings")]
            local_model: Mutex::new(None),
        }
    }

    pub async fn generate_embedding(&self, text: &str) -> Result<Vec<f32>> {
        let text = text.trim();
        if text.is_empty() {
            return Err(AppError::Embedding("Nothing to embed".to_string()));
        }

        let embedding = match self.config.provider {
            LLMProvider::Local => self.embed_locally(text)?,
            LLMProvider::OpenAI | LLMProvider::OpenRouter => self.embed_openai(text).await?,
            LLMProvider::Google => self.embed_gemini(text).await?,
            LLMProvider::Ollama => self.embed_ollama(text).await?,
        };

        self.check_dimension(embedding)
    }

    fn check_dimension(&self, embedding: Vec<f32>) -> Result<Vec<f32>> {
        if embedding.is_empty() {
            return Err(AppError::Embedding("Provider returned an empty vector".to_string()));
        }
        match self.dimension {
            Some(expected) if embedding.len() != expected => Err(AppError::Embedding(format!(
                "Embedding model returned {} dimensions, expected {}",
                embedding.len(),
                expected
            ))),
            _ => Ok(embedding),
        }
    }

    async fn embed_openai(&self, text: &str) -> Result<Vec<f32>> {
        let mut request = self
            .client
            .post(join_url(&self.config.base_url, "embeddings"));
        if let Some(key) = self.config.api_key.as_deref() {
            request = request.bearer_auth(key);
        }
        let body = OpenAIEmbeddingRequest {
            model: &self.config.model,
            input: text,
        };
        let response: OpenAIEmbeddingResponse =
            send_json(request, &body, AppError::Embedding).await?;

        response
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| AppError::Embedding("No embedding data in response".to_string()))
    }

    async fn embed_gemini(&self, text: &str) -> Result<Vec<f32>> {
        let key = self
            .config
            .api_key
            .as_deref()
            .ok_or_else(|| AppError::Config("Missing API key for Google provider".to_string()))?;
        let request = self
            .client
            .post(gemini_embed_url(&self.config.base_url, &self.config.model))
            .query(&[("key", key)]);
        let body = GeminiEmbedRequest {
            content: GeminiEmbedContent {
                parts: [GeminiEmbedPart { text }],
            },
        };
        let response: GeminiEmbedResponse = send_json(request, &body, AppError::Embedding).await?;
        Ok(response.embedding.values)
    }

    async fn embed_ollama(&self, text: &str) -> Result<Vec<f32>> {
        let request = self.client.post(ollama_embed_url(&self.config.base_url));
        let body = OllamaEmbeddingRequest {
            model: &self.config.model,
            prompt: text,
        };
        let response: OllamaEmbeddingResponse =
            send_json(request, &body, AppError::Embedding).await?;
        Ok(response.embedding)
    }

    #[cfg(feature = "local-embeddings")]
    fn embed_locally(&self, text: &str) -> Result<Vec<f32>> {
        let mut guard = self.local_model.lock();
        if guard.is_none() {
            let model = match self.config.model.trim().to_lowercase().as_str() {
                "bge-small-en-v1.5" => EmbeddingModel::BGESmallENV15,
                _ => EmbeddingModel::AllMiniLML6V2,
            };
            debug!(model = %self.config.model, "Loading local embedding model");
            let loaded = TextEmbedding::try_new(InitOptions::new(model))
                .map_err(|e| AppError::Embedding(format!("Failed to load local model: {}", e)))?;
            *guard = Some(loaded);
        }
        let model = guard
            .as_mut()
            .ok_or_else(|| AppError::Embedding("Local model unavailable".to_string()))?;
        model
            .embed(vec![text.to_string()], None)
            .map_err(|e| AppError::Embedding(format!("Local embedding failed: {}", e)))?
            .into_iter()
            .next()
            .ok_or_else(|| AppError::Embedding("Local model returned no vector".to_string()))
    }

    #[cfg(not(feature = "local-embeddings"))]
    fn embed_locally(&self, _text: &str) -> Result<Vec<f32>> {
        debug!("Local embedding requested without the local-embeddings feature");
        Err(AppError::Config(
            "Local embeddings require the `local-embeddings` feature".to_string(),
        ))
    }

    /// Little-endian f32 encoding used for the catalog's embedding column.
    pub fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
        embedding.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    pub fn bytes_to_embedding(bytes: &[u8]) -> Result<Vec<f32>> {
        if bytes.len() % 4 != 0 {
            return Err(AppError::Embedding(format!(
                "Stored embedding has {} bytes, not a multiple of 4",
                bytes.len()
            )));
        }
        Ok(bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect())
    }
}

/// Gemini wants `{base}/models/{model}:embedContent`; chat model names fall
/// back to the default embedding model.
fn gemini_embed_url(base_url: &str, model: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let base = base.strip_suffix("/models").unwrap_or(base);
    let model = model.trim().trim_start_matches("models/");
    let model = if model.contains("embedding") {
        model
    } else {
        "text-embedding-004"
    };
    format!("{}/models/{}:embedContent", base, model)
}

/// Ollama's native endpoint lives beside, not under, its OpenAI-style `/v1`.
fn ollama_embed_url(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let base = base.strip_suffix("/v1").unwrap_or(base);
    join_url(base, "api/embeddings")
}

#[async_trait]
impl Embedder for EmbeddingService {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.generate_embedding(text).await
    }
}
