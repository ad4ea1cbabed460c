//! Text embeddings for the vector index.
//!
//! - [`MockEmbedder`]: deterministic feature-hashed embeddings for tests and offline use
//! - [`OpenAiEmbedder`]: OpenAI-compatible `/embeddings` endpoint

use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::with_retry;
use crate::error::{LlmError, Result};
use crate::openai::OpenAiConfig;

// ─────────────────────────────────────────────────────────────────────────────
// Embedder Trait
// ─────────────────────────────────────────────────────────────────────────────

/// Turns text into fixed-length vectors for similarity search.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embeds one text at a time unless overridden.
    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed(text).await?);
        }
        Ok(results)
    }

    /// Length of every vector this embedder returns.
    fn dimensions(&self) -> usize;

    fn name(&self) -> &str;
}

pub type SharedEmbedder = Arc<dyn Embedder>;

// ─────────────────────────────────────────────────────────────────────────────
// Mock Embedder
// ─────────────────────────────────────────────────────────────────────────────

/// Deterministic bag-of-words embedder.
///
/// Each lowercase word is hashed into a bucket, so texts sharing vocabulary
/// land near each other. Output is unit length unless the text has no words.
#[derive(Debug, Clone)]
pub struct MockEmbedder {
    dimensions: usize,
}

impl MockEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }
}

impl Default for MockEmbedder {
    fn default() -> Self {
        Self::new(384)
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut embedding = vec![0.0f32; self.dimensions];

        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let hash = simple_hash(&word.to_lowercase());
            let bucket = (hash % self.dimensions as u64) as usize;
            let sign = if (hash >> 32) & 1 == 0 { 1.0 } else { -1.0 };
            embedding[bucket] += sign;
        }

        let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut embedding {
                *x /= norm;
            }
        }

        Ok(embedding)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// djb2 with a final avalanche so neighbouring words spread across buckets.
fn simple_hash(s: &str) -> u64 {
    let mut hash: u64 = 5381;
    for byte in s.bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(byte as u64);
    }
    hash ^= hash >> 33;
    hash = hash.wrapping_mul(0xff51_afd7_ed55_8ccd);
    hash ^= hash >> 33;
    hash
}

// ─────────────────────────────────────────────────────────────────────────────
// OpenAI Embedder
// ─────────────────────────────────────────────────────────────────────────────

const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";

/// Client for an OpenAI-compatible `/embeddings` endpoint.
///
/// Shares [`OpenAiConfig`] with the chat backend; `config.model` names the
/// embedding model.
pub struct OpenAiEmbedder {
    client: Client,
    config: OpenAiConfig,
    model: String,
    /// Sent as `dimensions` only when explicitly requested.
    requested_dimensions: Option<usize>,
    dimensions: usize,
}

impl OpenAiEmbedder {
    pub fn new(config: OpenAiConfig, dimensions: Option<usize>) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout.min(Duration::from_secs(60)))
            .build()
            .map_err(|e| LlmError::Config(format!("HTTP client: {}", e)))?;

        let model = config
            .model
            .clone()
            .unwrap_or_else(|| DEFAULT_EMBEDDING_MODEL.to_string());
        let native = if model == "text-embedding-3-large" { 3072 } else { 1536 };

        Ok(Self {
            client,
            config,
            model,
            requested_dimensions: dimensions,
            dimensions: dimensions.unwrap_or(native),
        })
    }

    async fn request(&self, body: &EmbeddingRequest<'_>) -> Result<EmbeddingResponse> {
        let mut builder = self
            .client
            .post(self.config.endpoint("embeddings"))
            .json(body);
        if let Some(key) = self.config.bearer() {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(LlmError::Backend(format!(
                "embeddings returned HTTP {}: {}",
                status,
                text.trim()
            )));
        }
        Ok(serde_json::from_str(&text)?)
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text])
            .await?
            .pop()
            .ok_or_else(|| LlmError::Backend("embeddings response was empty".to_string()))
    }

    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let body = EmbeddingRequest {
            model: &self.model,
            input: texts,
            dimensions: self.requested_dimensions,
        };
        let (this, body) = (self, &body);
        let mut response = with_retry(
            self.config.max_retries,
            self.config.retry_backoff,
            &self.config.name,
            move || async move { this.request(body).await },
        )
        .await?;

        if response.data.len() != texts.len() {
            return Err(LlmError::Backend(format!(
                "asked for {} embeddings, got {}",
                texts.len(),
                response.data.len()
            )));
        }
        response.data.sort_by_key(|item| item.index);
        Ok(response.data.into_iter().map(|item| item.embedding).collect())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn name(&self) -> &str {
        "openai"
    }
}

#[derive(Debug, serde::Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [&'a str],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Debug, serde::Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Debug, serde::Deserialize)]
struct EmbeddingItem {
    index: usize,
    embedding: Vec<f32>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Factory
// ─────────────────────────────────────────────────────────────────────────────

/// Embedder settings as read from configuration.
#[derive(Debug, Clone, Default)]
pub struct EmbedderSpec {
    /// "openai" or "mock". Empty means mock.
    pub provider: String,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub dimensions: Option<usize>,
}

pub fn build_embedder(spec: &EmbedderSpec) -> Result<SharedEmbedder> {
    match spec.provider.as_str() {
        "openai" => {
            let api_key = spec.api_key.as_deref().ok_or_else(|| {
                LlmError::Config(
                    "the openai embedding provider needs an API key \
                     (OPENAI_API_KEY or [embedding] api_key)"
                        .to_string(),
                )
            })?;
            let mut config = OpenAiConfig::openai(api_key).with_name("openai-embeddings");
            if let Some(ref model) = spec.model {
                config = config.with_model(model);
            }
            if let Some(ref base_url) = spec.base_url {
                config = config.with_base_url(base_url);
            }
            Ok(Arc::new(OpenAiEmbedder::new(config, spec.dimensions)?))
        }
        "mock" | "" => Ok(Arc::new(MockEmbedder::new(spec.dimensions.unwrap_or(384)))),
        other => Err(LlmError::Config(format!(
            "unknown embedding provider '{}', expected openai or mock",
            other
        ))),
    }
}

/// Cosine similarity between two embeddings; 0.0 on length mismatch.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let norm = |v: &[f32]| v.iter().map(|x| x * x).sum::<f32>().sqrt();
    let denom = norm(a) * norm(b);
    if denom == 0.0 {
        return 0.0;
    }
    a.iter().zip(b).map(|(x, y)| x * y).sum::<f32>() / denom
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
