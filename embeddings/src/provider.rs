//! Embedding providers.
//!
//! Supports an OpenAI-compatible HTTP provider and an offline hashing model.
//! Every provider declares its capabilities explicitly; callers check
//! [`EmbeddingProvider::supports_embeddings`] instead of probing.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use crate::Embedding;
use crate::error::{ProviderError, Result};
use crate::similarity::normalize;

/// Trait for embedding providers.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Get the name of this provider.
    fn name(&self) -> &str;

    /// Model identifier recorded with every stored vector.
    fn model(&self) -> &str;

    /// Dimension of the vectors this provider returns.
    fn dimension(&self) -> usize;

    /// Whether this provider can produce embeddings at all.
    fn supports_embeddings(&self) -> bool;

    /// Generate one embedding per input text, in order.
    async fn generate_embeddings(&self, texts: &[String]) -> Result<Vec<Embedding>>;
}

/// OpenAI-compatible provider for embeddings and chat completions.
pub struct OpenAIProvider {
    /// API key.
    pub(crate) api_key: Option<String>,

    /// API base URL.
    pub(crate) base_url: String,

    /// HTTP client.
    pub(crate) client: reqwest::Client,

    /// Embedding model.
    pub(crate) embedding_model: String,

    /// Requested embedding dimension.
    pub(crate) dimension: usize,

    /// Default chat model.
    pub(crate) chat_model: String,

    /// Maximum texts per embeddings request.
    pub(crate) batch_size: usize,
}

impl OpenAIProvider {
    /// Create a new provider reading `OPENAI_API_KEY` from the environment.
    pub fn new() -> Self {
        Self {
            api_key: std::env::var("OPENAI_API_KEY").ok(),
            base_url: "https://api.openai.com/v1".to_string(),
            client: reqwest::Client::new(),
            embedding_model: "text-embedding-3-small".to_string(),
            dimension: 1536,
            chat_model: "gpt-4o-mini".to_string(),
            batch_size: 64,
        }
    }

    /// Set the API key.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Set the base URL.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Set the embedding model and the dimension it should return.
    pub fn with_embedding_model(mut self, model: impl Into<String>, dimension: usize) -> Self {
        self.embedding_model = model.into();
        self.dimension = dimension;
        self
    }

    /// Set the default chat model.
    pub fn with_chat_model(mut self, model: impl Into<String>) -> Self {
        self.chat_model = model.into();
        self
    }

    /// Set the maximum number of texts per embeddings request.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Check if the provider has credentials.
    pub fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    pub(crate) fn api_key(&self) -> Result<&str> {
        self.api_key
            .as_deref()
            .ok_or_else(|| ProviderError::NotConfigured("OPENAI_API_KEY is not set".to_string()))
    }

    /// Turn a non-success response into a provider error.
    pub(crate) async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok())
                .unwrap_or(60);

            return Err(ProviderError::RateLimited {
                retry_after_secs: retry_after,
            });
        }

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(ProviderError::ApiRequest(format!(
                "API error ({status}): {error_text}"
            )));
        }

        Ok(response)
    }

    async fn embed_chunk(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        let api_key = self.api_key()?;

        debug!(
            "Generating batch embeddings for {} texts with model: {}",
            texts.len(),
            self.embedding_model
        );

        let body = serde_json::json!({
            "input": texts,
            "model": self.embedding_model,
            "dimensions": self.dimension,
        });

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .header("Authorization", format!("Bearer {api_key}"))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let response = Self::check_status(response).await?;
        let mut result: OpenAIEmbeddingResponse = response.json().await?;

        if result.data.len() != texts.len() {
            return Err(ProviderError::InvalidResponse(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                result.data.len()
            )));
        }

        result.data.sort_by_key(|item| item.index);
        Ok(result.data.into_iter().map(|item| item.embedding).collect())
    }
}

impl Default for OpenAIProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.embedding_model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn supports_embeddings(&self) -> bool {
        true
    }

    async fn generate_embeddings(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut embeddings = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(self.batch_size) {
            embeddings.extend(self.embed_chunk(chunk).await?);
        }

        info!("Generated {} embeddings", embeddings.len());
        Ok(embeddings)
    }
}

/// OpenAI API response format.
#[derive(Debug, Deserialize)]
struct OpenAIEmbeddingResponse {
    data: Vec<OpenAIEmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct OpenAIEmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

/// Offline embedding model based on feature hashing.
///
/// Lower-cased word tokens are hashed into `dimension` buckets and the
/// resulting count vector is L2-normalized. Texts sharing vocabulary land
/// close together; the output is deterministic across runs and platforms.
#[derive(Debug, Clone)]
pub struct HashingProvider {
    dimension: usize,
    model: String,
}

impl HashingProvider {
    /// Create a hashing model with the given output dimension.
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
            model: format!("hashing-{dimension}"),
        }
    }

    fn bucket(&self, token: &str) -> usize {
        // FNV-1a
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in token.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        (hash % self.dimension as u64) as usize
    }

    /// Embed one text synchronously.
    pub fn embed_text(&self, text: &str) -> Embedding {
        let mut vector = vec![0.0f32; self.dimension];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let token = token.to_lowercase();
            vector[self.bucket(&token)] += 1.0;
        }
        normalize(&mut vector);
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashingProvider {
    fn name(&self) -> &str {
        "hashing"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn supports_embeddings(&self) -> bool {
        true
    }

    async fn generate_embeddings(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        Ok(texts.iter().map(|text| self.embed_text(text)).collect())
    }
}
