//! Error types for the provider layer.

use thiserror::Error;

/// Result type alias for provider operations.
pub type Result<T> = std::result::Result<T, ProviderError>;

/// Errors that can occur while talking to an embedding or generation provider.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// Provider not configured.
    #[error("provider not configured: {0}")]
    NotConfigured(String),

    /// The provider does not offer the requested capability.
    #[error("provider {provider} does not support {capability}")]
    Unsupported {
        provider: String,
        capability: &'static str,
    },

    /// API request failed.
    #[error("API request failed: {0}")]
    ApiRequest(String),

    /// Invalid response from provider.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Rate limit exceeded.
    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Dimension mismatch.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Streaming failed mid-response.
    #[error("stream error: {0}")]
    Stream(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP error.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}
