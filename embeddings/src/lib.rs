//! # Embeddings
//!
//! This crate provides the model-facing half of ragcore: embedding
//! generation, chat generation, and the caches that sit in front of them.
//!
//! ## Features
//!
//! - **Embedding Generation**: Convert text to dense vectors using AI models
//! - **Chat Generation**: One-shot and streamed completions
//! - **Multiple Providers**: OpenAI-compatible APIs and an offline hashing model
//! - **Caching**: TTL + LRU cache shared by embeddings and search results
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Embeddings System                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  EmbeddingProvider ──► CachedEmbedder ──► Cache<Embedding>     │
//! │       │                                                         │
//! │       ▼                                                         │
//! │  OpenAI/Hashing       GenerationProvider ──► TokenStream       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod cache;
pub mod chat;
pub mod error;
pub mod provider;
pub mod similarity;

pub use cache::{Cache, CacheStats, CachedEmbedder};
pub use chat::{
    ChatCompletion, ChatMessage, ChatRole, CompletionParams, GenerationProvider, StreamEvent,
    TokenStream, TokenUsage,
};
pub use error::{ProviderError, Result};
pub use provider::{EmbeddingProvider, HashingProvider, OpenAIProvider};
pub use similarity::{cosine_similarity, normalize, similarity_from_distance, squared_l2};

/// A dense vector embedding.
pub type Embedding = Vec<f32>;

/// Dimension of embeddings produced by the default local model.
pub const DEFAULT_DIMENSION: usize = 384;
