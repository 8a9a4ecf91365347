//! Error types for the retrieval layer.

use ragcore_documents::DocumentError;
use ragcore_vector_index::IndexError;
use thiserror::Error;

/// Result type alias for retrieval operations.
pub type Result<T> = std::result::Result<T, RagError>;

/// Errors that can occur in the retrieval layer.
#[derive(Error, Debug)]
pub enum RagError {
    /// Input rejected before any work was done.
    #[error("validation error: {0}")]
    Validation(String),

    /// A required backend or provider is not available.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A bounded resource is at capacity.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Persisted index artifacts failed validation.
    #[error("index corruption: {0}")]
    IndexCorruption(String),

    /// The generation service failed.
    #[error("generation error: {0}")]
    Generation(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Record store error.
    #[error("store error: {0}")]
    Store(String),

    /// Embedding or generation provider error.
    #[error("provider error: {0}")]
    Provider(#[from] ragcore_embeddings::ProviderError),

    /// Document processing error.
    #[error("document error: {0}")]
    Document(DocumentError),

    /// Vector index error.
    #[error("index error: {0}")]
    Index(IndexError),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration file could not be parsed.
    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

impl From<DocumentError> for RagError {
    fn from(err: DocumentError) -> Self {
        match err {
            DocumentError::InvalidConfig(_) => Self::Validation(err.to_string()),
            other => Self::Document(other),
        }
    }
}

impl From<IndexError> for RagError {
    fn from(err: IndexError) -> Self {
        match err {
            IndexError::Corruption(msg) => Self::IndexCorruption(msg),
            IndexError::InvalidConfig(_) => Self::Validation(err.to_string()),
            other => Self::Index(other),
        }
    }
}

impl RagError {
    /// Short machine-readable name of the error category.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::BackendUnavailable(_) => "backend_unavailable",
            Self::ResourceExhausted(_) => "resource_exhausted",
            Self::IndexCorruption(_) => "index_corruption",
            Self::Generation(_) => "generation",
            Self::Config(_) | Self::ConfigParse(_) => "config",
            Self::Store(_) => "store",
            Self::Provider(_) => "provider",
            Self::Document(_) => "document",
            Self::Index(_) => "index",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
        }
    }
}
