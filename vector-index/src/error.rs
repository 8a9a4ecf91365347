//! Error types for the vector index.

use thiserror::Error;

/// Result type alias for index operations.
pub type Result<T> = std::result::Result<T, IndexError>;

/// Errors that can occur in the vector index.
#[derive(Error, Debug)]
pub enum IndexError {
    /// Vector has the wrong number of components.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Arguments do not line up (e.g. vectors vs. metadata).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Invalid index configuration.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Persisted index failed validation.
    #[error("index corruption: {0}")]
    Corruption(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
