//! Error types for document processing.

use thiserror::Error;

/// Result type alias for document operations.
pub type Result<T> = std::result::Result<T, DocumentError>;

/// Errors that can occur while preparing documents.
#[derive(Error, Debug)]
pub enum DocumentError {
    /// Chunking configuration is inconsistent.
    #[error("invalid chunking config: {0}")]
    InvalidConfig(String),

    /// Unknown document type name.
    #[error("unknown document type: {0}")]
    UnknownType(String),

    /// A built-in pattern failed to compile.
    #[error("pattern error: {0}")]
    Pattern(#[from] regex_lite::Error),
}
