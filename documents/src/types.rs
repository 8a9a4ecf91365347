//! Core document and chunk types.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::DocumentError;

/// Open-ended metadata attached to documents and chunks.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Kind of content, used to pick a preprocessing path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    #[default]
    Text,
    Markdown,
    Html,
    Code,
    Json,
}

impl DocumentType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Markdown => "markdown",
            Self::Html => "html",
            Self::Code => "code",
            Self::Json => "json",
        }
    }

    /// Guess the type from a file extension. Unknown extensions are text.
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();

        match ext.as_str() {
            "md" | "markdown" | "mdx" => Self::Markdown,
            "html" | "htm" | "xhtml" => Self::Html,
            "json" | "jsonl" => Self::Json,
            "rs" | "py" | "js" | "ts" | "jsx" | "tsx" | "go" | "java" | "c" | "h" | "cpp"
            | "hpp" | "cc" | "rb" | "sh" | "kt" | "swift" | "cs" => Self::Code,
            _ => Self::Text,
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentType {
    type Err = DocumentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "txt" => Ok(Self::Text),
            "markdown" | "md" => Ok(Self::Markdown),
            "html" => Ok(Self::Html),
            "code" => Ok(Self::Code),
            "json" => Ok(Self::Json),
            other => Err(DocumentError::UnknownType(other.to_string())),
        }
    }
}

/// A whole document awaiting ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub content: String,
    pub document_id: String,
    pub document_type: DocumentType,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Document {
    pub fn new(
        content: impl Into<String>,
        document_id: impl Into<String>,
        document_type: DocumentType,
    ) -> Self {
        Self {
            content: content.into(),
            document_id: document_id.into(),
            document_type,
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A chunk of a document, ready for embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChunk {
    /// The chunk text.
    pub content: String,

    /// Identifier of the source document.
    pub document_id: String,

    /// Type of the source document.
    pub document_type: DocumentType,

    /// Position of this chunk within its document.
    pub chunk_index: usize,

    /// Structural, preprocessing, and caller metadata.
    pub metadata: Metadata,

    /// SHA-256 of `content`, hex encoded.
    pub content_hash: String,

    /// Character offset of the chunk start in the preprocessed text.
    pub start_offset: Option<usize>,

    /// Character offset of the chunk end in the preprocessed text.
    pub end_offset: Option<usize>,
}

impl DocumentChunk {
    /// Create a chunk; the content hash is derived here.
    pub fn new(
        content: impl Into<String>,
        document_id: impl Into<String>,
        document_type: DocumentType,
        chunk_index: usize,
        metadata: Metadata,
    ) -> Self {
        let content = content.into();
        let content_hash = content_hash(&content);
        Self {
            content,
            document_id: document_id.into(),
            document_type,
            chunk_index,
            metadata,
            content_hash,
            start_offset: None,
            end_offset: None,
        }
    }

    /// Set the offsets.
    pub fn with_offsets(mut self, start: usize, end: usize) -> Self {
        self.start_offset = Some(start);
        self.end_offset = Some(end);
        self
    }

    /// Best human-readable label for this chunk.
    pub fn title(&self) -> &str {
        self.metadata
            .get("title")
            .and_then(|v| v.as_str())
            .unwrap_or(&self.document_id)
    }
}

/// SHA-256 of a string, hex encoded.
pub fn content_hash(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    format!("{digest:x}")
}
