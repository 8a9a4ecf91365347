//! # Documents
//!
//! Turns raw content into [`DocumentChunk`]s: type-specific preprocessing
//! (HTML, Markdown, code) followed by one of several chunking strategies.
//!
//! ```text
//! content ──► Preprocessor ──► chunk_text ──► min-size filter ──► DocumentChunk
//!               │                                                    ▲
//!               └──────────────── metadata (title, headers, ...) ────┘
//! ```

pub mod chunker;
pub mod error;
pub mod preprocess;
pub mod processor;
pub mod types;

pub use chunker::{ChunkerConfig, ChunkingStrategy};
pub use error::{DocumentError, Result};
pub use processor::DocumentProcessor;
pub use types::{Document, DocumentChunk, DocumentType, Metadata, content_hash};
