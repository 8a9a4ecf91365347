//! # Vector Index
//!
//! Similarity search over fixed-dimension embeddings with a backend that
//! follows corpus size:
//!
//! | vectors          | backend                         |
//! |------------------|---------------------------------|
//! | < 1,000          | flat (exact)                    |
//! | 1,000 - 10,000   | IVF with exact reranking        |
//! | 10,000 - 100,000 | IVF with product-quantized codes|
//! | > 100,000        | HNSW graph                      |
//!
//! Entries are addressed by sequential `u64` ids and carry a JSON metadata
//! map. Deletion is logical until the next rebuild.

pub mod backend;
pub mod config;
pub mod error;
pub mod index;
pub mod kmeans;
pub mod persistence;
pub mod pq;

pub use backend::AnyBackend;
pub use config::{BackendKind, BackendMode, IndexConfig};
pub use error::{IndexError, Result};
pub use index::{IndexStats, VectorIndex, is_deleted};

/// Metadata stored alongside each indexed vector.
pub type EntryMetadata = serde_json::Map<String, serde_json::Value>;
