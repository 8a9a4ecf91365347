//! # Retrieval
//!
//! This crate ties the ragcore pieces into a retrieval-augmented generation
//! service:
//!
//! - **Retrieval Store**: Deduplicated, scoped similarity search
//! - **Record Store**: Durable chunk + embedding records
//! - **Resource Management**: Bounded connection pool and memory monitor
//! - **Orchestrator**: Ingestion and question answering
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        RAG Orchestrator                         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │  Document    │  │  Generation  │  │    Input     │          │
//! │  │  Processor   │  │   Provider   │  │    Guard     │          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │         │                ▲                                      │
//! │         ▼                │                                      │
//! │  ┌──────────────────────────────────┐   ┌──────────────┐       │
//! │  │         Retrieval Store          │◄──│    Memory    │       │
//! │  │  CachedEmbedder · result cache   │   │   Monitor    │       │
//! │  └──────────────────────────────────┘   └──────────────┘       │
//! │         │                    │                                  │
//! │         ▼                    ▼                                  │
//! │  ┌──────────────┐   ┌────────────────┐                         │
//! │  │ VectorIndex  │   │ ResourcePool → │                         │
//! │  │              │   │  RecordStore   │                         │
//! │  └──────────────┘   └────────────────┘                         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use ragcore_retrieval::{QueryOptions, RagConfig, RagOrchestrator};
//!
//! let orchestrator = RagOrchestrator::open(RagConfig::load("ragcore.toml")?)?;
//! orchestrator.ingest(&document, "default").await?;
//!
//! let answer = orchestrator
//!     .query("How are chunks deduplicated?", &QueryOptions::default())
//!     .await;
//! ```

pub mod config;
pub mod error;
pub mod guard;
pub mod memory;
pub mod orchestrator;
pub mod pool;
pub mod record_store;
pub mod store;

pub use config::RagConfig;
pub use error::{RagError, Result};
pub use guard::InputGuard;
pub use memory::{MemoryMonitor, MemorySample, MemorySampler, MemoryThresholds, PressureCallback};
pub use orchestrator::{
    BatchReport, DEFAULT_SCOPE, IngestFailure, IngestReport, QueryOptions, RagOrchestrator,
    RagResponse,
};
pub use pool::{PoolHandle, PoolStats, ResourcePool};
pub use record_store::{EmbeddingRecord, InMemoryRecordStore, JsonRecordStore, RecordStore};
pub use store::{ReconcileReport, RetrievalResult, RetrievalStore, SearchFilters, StoreStats};

// Re-export from dependencies for convenience
pub use ragcore_documents::{Document, DocumentChunk, DocumentType, Metadata};
pub use ragcore_embeddings::{EmbeddingProvider, GenerationProvider, StreamEvent, TokenStream};
