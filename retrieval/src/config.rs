//! Configuration for the retrieval layer.
//!
//! Every field has a default, so a config file only needs the sections it
//! changes:
//!
//! ```toml
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-small"
//! dimension = 1536
//!
//! [index]
//! backend_mode = "hnsw"
//! path = "/var/lib/ragcore/index"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use ragcore_documents::ChunkerConfig;
use ragcore_embeddings::DEFAULT_DIMENSION;
use ragcore_vector_index::IndexConfig;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{RagError, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RagConfig {
    /// Where records and the index live when no explicit path is given.
    pub data_dir: DataDir,

    /// Embedding provider configuration.
    pub embedding: EmbeddingConfig,

    /// Chunking configuration.
    pub chunking: ChunkerConfig,

    /// Query processing configuration.
    pub retrieval: RetrievalConfig,

    /// Vector index configuration.
    pub index: IndexSection,

    /// Embedding and search result caches.
    pub cache: CacheConfig,

    /// Record store connection pool.
    pub pool: PoolConfig,

    /// Memory pressure monitoring.
    pub memory: MemoryConfig,

    /// Answer generation.
    pub generation: GenerationConfig,
}

impl RagConfig {
    /// Read and validate a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&content)?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Set the embedding configuration.
    pub fn with_embedding(mut self, config: EmbeddingConfig) -> Self {
        self.embedding = config;
        self
    }

    /// Set the chunking configuration.
    pub fn with_chunking(mut self, config: ChunkerConfig) -> Self {
        self.chunking = config;
        self
    }

    /// Set the index configuration.
    pub fn with_index(mut self, config: IndexConfig) -> Self {
        self.index.config = config;
        self
    }

    /// Keep records (and, unless overridden, the index) under `dir`.
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = DataDir(dir.into());
        self
    }

    /// Persist the index at `path`.
    pub fn with_index_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.index.path = Some(path.into());
        self
    }

    /// Reject configurations that cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.embedding.dimension == 0 {
            return Err(RagError::Validation(
                "embedding.dimension must be positive".to_string(),
            ));
        }
        if self.embedding.batch_size == 0 {
            return Err(RagError::Validation(
                "embedding.batch_size must be positive".to_string(),
            ));
        }

        self.chunking.validate()?;
        self.index.config.validate()?;

        let threshold = self.retrieval.similarity_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(RagError::Validation(format!(
                "retrieval.similarity_threshold must be within [0, 1], got {threshold}"
            )));
        }
        if self.retrieval.max_results == 0 {
            return Err(RagError::Validation(
                "retrieval.max_results must be positive".to_string(),
            ));
        }

        if self.cache.max_size == 0 {
            return Err(RagError::Validation(
                "cache.max_size must be positive".to_string(),
            ));
        }
        if self.cache.ttl_seconds == 0 {
            return Err(RagError::Validation(
                "cache.ttl_seconds must be positive".to_string(),
            ));
        }

        if self.pool.max_connections == 0 {
            return Err(RagError::Validation(
                "pool.max_connections must be positive".to_string(),
            ));
        }

        let percent = self.memory.threshold_percent;
        if !(percent > 0.0 && percent <= 100.0) {
            return Err(RagError::Validation(format!(
                "memory.threshold_percent must be within (0, 100], got {percent}"
            )));
        }
        if self.memory.check_interval_secs == 0 {
            return Err(RagError::Validation(
                "memory.check_interval_secs must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// Path the index is saved to and loaded from.
    pub fn index_path(&self) -> PathBuf {
        self.index
            .path
            .clone()
            .unwrap_or_else(|| self.data_dir.0.join("index"))
    }

    /// Path of the JSON record store.
    pub fn records_path(&self) -> PathBuf {
        self.data_dir.0.join("records.json")
    }
}

/// Root directory for persisted state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataDir(pub PathBuf);

impl Default for DataDir {
    fn default() -> Self {
        Self(dirs::data_dir().unwrap_or_default().join("ragcore"))
    }
}

/// Type of embedding provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingProviderType {
    /// Local feature hashing; needs no network.
    #[default]
    Hashing,
    /// OpenAI-compatible embeddings API.
    #[serde(rename = "openai")]
    OpenAI,
}

/// Configuration for the embedding provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProviderType,

    /// Model name; the provider default when unset.
    pub model: Option<String>,

    /// Embedding dimension D shared by every vector in the index.
    pub dimension: usize,

    /// Base URL of an OpenAI-compatible API.
    pub api_base: Option<String>,

    /// Texts per embeddings request.
    pub batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProviderType::Hashing,
            model: None,
            dimension: DEFAULT_DIMENSION,
            api_base: None,
            batch_size: 64,
        }
    }
}

/// Configuration for query processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Minimum similarity score (0.0 to 1.0).
    pub similarity_threshold: f32,

    /// Results returned when the caller does not ask for a count.
    pub max_results: usize,

    /// Upper bound on the context handed to the generator.
    pub max_context_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.7,
            max_results: 5,
            max_context_chars: 4000,
        }
    }
}

/// Vector index configuration plus where it is persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexSection {
    /// Base path of the saved index; `<data_dir>/index` when unset.
    pub path: Option<PathBuf>,

    #[serde(flatten)]
    pub config: IndexConfig,
}

/// Cache sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_size: usize,
    pub ttl_seconds: u64,
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            ttl_seconds: 3600,
        }
    }
}

/// Record store pool sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_connections: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { max_connections: 10 }
    }
}

/// Memory pressure monitoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Start the monitor together with the orchestrator.
    pub enabled: bool,

    /// Resident set size, in MiB, above which memory is under pressure.
    pub threshold_mb: f64,

    /// Share of system memory, in percent, above which memory is under pressure.
    pub threshold_percent: f64,

    pub check_interval_secs: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold_mb: 2048.0,
            threshold_percent: 80.0,
            check_interval_secs: 30,
        }
    }
}

/// Answer generation parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Chat model; the provider default when unset.
    pub model: Option<String>,

    /// Base URL of an OpenAI-compatible chat API, independent of the
    /// embeddings endpoint.
    pub api_base: Option<String>,

    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            model: None,
            api_base: None,
            temperature: 0.2,
            max_tokens: 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use ragcore_documents::ChunkingStrategy;
    use ragcore_vector_index::BackendMode;

    #[test]
    fn test_defaults_are_valid() {
        let config = RagConfig::default();
        config.validate().unwrap();
        assert_eq!(config.embedding.dimension, DEFAULT_DIMENSION);
        assert_eq!(config.chunking.chunk_size, 1000);
        assert_eq!(config.index_path(), config.data_dir.0.join("index"));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = RagConfig::from_toml(
            r#"
data_dir = "/tmp/ragcore-test"

[embedding]
provider = "openai"
dimension = 1536

[chunking]
strategy = "fixed_size"
chunk_size = 100
chunk_overlap = 20

[index]
backend_mode = "ivf_pq"
seed = 7
path = "/tmp/ragcore-test/idx"
"#,
        )
        .unwrap();

        assert_eq!(config.embedding.provider, EmbeddingProviderType::OpenAI);
        assert_eq!(config.embedding.dimension, 1536);
        assert_eq!(config.embedding.batch_size, 64);
        assert_eq!(config.chunking.strategy, ChunkingStrategy::FixedSize);
        assert_eq!(config.chunking.min_chunk_size, 20);
        assert_eq!(config.index.config.backend_mode, BackendMode::IvfPq);
        assert_eq!(config.index.config.seed, 7);
        assert_eq!(config.index_path(), PathBuf::from("/tmp/ragcore-test/idx"));
        assert_eq!(
            config.records_path(),
            PathBuf::from("/tmp/ragcore-test/records.json")
        );
        assert_eq!(config.retrieval, RetrievalConfig::default());
    }

    #[test]
    fn test_validation_errors() {
        let invalid = [
            "[embedding]\ndimension = 0",
            "[chunking]\nchunk_size = 100\nchunk_overlap = 100",
            "[retrieval]\nsimilarity_threshold = 1.5",
            "[cache]\nmax_size = 0",
            "[cache]\nttl_seconds = 0",
            "[pool]\nmax_connections = 0",
            "[memory]\nthreshold_percent = 0.0",
            "[memory]\nthreshold_percent = 120.0",
        ];
        for content in invalid {
            assert!(
                matches!(
                    RagConfig::from_toml(content),
                    Err(RagError::Validation(_))
                ),
                "expected a validation error for {content:?}"
            );
        }
    }

    #[test]
    fn test_nested_config_errors_are_validation_errors() {
        let chunking = RagConfig::default().with_chunking(ChunkerConfig {
            chunk_size: 0,
            ..ChunkerConfig::default()
        });
        let err = chunking.validate().unwrap_err();
        assert_eq!(err.kind(), "validation");
        assert!(err.to_string().contains("chunk_size"));

        let index = RagConfig::default().with_index(IndexConfig {
            nprobe: 0,
            ..IndexConfig::default()
        });
        let err = index.validate().unwrap_err();
        assert_eq!(err.kind(), "validation");
        assert!(err.to_string().contains("nprobe"));

        let err = RagConfig::from_toml("[index]\nnprobe = 0").unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn test_generation_endpoint_is_separate_from_embeddings() {
        let config = RagConfig::from_toml(
            r#"
[embedding]
api_base = "http://embeddings.local/v1"

[generation]
api_base = "http://chat.local/v1"
model = "small-chat"
"#,
        )
        .unwrap();

        assert_eq!(
            config.generation.api_base.as_deref(),
            Some("http://chat.local/v1")
        );
        assert_eq!(
            config.embedding.api_base.as_deref(),
            Some("http://embeddings.local/v1")
        );
        assert_eq!(config.generation.max_tokens, 1024);
        assert_eq!(RagConfig::default().generation.api_base, None);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ragcore.toml");
        std::fs::write(&path, "[pool]\nmax_connections = 3\n").unwrap();

        let config = RagConfig::load(&path).unwrap();
        assert_eq!(config.pool.max_connections, 3);

        assert!(matches!(
            RagConfig::load(dir.path().join("missing.toml")),
            Err(RagError::Io(_))
        ));
        std::fs::write(&path, "[pool\n").unwrap();
        assert!(matches!(
            RagConfig::load(&path),
            Err(RagError::ConfigParse(_))
        ));
    }
}
