//! Index configuration and size-based backend selection.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{IndexError, Result};

/// Below this many vectors the exact flat backend is used.
pub const FLAT_MAX_VECTORS: usize = 1_000;

/// Below this many vectors IVF with exact reranking is used.
pub const IVF_MAX_VECTORS: usize = 10_000;

/// Up to this many vectors IVF with product-quantized codes is used.
pub const IVF_PQ_MAX_VECTORS: usize = 100_000;

/// Concrete search structure behind the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Flat,
    Ivf,
    IvfPq,
    Hnsw,
    Unavailable,
}

impl BackendKind {
    /// Pick the backend for a corpus of `size` vectors.
    pub fn for_size(size: usize) -> Self {
        if size < FLAT_MAX_VECTORS {
            Self::Flat
        } else if size < IVF_MAX_VECTORS {
            Self::Ivf
        } else if size <= IVF_PQ_MAX_VECTORS {
            Self::IvfPq
        } else {
            Self::Hnsw
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flat => "flat",
            Self::Ivf => "ivf",
            Self::IvfPq => "ivf_pq",
            Self::Hnsw => "hnsw",
            Self::Unavailable => "unavailable",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the backend is chosen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendMode {
    /// Follow corpus size, rebuilding when the flat backend outgrows itself.
    #[default]
    Auto,
    Flat,
    Ivf,
    IvfPq,
    Hnsw,
}

impl BackendMode {
    /// The pinned backend, or `None` in automatic mode.
    pub fn pinned(self) -> Option<BackendKind> {
        match self {
            Self::Auto => None,
            Self::Flat => Some(BackendKind::Flat),
            Self::Ivf => Some(BackendKind::Ivf),
            Self::IvfPq => Some(BackendKind::IvfPq),
            Self::Hnsw => Some(BackendKind::Hnsw),
        }
    }
}

/// Tunables for the vector index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub backend_mode: BackendMode,

    /// When false, the index accepts inserts but never returns results.
    pub backend_available: bool,

    /// Accepted for compatibility; all backends run on the CPU.
    pub gpu_offload: bool,

    /// Seed for clustering and graph level assignment.
    pub seed: u64,

    /// Inverted lists probed per query.
    pub nprobe: usize,

    pub kmeans_iterations: usize,

    /// Upper bound on PQ subspaces; the actual count divides the dimension.
    pub pq_subspaces: usize,

    /// Maximum vectors sampled for training.
    pub training_sample_size: usize,

    pub hnsw_m: usize,
    pub hnsw_ef_construction: usize,
    pub hnsw_ef_search: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            backend_mode: BackendMode::Auto,
            backend_available: true,
            gpu_offload: false,
            seed: 42,
            nprobe: 8,
            kmeans_iterations: 20,
            pq_subspaces: 8,
            training_sample_size: 10_000,
            hnsw_m: 16,
            hnsw_ef_construction: 200,
            hnsw_ef_search: 64,
        }
    }
}

impl IndexConfig {
    /// Pin a backend.
    pub fn with_mode(mut self, mode: BackendMode) -> Self {
        self.backend_mode = mode;
        self
    }

    /// Set the seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.nprobe == 0 {
            return Err(IndexError::InvalidConfig("nprobe must be positive".to_string()));
        }
        if self.pq_subspaces == 0 {
            return Err(IndexError::InvalidConfig(
                "pq_subspaces must be positive".to_string(),
            ));
        }
        if self.hnsw_m < 2 {
            return Err(IndexError::InvalidConfig("hnsw_m must be at least 2".to_string()));
        }
        if self.training_sample_size == 0 {
            return Err(IndexError::InvalidConfig(
                "training_sample_size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_backend_for_size() {
        assert_eq!(BackendKind::for_size(0), BackendKind::Flat);
        assert_eq!(BackendKind::for_size(999), BackendKind::Flat);
        assert_eq!(BackendKind::for_size(1_000), BackendKind::Ivf);
        assert_eq!(BackendKind::for_size(9_999), BackendKind::Ivf);
        assert_eq!(BackendKind::for_size(10_000), BackendKind::IvfPq);
        assert_eq!(BackendKind::for_size(100_000), BackendKind::IvfPq);
        assert_eq!(BackendKind::for_size(100_001), BackendKind::Hnsw);
    }

    #[test]
    fn test_mode_round_trips_through_toml_names() {
        let mode: BackendMode = serde_json::from_str("\"ivf_pq\"").unwrap();
        assert_eq!(mode, BackendMode::IvfPq);
        assert_eq!(mode.pinned(), Some(BackendKind::IvfPq));
        assert_eq!(BackendMode::Auto.pinned(), None);
    }

    #[test]
    fn test_validate() {
        assert!(IndexConfig::default().validate().is_ok());
        let config = IndexConfig {
            hnsw_m: 1,
            ..IndexConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
