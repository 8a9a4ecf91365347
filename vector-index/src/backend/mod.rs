//! Search backends and static dispatch over them.

mod flat;
mod hnsw;
mod ivf;
mod ivf_pq;

pub use flat::FlatBackend;
pub use hnsw::HnswBackend;
pub use ivf::IvfBackend;
pub use ivf_pq::IvfPqBackend;

use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::config::{BackendKind, IndexConfig};
use crate::error::Result;

/// Upper bound on inverted lists.
const MAX_LISTS: usize = 4096;

/// Number of inverted lists for a corpus: about `sqrt(n)`.
pub(crate) fn list_count(n: usize) -> usize {
    ((n as f64).sqrt().round() as usize).clamp(1, MAX_LISTS)
}

/// Up to `max` training vectors drawn without replacement.
pub(crate) fn training_sample<'a>(
    entries: &'a [(u64, Vec<f32>)],
    max: usize,
    rng: &mut StdRng,
) -> Vec<&'a [f32]> {
    if entries.len() <= max {
        return entries.iter().map(|(_, v)| v.as_slice()).collect();
    }
    rand::seq::index::sample(rng, entries.len(), max)
        .into_iter()
        .map(|i| entries[i].1.as_slice())
        .collect()
}

/// The active backend of a vector index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "state", rename_all = "snake_case")]
pub enum AnyBackend {
    Flat(FlatBackend),
    Ivf(IvfBackend),
    IvfPq(IvfPqBackend),
    Hnsw(HnswBackend),
    /// Accepts inserts, stores nothing, finds nothing.
    Unavailable,
}

impl AnyBackend {
    /// An empty backend of the given kind.
    pub fn empty(kind: BackendKind, config: &IndexConfig) -> Self {
        match kind {
            BackendKind::Flat => Self::Flat(FlatBackend::new()),
            BackendKind::Ivf => Self::Ivf(IvfBackend::new(config.nprobe)),
            BackendKind::IvfPq => Self::IvfPq(IvfPqBackend::new(config.nprobe)),
            BackendKind::Hnsw => Self::Hnsw(HnswBackend::new(config)),
            BackendKind::Unavailable => Self::Unavailable,
        }
    }

    /// Build and train a backend of `kind` over `entries`.
    pub fn build(
        kind: BackendKind,
        dimension: usize,
        config: &IndexConfig,
        entries: Vec<(u64, Vec<f32>)>,
    ) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(config.seed);
        Ok(match kind {
            BackendKind::Flat => Self::Flat(FlatBackend::from_entries(entries)),
            BackendKind::Ivf => Self::Ivf(IvfBackend::train(entries, config, &mut rng)),
            BackendKind::IvfPq => Self::IvfPq(IvfPqBackend::train(
                entries, dimension, config, &mut rng,
            )?),
            BackendKind::Hnsw => Self::Hnsw(HnswBackend::from_entries(entries, config)),
            BackendKind::Unavailable => Self::Unavailable,
        })
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Flat(_) => BackendKind::Flat,
            Self::Ivf(_) => BackendKind::Ivf,
            Self::IvfPq(_) => BackendKind::IvfPq,
            Self::Hnsw(_) => BackendKind::Hnsw,
            Self::Unavailable => BackendKind::Unavailable,
        }
    }

    pub fn add(&mut self, id: u64, vector: Vec<f32>) {
        match self {
            Self::Flat(b) => b.add(id, vector),
            Self::Ivf(b) => b.add(id, vector),
            Self::IvfPq(b) => b.add(id, vector),
            Self::Hnsw(b) => b.add(id, vector),
            Self::Unavailable => {}
        }
    }

    /// The `k` nearest ids with squared L2 distances, closest first.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(u64, f32)> {
        match self {
            Self::Flat(b) => b.search(query, k),
            Self::Ivf(b) => b.search(query, k),
            Self::IvfPq(b) => b.search(query, k),
            Self::Hnsw(b) => b.search(query, k),
            Self::Unavailable => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Flat(b) => b.len(),
            Self::Ivf(b) => b.len(),
            Self::IvfPq(b) => b.len(),
            Self::Hnsw(b) => b.len(),
            Self::Unavailable => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the backend still runs on untrained exact scans.
    pub fn needs_training(&self) -> bool {
        match self {
            Self::Ivf(b) => !b.is_trained(),
            Self::IvfPq(b) => !b.is_trained(),
            Self::Flat(_) | Self::Hnsw(_) | Self::Unavailable => false,
        }
    }

    /// Ids of every stored vector, sorted.
    pub fn ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.reconstruct().into_iter().map(|(id, _)| id).collect();
        ids.sort_unstable();
        ids
    }

    /// All stored vectors, sorted by id. Lossy for product-quantized data.
    pub fn reconstruct(&self) -> Vec<(u64, Vec<f32>)> {
        match self {
            Self::Flat(b) => b.reconstruct(),
            Self::Ivf(b) => b.reconstruct(),
            Self::IvfPq(b) => b.reconstruct(),
            Self::Hnsw(b) => b.reconstruct(),
            Self::Unavailable => Vec::new(),
        }
    }
}
