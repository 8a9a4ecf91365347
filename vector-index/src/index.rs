//! The vector index facade.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use ragcore_embeddings::{Embedding, normalize, similarity_from_distance};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::EntryMetadata;
use crate::backend::AnyBackend;
use crate::config::{BackendKind, BackendMode, FLAT_MAX_VECTORS, IndexConfig};
use crate::error::{IndexError, Result};
use crate::persistence::{self, IndexSidecar};

/// Pinned IVF backends train once this many vectors are present.
pub const MIN_TRAINING_VECTORS: usize = 256;

/// Metadata key marking a logically deleted entry.
pub const DELETED_KEY: &str = "deleted";

/// Whether metadata carries the deletion marker.
pub fn is_deleted(metadata: &EntryMetadata) -> bool {
    metadata
        .get(DELETED_KEY)
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false)
}

/// Point-in-time description of the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexStats {
    pub backend: BackendKind,
    pub backend_mode: BackendMode,
    pub backend_available: bool,
    pub gpu_offload: bool,
    pub dimension: usize,
    pub total_vectors: usize,
    pub active_vectors: usize,
    pub deleted_vectors: usize,
    pub next_id: u64,
    pub rebuild_count: u64,
}

/// Similarity index over fixed-dimension embeddings.
///
/// Ids are assigned sequentially and never reused. Vectors are normalized on
/// the way in, and scores are similarities in `[0, 1]` derived from squared
/// L2 distance. Mutating calls take `&mut self`; callers serialize access.
pub struct VectorIndex {
    dimension: usize,
    config: IndexConfig,
    backend: AnyBackend,
    metadata: BTreeMap<u64, EntryMetadata>,
    /// Entries not marked deleted.
    active: usize,
    next_id: u64,
    rebuild_count: u64,
    warned_unavailable: AtomicBool,
}

impl VectorIndex {
    /// Create an empty index.
    pub fn new(dimension: usize, config: IndexConfig) -> Result<Self> {
        if dimension == 0 {
            return Err(IndexError::InvalidConfig(
                "dimension must be positive".to_string(),
            ));
        }
        config.validate()?;

        if config.gpu_offload {
            info!("GPU offload requested; all index backends run on the CPU");
        }

        let kind = if config.backend_available {
            config.backend_mode.pinned().unwrap_or(BackendKind::Flat)
        } else {
            BackendKind::Unavailable
        };

        Ok(Self {
            dimension,
            backend: AnyBackend::empty(kind, &config),
            config,
            metadata: BTreeMap::new(),
            active: 0,
            next_id: 0,
            rebuild_count: 0,
            warned_unavailable: AtomicBool::new(false),
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    fn is_unavailable(&self) -> bool {
        matches!(self.backend, AnyBackend::Unavailable)
    }

    fn warn_unavailable(&self) {
        if !self.warned_unavailable.swap(true, Ordering::Relaxed) {
            warn!("Vector backend unavailable; inserts are accepted but searches return nothing");
        }
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        Ok(())
    }

    /// Insert vectors with their metadata, returning the assigned ids.
    ///
    /// May trigger a rebuild when the flat backend outgrows its size band.
    pub fn add(
        &mut self,
        vectors: Vec<Embedding>,
        metadata: Vec<EntryMetadata>,
    ) -> Result<Vec<u64>> {
        if vectors.len() != metadata.len() {
            return Err(IndexError::InvalidInput(format!(
                "{} vectors but {} metadata entries",
                vectors.len(),
                metadata.len()
            )));
        }
        for vector in &vectors {
            self.check_dimension(vector)?;
        }

        let unavailable = self.is_unavailable();
        if unavailable {
            self.warn_unavailable();
        }

        let mut ids = Vec::with_capacity(vectors.len());
        for (mut vector, entry) in vectors.into_iter().zip(metadata) {
            let id = self.next_id;
            self.next_id += 1;
            if !unavailable {
                normalize(&mut vector);
                self.backend.add(id, vector);
                if !is_deleted(&entry) {
                    self.active += 1;
                }
                self.metadata.insert(id, entry);
            }
            ids.push(id);
        }

        debug!("Added {} vectors to {} backend", ids.len(), self.backend.kind());
        self.maybe_rebuild()?;
        Ok(ids)
    }

    fn maybe_rebuild(&mut self) -> Result<()> {
        let due = match self.config.backend_mode.pinned() {
            None => {
                self.backend.kind() == BackendKind::Flat && self.backend.len() > FLAT_MAX_VECTORS
            }
            Some(_) => {
                self.backend.needs_training() && self.backend.len() >= MIN_TRAINING_VECTORS
            }
        };
        if due { self.rebuild() } else { Ok(()) }
    }

    /// Rebuild the backend from the stored vectors.
    ///
    /// Logically deleted entries are dropped for good. In automatic mode the
    /// new backend is chosen by the number of surviving vectors.
    pub fn rebuild(&mut self) -> Result<()> {
        if self.is_unavailable() {
            return Ok(());
        }

        let started = Instant::now();
        let previous = self.backend.kind();

        let entries: Vec<(u64, Vec<f32>)> = self
            .backend
            .reconstruct()
            .into_iter()
            .filter(|(id, _)| self.metadata.get(id).is_some_and(|m| !is_deleted(m)))
            .collect();
        let count = entries.len();
        let target = self
            .config
            .backend_mode
            .pinned()
            .unwrap_or_else(|| BackendKind::for_size(count));

        self.backend = AnyBackend::build(target, self.dimension, &self.config, entries)?;
        self.metadata.retain(|_, m| !is_deleted(m));
        self.active = self.metadata.len();
        self.rebuild_count += 1;

        info!(
            "Rebuilt vector index ({previous} -> {target}) with {count} vectors in {:?}",
            started.elapsed()
        );
        Ok(())
    }

    /// Up to `k` `(id, similarity)` pairs scoring at least `threshold`, best first.
    pub fn search(&self, query: &[f32], k: usize, threshold: f32) -> Result<Vec<(u64, f32)>> {
        if self.is_unavailable() {
            self.warn_unavailable();
            return Ok(Vec::new());
        }
        self.check_dimension(query)?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut query = query.to_vec();
        normalize(&mut query);

        Ok(self
            .backend
            .search(&query, k)
            .into_iter()
            .filter(|(id, _)| self.metadata.contains_key(id))
            .map(|(id, distance)| (id, similarity_from_distance(distance)))
            .filter(|(_, similarity)| *similarity >= threshold)
            .collect())
    }

    /// Mark entries as deleted. Returns how many were newly marked.
    pub fn remove(&mut self, ids: &[u64]) -> usize {
        let mut removed = 0;
        for id in ids {
            let Some(entry) = self.metadata.get_mut(id) else {
                continue;
            };
            if !is_deleted(entry) {
                entry.insert(DELETED_KEY.to_string(), serde_json::Value::Bool(true));
                removed += 1;
            }
        }
        self.active -= removed;
        removed
    }

    pub fn metadata(&self, id: u64) -> Option<&EntryMetadata> {
        self.metadata.get(&id)
    }

    /// Live entries in id order.
    pub fn entries(&self) -> impl Iterator<Item = (u64, &EntryMetadata)> + '_ {
        self.metadata
            .iter()
            .filter(|(_, m)| !is_deleted(m))
            .map(|(id, m)| (*id, m))
    }

    /// Number of stored entries, including logically deleted ones.
    pub fn len(&self) -> usize {
        self.metadata.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metadata.is_empty()
    }

    pub fn active_len(&self) -> usize {
        self.active
    }

    pub fn stats(&self) -> IndexStats {
        let active = self.active_len();
        IndexStats {
            backend: self.backend.kind(),
            backend_mode: self.config.backend_mode,
            backend_available: self.config.backend_available,
            gpu_offload: self.config.gpu_offload,
            dimension: self.dimension,
            total_vectors: self.metadata.len(),
            active_vectors: active,
            deleted_vectors: self.metadata.len() - active,
            next_id: self.next_id,
            rebuild_count: self.rebuild_count,
        }
    }

    /// Persist the index next to `path` (see [`crate::persistence`]).
    pub fn save(&self, path: &Path) -> Result<()> {
        let sidecar = IndexSidecar {
            id_to_metadata: self.metadata.clone(),
            id_counter: self.next_id,
            embedding_dim: self.dimension,
            backend_kind: self.backend.kind(),
            backend_config: self.config.clone(),
            blob_checksum: 0,
        };
        persistence::save(path, &self.backend, sidecar)?;
        info!(
            "Saved {} backend with {} entries to {}",
            self.backend.kind(),
            self.metadata.len(),
            path.display()
        );
        Ok(())
    }

    /// Replace the in-memory state with the index saved at `path`.
    ///
    /// Returns `Ok(false)` when nothing is saved there. On any error the
    /// current state is left untouched.
    pub fn load(&mut self, path: &Path) -> Result<bool> {
        if self.is_unavailable() {
            self.warn_unavailable();
            return Ok(false);
        }

        let Some((backend, sidecar)) = persistence::load(path, self.dimension)? else {
            debug!("No saved index at {}", path.display());
            return Ok(false);
        };

        self.backend = backend;
        self.metadata = sidecar.id_to_metadata;
        self.active = self.metadata.values().filter(|m| !is_deleted(m)).count();
        self.next_id = sidecar.id_counter;

        info!(
            "Loaded {} backend with {} entries from {}",
            self.backend.kind(),
            self.metadata.len(),
            path.display()
        );

        let pinned = self.config.backend_mode.pinned();
        if let Some(pinned) = pinned.filter(|kind| *kind != self.backend.kind()) {
            info!("Saved backend differs from pinned {pinned}; rebuilding");
            self.rebuild()?;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn meta(name: &str) -> EntryMetadata {
        let mut m = EntryMetadata::new();
        m.insert("name".to_string(), json!(name));
        m
    }

    fn small_index() -> VectorIndex {
        let mut index = VectorIndex::new(3, IndexConfig::default()).unwrap();
        index
            .add(
                vec![vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0], vec![1.0, 1.0, 0.0]],
                vec![meta("x"), meta("y"), meta("xy")],
            )
            .unwrap();
        index
    }

    #[test]
    fn test_sequential_ids_and_search() {
        let index = small_index();
        assert_eq!(index.len(), 3);

        let results = index.search(&[2.0, 0.0, 0.0], 3, 0.0).unwrap();
        let ids: Vec<u64> = results.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![0, 2, 1]);
        assert!((results[0].1 - 1.0).abs() < 1e-6);
        assert!((results[1].1 - std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-5);
    }

    #[test]
    fn test_threshold_filters_results() {
        let index = small_index();
        let results = index.search(&[1.0, 0.0, 0.0], 3, 0.9).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, 0);
        assert!(index.search(&[0.0, 0.0, 1.0], 3, 0.5).unwrap().is_empty());
    }

    #[test]
    fn test_dimension_and_length_checks() {
        let mut index = small_index();
        assert!(matches!(
            index.add(vec![vec![1.0]], vec![meta("bad")]),
            Err(IndexError::DimensionMismatch { expected: 3, actual: 1 })
        ));
        assert!(matches!(
            index.add(vec![vec![1.0, 0.0, 0.0]], vec![]),
            Err(IndexError::InvalidInput(_))
        ));
        assert!(index.search(&[1.0], 1, 0.0).is_err());
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn test_logical_delete_then_rebuild_purges() {
        let mut index = small_index();
        assert_eq!(index.remove(&[1, 1, 99]), 1);
        assert_eq!(index.remove(&[1]), 0);
        assert_eq!(index.stats().deleted_vectors, 1);
        assert_eq!(index.metadata(1).map(is_deleted), Some(true));
        assert_eq!(
            index.entries().map(|(id, _)| id).collect::<Vec<_>>(),
            vec![0, 2]
        );

        index.rebuild().unwrap();
        assert_eq!(index.len(), 2);
        assert!(index.metadata(1).is_none());

        let ids = index.add(vec![vec![0.0, 0.0, 1.0]], vec![meta("z")]).unwrap();
        assert_eq!(ids, vec![3]);
    }

    #[test]
    fn test_active_count_tracks_mutations() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("index");

        let mut index = small_index();
        assert_eq!(index.active_len(), 3);
        index.remove(&[0, 0]);
        assert_eq!(index.active_len(), 2);
        assert_eq!(index.stats().deleted_vectors, 1);

        index.save(&base).unwrap();
        let mut restored = VectorIndex::new(3, IndexConfig::default()).unwrap();
        assert!(restored.load(&base).unwrap());
        assert_eq!(restored.active_len(), 2);

        index.rebuild().unwrap();
        assert_eq!(index.active_len(), 2);
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_unavailable_backend() {
        let config = IndexConfig {
            backend_available: false,
            ..IndexConfig::default()
        };
        let mut index = VectorIndex::new(2, config).unwrap();

        let ids = index
            .add(vec![vec![1.0, 0.0], vec![0.0, 1.0]], vec![meta("a"), meta("b")])
            .unwrap();
        assert_eq!(ids, vec![0, 1]);
        assert!(index.search(&[1.0, 0.0], 5, 0.0).unwrap().is_empty());
        assert_eq!(index.stats().backend, BackendKind::Unavailable);
    }

    #[test]
    fn test_pinned_hnsw_from_the_start() {
        let config = IndexConfig::default().with_mode(BackendMode::Hnsw);
        let mut index = VectorIndex::new(2, config).unwrap();
        index
            .add(vec![vec![1.0, 0.0], vec![0.0, 1.0]], vec![meta("a"), meta("b")])
            .unwrap();

        assert_eq!(index.backend_kind(), BackendKind::Hnsw);
        assert_eq!(index.search(&[0.0, 1.0], 1, 0.0).unwrap()[0].0, 1);
    }

    #[test]
    fn test_zero_dimension_rejected() {
        assert!(VectorIndex::new(0, IndexConfig::default()).is_err());
    }
}
