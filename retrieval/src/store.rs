//! Retrieval store: chunks in, ranked results out.
//!
//! The store keeps two views of every chunk in step: a durable
//! [`EmbeddingRecord`] in the [`RecordStore`] and an entry in the
//! [`VectorIndex`] whose metadata points back at the record. Content is
//! deduplicated per `(content_hash, scope)`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use ragcore_documents::{DocumentChunk, DocumentType, Metadata};
use ragcore_embeddings::{Cache, CacheStats, CachedEmbedder, Embedding};
use ragcore_vector_index::{BackendKind, EntryMetadata, IndexStats, VectorIndex, is_deleted};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RagConfig;
use crate::error::{RagError, Result};
use crate::memory::{MemorySample, PressureCallback};
use crate::pool::{PoolStats, ResourcePool};
use crate::record_store::{EmbeddingRecord, RecordStore};

const RECORD_ID_KEY: &str = "record_id";
const SCOPE_KEY: &str = "scope";

/// Restrictions applied to search candidates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchFilters {
    /// Only chunks of these document types.
    pub document_types: Option<Vec<DocumentType>>,

    /// Only chunks of these documents.
    pub document_ids: Option<Vec<String>>,

    /// Chunk metadata that must match exactly.
    #[serde(default)]
    pub metadata: Metadata,
}

impl SearchFilters {
    pub fn with_document_type(mut self, document_type: DocumentType) -> Self {
        self.document_types
            .get_or_insert_with(Vec::new)
            .push(document_type);
        self
    }

    pub fn with_document_id(mut self, document_id: impl Into<String>) -> Self {
        self.document_ids
            .get_or_insert_with(Vec::new)
            .push(document_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, record: &EmbeddingRecord) -> bool {
        let type_ok = self
            .document_types
            .as_ref()
            .is_none_or(|types| types.contains(&record.document_type));
        let document_ok = self
            .document_ids
            .as_ref()
            .is_none_or(|ids| ids.contains(&record.document_id));
        type_ok
            && document_ok
            && self
                .metadata
                .iter()
                .all(|(key, value)| record.metadata.get(key) == Some(value))
    }
}

/// One ranked search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub chunk: DocumentChunk,

    /// Similarity in `[0, 1]`.
    pub similarity_score: f32,

    /// 1-based position in the result list.
    pub rank: usize,

    /// `record_id`, `index_id` and `scope` of the hit.
    pub metadata: Metadata,
}

/// Outcome of [`RetrievalStore::reconcile`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Records that had no live index entry and were re-indexed.
    pub reindexed_records: usize,

    /// Index entries without a matching record, now marked deleted.
    pub orphaned_entries: usize,
}

/// Point-in-time view of the store and everything it owns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    pub index: IndexStats,
    pub records: usize,
    pub embedding_cache: CacheStats,
    pub result_cache: CacheStats,
    pub pool: PoolStats,
}

/// Index metadata stored next to each vector.
fn entry_metadata(record: &EmbeddingRecord) -> EntryMetadata {
    let mut metadata = EntryMetadata::new();
    metadata.insert(RECORD_ID_KEY.to_string(), json!(record.id.to_string()));
    metadata.insert(SCOPE_KEY.to_string(), json!(record.scope));
    metadata.insert("content_hash".to_string(), json!(record.content_hash));
    metadata.insert("document_id".to_string(), json!(record.document_id));
    metadata.insert("chunk_index".to_string(), json!(record.chunk_index));
    metadata
}

fn record_id_of(metadata: &EntryMetadata) -> Option<Uuid> {
    metadata
        .get(RECORD_ID_KEY)
        .and_then(Value::as_str)
        .and_then(|id| Uuid::parse_str(id).ok())
}

fn scope_of(metadata: &EntryMetadata) -> Option<&str> {
    metadata.get(SCOPE_KEY).and_then(Value::as_str)
}

/// Add `records` to `index` and point each record at its new entry.
fn index_records(index: &mut VectorIndex, records: &mut [EmbeddingRecord]) -> Result<()> {
    if records.is_empty() {
        return Ok(());
    }
    let vectors: Vec<Embedding> = records.iter().map(|r| r.vector.clone()).collect();
    let metadata: Vec<EntryMetadata> = records.iter().map(entry_metadata).collect();
    let ids = index.add(vectors, metadata)?;
    for (record, id) in records.iter_mut().zip(ids) {
        record.index_id = Some(id);
    }
    Ok(())
}

/// Similarity search over deduplicated, scoped chunks.
pub struct RetrievalStore {
    embedder: CachedEmbedder,
    index: RwLock<VectorIndex>,
    pool: ResourcePool<Arc<dyn RecordStore>>,
    results: Arc<Cache<Vec<RetrievalResult>>>,
    index_path: Option<PathBuf>,
}

impl RetrievalStore {
    /// Assemble a store. The embedder and index must agree on the dimension.
    pub fn new(
        embedder: CachedEmbedder,
        index: VectorIndex,
        records: Arc<dyn RecordStore>,
        config: &RagConfig,
    ) -> Result<Self> {
        if embedder.dimension() != index.dimension() {
            return Err(RagError::Validation(format!(
                "embedding dimension {} does not match index dimension {}",
                embedder.dimension(),
                index.dimension()
            )));
        }

        let pool = ResourcePool::new(config.pool.max_connections, move || {
            Ok(Arc::clone(&records))
        })?;

        Ok(Self {
            embedder,
            index: RwLock::new(index),
            pool,
            results: Arc::new(Cache::new(config.cache.max_size, config.cache.ttl())),
            index_path: config.index.path.clone(),
        })
    }

    /// Where `save_index` and `load_index` keep the index.
    pub fn with_index_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.index_path = Some(path.into());
        self
    }

    pub fn index_path(&self) -> Option<&Path> {
        self.index_path.as_deref()
    }

    pub fn embedder(&self) -> &CachedEmbedder {
        &self.embedder
    }

    pub fn pool(&self) -> &ResourcePool<Arc<dyn RecordStore>> {
        &self.pool
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.index.read().backend_kind()
    }

    fn has_live_entries(&self) -> bool {
        self.index.read().active_len() > 0
    }

    /// Store chunks under `scope`, returning one record id per chunk.
    ///
    /// Chunks whose content already exists in the scope, or repeats earlier
    /// in the batch, get the existing id and are not embedded again.
    pub async fn add_documents(&self, chunks: &[DocumentChunk], scope: &str) -> Result<Vec<String>> {
        if chunks.is_empty() {
            return Ok(Vec::new());
        }

        let mut ids: Vec<Option<Uuid>> = vec![None; chunks.len()];
        let mut first_seen: HashMap<&str, usize> = HashMap::new();
        let mut repeats = Vec::new();
        let mut pending = Vec::new();
        {
            let store = self.pool.acquire()?;
            for (i, chunk) in chunks.iter().enumerate() {
                if let Some(existing) = store.find_by_hash(&chunk.content_hash, scope)? {
                    debug!(
                        "Chunk {} of {} already stored as {}",
                        chunk.chunk_index, chunk.document_id, existing.id
                    );
                    ids[i] = Some(existing.id);
                } else if let Some(&first) = first_seen.get(chunk.content_hash.as_str()) {
                    repeats.push((i, first));
                } else {
                    first_seen.insert(&chunk.content_hash, i);
                    pending.push(i);
                }
            }
        }

        if !pending.is_empty() {
            let texts: Vec<String> = pending.iter().map(|&i| chunks[i].content.clone()).collect();
            let vectors = self.embedder.embed(&texts).await?;
            let inserted = self.insert_embedded(chunks, &pending, vectors, scope, &mut ids)?;
            if inserted > 0 {
                self.results.clear();
                info!("Indexed {inserted} new chunks in scope {scope}");
            }
        }

        for (i, first) in repeats {
            ids[i] = ids[first];
        }

        ids.into_iter()
            .map(|id| {
                id.map(|id| id.to_string())
                    .ok_or_else(|| RagError::Store("chunk was not assigned a record".to_string()))
            })
            .collect()
    }

    /// Index freshly embedded chunks and persist their records.
    ///
    /// Holds the index write lock throughout, so a concurrent insert of the
    /// same content is seen by the duplicate re-check.
    fn insert_embedded(
        &self,
        chunks: &[DocumentChunk],
        pending: &[usize],
        vectors: Vec<Embedding>,
        scope: &str,
        ids: &mut [Option<Uuid>],
    ) -> Result<usize> {
        let store = self.pool.acquire()?;
        let mut index = self.index.write();

        let mut fresh_positions = Vec::new();
        let mut fresh = Vec::new();
        for (&i, vector) in pending.iter().zip(vectors) {
            let chunk = &chunks[i];
            if let Some(existing) = store.find_by_hash(&chunk.content_hash, scope)? {
                debug!("Chunk {} was stored concurrently as {}", chunk.content_hash, existing.id);
                ids[i] = Some(existing.id);
                continue;
            }
            fresh_positions.push(i);
            fresh.push(EmbeddingRecord::from_chunk(
                chunk,
                scope,
                vector,
                self.embedder.model(),
            ));
        }

        index_records(&mut index, &mut fresh)?;
        for (&i, record) in fresh_positions.iter().zip(&fresh) {
            ids[i] = Some(record.id);
        }
        let inserted = fresh.len();
        store.upsert_many(fresh)?;
        Ok(inserted)
    }

    /// Up to `limit` chunks of `scope` scoring at least `threshold`, best first.
    pub async fn similarity_search(
        &self,
        query: &str,
        scope: &str,
        filters: &SearchFilters,
        limit: usize,
        threshold: f32,
    ) -> Result<Vec<RetrievalResult>> {
        if limit == 0 || !self.has_live_entries() {
            return Ok(Vec::new());
        }

        let key = Cache::<Vec<RetrievalResult>>::key([
            query.to_string(),
            scope.to_string(),
            serde_json::to_string(filters)?,
            limit.to_string(),
            threshold.to_string(),
        ]);
        if let Some(hit) = self.results.get(&key) {
            debug!("Result cache hit for query in scope {scope}");
            return Ok(hit);
        }

        let vector = self.embedder.embed_one(query).await?;
        let candidates = self.candidates(&vector, scope, limit.saturating_mul(2), threshold)?;
        let results = self.resolve(candidates, scope, filters, limit)?;

        debug!("Search in scope {scope} returned {} results", results.len());
        self.results.put(key, results.clone());
        Ok(results)
    }

    /// Live index hits in `scope` as `(index_id, score, record_id)`.
    fn candidates(
        &self,
        vector: &[f32],
        scope: &str,
        k: usize,
        threshold: f32,
    ) -> Result<Vec<(u64, f32, Uuid)>> {
        let index = self.index.read();
        let hits = index.search(vector, k, threshold)?;
        Ok(hits
            .into_iter()
            .filter_map(|(id, score)| {
                let metadata = index.metadata(id)?;
                if is_deleted(metadata) || scope_of(metadata) != Some(scope) {
                    return None;
                }
                record_id_of(metadata).map(|record_id| (id, score, record_id))
            })
            .collect())
    }

    fn resolve(
        &self,
        candidates: Vec<(u64, f32, Uuid)>,
        scope: &str,
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<RetrievalResult>> {
        let store = self.pool.acquire()?;
        let mut results: Vec<RetrievalResult> = Vec::with_capacity(limit);
        for (index_id, score, record_id) in candidates {
            let Some(record) = store.get(&record_id)? else {
                debug!("Index entry {index_id} has no record; skipping");
                continue;
            };
            if record.scope != scope
                || record.index_id != Some(index_id)
                || !filters.matches(&record)
            {
                continue;
            }

            let mut metadata = Metadata::new();
            metadata.insert(RECORD_ID_KEY.to_string(), json!(record.id.to_string()));
            metadata.insert("index_id".to_string(), json!(index_id));
            metadata.insert(SCOPE_KEY.to_string(), json!(record.scope));

            results.push(RetrievalResult {
                chunk: record.to_chunk(),
                similarity_score: score,
                rank: results.len() + 1,
                metadata,
            });
            if results.len() == limit {
                break;
            }
        }
        Ok(results)
    }

    /// Delete records of `scope` by id. Unknown, malformed, and out-of-scope
    /// ids are skipped. Returns how many records were deleted.
    pub fn delete_documents(&self, ids: &[String], scope: &str) -> Result<usize> {
        let store = self.pool.acquire()?;
        let mut deleted = 0;
        {
            let mut index = self.index.write();
            for id in ids {
                let Ok(record_id) = Uuid::parse_str(id) else {
                    debug!("Ignoring malformed record id {id}");
                    continue;
                };
                let Some(record) = store.get(&record_id)? else {
                    continue;
                };
                if record.scope != scope {
                    debug!("Record {id} belongs to another scope");
                    continue;
                }
                if let Some(index_id) = record.index_id {
                    index.remove(&[index_id]);
                }
                if store.delete(&record_id)? {
                    deleted += 1;
                }
            }
        }

        if deleted > 0 {
            self.results.clear();
            info!("Deleted {deleted} records from scope {scope}");
        }
        Ok(deleted)
    }

    fn require_index_path(&self) -> Result<&Path> {
        self.index_path
            .as_deref()
            .ok_or_else(|| RagError::Config("no index path configured".to_string()))
    }

    pub fn save_index(&self) -> Result<()> {
        let path = self.require_index_path()?;
        self.index.read().save(path)?;
        Ok(())
    }

    /// Load the saved index. Returns `false` when nothing is saved.
    pub fn load_index(&self) -> Result<bool> {
        let path = self.require_index_path()?;
        let loaded = self.index.write().load(path)?;
        if loaded {
            self.results.clear();
        }
        Ok(loaded)
    }

    /// Re-index records from the record store.
    ///
    /// With no scope the whole index is replaced; otherwise only the entries
    /// of `scope` are. Returns how many records were indexed.
    pub fn rebuild_from_store(&self, scope: Option<&str>) -> Result<usize> {
        let store = self.pool.acquire()?;
        let mut records = store.records(scope)?;
        {
            let mut index = self.index.write();
            match scope {
                None => {
                    let mut fresh = VectorIndex::new(index.dimension(), index.config().clone())?;
                    index_records(&mut fresh, &mut records)?;
                    *index = fresh;
                }
                Some(scope) => {
                    let stale: Vec<u64> = index
                        .entries()
                        .filter(|(_, m)| scope_of(m) == Some(scope))
                        .map(|(id, _)| id)
                        .collect();
                    index.remove(&stale);
                    index_records(&mut index, &mut records)?;
                    index.rebuild()?;
                }
            }
        }

        let count = records.len();
        store.upsert_many(records)?;
        self.results.clear();
        info!(
            "Rebuilt index from {count} stored records{}",
            scope.map(|s| format!(" in scope {s}")).unwrap_or_default()
        );
        Ok(count)
    }

    /// Repair drift between the record store and the index.
    ///
    /// Index entries without a matching record are marked deleted; records
    /// without a live entry are indexed again.
    pub fn reconcile(&self) -> Result<ReconcileReport> {
        let store = self.pool.acquire()?;
        let records = store.records(None)?;
        let mut index = self.index.write();
        if index.backend_kind() == BackendKind::Unavailable {
            return Ok(ReconcileReport::default());
        }

        let pointers: HashMap<Uuid, Option<u64>> =
            records.iter().map(|r| (r.id, r.index_id)).collect();
        let orphaned: Vec<u64> = index
            .entries()
            .filter(|(id, metadata)| {
                let owner = record_id_of(metadata).and_then(|rid| pointers.get(&rid));
                owner != Some(&Some(*id))
            })
            .map(|(id, _)| id)
            .collect();
        let orphaned_entries = index.remove(&orphaned);

        let mut missing: Vec<EmbeddingRecord> = records
            .into_iter()
            .filter(|record| {
                !record
                    .index_id
                    .and_then(|id| index.metadata(id))
                    .is_some_and(|m| !is_deleted(m) && record_id_of(m) == Some(record.id))
            })
            .collect();
        index_records(&mut index, &mut missing)?;
        drop(index);

        let report = ReconcileReport {
            reindexed_records: missing.len(),
            orphaned_entries,
        };
        if !missing.is_empty() {
            store.upsert_many(missing)?;
        }
        if report != ReconcileReport::default() {
            self.results.clear();
            warn!(
                "Reconciled store: re-indexed {} records, dropped {} orphan entries",
                report.reindexed_records, report.orphaned_entries
            );
        }
        Ok(report)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let records = self.pool.acquire()?.len()?;
        Ok(StoreStats {
            index: self.index.read().stats(),
            records,
            embedding_cache: self.embedder.cache().stats(),
            result_cache: self.results.stats(),
            pool: self.pool.stats(),
        })
    }

    /// Drop expired entries from both caches.
    pub fn cleanup_expired(&self) -> usize {
        self.embedder.cache().cleanup_expired() + self.results.cleanup_expired()
    }

    pub fn clear_caches(&self) {
        self.embedder.cache().clear();
        self.results.clear();
    }

    /// Memory pressure callbacks that empty the caches.
    pub fn cleanup_callbacks(&self) -> Vec<(String, PressureCallback)> {
        let embeddings = Arc::clone(self.embedder.cache());
        let results = Arc::clone(&self.results);
        vec![
            (
                "embedding_cache".to_string(),
                Box::new(move |_: &MemorySample| -> anyhow::Result<()> {
                    let cleared = embeddings.len();
                    embeddings.clear();
                    info!("Cleared {cleared} cached embeddings");
                    Ok(())
                }),
            ),
            (
                "result_cache".to_string(),
                Box::new(move |_: &MemorySample| -> anyhow::Result<()> {
                    let cleared = results.len();
                    results.clear();
                    info!("Cleared {cleared} cached search results");
                    Ok(())
                }),
            ),
        ]
    }
}
