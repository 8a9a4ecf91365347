//! Persisted embedding records.
//!
//! A record pairs a chunk with its vector and is addressed by
//! `(content_hash, scope)`. The vector index can be rebuilt from records
//! alone, so records are the durable side of the pair.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use ragcore_documents::{DocumentChunk, DocumentType, Metadata};
use ragcore_embeddings::Embedding;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{RagError, Result};

/// A chunk, its embedding, and where the embedding sits in the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub id: Uuid,
    pub content_hash: String,
    pub scope: String,
    pub vector: Embedding,
    pub content: String,
    pub document_id: String,
    pub document_type: DocumentType,
    pub chunk_index: usize,
    #[serde(default)]
    pub start_offset: Option<usize>,
    #[serde(default)]
    pub end_offset: Option<usize>,
    pub metadata: Metadata,
    pub embedding_model: String,
    /// Id of the live index entry, if any.
    pub index_id: Option<u64>,
    pub created_at: DateTime<Utc>,
}

impl EmbeddingRecord {
    /// A fresh record for `chunk` in `scope`, not yet indexed.
    pub fn from_chunk(
        chunk: &DocumentChunk,
        scope: &str,
        vector: Embedding,
        embedding_model: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            content_hash: chunk.content_hash.clone(),
            scope: scope.to_string(),
            vector,
            content: chunk.content.clone(),
            document_id: chunk.document_id.clone(),
            document_type: chunk.document_type,
            chunk_index: chunk.chunk_index,
            start_offset: chunk.start_offset,
            end_offset: chunk.end_offset,
            metadata: chunk.metadata.clone(),
            embedding_model: embedding_model.to_string(),
            index_id: None,
            created_at: Utc::now(),
        }
    }

    /// Rebuild the chunk this record was created from.
    pub fn to_chunk(&self) -> DocumentChunk {
        DocumentChunk {
            content: self.content.clone(),
            document_id: self.document_id.clone(),
            document_type: self.document_type,
            chunk_index: self.chunk_index,
            metadata: self.metadata.clone(),
            content_hash: self.content_hash.clone(),
            start_offset: self.start_offset,
            end_offset: self.end_offset,
        }
    }
}

/// Storage for embedding records.
///
/// Implementations are shared between tasks and must not block for long.
pub trait RecordStore: Send + Sync {
    /// Insert a record or replace the one with the same id.
    fn upsert(&self, record: EmbeddingRecord) -> Result<()>;

    fn upsert_many(&self, records: Vec<EmbeddingRecord>) -> Result<()> {
        for record in records {
            self.upsert(record)?;
        }
        Ok(())
    }

    fn find_by_hash(&self, content_hash: &str, scope: &str) -> Result<Option<EmbeddingRecord>>;

    fn get(&self, id: &Uuid) -> Result<Option<EmbeddingRecord>>;

    /// Returns whether a record was removed.
    fn delete(&self, id: &Uuid) -> Result<bool>;

    /// All records, or those in `scope`, oldest first.
    fn records(&self, scope: Option<&str>) -> Result<Vec<EmbeddingRecord>>;

    fn len(&self) -> Result<usize>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[derive(Debug, Default)]
struct RecordTable {
    records: HashMap<Uuid, EmbeddingRecord>,
    by_hash: HashMap<(String, String), Uuid>,
}

impl RecordTable {
    fn from_records(records: impl IntoIterator<Item = EmbeddingRecord>) -> Self {
        let mut table = Self::default();
        for record in records {
            table.insert(record);
        }
        table
    }

    fn insert(&mut self, record: EmbeddingRecord) {
        if let Some(previous) = self.records.get(&record.id) {
            self.by_hash
                .remove(&(previous.content_hash.clone(), previous.scope.clone()));
        }
        self.by_hash
            .insert((record.content_hash.clone(), record.scope.clone()), record.id);
        self.records.insert(record.id, record);
    }

    fn find_by_hash(&self, content_hash: &str, scope: &str) -> Option<EmbeddingRecord> {
        self.by_hash
            .get(&(content_hash.to_string(), scope.to_string()))
            .and_then(|id| self.records.get(id))
            .cloned()
    }

    fn remove(&mut self, id: &Uuid) -> bool {
        match self.records.remove(id) {
            Some(record) => {
                self.by_hash.remove(&(record.content_hash, record.scope));
                true
            }
            None => false,
        }
    }

    fn list(&self, scope: Option<&str>) -> Vec<EmbeddingRecord> {
        let mut records: Vec<EmbeddingRecord> = self
            .records
            .values()
            .filter(|r| scope.is_none_or(|s| r.scope == s))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        records
    }
}

/// Records held in memory only.
#[derive(Default)]
pub struct InMemoryRecordStore {
    table: RwLock<RecordTable>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordStore for InMemoryRecordStore {
    fn upsert(&self, record: EmbeddingRecord) -> Result<()> {
        self.table.write().insert(record);
        Ok(())
    }

    fn find_by_hash(&self, content_hash: &str, scope: &str) -> Result<Option<EmbeddingRecord>> {
        Ok(self.table.read().find_by_hash(content_hash, scope))
    }

    fn get(&self, id: &Uuid) -> Result<Option<EmbeddingRecord>> {
        Ok(self.table.read().records.get(id).cloned())
    }

    fn delete(&self, id: &Uuid) -> Result<bool> {
        Ok(self.table.write().remove(id))
    }

    fn records(&self, scope: Option<&str>) -> Result<Vec<EmbeddingRecord>> {
        Ok(self.table.read().list(scope))
    }

    fn len(&self) -> Result<usize> {
        Ok(self.table.read().records.len())
    }
}

#[derive(Serialize, Deserialize)]
struct RecordFile {
    version: u32,
    records: Vec<EmbeddingRecord>,
}

const RECORD_FILE_VERSION: u32 = 1;

/// Records kept in memory and mirrored to a single JSON file.
///
/// Every mutation rewrites the file through a temporary file and a rename,
/// so a crash leaves either the old or the new contents.
pub struct JsonRecordStore {
    path: PathBuf,
    table: RwLock<RecordTable>,
}

impl JsonRecordStore {
    /// Open the store at `path`, creating parent directories as needed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let table = if path.exists() {
            let file: RecordFile = serde_json::from_slice(&fs::read(&path)?)?;
            if file.version != RECORD_FILE_VERSION {
                return Err(RagError::Store(format!(
                    "unsupported record file version {} in {}",
                    file.version,
                    path.display()
                )));
            }
            RecordTable::from_records(file.records)
        } else {
            RecordTable::default()
        };

        info!(
            "Opened record store at {} with {} records",
            path.display(),
            table.records.len()
        );
        Ok(Self {
            path,
            table: RwLock::new(table),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, table: &RecordTable) -> Result<()> {
        let file = RecordFile {
            version: RECORD_FILE_VERSION,
            records: table.list(None),
        };
        let content = serde_json::to_vec(&file)?;

        let mut temp = OsString::from(self.path.as_os_str());
        temp.push(".tmp");
        let temp_path = PathBuf::from(temp);
        fs::write(&temp_path, &content)?;
        fs::rename(&temp_path, &self.path)?;

        debug!(
            "Wrote {} records to {}",
            file.records.len(),
            self.path.display()
        );
        Ok(())
    }

    /// Apply `change` and write the result, keeping memory and disk in step.
    fn mutate<T>(&self, change: impl FnOnce(&mut RecordTable) -> T) -> Result<T> {
        let mut table = self.table.write();
        let result = change(&mut table);
        self.persist(&table)?;
        Ok(result)
    }
}

impl RecordStore for JsonRecordStore {
    fn upsert(&self, record: EmbeddingRecord) -> Result<()> {
        self.mutate(|table| table.insert(record))
    }

    /// One file rewrite for the whole batch.
    fn upsert_many(&self, records: Vec<EmbeddingRecord>) -> Result<()> {
        self.mutate(|table| {
            for record in records {
                table.insert(record);
            }
        })
    }

    fn find_by_hash(&self, content_hash: &str, scope: &str) -> Result<Option<EmbeddingRecord>> {
        Ok(self.table.read().find_by_hash(content_hash, scope))
    }

    fn get(&self, id: &Uuid) -> Result<Option<EmbeddingRecord>> {
        Ok(self.table.read().records.get(id).cloned())
    }

    fn delete(&self, id: &Uuid) -> Result<bool> {
        if !self.table.read().records.contains_key(id) {
            return Ok(false);
        }
        self.mutate(|table| table.remove(id))
    }

    fn records(&self, scope: Option<&str>) -> Result<Vec<EmbeddingRecord>> {
        Ok(self.table.read().list(scope))
    }

    fn len(&self) -> Result<usize> {
        Ok(self.table.read().records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn record(content: &str, scope: &str) -> EmbeddingRecord {
        let chunk = DocumentChunk::new(content, "doc-1", DocumentType::Text, 0, Metadata::new());
        EmbeddingRecord::from_chunk(&chunk, scope, vec![1.0, 0.0], "hashing-2")
    }

    fn exercise(store: &dyn RecordStore) {
        let a = record("alpha content", "team-a");
        let b = record("alpha content", "team-b");
        store.upsert(a.clone()).unwrap();
        store.upsert(b.clone()).unwrap();

        assert_eq!(store.len().unwrap(), 2);
        assert_eq!(
            store.find_by_hash(&a.content_hash, "team-a").unwrap(),
            Some(a.clone())
        );
        assert_eq!(store.records(Some("team-b")).unwrap(), vec![b.clone()]);

        let mut indexed = a.clone();
        indexed.index_id = Some(7);
        store.upsert(indexed).unwrap();
        assert_eq!(store.get(&a.id).unwrap().and_then(|r| r.index_id), Some(7));
        assert_eq!(store.len().unwrap(), 2);

        assert!(store.delete(&a.id).unwrap());
        assert!(!store.delete(&a.id).unwrap());
        assert_eq!(store.find_by_hash(&a.content_hash, "team-a").unwrap(), None);
        assert_eq!(store.records(None).unwrap(), vec![b]);
    }

    #[test]
    fn test_in_memory_store() {
        exercise(&InMemoryRecordStore::new());
    }

    #[test]
    fn test_json_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/records.json");

        {
            let store = JsonRecordStore::open(&path).unwrap();
            exercise(&store);
        }

        let reopened = JsonRecordStore::open(&path).unwrap();
        let records = reopened.records(None).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].scope, "team-b");
        assert!(
            reopened
                .find_by_hash(&records[0].content_hash, "team-b")
                .unwrap()
                .is_some()
        );
    }

    #[test]
    fn test_record_round_trips_to_chunk() {
        let chunk =
            DocumentChunk::new("some text here", "doc-9", DocumentType::Markdown, 3, Metadata::new())
                .with_offsets(10, 24);
        let record = EmbeddingRecord::from_chunk(&chunk, "default", vec![0.5], "m");
        assert_eq!(record.to_chunk(), chunk);
    }
}
