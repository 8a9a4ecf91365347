//! Integration tests for the retrieval store.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use ragcore_documents::{ChunkerConfig, DocumentProcessor};
use ragcore_embeddings::{Cache, CachedEmbedder, HashingProvider};
use ragcore_retrieval::{
    DocumentType, InMemoryRecordStore, JsonRecordStore, Metadata, RagConfig, RagError,
    RecordStore, RetrievalStore, SearchFilters,
};
use ragcore_vector_index::{IndexConfig, VectorIndex};

const DIM: usize = 128;

fn build_store(records: Arc<dyn RecordStore>, config: &RagConfig) -> RetrievalStore {
    let cache = Arc::new(Cache::new(100, Duration::from_secs(60)));
    let embedder = CachedEmbedder::new(Arc::new(HashingProvider::new(DIM)), cache, DIM).unwrap();
    let index = VectorIndex::new(DIM, IndexConfig::default()).unwrap();
    RetrievalStore::new(embedder, index, records, config).unwrap()
}

fn memory_store() -> RetrievalStore {
    build_store(Arc::new(InMemoryRecordStore::new()), &RagConfig::default())
}

fn chunks(content: &str, document_id: &str) -> Vec<ragcore_documents::DocumentChunk> {
    DocumentProcessor::new(ChunkerConfig::default())
        .unwrap()
        .process(content, document_id, DocumentType::Text, &Metadata::new())
}

#[tokio::test]
async fn test_three_sentence_sample_end_to_end() {
    let sample = chunks("A cat sat. A dog ran. A bird flew.", "animals");
    assert_eq!(sample.len(), 1);

    let unrelated = memory_store();
    unrelated
        .add_documents(
            &chunks("Quarterly revenue grew steadily across every region.", "finance"),
            "default",
        )
        .await
        .unwrap();
    let results = unrelated
        .similarity_search("animal movement", "default", &SearchFilters::default(), 5, 0.95)
        .await
        .unwrap();
    assert!(results.is_empty());

    let store = memory_store();
    store.add_documents(&sample, "default").await.unwrap();
    let results = store
        .similarity_search("animal movement", "default", &SearchFilters::default(), 5, 0.0)
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].chunk.document_id, "animals");
    assert_eq!(results[0].rank, 1);
}

#[tokio::test]
async fn test_empty_index_returns_no_results() {
    let store = memory_store();
    let results = store
        .similarity_search("anything at all", "default", &SearchFilters::default(), 5, 0.0)
        .await
        .unwrap();
    assert!(results.is_empty());
    // Short-circuits before embedding the query.
    assert!(store.embedder().cache().is_empty());
}

#[tokio::test]
async fn test_reingesting_identical_content_returns_same_id() {
    let records: Arc<dyn RecordStore> = Arc::new(InMemoryRecordStore::new());
    let store = build_store(Arc::clone(&records), &RagConfig::default());
    let chunk = chunks("Ownership moves values between bindings.", "rust-book");

    let first = store.add_documents(&chunk, "default").await.unwrap();
    let second = store.add_documents(&chunk, "default").await.unwrap();

    assert_eq!(first, second);
    assert_eq!(records.len().unwrap(), 1);
    assert_eq!(store.stats().unwrap().index.total_vectors, 1);
}

#[tokio::test]
async fn test_concurrent_inserts_of_same_content_dedup() {
    let records: Arc<dyn RecordStore> = Arc::new(InMemoryRecordStore::new());
    let store = Arc::new(build_store(Arc::clone(&records), &RagConfig::default()));
    let chunk = chunks("Borrowing never outlives the owner.", "rust-book");

    let (a, b) = tokio::join!(
        store.add_documents(&chunk, "default"),
        store.add_documents(&chunk, "default")
    );

    assert_eq!(a.unwrap(), b.unwrap());
    assert_eq!(records.len().unwrap(), 1);
    assert_eq!(store.stats().unwrap().index.active_vectors, 1);
}

#[tokio::test]
async fn test_pool_bound_is_enforced() {
    let mut config = RagConfig::default();
    config.pool.max_connections = 1;
    let store = build_store(Arc::new(InMemoryRecordStore::new()), &config);

    let held = tokio_test::assert_ok!(store.pool().acquire());
    let err = tokio_test::assert_err!(
        store
            .add_documents(&chunks("Pools never queue callers.", "doc"), "default")
            .await
    );
    assert!(matches!(err, RagError::ResourceExhausted(_)));

    drop(held);
    tokio_test::assert_ok!(
        store
            .add_documents(&chunks("Pools never queue callers.", "doc"), "default")
            .await
    );
    assert_eq!(store.pool().stats().active, 0);
}

#[tokio::test]
async fn test_threshold_filters_weak_matches() {
    let store = memory_store();
    store
        .add_documents(&chunks("Tokio drives futures to completion.", "a"), "default")
        .await
        .unwrap();
    store
        .add_documents(&chunks("Sourdough needs a long cold proof.", "b"), "default")
        .await
        .unwrap();

    let results = store
        .similarity_search(
            "Tokio drives futures to completion.",
            "default",
            &SearchFilters::default(),
            5,
            0.9,
        )
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].chunk.document_id, "a");
    assert!(results[0].similarity_score >= 0.9);
}

#[tokio::test]
async fn test_index_survives_save_and_load() {
    let dir = tempfile::tempdir().unwrap();
    let records: Arc<dyn RecordStore> =
        Arc::new(JsonRecordStore::open(dir.path().join("records.json")).unwrap());
    let config = RagConfig::default().with_index_path(dir.path().join("index"));

    let store = build_store(Arc::clone(&records), &config);
    for (i, text) in [
        "Channels move values between tasks.",
        "Mutexes guard shared state.",
        "Atomics avoid locks for counters.",
    ]
    .iter()
    .enumerate()
    {
        store
            .add_documents(&chunks(text, &format!("doc-{i}")), "default")
            .await
            .unwrap();
    }
    let query = "values between tasks";
    let before = store
        .similarity_search(query, "default", &SearchFilters::default(), 3, 0.0)
        .await
        .unwrap();
    store.save_index().unwrap();

    let restored = build_store(records, &config);
    assert!(restored.load_index().unwrap());
    let after = restored
        .similarity_search(query, "default", &SearchFilters::default(), 3, 0.0)
        .await
        .unwrap();
    assert_eq!(after, before);
}

#[tokio::test]
async fn test_corrupted_index_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let config = RagConfig::default().with_index_path(dir.path().join("index"));
    let store = build_store(Arc::new(InMemoryRecordStore::new()), &config);
    store
        .add_documents(&chunks("Checksums catch flipped bits.", "doc"), "default")
        .await
        .unwrap();
    store.save_index().unwrap();

    let blob = dir.path().join("index.idx");
    let mut bytes = std::fs::read(&blob).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    std::fs::write(&blob, bytes).unwrap();

    let err = store.load_index().unwrap_err();
    assert!(matches!(err, RagError::IndexCorruption(_)));
    // The in-memory index is untouched.
    assert_eq!(store.stats().unwrap().index.active_vectors, 1);
}
