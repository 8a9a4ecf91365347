//! Question answering over the retrieval store.
//!
//! A query is validated, answered from retrieved context by the generation
//! provider, and always produces a [`RagResponse`]: failures turn into a
//! degraded answer with zero confidence rather than an error.

use std::sync::Arc;
use std::time::Instant;

use ragcore_documents::{Document, DocumentProcessor, Metadata};
use ragcore_embeddings::{
    Cache, CachedEmbedder, ChatMessage, CompletionParams, EmbeddingProvider, GenerationProvider,
    HashingProvider, OpenAIProvider, StreamEvent, TokenStream,
};
use ragcore_vector_index::VectorIndex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::config::{EmbeddingConfig, EmbeddingProviderType, RagConfig};
use crate::error::{RagError, Result};
use crate::guard::InputGuard;
use crate::memory::MemoryMonitor;
use crate::record_store::{JsonRecordStore, RecordStore};
use crate::store::{RetrievalResult, RetrievalStore, SearchFilters, StoreStats};

/// Answer given when no indexed chunk is relevant to the question.
pub const INSUFFICIENT_CONTEXT_RESPONSE: &str =
    "I don't have enough information in the indexed documents to answer that question.";

/// Answer given when the query could not be processed.
pub const DEGRADED_RESPONSE: &str =
    "I'm sorry, I couldn't process your question right now. Please try again later.";

const SYSTEM_PROMPT: &str = "You are a helpful assistant that answers questions using only \
the provided context. Cite the sources you use as [Source N]. If the context does not \
contain the answer, say that you don't know.";

/// Scope used when the caller does not name one.
pub const DEFAULT_SCOPE: &str = "default";

/// Options for a single query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryOptions {
    pub scope: String,
    pub filters: SearchFilters,
    /// Overrides `retrieval.max_results`.
    pub max_results: Option<usize>,
    /// Attach the retrieved chunks to the response.
    pub include_sources: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            scope: DEFAULT_SCOPE.to_string(),
            filters: SearchFilters::default(),
            max_results: None,
            include_sources: true,
        }
    }
}

impl QueryOptions {
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    pub fn with_filters(mut self, filters: SearchFilters) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = Some(max_results);
        self
    }

    pub fn without_sources(mut self) -> Self {
        self.include_sources = false;
        self
    }
}

/// Answer to a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RagResponse {
    pub response: String,
    pub sources: Option<Vec<RetrievalResult>>,
    /// Zero for insufficient-context and degraded answers.
    pub confidence: f32,
    pub metadata: Metadata,
}

impl RagResponse {
    fn insufficient_context(include_sources: bool) -> Self {
        let mut metadata = Metadata::new();
        metadata.insert("results".to_string(), json!(0));
        metadata.insert("reason".to_string(), json!("no_relevant_context"));
        Self {
            response: INSUFFICIENT_CONTEXT_RESPONSE.to_string(),
            sources: include_sources.then(Vec::new),
            confidence: 0.0,
            metadata,
        }
    }

    fn degraded(err: &RagError) -> Self {
        let mut metadata = Metadata::new();
        metadata.insert("error".to_string(), json!(err.to_string()));
        metadata.insert("error_kind".to_string(), json!(err.kind()));
        Self {
            response: DEGRADED_RESPONSE.to_string(),
            sources: None,
            confidence: 0.0,
            metadata,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.metadata.contains_key("error")
    }
}

/// Outcome of ingesting one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestReport {
    pub document_id: String,
    /// Record id of each chunk, in chunk order.
    pub chunk_ids: Vec<String>,
}

/// A document that failed to ingest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestFailure {
    pub document_id: String,
    pub error: String,
}

/// Outcome of a batch ingest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub succeeded: Vec<IngestReport>,
    pub failed: Vec<IngestFailure>,
}

impl BatchReport {
    pub fn total_chunks(&self) -> usize {
        self.succeeded.iter().map(|r| r.chunk_ids.len()).sum()
    }
}

/// Context block handed to the generator: one `[Source N: title]` section
/// per result, cut off at `max_chars` characters.
///
/// The first source is truncated rather than dropped so that a tight budget
/// still yields some context.
pub fn build_context(results: &[RetrievalResult], max_chars: usize) -> String {
    let mut context = String::new();
    let mut used = 0;
    for (i, result) in results.iter().enumerate() {
        let entry = format!(
            "[Source {}: {}]\n{}\n\n",
            i + 1,
            result.chunk.title(),
            result.chunk.content
        );
        let entry_chars = entry.chars().count();
        if used + entry_chars > max_chars {
            if i == 0 {
                context.extend(entry.chars().take(max_chars));
            }
            break;
        }
        context.push_str(&entry);
        used += entry_chars;
    }
    context.trim_end().to_string()
}

/// `min(avg(score) + min(0.1 * n, 0.3), 1.0)`; zero without results.
pub fn confidence(results: &[RetrievalResult]) -> f32 {
    if results.is_empty() {
        return 0.0;
    }
    let n = results.len() as f32;
    let average = results.iter().map(|r| r.similarity_score).sum::<f32>() / n;
    (average + (0.1 * n).min(0.3)).min(1.0)
}

fn ready_stream(events: Vec<StreamEvent>) -> TokenStream {
    let (tx, stream) = TokenStream::channel();
    for event in events {
        // Fresh channel with spare capacity.
        let _ = tx.try_send(event);
    }
    stream
}

fn embedding_provider(config: &EmbeddingConfig) -> Arc<dyn EmbeddingProvider> {
    match config.provider {
        EmbeddingProviderType::Hashing => Arc::new(HashingProvider::new(config.dimension)),
        EmbeddingProviderType::OpenAI => {
            let mut provider = OpenAIProvider::new().with_batch_size(config.batch_size);
            if let Some(base) = &config.api_base {
                provider = provider.with_base_url(base);
            }
            if let Some(model) = &config.model {
                provider = provider.with_embedding_model(model, config.dimension);
            }
            Arc::new(provider)
        }
    }
}

fn generation_provider(config: &RagConfig) -> Arc<dyn GenerationProvider> {
    Arc::new(chat_client(config))
}

fn chat_client(config: &RagConfig) -> OpenAIProvider {
    let mut provider = OpenAIProvider::new();
    if let Some(base) = &config.generation.api_base {
        provider = provider.with_base_url(base);
    }
    if let Some(model) = &config.generation.model {
        provider = provider.with_chat_model(model);
    }
    provider
}

/// Ties document processing, retrieval, and generation together.
pub struct RagOrchestrator {
    config: RagConfig,
    processor: DocumentProcessor,
    store: Arc<RetrievalStore>,
    generator: Arc<dyn GenerationProvider>,
    guard: InputGuard,
    monitor: MemoryMonitor,
}

impl RagOrchestrator {
    /// Build an orchestrator from explicit collaborators.
    pub fn new(
        config: RagConfig,
        embeddings: Arc<dyn EmbeddingProvider>,
        generator: Arc<dyn GenerationProvider>,
        records: Arc<dyn RecordStore>,
    ) -> Result<Self> {
        config.validate()?;

        if !embeddings.supports_embeddings() {
            return Err(RagError::BackendUnavailable(format!(
                "embedding provider {} cannot produce embeddings",
                embeddings.name()
            )));
        }

        let dimension = config.embedding.dimension;
        if embeddings.dimension() != dimension {
            return Err(RagError::Config(format!(
                "provider {} produces {}-dimensional embeddings, configured dimension is {dimension}",
                embeddings.name(),
                embeddings.dimension()
            )));
        }

        let cache = Arc::new(Cache::new(config.cache.max_size, config.cache.ttl()));
        let embedder = CachedEmbedder::new(embeddings, cache, dimension)?;
        let index = VectorIndex::new(dimension, config.index.config.clone())?;
        let store = RetrievalStore::new(embedder, index, records, &config)?;
        let processor = DocumentProcessor::new(config.chunking.clone())?;
        let monitor = MemoryMonitor::from_config(&config.memory);

        info!(
            "RAG orchestrator ready: model={}, dimension={dimension}, backend={}",
            store.embedder().model(),
            store.backend_kind()
        );

        Ok(Self {
            config,
            processor,
            store: Arc::new(store),
            generator,
            guard: InputGuard::default(),
            monitor,
        })
    }

    /// Build providers and a JSON record store from `config`, then restore
    /// the saved index.
    ///
    /// A missing index is rebuilt from the records; a corrupted one is
    /// rebuilt as well, with a warning.
    pub fn open(mut config: RagConfig) -> Result<Self> {
        config.index.path = Some(config.index_path());
        let records: Arc<dyn RecordStore> = Arc::new(JsonRecordStore::open(config.records_path())?);
        let embeddings = embedding_provider(&config.embedding);
        let generator = generation_provider(&config);

        let orchestrator = Self::new(config, embeddings, generator, Arc::clone(&records))?;

        match orchestrator.store.load_index() {
            Ok(true) => {
                orchestrator.store.reconcile()?;
            }
            Ok(false) => {
                if !records.is_empty()? {
                    info!("No saved index; rebuilding from stored records");
                    orchestrator.store.rebuild_from_store(None)?;
                }
            }
            Err(RagError::IndexCorruption(reason)) => {
                warn!("Saved index is corrupted ({reason}); rebuilding from stored records");
                orchestrator.store.rebuild_from_store(None)?;
            }
            Err(e) => return Err(e),
        }
        Ok(orchestrator)
    }

    /// Replace the default input limits.
    pub fn with_guard(mut self, guard: InputGuard) -> Self {
        self.guard = guard;
        self
    }

    pub fn config(&self) -> &RagConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<RetrievalStore> {
        &self.store
    }

    pub fn monitor(&self) -> &MemoryMonitor {
        &self.monitor
    }

    pub fn stats(&self) -> Result<StoreStats> {
        self.store.stats()
    }

    fn completion_params(&self) -> CompletionParams {
        CompletionParams {
            model: self.config.generation.model.clone(),
            temperature: self.config.generation.temperature,
            max_tokens: self.config.generation.max_tokens,
        }
    }

    fn prompt(&self, query: &str, results: &[RetrievalResult]) -> Vec<ChatMessage> {
        let context = build_context(results, self.config.retrieval.max_context_chars);
        vec![
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user(format!("Context:\n{context}\n\nQuestion: {query}")),
        ]
    }

    /// Validate the query and fetch its context.
    async fn retrieve(
        &self,
        text: &str,
        options: &QueryOptions,
    ) -> Result<(String, Vec<RetrievalResult>)> {
        let query = self.guard.sanitize_query(text)?;
        self.guard.validate_scope(&options.scope)?;
        let limit = options
            .max_results
            .unwrap_or(self.config.retrieval.max_results);
        self.guard.validate_limit(limit)?;

        let results = self
            .store
            .similarity_search(
                &query,
                &options.scope,
                &options.filters,
                limit,
                self.config.retrieval.similarity_threshold,
            )
            .await?;
        Ok((query, results))
    }

    /// Answer a question. Never fails; see [`RagResponse::is_degraded`].
    pub async fn query(&self, text: &str, options: &QueryOptions) -> RagResponse {
        let started = Instant::now();
        let mut response = match self.answer(text, options).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Query failed, returning degraded response: {e}");
                RagResponse::degraded(&e)
            }
        };
        response.metadata.insert(
            "latency_ms".to_string(),
            json!(started.elapsed().as_millis() as u64),
        );
        response
    }

    async fn answer(&self, text: &str, options: &QueryOptions) -> Result<RagResponse> {
        let (query, results) = self.retrieve(text, options).await?;
        if results.is_empty() {
            debug!("No context found for query in scope {}", options.scope);
            return Ok(RagResponse::insufficient_context(options.include_sources));
        }

        let completion = self
            .generator
            .chat_completion(&self.prompt(&query, &results), &self.completion_params())
            .await
            .map_err(|e| RagError::Generation(e.to_string()))?;

        let mut metadata = Metadata::new();
        metadata.insert("results".to_string(), json!(results.len()));
        metadata.insert("scope".to_string(), json!(options.scope));
        metadata.insert("model".to_string(), json!(completion.model));
        metadata.insert("generator".to_string(), json!(self.generator.name()));
        if let Some(usage) = &completion.usage {
            metadata.insert("usage".to_string(), serde_json::to_value(usage)?);
        }
        if let Some(reason) = &completion.finish_reason {
            metadata.insert("finish_reason".to_string(), json!(reason));
        }

        Ok(RagResponse {
            response: completion.content,
            confidence: confidence(&results),
            sources: options.include_sources.then_some(results),
            metadata,
        })
    }

    /// Answer a question as a token stream.
    ///
    /// Failures arrive as a single [`StreamEvent::Error`]; a question without
    /// relevant context streams the insufficient-context answer.
    pub async fn query_stream(&self, text: &str, options: &QueryOptions) -> TokenStream {
        match self.start_stream(text, options).await {
            Ok(Some(stream)) => stream,
            Ok(None) => ready_stream(vec![
                StreamEvent::Token(INSUFFICIENT_CONTEXT_RESPONSE.to_string()),
                StreamEvent::Done,
            ]),
            Err(e) => {
                warn!("Streaming query failed: {e}");
                ready_stream(vec![StreamEvent::Error(e.to_string())])
            }
        }
    }

    async fn start_stream(&self, text: &str, options: &QueryOptions) -> Result<Option<TokenStream>> {
        let (query, results) = self.retrieve(text, options).await?;
        if results.is_empty() {
            return Ok(None);
        }
        let stream = self
            .generator
            .stream_chat_completion(&self.prompt(&query, &results), &self.completion_params())
            .await
            .map_err(|e| RagError::Generation(e.to_string()))?;
        Ok(Some(stream))
    }

    /// Chunk, embed, and store one document.
    pub async fn ingest(&self, document: &Document, scope: &str) -> Result<IngestReport> {
        self.guard.validate_document(document)?;
        self.guard.validate_scope(scope)?;

        let chunks = self.processor.process(
            &document.content,
            &document.document_id,
            document.document_type,
            &document.metadata,
        );
        let chunk_ids = if chunks.is_empty() {
            debug!("Document {} produced no chunks", document.document_id);
            Vec::new()
        } else {
            self.store.add_documents(&chunks, scope).await?
        };

        info!(
            "Ingested document {} ({} chunks) into scope {scope}",
            document.document_id,
            chunk_ids.len()
        );
        Ok(IngestReport {
            document_id: document.document_id.clone(),
            chunk_ids,
        })
    }

    /// Ingest documents one by one. A failing document is reported and the
    /// batch continues.
    pub async fn ingest_batch(&self, documents: &[Document], scope: &str) -> BatchReport {
        let mut report = BatchReport::default();
        if let Err(e) = self.guard.validate_batch(documents.len()) {
            report.failed = documents
                .iter()
                .map(|d| IngestFailure {
                    document_id: d.document_id.clone(),
                    error: e.to_string(),
                })
                .collect();
            return report;
        }

        for document in documents {
            match self.ingest(document, scope).await {
                Ok(ingested) => report.succeeded.push(ingested),
                Err(e) => {
                    warn!("Failed to ingest document {}: {e}", document.document_id);
                    report.failed.push(IngestFailure {
                        document_id: document.document_id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            "Batch ingest: {} documents succeeded, {} failed, {} chunks",
            report.succeeded.len(),
            report.failed.len(),
            report.total_chunks()
        );
        report
    }

    /// Register cache-clearing callbacks and start the memory monitor.
    ///
    /// Must be called inside a tokio runtime. Returns `false` if already running.
    pub fn start_memory_monitoring(&self) -> bool {
        if self.monitor.callback_count() == 0 {
            for (name, callback) in self.store.cleanup_callbacks() {
                self.monitor.register_callback(name, callback);
            }
        }
        self.monitor.start()
    }

    /// Stop background work and save the index if it has a path.
    pub async fn shutdown(&self) {
        self.monitor.stop().await;
        if self.store.index_path().is_some() {
            match self.store.save_index() {
                Ok(()) => info!("Index saved on shutdown"),
                Err(e) => error!("Failed to save index on shutdown: {e}"),
            }
        }
    }
}
