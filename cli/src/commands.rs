//! Subcommand implementations.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, bail};
use ragcore_retrieval::{
    QueryOptions, RagConfig, RagOrchestrator, RagResponse, RetrievalResult, SearchFilters,
    StoreStats, StreamEvent,
};
use tracing::{info, warn};

use crate::files::{collect_files, load_document};

fn open(config: RagConfig) -> anyhow::Result<RagOrchestrator> {
    let records = config.records_path();
    RagOrchestrator::open(config)
        .with_context(|| format!("failed to open record store {}", records.display()))
}

pub async fn ingest(config: RagConfig, paths: &[PathBuf], scope: &str) -> anyhow::Result<()> {
    let monitor_memory = config.memory.enabled;
    let rag = open(config)?;
    if monitor_memory {
        rag.start_memory_monitoring();
    }

    let files = collect_files(paths);
    if files.is_empty() {
        bail!("no files found under the given paths");
    }
    let documents: Vec<_> = files.iter().filter_map(|p| load_document(p.as_path())).collect();
    info!("Ingesting {} of {} files", documents.len(), files.len());

    let report = rag.ingest_batch(&documents, scope).await;
    rag.shutdown().await;

    for failure in &report.failed {
        eprintln!("failed: {}: {}", failure.document_id, failure.error);
    }
    println!(
        "Ingested {} documents ({} chunks) into scope {scope}; {} failed",
        report.succeeded.len(),
        report.total_chunks(),
        report.failed.len()
    );

    if report.succeeded.is_empty() && !report.failed.is_empty() {
        bail!("every document failed to ingest");
    }
    Ok(())
}

/// Arguments of `ragcore query`.
#[derive(Debug)]
pub struct QueryRequest {
    pub question: String,
    pub scope: String,
    pub max_results: Option<usize>,
    pub stream: bool,
    pub retrieve_only: bool,
    pub json: bool,
}

impl QueryRequest {
    fn options(&self) -> QueryOptions {
        let options = QueryOptions::default().with_scope(self.scope.clone());
        match self.max_results {
            Some(k) => options.with_max_results(k),
            None => options,
        }
    }
}

pub async fn query(config: RagConfig, request: QueryRequest) -> anyhow::Result<()> {
    let rag = open(config)?;

    if request.retrieve_only {
        let limit = request
            .max_results
            .unwrap_or(rag.config().retrieval.max_results);
        let results = rag
            .store()
            .similarity_search(
                &request.question,
                &request.scope,
                &SearchFilters::default(),
                limit,
                rag.config().retrieval.similarity_threshold,
            )
            .await?;
        if request.json {
            println!("{}", serde_json::to_string_pretty(&results)?);
        } else {
            print_sources(&results);
        }
        return Ok(());
    }

    if request.stream {
        let mut stream = rag.query_stream(&request.question, &request.options()).await;
        let mut stdout = std::io::stdout();
        while let Some(event) = stream.recv().await {
            match event {
                StreamEvent::Token(token) => {
                    stdout.write_all(token.as_bytes())?;
                    stdout.flush()?;
                }
                StreamEvent::Done => break,
                StreamEvent::Error(message) => {
                    writeln!(stdout)?;
                    bail!("generation failed: {message}");
                }
            }
        }
        writeln!(stdout)?;
        return Ok(());
    }

    let response = rag.query(&request.question, &request.options()).await;
    if request.json {
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else {
        print_response(&response);
    }
    if response.is_degraded() {
        let reason = response
            .metadata
            .get("error")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("unknown error");
        bail!("query failed: {reason}");
    }
    Ok(())
}

fn print_response(response: &RagResponse) {
    println!("{}", response.response);
    println!();
    println!("confidence: {:.2}", response.confidence);
    if let Some(sources) = response.sources.as_deref().filter(|s| !s.is_empty()) {
        println!();
        print_sources(sources);
    }
}

fn print_sources(results: &[RetrievalResult]) {
    if results.is_empty() {
        println!("No matching sources.");
        return;
    }
    for result in results {
        println!(
            "[{}] {} (chunk {}, score {:.3})",
            result.rank,
            result.chunk.document_id,
            result.chunk.chunk_index,
            result.similarity_score
        );
    }
}

pub fn stats(config: RagConfig, json: bool) -> anyhow::Result<()> {
    let rag = open(config)?;
    let stats = rag.stats()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        print_stats(&stats);
    }
    Ok(())
}

fn print_stats(stats: &StoreStats) {
    let index = &stats.index;
    println!(
        "index:     {} backend ({:?} mode), {} active / {} total vectors, {} rebuilds",
        index.backend,
        index.backend_mode,
        index.active_vectors,
        index.total_vectors,
        index.rebuild_count
    );
    if !index.backend_available {
        println!("           backend unavailable; searches return nothing");
    }
    println!("records:   {}", stats.records);
    println!(
        "caches:    embeddings {}/{} ({} hits, {} misses), results {}/{}",
        stats.embedding_cache.size,
        stats.embedding_cache.max_size,
        stats.embedding_cache.hits,
        stats.embedding_cache.misses,
        stats.result_cache.size,
        stats.result_cache.max_size
    );
    println!(
        "pool:      {} active, {} idle, max {}",
        stats.pool.active, stats.pool.idle, stats.pool.max
    );
}

pub async fn rebuild(config: RagConfig, scope: Option<&str>) -> anyhow::Result<()> {
    let rag = open(config)?;
    let indexed = rag.store().rebuild_from_store(scope)?;
    if indexed == 0 {
        warn!("No stored records to index");
    }
    rag.shutdown().await;
    println!(
        "Rebuilt index with {indexed} records ({} backend)",
        rag.store().backend_kind()
    );
    Ok(())
}
