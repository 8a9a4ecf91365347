//! The document processor: preprocessing, chunking, and metadata stamping.

use serde_json::Value;
use tracing::debug;

use crate::chunker::{ChunkerConfig, chunk_text};
use crate::error::Result;
use crate::preprocess::Preprocessor;
use crate::types::{DocumentChunk, DocumentType, Metadata};

/// Turns raw document content into chunks ready for embedding.
pub struct DocumentProcessor {
    config: ChunkerConfig,
    preprocessor: Preprocessor,
}

impl DocumentProcessor {
    /// Create a processor, rejecting inconsistent configuration.
    pub fn new(config: ChunkerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            preprocessor: Preprocessor::new()?,
        })
    }

    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Split a document into chunks.
    ///
    /// Whitespace-only content yields no chunks. Caller metadata overrides
    /// anything preprocessing found; structural keys such as `chunk_index`
    /// are always set by the processor.
    pub fn process(
        &self,
        content: &str,
        document_id: &str,
        document_type: DocumentType,
        metadata: &Metadata,
    ) -> Vec<DocumentChunk> {
        if content.trim().is_empty() {
            return Vec::new();
        }

        let mut base = Metadata::new();
        let text = if self.config.preprocess {
            self.preprocessor
                .preprocess(content, document_type, &mut base)
        } else {
            content.to_string()
        };

        for (key, value) in metadata {
            base.insert(key.clone(), value.clone());
        }

        let spans: Vec<_> = chunk_text(&text, &self.config)
            .into_iter()
            .filter(|span| span.len() >= self.config.min_chunk_size)
            .collect();

        let total = spans.len();
        let strategy = self.config.strategy.as_str();

        let chunks: Vec<DocumentChunk> = spans
            .into_iter()
            .enumerate()
            .map(|(index, span)| {
                let mut chunk_metadata = base.clone();
                chunk_metadata.insert("chunk_index".to_string(), index.into());
                chunk_metadata.insert("total_chunks".to_string(), total.into());
                chunk_metadata.insert(
                    "relative_position".to_string(),
                    Value::from(index as f64 / total as f64),
                );
                chunk_metadata.insert(
                    "word_count".to_string(),
                    span.text.split_whitespace().count().into(),
                );
                chunk_metadata.insert("character_count".to_string(), span.len().into());
                chunk_metadata.insert("chunking_strategy".to_string(), strategy.into());

                DocumentChunk::new(span.text, document_id, document_type, index, chunk_metadata)
                    .with_offsets(span.start, span.end)
            })
            .collect();

        debug!(
            "Processed document {document_id} ({document_type}) into {} chunks",
            chunks.len()
        );
        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::ChunkingStrategy;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_three_sentence_sample_is_one_chunk() {
        let processor = DocumentProcessor::new(ChunkerConfig::default()).unwrap();
        let chunks = processor.process(
            "A cat sat. A dog ran. A bird flew.",
            "animals",
            DocumentType::Text,
            &Metadata::new(),
        );

        assert_eq!(chunks.len(), 1);
        let chunk = &chunks[0];
        assert_eq!(chunk.content, "A cat sat. A dog ran. A bird flew.");
        assert_eq!(chunk.chunk_index, 0);
        assert_eq!(chunk.metadata["total_chunks"], 1);
        assert_eq!(chunk.metadata["relative_position"], 0.0);
        assert_eq!(chunk.metadata["word_count"], 9);
        assert_eq!(chunk.metadata["character_count"], 34);
        assert_eq!(chunk.metadata["chunking_strategy"], "sentence");
        assert_eq!(chunk.metadata["detected_language"], "en");
        assert_eq!((chunk.start_offset, chunk.end_offset), (Some(0), Some(34)));
    }

    #[test]
    fn test_empty_content_yields_no_chunks() {
        let processor = DocumentProcessor::new(ChunkerConfig::default()).unwrap();
        assert!(
            processor
                .process("  \n\t ", "empty", DocumentType::Text, &Metadata::new())
                .is_empty()
        );
    }

    #[test]
    fn test_invalid_config_fails_fast() {
        assert!(DocumentProcessor::new(ChunkerConfig::fixed_size(10, 10)).is_err());
    }

    #[test]
    fn test_short_chunks_are_dropped_before_stamping() {
        let config = ChunkerConfig {
            chunk_size: 30,
            min_chunk_size: 10,
            ..ChunkerConfig::default()
        };
        let processor = DocumentProcessor::new(config).unwrap();
        let chunks = processor.process(
            "This sentence is long enough to stay. Tiny.",
            "doc",
            DocumentType::Text,
            &Metadata::new(),
        );

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].metadata["total_chunks"], 1);
    }

    #[test]
    fn test_caller_metadata_wins_over_preprocessing() {
        let processor = DocumentProcessor::new(ChunkerConfig::default()).unwrap();
        let mut metadata = Metadata::new();
        metadata.insert("title".to_string(), "Caller title".into());
        metadata.insert("source".to_string(), "unit-test".into());

        let chunks = processor.process(
            "# Markdown title\n\nBody text that is long enough to keep.",
            "doc",
            DocumentType::Markdown,
            &metadata,
        );

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].metadata["title"], "Caller title");
        assert_eq!(chunks[0].metadata["source"], "unit-test");
        assert!(chunks[0].metadata.contains_key("headers"));
    }

    #[test]
    fn test_fixed_size_positions() {
        let config = ChunkerConfig::fixed_size(100, 20).with_strategy(ChunkingStrategy::FixedSize);
        let processor = DocumentProcessor::new(config).unwrap();
        let text = "word ".repeat(60);

        let chunks = processor.process(&text, "doc", DocumentType::Text, &Metadata::new());

        let total = chunks.len();
        assert!(total >= 3);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_index, i);
            assert_eq!(chunk.metadata["relative_position"], i as f64 / total as f64);
            assert!(chunk.content.chars().count() <= 100);
        }
    }
}
