//! Integration tests for document processing.

use pretty_assertions::assert_eq;
use ragcore_documents::{
    ChunkerConfig, ChunkingStrategy, DocumentProcessor, DocumentType, Metadata,
};

#[test]
fn test_fixed_size_invariants() {
    let config = ChunkerConfig::fixed_size(100, 20).with_min_chunk_size(1);
    let processor = DocumentProcessor::new(config).unwrap();
    let text: String = (0..1000)
        .map(|i| if i % 7 == 6 { ' ' } else { char::from(b'a' + (i % 26) as u8) })
        .collect();

    let chunks = processor.process(&text, "doc", DocumentType::Text, &Metadata::new());

    let (last, rest) = chunks.split_last().unwrap();
    for chunk in rest {
        assert_eq!(chunk.content.chars().count(), 100);
    }
    assert!(last.content.chars().count() <= 100);

    for pair in chunks.windows(2) {
        let tail: String = pair[0].content.chars().skip(80).collect();
        let head: String = pair[1].content.chars().take(20).collect();
        assert_eq!(tail, head);
        assert_eq!(pair[1].start_offset.unwrap() - pair[0].start_offset.unwrap(), 80);
    }
}

#[test]
fn test_html_document_end_to_end() {
    let processor = DocumentProcessor::new(
        ChunkerConfig::default().with_strategy(ChunkingStrategy::Paragraph),
    )
    .unwrap();
    let html = "<html><head><title>Release Notes</title></head><body>\
                <p>Version two adds streaming answers to every client.</p>\
                <p>Version two also fixes index corruption on restart.</p>\
                </body></html>";

    let chunks = processor.process(html, "notes", DocumentType::Html, &Metadata::new());

    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].title(), "Release Notes");
    assert!(chunks[0].content.contains("streaming answers"));
    assert!(chunks[0].content.contains("index corruption"));
    assert!(!chunks[0].content.contains("<p>"));
    assert_eq!(chunks[0].metadata["chunking_strategy"], "paragraph");
}

#[test]
fn test_identical_content_hashes_match_across_documents() {
    let processor = DocumentProcessor::new(ChunkerConfig::default()).unwrap();
    let content = "Shared paragraph that appears in two documents verbatim.";

    let a = processor.process(content, "a", DocumentType::Text, &Metadata::new());
    let b = processor.process(content, "b", DocumentType::Text, &Metadata::new());

    assert_eq!(a[0].content_hash, b[0].content_hash);
    assert_eq!(a[0].document_id, "a");
    assert_eq!(b[0].document_id, "b");
}
