//! Turning command-line paths into documents.

use std::path::{Path, PathBuf};

use ragcore_retrieval::{Document, DocumentType, Metadata};
use serde_json::json;
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with('.'))
}

/// Every regular file under `paths`, sorted. Hidden files and directories
/// below a given root are skipped.
pub fn collect_files(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for root in paths {
        let walker = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| !is_hidden(e));
        for entry in walker {
            match entry {
                Ok(entry) if entry.file_type().is_file() => files.push(entry.into_path()),
                Ok(_) => {}
                Err(e) => warn!("Skipping unreadable path under {}: {e}", root.display()),
            }
        }
    }
    files.sort();
    files.dedup();
    files
}

/// Read a file as a document keyed by its path. Non-UTF-8 files yield `None`.
pub fn load_document(path: &Path) -> Option<Document> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            warn!("Skipping {}: {e}", path.display());
            return None;
        }
    };
    let document_type = DocumentType::from_path(path);
    debug!("Loaded {} as {document_type:?}", path.display());

    let mut metadata = Metadata::new();
    metadata.insert("source_path".to_string(), json!(path.display().to_string()));
    Some(Document::new(content, path.display().to_string(), document_type).with_metadata(metadata))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_collect_files_walks_directories() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("guide/nested")).unwrap();
        std::fs::create_dir_all(root.join(".git")).unwrap();
        std::fs::write(root.join("guide/intro.md"), "# Intro").unwrap();
        std::fs::write(root.join("guide/nested/lib.rs"), "fn main() {}").unwrap();
        std::fs::write(root.join(".git/HEAD"), "ref").unwrap();
        std::fs::write(root.join(".env"), "SECRET=1").unwrap();

        let files = collect_files(&[root.to_path_buf(), root.join("guide/intro.md")]);

        assert_eq!(
            files,
            vec![root.join("guide/intro.md"), root.join("guide/nested/lib.rs")]
        );
    }

    #[test]
    fn test_load_document_detects_type() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.md");
        std::fs::write(&path, "# Notes\n\nSome text.").unwrap();

        let document = load_document(&path).unwrap();
        assert_eq!(document.document_type, DocumentType::Markdown);
        assert_eq!(document.document_id, path.display().to_string());

        std::fs::write(dir.path().join("blob.bin"), [0xff, 0xfe, 0x00]).unwrap();
        assert!(load_document(&dir.path().join("blob.bin")).is_none());
    }
}
