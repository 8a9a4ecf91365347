//! Input validation applied at every orchestrator entry point.

use ragcore_documents::Document;
use serde::{Deserialize, Serialize};

use crate::error::{RagError, Result};

/// Limits on caller-supplied input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputGuard {
    pub max_query_chars: usize,
    pub max_document_chars: usize,
    pub max_results: usize,
    pub max_scope_chars: usize,
    pub max_batch_documents: usize,
}

impl Default for InputGuard {
    fn default() -> Self {
        Self {
            max_query_chars: 10_000,
            max_document_chars: 10_000_000,
            max_results: 100,
            max_scope_chars: 128,
            max_batch_documents: 1_000,
        }
    }
}

impl InputGuard {
    /// Trim the query and drop control characters other than newlines and tabs.
    pub fn sanitize_query(&self, query: &str) -> Result<String> {
        let cleaned: String = query
            .trim()
            .chars()
            .filter(|c| !c.is_control() || matches!(c, '\n' | '\t'))
            .collect();

        if cleaned.is_empty() {
            return Err(RagError::Validation("query is empty".to_string()));
        }
        let chars = cleaned.chars().count();
        if chars > self.max_query_chars {
            return Err(RagError::Validation(format!(
                "query has {chars} characters, limit is {}",
                self.max_query_chars
            )));
        }
        Ok(cleaned)
    }

    /// Scopes are short identifiers: letters, digits, `-`, `_`, `.`, `:`, `/`.
    pub fn validate_scope(&self, scope: &str) -> Result<()> {
        if scope.is_empty() {
            return Err(RagError::Validation("scope is empty".to_string()));
        }
        if scope.chars().count() > self.max_scope_chars {
            return Err(RagError::Validation(format!(
                "scope exceeds {} characters",
                self.max_scope_chars
            )));
        }
        if let Some(bad) = scope
            .chars()
            .find(|c| !(c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | ':' | '/')))
        {
            return Err(RagError::Validation(format!(
                "scope contains invalid character {bad:?}"
            )));
        }
        Ok(())
    }

    pub fn validate_limit(&self, limit: usize) -> Result<()> {
        if limit == 0 || limit > self.max_results {
            return Err(RagError::Validation(format!(
                "result limit must be within 1..={}, got {limit}",
                self.max_results
            )));
        }
        Ok(())
    }

    pub fn validate_document(&self, document: &Document) -> Result<()> {
        if document.document_id.trim().is_empty() {
            return Err(RagError::Validation("document_id is empty".to_string()));
        }
        let chars = document.content.chars().count();
        if chars > self.max_document_chars {
            return Err(RagError::Validation(format!(
                "document {} has {chars} characters, limit is {}",
                document.document_id, self.max_document_chars
            )));
        }
        Ok(())
    }

    pub fn validate_batch(&self, size: usize) -> Result<()> {
        if size > self.max_batch_documents {
            return Err(RagError::Validation(format!(
                "batch of {size} documents exceeds limit of {}",
                self.max_batch_documents
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use ragcore_documents::DocumentType;

    #[test]
    fn test_sanitize_query() {
        let guard = InputGuard::default();
        assert_eq!(
            guard.sanitize_query("  what is\u{0007} rust?\n").unwrap(),
            "what is rust?"
        );
        assert!(guard.sanitize_query("   ").is_err());
        assert!(guard.sanitize_query("\u{0000}").is_err());

        let long = "a".repeat(guard.max_query_chars + 1);
        assert!(matches!(
            guard.sanitize_query(&long),
            Err(RagError::Validation(_))
        ));
    }

    #[test]
    fn test_validate_scope() {
        let guard = InputGuard::default();
        assert!(guard.validate_scope("team-a/project_1").is_ok());
        assert!(guard.validate_scope("").is_err());
        assert!(guard.validate_scope("has space").is_err());
        assert!(guard.validate_scope(&"s".repeat(129)).is_err());
    }

    #[test]
    fn test_validate_limits() {
        let guard = InputGuard::default();
        assert!(guard.validate_limit(5).is_ok());
        assert!(guard.validate_limit(0).is_err());
        assert!(guard.validate_limit(101).is_err());
        assert!(guard.validate_batch(1_000).is_ok());
        assert!(guard.validate_batch(1_001).is_err());
    }

    #[test]
    fn test_validate_document() {
        let guard = InputGuard {
            max_document_chars: 10,
            ..InputGuard::default()
        };
        assert!(guard
            .validate_document(&Document::new("short", "doc", DocumentType::Text))
            .is_ok());
        assert!(guard
            .validate_document(&Document::new("far too long here", "doc", DocumentType::Text))
            .is_err());
        assert!(guard
            .validate_document(&Document::new("short", " ", DocumentType::Text))
            .is_err());
    }
}
