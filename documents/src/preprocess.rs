//! Type-specific cleanup applied before chunking.
//!
//! Each path returns plain text and records what it learned about the
//! document (titles, headers, links, language) into a metadata map.

use regex_lite::Regex;
use serde_json::{Value, json};
use tracing::debug;

use crate::error::Result;
use crate::types::{DocumentType, Metadata};

/// Share of ASCII characters above which text is tagged as English.
const ASCII_RATIO_EN: f64 = 0.95;

/// Minimum keyword matches before a programming language is reported.
const MIN_LANGUAGE_MATCHES: usize = 2;

const LANGUAGE_PATTERNS: &[(&str, &[&str])] = &[
    (
        "python",
        &[
            r"(?m)^\s*def\s+\w+\s*\(",
            r"(?m)^\s*(from\s+\w+\s+)?import\s+\w+",
            r"\bself\.",
            r"\belif\b",
            r"\bprint\(",
        ],
    ),
    (
        "rust",
        &[
            r"\bfn\s+\w+",
            r"\blet\s+mut\b",
            r"\bimpl\b",
            r"\bpub\s+(fn|struct|enum|mod)\b",
            r"\buse\s+\w+::",
        ],
    ),
    (
        "javascript",
        &[
            r"\bfunction\b",
            r"\b(const|let)\s+\w+\s*=",
            r"=>",
            r"console\.log",
            r"\brequire\(",
        ],
    ),
    (
        "java",
        &[
            r"\bpublic\s+class\b",
            r"System\.out\.println",
            r"\bprivate\s+\w+\s+\w+",
            r"@Override",
        ],
    ),
    (
        "go",
        &[
            r"\bfunc\s+\w+",
            r"(?m)^package\s+\w+",
            r":=",
            r"\bfmt\.",
        ],
    ),
    (
        "c",
        &[
            r"#include\s*<",
            r"\bint\s+main\s*\(",
            r"\bprintf\(",
            r"\bstd::",
        ],
    ),
];

struct Patterns {
    script_style: Regex,
    title: Regex,
    meta_description: Regex,
    meta_content: Regex,
    block_tags: Regex,
    any_tag: Regex,
    blank_runs: Regex,
    md_header: Regex,
    md_header_marker: Regex,
    md_fence: Regex,
    md_link: Regex,
    md_bold: Regex,
    md_italic: Regex,
    md_inline_code: Regex,
    line_comment: Regex,
    block_comment: Regex,
    hash_comment: Regex,
}

/// Compiled preprocessing rules.
pub struct Preprocessor {
    patterns: Patterns,
    languages: Vec<(&'static str, Vec<Regex>)>,
}

impl Preprocessor {
    /// Compile the built-in rules.
    pub fn new() -> Result<Self> {
        let patterns = Patterns {
            script_style: Regex::new(r"(?is)<(script|style)[^>]*>.*?</(script|style)\s*>")?,
            title: Regex::new(r"(?is)<title[^>]*>(.*?)</title\s*>")?,
            meta_description: Regex::new(
                r#"(?is)<meta\s+[^>]*name\s*=\s*["']description["'][^>]*>"#,
            )?,
            meta_content: Regex::new(r#"(?is)content\s*=\s*["']([^"']*)["']"#)?,
            block_tags: Regex::new(
                r"(?i)</?(p|div|br|li|ul|ol|h[1-6]|tr|table|section|article|header|footer|blockquote|pre|title)(\s[^>]*)?/?>",
            )?,
            any_tag: Regex::new(r"(?s)<[^>]+>")?,
            blank_runs: Regex::new(r"\n{3,}")?,
            md_header: Regex::new(r"(?m)^(#{1,6})\s+(.+?)\s*#*\s*$")?,
            md_header_marker: Regex::new(r"(?m)^#{1,6}\s+")?,
            md_fence: Regex::new(r"(?m)^\s*```.*$")?,
            md_link: Regex::new(r"!?\[([^\]]*)\]\(([^)\s]+)[^)]*\)")?,
            md_bold: Regex::new(r"(\*\*|__)([^*_\n]+)(\*\*|__)")?,
            md_italic: Regex::new(r"\*([^*\n]+)\*")?,
            md_inline_code: Regex::new(r"`([^`\n]+)`")?,
            line_comment: Regex::new(r"(?m)//+\s?(.*)$")?,
            block_comment: Regex::new(r"(?s)/\*+(.*?)\*/")?,
            hash_comment: Regex::new(r"(?m)^\s*#\s?(.*)$")?,
        };

        let mut languages = Vec::with_capacity(LANGUAGE_PATTERNS.len());
        for (language, sources) in LANGUAGE_PATTERNS {
            let compiled = sources
                .iter()
                .map(|source| Regex::new(source))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            languages.push((*language, compiled));
        }

        Ok(Self {
            patterns,
            languages,
        })
    }

    /// Clean `content` for its type, recording findings into `metadata`.
    pub fn preprocess(
        &self,
        content: &str,
        document_type: DocumentType,
        metadata: &mut Metadata,
    ) -> String {
        let content = content.replace("\r\n", "\n");
        let text = match document_type {
            DocumentType::Html => self.html(&content, metadata),
            DocumentType::Markdown => self.markdown(&content, metadata),
            DocumentType::Code => {
                self.code(&content, metadata);
                content
            }
            DocumentType::Text | DocumentType::Json => content,
        };

        let text = text.trim().to_string();
        metadata.insert(
            "detected_language".to_string(),
            Value::String(detect_language(&text).to_string()),
        );
        text
    }

    fn html(&self, content: &str, metadata: &mut Metadata) -> String {
        let p = &self.patterns;

        if let Some(title) = p.title.captures(content).and_then(|c| c.get(1)) {
            let title = decode_entities(title.as_str().trim());
            if !title.is_empty() {
                metadata.insert("title".to_string(), Value::String(title));
            }
        }

        if let Some(description) = p
            .meta_description
            .find(content)
            .and_then(|tag| p.meta_content.captures(tag.as_str()))
            .and_then(|c| c.get(1))
        {
            metadata.insert(
                "description".to_string(),
                Value::String(decode_entities(description.as_str().trim())),
            );
        }

        let text = p.script_style.replace_all(content, "");
        let text = p.block_tags.replace_all(&text, "\n");
        let text = p.any_tag.replace_all(&text, "");
        let text = decode_entities(&text);
        normalize_lines(&p.blank_runs, &text)
    }

    fn markdown(&self, content: &str, metadata: &mut Metadata) -> String {
        let p = &self.patterns;

        let headers: Vec<Value> = p
            .md_header
            .captures_iter(content)
            .map(|c| {
                let level = c.get(1).map_or(1, |m| m.as_str().len());
                let text = c.get(2).map_or("", |m| m.as_str());
                json!({ "level": level, "text": text })
            })
            .collect();

        if !metadata.contains_key("title") {
            let first_h1 = headers
                .iter()
                .find(|h| h["level"] == 1)
                .and_then(|h| h["text"].as_str())
                .map(str::to_string);
            if let Some(title) = first_h1 {
                metadata.insert("title".to_string(), Value::String(title));
            }
        }
        if !headers.is_empty() {
            metadata.insert("headers".to_string(), Value::Array(headers));
        }

        let links: Vec<Value> = p
            .md_link
            .captures_iter(content)
            .map(|c| {
                json!({
                    "text": c.get(1).map_or("", |m| m.as_str()),
                    "url": c.get(2).map_or("", |m| m.as_str()),
                })
            })
            .collect();
        if !links.is_empty() {
            metadata.insert("links".to_string(), Value::Array(links));
        }

        let text = p.md_fence.replace_all(content, "");
        let text = p.md_header_marker.replace_all(&text, "");
        let text = p.md_link.replace_all(&text, "${1}");
        let text = p.md_bold.replace_all(&text, "${2}");
        let text = p.md_italic.replace_all(&text, "${1}");
        let text = p.md_inline_code.replace_all(&text, "${1}");
        normalize_lines(&p.blank_runs, &text)
    }

    fn code(&self, content: &str, metadata: &mut Metadata) {
        let language = self.guess_language(content);
        if let Some(language) = language {
            metadata.insert(
                "programming_language".to_string(),
                Value::String(language.to_string()),
            );
        }

        let p = &self.patterns;
        let mut comments: Vec<Value> = Vec::new();
        let mut push = |text: &str| {
            let text = text.trim();
            if !text.is_empty() {
                comments.push(Value::String(text.to_string()));
            }
        };

        if language == Some("python") {
            for c in p.hash_comment.captures_iter(content) {
                push(c.get(1).map_or("", |m| m.as_str()));
            }
        } else {
            for c in p.line_comment.captures_iter(content) {
                push(c.get(1).map_or("", |m| m.as_str()));
            }
            for c in p.block_comment.captures_iter(content) {
                push(c.get(1).map_or("", |m| m.as_str()));
            }
        }

        debug!(
            "Extracted {} comments from code ({:?})",
            comments.len(),
            language
        );
        if !comments.is_empty() {
            metadata.insert("comments".to_string(), Value::Array(comments));
        }
    }

    /// Best-scoring language with at least two keyword matches.
    pub fn guess_language(&self, content: &str) -> Option<&'static str> {
        let mut best: Option<(&'static str, usize)> = None;
        for (language, patterns) in &self.languages {
            let score = patterns.iter().filter(|re| re.is_match(content)).count();
            if score >= MIN_LANGUAGE_MATCHES && best.is_none_or(|(_, s)| score > s) {
                best = Some((language, score));
            }
        }
        best.map(|(language, _)| language)
    }
}

/// `"en"` when nearly all characters are ASCII, `"unknown"` otherwise.
pub fn detect_language(text: &str) -> &'static str {
    let total = text.chars().count();
    if total == 0 {
        return "unknown";
    }
    let ascii = text.chars().filter(char::is_ascii).count();
    if ascii as f64 / total as f64 > ASCII_RATIO_EN {
        "en"
    } else {
        "unknown"
    }
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn normalize_lines(blank_runs: &Regex, text: &str) -> String {
    let trimmed: Vec<&str> = text.lines().map(str::trim).collect();
    blank_runs
        .replace_all(&trimmed.join("\n"), "\n\n")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn run(content: &str, document_type: DocumentType) -> (String, Metadata) {
        let preprocessor = Preprocessor::new().unwrap();
        let mut metadata = Metadata::new();
        let text = preprocessor.preprocess(content, document_type, &mut metadata);
        (text, metadata)
    }

    #[test]
    fn test_html_strips_markup_and_extracts_head() {
        let html = r#"<html><head><title>Guide &amp; Notes</title>
<meta name="description" content="A short guide">
<style>body { color: red; }</style></head>
<body><h1>Intro</h1><p>First <b>bold</b> paragraph.</p>
<script>alert("x")</script><div>Second &lt;para&gt;</div></body></html>"#;

        let (text, metadata) = run(html, DocumentType::Html);

        assert_eq!(metadata["title"], "Guide & Notes");
        assert_eq!(metadata["description"], "A short guide");
        assert!(text.contains("First bold paragraph."));
        assert!(text.contains("Second <para>"));
        assert!(!text.contains("alert"));
        assert!(!text.contains("color: red"));
        assert!(!text.contains('<') || text.contains("<para>"));
    }

    #[test]
    fn test_markdown_headers_links_and_emphasis() {
        let md = "# Title\n\nSome **bold** and *italic* with `code`.\n\n## Section\n\nSee [the docs](https://example.com/docs).\n\n```rust\nfn main() {}\n```\n";

        let (text, metadata) = run(md, DocumentType::Markdown);

        assert_eq!(metadata["title"], "Title");
        assert_eq!(
            metadata["headers"],
            json!([{"level": 1, "text": "Title"}, {"level": 2, "text": "Section"}])
        );
        assert_eq!(
            metadata["links"],
            json!([{"text": "the docs", "url": "https://example.com/docs"}])
        );
        assert!(text.contains("Some bold and italic with code."));
        assert!(text.contains("See the docs."));
        assert!(text.contains("fn main() {}"));
        assert!(!text.contains('#'));
        assert!(!text.contains("```"));
    }

    #[test]
    fn test_code_language_and_comments() {
        let code = "use std::io;\n\n// Entry point\npub fn main() {\n    let mut x = 1; /* counter */\n}\n";

        let (text, metadata) = run(code, DocumentType::Code);

        assert_eq!(metadata["programming_language"], "rust");
        assert_eq!(metadata["comments"], json!(["Entry point", "counter"]));
        assert!(text.contains("pub fn main()"));
    }

    #[test]
    fn test_language_needs_two_matches() {
        let preprocessor = Preprocessor::new().unwrap();
        assert_eq!(preprocessor.guess_language("x => y"), None);
        assert_eq!(
            preprocessor.guess_language("def run(self):\n    print(self.name)\n"),
            Some("python")
        );
    }

    #[test]
    fn test_detected_language() {
        assert_eq!(detect_language("plain english text"), "en");
        assert_eq!(detect_language("日本語のテキストです"), "unknown");
        let (_, metadata) = run("Hello there.", DocumentType::Text);
        assert_eq!(metadata["detected_language"], "en");
    }
}
