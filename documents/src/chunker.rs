//! Chunking strategies.
//!
//! All sizes are measured in characters. Sentence and paragraph strategies
//! accumulate whole units until the next one would overflow `chunk_size`;
//! the fixed-size strategy slides a window with a constant overlap. A chunk's
//! text is always the source slice between its `start` and `end` offsets.

use serde::{Deserialize, Serialize};

use crate::error::{DocumentError, Result};

/// How text is split into chunks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkingStrategy {
    #[default]
    Sentence,
    Paragraph,
    FixedSize,
    /// Currently chunked like [`ChunkingStrategy::Paragraph`].
    CodeBlocks,
}

impl ChunkingStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sentence => "sentence",
            Self::Paragraph => "paragraph",
            Self::FixedSize => "fixed_size",
            Self::CodeBlocks => "code_blocks",
        }
    }
}

/// Configuration for the chunker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkerConfig {
    /// Target chunk size in characters.
    pub chunk_size: usize,

    /// Overlap between fixed-size windows.
    pub chunk_overlap: usize,

    /// Chunks shorter than this are dropped.
    pub min_chunk_size: usize,

    pub strategy: ChunkingStrategy,

    /// Run type-specific preprocessing first.
    pub preprocess: bool,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 200,
            min_chunk_size: 20,
            strategy: ChunkingStrategy::Sentence,
            preprocess: true,
        }
    }
}

impl ChunkerConfig {
    /// Create a fixed-size configuration.
    pub fn fixed_size(chunk_size: usize, chunk_overlap: usize) -> Self {
        Self {
            chunk_size,
            chunk_overlap,
            strategy: ChunkingStrategy::FixedSize,
            ..Self::default()
        }
    }

    /// Set the strategy.
    pub fn with_strategy(mut self, strategy: ChunkingStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Set the minimum chunk size.
    pub fn with_min_chunk_size(mut self, min_chunk_size: usize) -> Self {
        self.min_chunk_size = min_chunk_size;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(DocumentError::InvalidConfig(
                "chunk_size must be positive".to_string(),
            ));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(DocumentError::InvalidConfig(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        if self.min_chunk_size > self.chunk_size {
            return Err(DocumentError::InvalidConfig(format!(
                "min_chunk_size ({}) must not exceed chunk_size ({})",
                self.min_chunk_size, self.chunk_size
            )));
        }
        Ok(())
    }
}

/// A span of text with its character offsets.
#[derive(Debug, Clone, PartialEq)]
pub struct TextSpan {
    pub text: String,
    pub start: usize,
    pub end: usize,
    chars: usize,
}

impl TextSpan {
    fn from_chars(chars: &[char], mut start: usize, mut end: usize) -> Option<Self> {
        while start < end && chars[start].is_whitespace() {
            start += 1;
        }
        while end > start && chars[end - 1].is_whitespace() {
            end -= 1;
        }
        (start < end).then(|| Self {
            text: chars[start..end].iter().collect(),
            start,
            end,
            chars: end - start,
        })
    }

    /// Length in characters.
    pub fn len(&self) -> usize {
        self.chars
    }

    pub fn is_empty(&self) -> bool {
        self.chars == 0
    }
}

/// Split `text` into raw chunks according to `config.strategy`.
pub fn chunk_text(text: &str, config: &ChunkerConfig) -> Vec<TextSpan> {
    let chars: Vec<char> = text.chars().collect();
    match config.strategy {
        ChunkingStrategy::Sentence => accumulate(&chars, split_sentences(&chars), config.chunk_size),
        ChunkingStrategy::Paragraph | ChunkingStrategy::CodeBlocks => {
            accumulate(&chars, split_paragraphs(&chars), config.chunk_size)
        }
        ChunkingStrategy::FixedSize => fixed_windows(&chars, config),
    }
}

/// Sentences end at `.`, `!` or `?` followed by whitespace.
fn split_sentences(chars: &[char]) -> Vec<TextSpan> {
    let mut spans = Vec::new();
    let mut start = 0;
    for i in 0..chars.len() {
        let terminator = matches!(chars[i], '.' | '!' | '?');
        if terminator && chars.get(i + 1).is_some_and(|c| c.is_whitespace()) {
            spans.extend(TextSpan::from_chars(chars, start, i + 1));
            start = i + 1;
        }
    }
    spans.extend(TextSpan::from_chars(chars, start, chars.len()));
    spans
}

/// Paragraphs are separated by one or more blank lines.
fn split_paragraphs(chars: &[char]) -> Vec<TextSpan> {
    let mut spans = Vec::new();
    let mut paragraph: Option<(usize, usize)> = None;
    let mut line_start = 0;

    for i in 0..=chars.len() {
        if i < chars.len() && chars[i] != '\n' {
            continue;
        }
        let blank = chars[line_start..i].iter().all(|c| c.is_whitespace());
        if blank {
            if let Some((start, end)) = paragraph.take() {
                spans.extend(TextSpan::from_chars(chars, start, end));
            }
        } else {
            let start = paragraph.map_or(line_start, |(start, _)| start);
            paragraph = Some((start, i));
        }
        line_start = i + 1;
    }

    if let Some((start, end)) = paragraph {
        spans.extend(TextSpan::from_chars(chars, start, end));
    }
    spans
}

/// Greedily merge adjacent units while the covered source span fits `chunk_size`.
///
/// A single unit longer than `chunk_size` is emitted on its own.
fn accumulate(chars: &[char], units: Vec<TextSpan>, chunk_size: usize) -> Vec<TextSpan> {
    let mut chunks = Vec::new();
    let mut current: Option<TextSpan> = None;

    for unit in units {
        current = match current.take() {
            None => Some(unit),
            Some(mut acc) => {
                if unit.end - acc.start > chunk_size {
                    chunks.push(acc);
                    Some(unit)
                } else {
                    acc.text.extend(&chars[acc.end..unit.end]);
                    acc.chars = unit.end - acc.start;
                    acc.end = unit.end;
                    Some(acc)
                }
            }
        };
    }

    chunks.extend(current);
    chunks
}

/// Windows of `chunk_size` characters advancing by `chunk_size - chunk_overlap`.
///
/// Blank windows are trimmed from either end of the sequence only, so every
/// consecutive pair still shares exactly `chunk_overlap` characters.
fn fixed_windows(chars: &[char], config: &ChunkerConfig) -> Vec<TextSpan> {
    let step = config.chunk_size.saturating_sub(config.chunk_overlap).max(1);
    let mut windows = Vec::new();
    let mut start = 0;

    while start < chars.len() {
        let end = (start + config.chunk_size).min(chars.len());
        windows.push(TextSpan {
            text: chars[start..end].iter().collect(),
            start,
            end,
            chars: end - start,
        });
        if end == chars.len() {
            break;
        }
        start += step;
    }

    let is_blank = |w: &TextSpan| w.text.chars().all(char::is_whitespace);
    let Some(first) = windows.iter().position(|w| !is_blank(w)) else {
        return Vec::new();
    };
    let last = windows.iter().rposition(|w| !is_blank(w)).unwrap_or(first);
    windows.truncate(last + 1);
    windows.drain(..first);
    windows
}
