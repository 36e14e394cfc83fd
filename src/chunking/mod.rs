//! Semantic chunking of policy documents
//!
//! Documents are split along their Markdown headings first. Sections that fit
//! the token budget become one chunk; larger ones descend into their
//! subsections and finally into overlapping token windows cut at sentence or
//! paragraph breaks. Chunk ids derive from the source id and ordinal, so
//! chunking the same document twice yields the same ids.

mod sections;
mod windows;

use crate::ingest::Document;
use sections::{parse_sections, Section};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use windows::{count_tokens, split_windows, Window};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChunkError {
    #[error("Invalid chunking configuration: {0}")]
    InvalidConfig(String),

    #[error("Malformed document {source_id}: {reason}")]
    MalformedText { source_id: String, reason: String },
}

/// Token budgets for chunking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Preferred window size when a section must be split
    pub target_tokens: usize,
    /// Largest section emitted as a single chunk
    pub max_tokens: usize,
    /// Tokens shared by consecutive windows
    pub overlap_tokens: usize,
    /// Smallest window emitted unless it ends its section
    pub min_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_tokens: 350,
            max_tokens: 450,
            overlap_tokens: 50,
            min_tokens: 50,
        }
    }
}

impl ChunkingConfig {
    /// Check `1 <= min <= target <= max` and `overlap < target`
    pub fn validate(&self) -> Result<(), ChunkError> {
        if self.min_tokens == 0 {
            return Err(ChunkError::InvalidConfig(
                "min_tokens must be at least 1".to_string(),
            ));
        }
        if self.overlap_tokens >= self.target_tokens {
            return Err(ChunkError::InvalidConfig(format!(
                "overlap_tokens ({}) must be smaller than target_tokens ({})",
                self.overlap_tokens, self.target_tokens
            )));
        }
        if self.min_tokens > self.target_tokens {
            return Err(ChunkError::InvalidConfig(format!(
                "min_tokens ({}) must not exceed target_tokens ({})",
                self.min_tokens, self.target_tokens
            )));
        }
        if self.target_tokens > self.max_tokens {
            return Err(ChunkError::InvalidConfig(format!(
                "target_tokens ({}) must not exceed max_tokens ({})",
                self.target_tokens, self.max_tokens
            )));
        }
        Ok(())
    }
}

/// The atomic retrievable unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Deterministic id, see [`chunk_id`]
    pub id: String,
    pub text: String,
    pub token_count: usize,
    pub source_id: String,
    pub doc_type: String,
    /// Nearest enclosing heading, or empty
    pub section: String,
    /// Position within the source document
    pub ordinal: usize,
    /// Shares leading tokens with the previous chunk
    pub overlap: bool,
}

impl Chunk {
    /// Short preview of the text (first N characters)
    pub fn preview(&self, max_chars: usize) -> String {
        match self.text.char_indices().nth(max_chars) {
            Some((idx, _)) => format!("{}...", &self.text[..idx]),
            None => self.text.clone(),
        }
    }
}

/// Chunk id for the `ordinal`-th chunk of a source
pub fn chunk_id(source_id: &str, ordinal: usize) -> String {
    let hash = blake3::hash(source_id.as_bytes());
    format!("{}-{:04}", &hash.to_hex()[..16], ordinal)
}

/// Splits documents into chunks
#[derive(Debug, Clone)]
pub struct Chunker {
    config: ChunkingConfig,
}

impl Chunker {
    pub fn new(config: ChunkingConfig) -> Result<Self, ChunkError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    /// Chunk one document. Empty documents yield no chunks.
    pub fn chunk(&self, document: &Document) -> Result<Vec<Chunk>, ChunkError> {
        if document.text.contains('\0') {
            return Err(ChunkError::MalformedText {
                source_id: document.source_id.clone(),
                reason: "text contains NUL bytes".to_string(),
            });
        }

        let mut pieces = Vec::new();
        match parse_sections(&document.text) {
            Some(sections) => {
                for section in &sections {
                    self.chunk_section(section, &mut pieces);
                }
            }
            None => {
                let label = document.source_id.clone();
                pieces.extend(
                    split_windows(&document.text, &self.config)
                        .into_iter()
                        .map(|window| (label.clone(), window)),
                );
            }
        }

        let chunks: Vec<Chunk> = pieces
            .into_iter()
            .enumerate()
            .map(|(ordinal, (section, window))| Chunk {
                id: chunk_id(&document.source_id, ordinal),
                text: window.text,
                token_count: window.token_count,
                source_id: document.source_id.clone(),
                doc_type: document.doc_type.clone(),
                section,
                ordinal,
                overlap: window.overlap,
            })
            .collect();

        debug!(
            "Chunked {} into {} chunks",
            document.source_id,
            chunks.len()
        );

        Ok(chunks)
    }

    fn chunk_section(&self, section: &Section<'_>, out: &mut Vec<(String, Window)>) {
        if !section.has_body() {
            return;
        }

        let token_count = count_tokens(section.text);
        if token_count <= self.config.max_tokens {
            out.push((
                section.label.clone(),
                Window {
                    text: section.text.trim().to_string(),
                    token_count,
                    overlap: false,
                },
            ));
            return;
        }

        if section.children.is_empty() {
            self.push_windows(&section.label, section.text, out);
            return;
        }

        if section.own_has_body() {
            self.push_windows(&section.label, section.own_text, out);
        }
        for child in &section.children {
            self.chunk_section(child, out);
        }
    }

    fn push_windows(&self, label: &str, text: &str, out: &mut Vec<(String, Window)>) {
        let windows = split_windows(text, &self.config);
        let last = windows.len().saturating_sub(1);

        out.extend(
            windows
                .into_iter()
                .enumerate()
                .filter(|(i, w)| *i == last || w.token_count >= self.config.min_tokens)
                .map(|(_, w)| (label.to_string(), w)),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunker(target: usize, max: usize, overlap: usize, min: usize) -> Chunker {
        Chunker::new(ChunkingConfig {
            target_tokens: target,
            max_tokens: max,
            overlap_tokens: overlap,
            min_tokens: min,
        })
        .unwrap()
    }

    fn sentences(n: usize) -> String {
        (0..n)
            .map(|i| format!("Clause {} requires written approval from a manager.", i))
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn test_config_validation() {
        assert!(ChunkingConfig::default().validate().is_ok());

        let mut config = ChunkingConfig::default();
        config.overlap_tokens = config.target_tokens;
        assert!(config.validate().is_err());

        let mut config = ChunkingConfig::default();
        config.target_tokens = config.max_tokens + 1;
        assert!(config.validate().is_err());

        let mut config = ChunkingConfig::default();
        config.min_tokens = 0;
        config.overlap_tokens = 0;
        assert!(Chunker::new(config).is_err());
    }

    #[test]
    fn test_empty_document() {
        let doc = Document::new("empty.md", "General Policy", "  \n\n ");
        let chunks = chunker(20, 30, 5, 10).chunk(&doc).unwrap();
        assert!(chunks.is_empty());
    }

    #[test]
    fn test_single_section_chunk() {
        let doc = Document::new(
            "hr_policy.md",
            "HR Policy",
            "## Working Hours\nRemote work up to 3 days/week with manager approval",
        );
        let chunks = Chunker::new(ChunkingConfig::default())
            .unwrap()
            .chunk(&doc)
            .unwrap();

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].section, "Working Hours");
        assert_eq!(chunks[0].ordinal, 0);
        assert_eq!(chunks[0].doc_type, "HR Policy");
        assert_eq!(chunks[0].id, chunk_id("hr_policy.md", 0));
        assert!(!chunks[0].overlap);
        assert!(chunks[0].text.contains("manager approval"));
    }

    #[test]
    fn test_chunking_is_deterministic() {
        let text = format!("# Policy\n{}\n## Travel\n{}", sentences(30), sentences(4));
        let doc = Document::new("policy.md", "General Policy", text);
        let chunker = chunker(40, 60, 8, 15);

        let first = chunker.chunk(&doc).unwrap();
        let second = chunker.chunk(&doc).unwrap();
        assert_eq!(first, second);
        assert!(first.len() > 2);
    }

    #[test]
    fn test_ids_unique_and_ordinals_sequential() {
        let text = format!("## A\n{}\n## B\n{}", sentences(20), sentences(20));
        let doc = Document::new("a.md", "General Policy", text);
        let chunks = chunker(30, 45, 5, 10).chunk(&doc).unwrap();

        let mut ids: Vec<&str> = chunks.iter().map(|c| c.id.as_str()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), chunks.len());

        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.ordinal, i);
        }
    }

    #[test]
    fn test_token_bounds() {
        let text = format!(
            "# Handbook\n{}\n## Leave\n{}\n### Sick\n{}\n## Hours\n{}",
            sentences(3),
            sentences(25),
            sentences(12),
            sentences(2)
        );
        let doc = Document::new("handbook.md", "Company Policy", text);
        let config = ChunkingConfig {
            target_tokens: 40,
            max_tokens: 55,
            overlap_tokens: 6,
            min_tokens: 12,
        };
        let chunks = Chunker::new(config).unwrap().chunk(&doc).unwrap();

        for (i, chunk) in chunks.iter().enumerate() {
            assert!(chunk.token_count >= 1);
            assert!(chunk.token_count <= config.max_tokens);
            assert_eq!(chunk.token_count, chunk.text.split_whitespace().count());

            let last_in_section = chunks
                .get(i + 1)
                .map(|next| next.section != chunk.section || !next.overlap)
                .unwrap_or(true);
            if !last_in_section {
                assert!(chunk.token_count >= config.min_tokens);
            }
        }
    }

    #[test]
    fn test_oversized_section_descends_into_subsections() {
        let text = format!("## Leave\nOverview.\n### Annual\n{}\n### Sick\n{}", sentences(10), sentences(2));
        let doc = Document::new("leave.md", "HR Policy", text);
        let chunks = chunker(40, 60, 5, 10).chunk(&doc).unwrap();

        let sections: Vec<&str> = chunks.iter().map(|c| c.section.as_str()).collect();
        assert_eq!(sections.first(), Some(&"Leave"));
        assert!(sections.contains(&"Annual"));
        assert_eq!(sections.last(), Some(&"Sick"));
        assert!(chunks[0].text.starts_with("## Leave"));
        assert!(!chunks[0].text.contains("### Annual"));
    }

    #[test]
    fn test_small_parent_keeps_subsections_together() {
        let doc = Document::new(
            "short.md",
            "General Policy",
            "## Leave\nOverview.\n### Sick\nTen days.",
        );
        let chunks = chunker(40, 60, 5, 10).chunk(&doc).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].section, "Leave");
        assert!(chunks[0].text.contains("Ten days."));
    }

    #[test]
    fn test_no_headings_uses_source_label() {
        let doc = Document::new("notes.txt", "General Policy", sentences(40));
        let chunks = chunker(50, 70, 10, 20).chunk(&doc).unwrap();

        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.section == "notes.txt"));
        assert!(!chunks[0].overlap);
        assert!(chunks[1..].iter().all(|c| c.overlap));
    }

    #[test]
    fn test_hard_split_overlap() {
        let text: String = (0..120).map(|i| format!("t{} ", i)).collect();
        let doc = Document::new("blob.txt", "General Policy", text);
        let chunks = chunker(30, 40, 6, 10).chunk(&doc).unwrap();

        assert!(chunks.len() >= 4);
        for pair in chunks.windows(2) {
            let prev: Vec<&str> = pair[0].text.split_whitespace().collect();
            let next: Vec<&str> = pair[1].text.split_whitespace().collect();
            assert_eq!(&prev[prev.len() - 6..], &next[..6]);
        }
        assert!(chunks.last().unwrap().text.ends_with("t119"));
    }

    #[test]
    fn test_trailing_short_section_kept() {
        let doc = Document::new(
            "mixed.md",
            "General Policy",
            format!("## Long\n{}\n## Tail\nOk.", sentences(3)),
        );
        let chunks = chunker(20, 30, 2, 10).chunk(&doc).unwrap();
        let tail = chunks.last().unwrap();
        assert_eq!(tail.section, "Tail");
        assert!(tail.token_count < 10);
    }

    #[test]
    fn test_nul_bytes_rejected() {
        let doc = Document::new("bin.md", "General Policy", "abc\0def");
        let err = chunker(20, 30, 5, 10).chunk(&doc).unwrap_err();
        assert!(matches!(err, ChunkError::MalformedText { .. }));
    }

    #[test]
    fn test_chunk_id_format() {
        let id = chunk_id("policies/hr.md", 7);
        assert_eq!(id.len(), 16 + 1 + 4);
        assert!(id.ends_with("-0007"));
        assert_eq!(id, chunk_id("policies/hr.md", 7));
        assert_ne!(id, chunk_id("policies/it.md", 7));
    }
}
