//! Source text representation.
//!
//! A document is a sequence of 1-indexed segments. Paged sources (PDF
//! extractions, delimiter-split text) use one segment per page; Markdown and
//! plain text use one segment per line. Outline ranges address segments.

use crate::error::{KnowledgeBaseError, Result};
use crate::tokens::estimate_tokens;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// What a segment represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentKind {
    Page,
    Line,
}

impl SegmentKind {
    fn separator(self) -> &'static str {
        match self {
            SegmentKind::Page => "\n\n",
            SegmentKind::Line => "\n",
        }
    }
}

/// A single addressable segment of a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    /// 1-indexed position.
    pub number: usize,
    pub content: String,
}

/// A document consisting of zero or more segments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Document name/title.
    pub name: String,
    /// Original file path (if loaded from file).
    pub path: Option<PathBuf>,
    pub kind: SegmentKind,
    pub segments: Vec<Segment>,
}

impl Document {
    /// Create a document from already-split segment contents.
    pub fn new(name: impl Into<String>, kind: SegmentKind, contents: Vec<String>) -> Self {
        let segments = contents
            .into_iter()
            .enumerate()
            .map(|(i, content)| Segment {
                number: i + 1,
                content,
            })
            .collect();
        Self {
            name: name.into(),
            path: None,
            kind,
            segments,
        }
    }

    /// Line-segmented document from raw text.
    pub fn from_text(name: impl Into<String>, content: &str) -> Self {
        let lines = content.lines().map(str::to_string).collect();
        Self::new(name, SegmentKind::Line, lines)
    }

    /// Page-segmented document from raw text split on `delimiter`.
    pub fn from_pages(name: impl Into<String>, content: &str, delimiter: &str) -> Self {
        let pages = content
            .split(delimiter)
            .filter(|s| !s.trim().is_empty())
            .map(|s| s.trim().to_string())
            .collect();
        Self::new(name, SegmentKind::Page, pages)
    }

    /// Load a text or Markdown file as a line-segmented document.
    pub fn from_text_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| KnowledgeBaseError::io(path, e))?;
        let mut doc = Self::from_text(file_stem(path), &content);
        doc.path = Some(path.to_path_buf());
        Ok(doc)
    }

    /// Load a text file as pages split on `delimiter`.
    pub fn from_text_file_with_delimiter(path: &Path, delimiter: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| KnowledgeBaseError::io(path, e))?;
        let mut doc = Self::from_pages(file_stem(path), &content, delimiter);
        doc.path = Some(path.to_path_buf());
        Ok(doc)
    }

    /// Get total number of segments.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Get a specific segment by number (1-indexed).
    pub fn get_segment(&self, number: usize) -> Option<&Segment> {
        if number == 0 {
            None
        } else {
            self.segments.get(number - 1)
        }
    }

    /// Join an arbitrary selection of segment numbers, in the given order.
    pub fn join_segments(&self, numbers: impl IntoIterator<Item = usize>) -> String {
        numbers
            .into_iter()
            .filter_map(|n| self.get_segment(n))
            .map(|s| s.content.as_str())
            .collect::<Vec<_>>()
            .join(self.kind.separator())
    }

    /// Content for a range of segments (1-indexed, inclusive).
    pub fn content_range(&self, start: usize, end: usize) -> String {
        self.join_segments(start..=end)
    }

    /// Whole document text.
    pub fn raw_content(&self) -> String {
        self.content_range(1, self.segment_count())
    }

    /// Whether the document has no non-whitespace text.
    pub fn is_blank(&self) -> bool {
        self.segments.iter().all(|s| s.content.trim().is_empty())
    }

    /// Approximate token count across all segments.
    pub fn total_tokens(&self) -> usize {
        self.segments.iter().map(|s| estimate_tokens(&s.content)).sum()
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("untitled")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_from_text_is_line_based() {
        let doc = Document::from_text("Notes", "first\nsecond\nthird");
        assert_eq!(doc.kind, SegmentKind::Line);
        assert_eq!(doc.segment_count(), 3);
        assert_eq!(doc.content_range(2, 3), "second\nthird");
        assert!(doc.path.is_none());
    }

    #[test]
    fn test_document_from_pages() {
        let doc = Document::from_pages("Book", "page one\x0c page two\x0c\x0c", "\x0c");
        assert_eq!(doc.kind, SegmentKind::Page);
        assert_eq!(doc.segment_count(), 2);
        assert_eq!(doc.raw_content(), "page one\n\npage two");
    }

    #[test]
    fn test_segment_access() {
        let doc = Document::from_text("Test", "Content");

        assert!(doc.get_segment(0).is_none()); // 0 is invalid
        assert!(doc.get_segment(1).is_some()); // Valid
        assert!(doc.get_segment(2).is_none()); // Out of range
    }

    #[test]
    fn test_join_skips_out_of_range() {
        let doc = Document::from_text("Test", "a\nb\nc");
        assert_eq!(doc.join_segments([1, 3, 7]), "a\nc");
    }

    #[test]
    fn test_blank_document() {
        assert!(Document::from_text("Empty", "  \n\n").is_blank());
        assert!(Document::from_text("Empty", "").is_blank());
        assert!(!Document::from_text("Text", "x").is_blank());
    }

    #[test]
    fn test_from_text_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("guide.md");
        std::fs::write(&path, "# Guide\nhello").unwrap();

        let doc = Document::from_text_file(&path).unwrap();
        assert_eq!(doc.name, "guide");
        assert_eq!(doc.segment_count(), 2);
        assert!(doc.total_tokens() > 0);
    }
}
