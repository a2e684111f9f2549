//! Raw outlines: the parser's view of a document before indexing.
//!
//! The indexer consumes a [`RawOutline`]; it never parses PDFs itself.
//! Outlines arrive either as JSON from an external parser or from the
//! Markdown heading scanner in this module.

use crate::error::{KnowledgeBaseError, Result};
use crate::tree::PageRange;
use serde::{Deserialize, Serialize};

/// One heading of a raw outline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawOutlineNode {
    #[serde(default)]
    pub title: String,

    /// Segment range, inclusive and 1-indexed.
    pub page_index: PageRange,

    /// Pre-partitioned text. When absent, the indexer slices the document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    #[serde(default, alias = "nodes", skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<RawOutlineNode>,
}

impl RawOutlineNode {
    pub fn new(title: impl Into<String>, start: usize, end: usize) -> Self {
        Self {
            title: title.into(),
            page_index: PageRange::new(start, end),
            text: None,
            children: Vec::new(),
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_children(mut self, children: Vec<RawOutlineNode>) -> Self {
        self.children = children;
        self
    }
}

/// A parsed but not yet validated outline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawOutline {
    #[serde(default, alias = "structure")]
    pub nodes: Vec<RawOutlineNode>,
}

impl RawOutline {
    pub fn new(nodes: Vec<RawOutlineNode>) -> Self {
        Self { nodes }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Parse a JSON outline: either a bare array of nodes or `{"nodes": [...]}`.
    pub fn from_json(json: &str) -> Result<Self> {
        if let Ok(nodes) = serde_json::from_str::<Vec<RawOutlineNode>>(json) {
            return Ok(Self { nodes });
        }

        serde_json::from_str::<RawOutline>(json)
            .map_err(|e| KnowledgeBaseError::Parse(format!("invalid outline JSON: {}", e)))
    }
}

#[derive(Debug)]
struct Heading {
    line: usize,
    level: usize,
    title: String,
    end: usize,
}

/// Build an outline from ATX Markdown headings.
///
/// Ranges are 1-indexed line numbers. A heading's range runs to the line
/// before the next heading of the same or a higher level. Non-blank text
/// before the first heading becomes an untitled leading node. A document
/// without headings yields an empty outline.
pub fn from_markdown(content: &str) -> RawOutline {
    let lines: Vec<&str> = content.lines().collect();
    let total = lines.len();
    let mut headings = Vec::new();
    let mut fence: Option<&str> = None;

    for (i, line) in lines.iter().enumerate() {
        let trimmed = line.trim_start();
        let marker = if trimmed.starts_with("```") {
            Some("```")
        } else if trimmed.starts_with("~~~") {
            Some("~~~")
        } else {
            None
        };
        if let Some(marker) = marker {
            fence = match fence {
                Some(open) if open == marker => None,
                Some(open) => Some(open),
                None => Some(marker),
            };
            continue;
        }
        if fence.is_some() {
            continue;
        }
        if let Some((level, title)) = parse_heading(line) {
            headings.push(Heading {
                line: i + 1,
                level,
                title,
                end: total,
            });
        }
    }

    for i in 0..headings.len() {
        let level = headings[i].level;
        if let Some(next) = headings[i + 1..].iter().find(|h| h.level <= level) {
            headings[i].end = next.line - 1;
        }
    }

    let mut nodes = Vec::new();
    if let Some(first) = headings.first() {
        let preamble_end = first.line - 1;
        if lines[..preamble_end].iter().any(|l| !l.trim().is_empty()) {
            nodes.push(RawOutlineNode::new("", 1, preamble_end));
        }
    }

    let mut idx = 0;
    nodes.extend(nest(&headings, &mut idx, 0));
    RawOutline { nodes }
}

fn parse_heading(line: &str) -> Option<(usize, String)> {
    if line.starts_with("    ") || line.starts_with('\t') {
        return None;
    }
    let trimmed = line.trim_start();
    let level = trimmed.chars().take_while(|&c| c == '#').count();
    if level == 0 || level > 6 {
        return None;
    }
    let rest = &trimmed[level..];
    if !rest.is_empty() && !rest.starts_with(' ') && !rest.starts_with('\t') {
        return None;
    }
    let title = rest.trim().trim_end_matches('#').trim_end().to_string();
    Some((level, title))
}

fn nest(headings: &[Heading], idx: &mut usize, parent_level: usize) -> Vec<RawOutlineNode> {
    let mut out = Vec::new();
    while *idx < headings.len() && headings[*idx].level > parent_level {
        let heading = &headings[*idx];
        *idx += 1;
        let children = nest(headings, idx, heading.level);
        out.push(
            RawOutlineNode::new(heading.title.clone(), heading.line, heading.end)
                .with_children(children),
        );
    }
    out
}
