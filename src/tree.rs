//! Tree structure for hierarchical document indexing.
//!
//! A [`DocumentTree`] is built once by the indexer and is immutable after
//! that: re-indexing produces a brand new tree rather than patching nodes.

use bincode::{Decode, Encode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Inclusive `[start, end]` segment range locating a node in its source.
///
/// Serialized as a two-element array. Used for display only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
#[serde(from = "[usize; 2]", into = "[usize; 2]")]
pub struct PageRange {
    pub start: usize,
    pub end: usize,
}

impl PageRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Whether `other` lies entirely inside this range.
    pub fn contains(&self, other: &PageRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Number of segments covered.
    pub fn span(&self) -> usize {
        if self.end >= self.start {
            self.end - self.start + 1
        } else {
            0
        }
    }
}

impl From<[usize; 2]> for PageRange {
    fn from([start, end]: [usize; 2]) -> Self {
        Self { start, end }
    }
}

impl From<PageRange> for [usize; 2] {
    fn from(range: PageRange) -> Self {
        [range.start, range.end]
    }
}

/// Where a node's summary came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Encode, Decode)]
#[serde(rename_all = "lowercase")]
pub enum SummarySource {
    /// Accepted on the first LLM attempt.
    Generated,
    /// Accepted after the stricter retry prompt.
    Regenerated,
    /// Deterministic first-sentences summary.
    Extractive,
    /// Summarization was disabled for this build.
    #[default]
    Unsummarized,
}

/// A node in the document tree structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct TreeNode {
    /// Zero-padded pre-order id, e.g. "0007".
    pub node_id: String,

    /// Section title. May be empty.
    pub title: String,

    /// Generated summary; `None` only when `summary_source` is `Unsummarized`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,

    #[serde(default)]
    pub summary_source: SummarySource,

    /// Segment range of this node including its descendants.
    pub page_index: PageRange,

    /// Text owned by this node alone; descendants own theirs.
    #[serde(default)]
    pub text: String,

    /// Child nodes in document order.
    #[serde(default, alias = "nodes", skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    /// Create a new tree node.
    pub fn new(node_id: impl Into<String>, title: impl Into<String>, page_index: PageRange) -> Self {
        Self {
            node_id: node_id.into(),
            title: title.into(),
            summary: None,
            summary_source: SummarySource::Unsummarized,
            page_index,
            text: String::new(),
            children: Vec::new(),
        }
    }

    /// Set the node's own text.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    /// Set the node's summary and where it came from.
    pub fn with_summary(mut self, summary: impl Into<String>, source: SummarySource) -> Self {
        self.summary = Some(summary.into());
        self.summary_source = source;
        self
    }

    /// Add a child node.
    pub fn add_child(&mut self, child: TreeNode) {
        self.children.push(child);
    }

    /// Check if this node has children.
    pub fn has_children(&self) -> bool {
        !self.children.is_empty()
    }

    /// Recursively count all nodes in this subtree (including self).
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(|n| n.node_count()).sum::<usize>()
    }

    /// Summary text, or the title when no summary exists.
    pub fn summary_or_title(&self) -> &str {
        self.summary.as_deref().unwrap_or(&self.title)
    }

    /// A copy of this node without its children.
    pub fn detached(&self) -> TreeNode {
        TreeNode {
            node_id: self.node_id.clone(),
            title: self.title.clone(),
            summary: self.summary.clone(),
            summary_source: self.summary_source,
            page_index: self.page_index,
            text: self.text.clone(),
            children: Vec::new(),
        }
    }

    /// Format the tree as a string for display.
    pub fn format_tree(&self, indent: usize) -> String {
        let prefix = "  ".repeat(indent);
        let title = if self.title.is_empty() {
            "(untitled)"
        } else {
            self.title.as_str()
        };

        let mut result = format!(
            "{}[{}] {} [{}-{}]\n",
            prefix, self.node_id, title, self.page_index.start, self.page_index.end
        );

        for child in &self.children {
            result.push_str(&child.format_tree(indent + 1));
        }

        result
    }
}

/// Aggregate size of a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Encode, Decode)]
pub struct TreeStats {
    pub total_nodes: usize,
    /// Number of levels; a tree of only top-level nodes has depth 1.
    pub max_depth: usize,
}

/// A complete per-document tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct DocumentTree {
    /// Document name.
    pub doc_name: String,

    /// Optional document description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Top-level nodes.
    #[serde(alias = "structure")]
    pub nodes: Vec<TreeNode>,

    #[serde(flatten)]
    pub stats: TreeStats,

    /// Build counter; bumped by every re-index of the same document.
    pub version: u64,

    #[bincode(with_serde)]
    pub created_at: DateTime<Utc>,
}

impl DocumentTree {
    /// Create a new document tree, computing its stats.
    pub fn new(doc_name: impl Into<String>, nodes: Vec<TreeNode>) -> Self {
        let stats = crate::tree_search::stats_of(&nodes);
        Self {
            doc_name: doc_name.into(),
            description: None,
            nodes,
            stats,
            version: 1,
            created_at: Utc::now(),
        }
    }

    /// Get total node count.
    pub fn node_count(&self) -> usize {
        self.stats.total_nodes
    }

    /// Get maximum depth of the tree.
    pub fn max_depth(&self) -> usize {
        self.stats.max_depth
    }

    /// Whether `other` was built after this tree.
    pub fn is_stale_against(&self, other: &DocumentTree) -> bool {
        (other.version, other.created_at) > (self.version, self.created_at)
    }

    /// Format the entire tree for display.
    pub fn format(&self) -> String {
        let mut result = format!(
            "Document: {} ({} sections, depth {}, v{})\n",
            self.doc_name,
            self.node_count(),
            self.max_depth(),
            self.version
        );
        result.push_str(&"─".repeat(50));
        result.push('\n');

        for node in &self.nodes {
            result.push_str(&node.format_tree(0));
        }

        result
    }

    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Parse from JSON string.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
