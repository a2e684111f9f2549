//! Structural checks for a committed [`DocumentTree`].
//!
//! A tree straight out of the indexer always passes. The checks exist for
//! trees that come back from storage, where a hand edit or a truncated
//! write can break the id ordering or the range containment that lookups
//! and retrieval rely on.
//!
//! ```no_run
//! use tree_knowledge_base::validate::validate_tree;
//! # fn check(tree: &tree_knowledge_base::DocumentTree) {
//! let report = validate_tree(tree);
//! if !report.is_healthy() {
//!     eprintln!("{}", report);
//! }
//! # }
//! ```

use crate::tree::{DocumentTree, SummarySource, TreeNode};
use crate::tree_search::{stats_of, walk};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// Severity level for validation issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational, not a problem.
    Info,
    /// Unusual but still searchable.
    Warning,
    /// Lookups or retrieval may return wrong results.
    Error,
    /// The tree cannot be used at all.
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "INFO"),
            Severity::Warning => write!(f, "WARN"),
            Severity::Error => write!(f, "ERROR"),
            Severity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// A single problem found in a tree.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationIssue {
    pub severity: Severity,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

impl ValidationIssue {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            node_id: None,
        }
    }

    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.severity, self.message)?;
        if let Some(id) = &self.node_id {
            write!(f, " (node {})", id)?;
        }
        Ok(())
    }
}

/// Every issue found in one tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationReport {
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, issue: ValidationIssue) {
        self.issues.push(issue);
    }

    /// No issue at `Error` or above.
    pub fn is_healthy(&self) -> bool {
        !self.issues.iter().any(|i| i.severity >= Severity::Error)
    }

    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }

    /// The most severe issue, earliest first among equals.
    pub fn worst(&self) -> Option<&ValidationIssue> {
        self.issues
            .iter()
            .rev()
            .max_by_key(|issue| issue.severity)
    }

    pub fn counts(&self) -> BTreeMap<Severity, usize> {
        let mut counts = BTreeMap::new();
        for issue in &self.issues {
            *counts.entry(issue.severity).or_default() += 1;
        }
        counts
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_clean() {
            return write!(f, "Validation passed: no issues found");
        }

        let counts = self.counts();
        let parts: Vec<String> = [
            (Severity::Critical, "critical"),
            (Severity::Error, "errors"),
            (Severity::Warning, "warnings"),
            (Severity::Info, "info"),
        ]
        .iter()
        .filter_map(|(sev, name)| counts.get(sev).map(|c| format!("{} {}", c, name)))
        .collect();
        writeln!(f, "Validation report: {}", parts.join(", "))?;

        for issue in &self.issues {
            writeln!(f, "  {}", issue)?;
        }
        Ok(())
    }
}

/// Check a tree's ids, ranges, statistics and summary provenance.
pub fn validate_tree(tree: &DocumentTree) -> ValidationReport {
    let mut report = ValidationReport::new();

    if tree.nodes.is_empty() {
        report.add(ValidationIssue::new(Severity::Critical, "tree has no nodes"));
        return report;
    }

    let mut seen = HashSet::new();
    let mut widths = HashSet::new();
    let mut has_text = false;

    for (position, flat) in walk(&tree.nodes).enumerate() {
        let node = flat.node;
        let id = node.node_id.as_str();

        if !seen.insert(id) {
            report.add(ValidationIssue::new(Severity::Critical, "duplicate node id").with_node(id));
        }
        match id.parse::<usize>() {
            Ok(n) if n == position => {}
            Ok(n) => report.add(
                ValidationIssue::new(
                    Severity::Error,
                    format!("id {} is at pre-order position {}", n, position),
                )
                .with_node(id),
            ),
            Err(_) => report.add(
                ValidationIssue::new(Severity::Error, "node id is not numeric").with_node(id),
            ),
        }
        widths.insert(id.len());

        check_range(node, &mut report);
        check_summary(node, &mut report);

        if node.title.trim().is_empty() {
            report.add(ValidationIssue::new(Severity::Warning, "node has no title").with_node(id));
        }
        has_text |= !node.text.trim().is_empty();
    }

    if widths.len() > 1 {
        report.add(ValidationIssue::new(
            Severity::Warning,
            "node ids have different widths, lexical order differs from document order",
        ));
    }
    if !has_text {
        report.add(ValidationIssue::new(Severity::Warning, "no node carries any text"));
    }

    let actual = stats_of(&tree.nodes);
    if actual != tree.stats {
        report.add(ValidationIssue::new(
            Severity::Error,
            format!(
                "recorded statistics ({} nodes, depth {}) disagree with the tree ({} nodes, depth {})",
                tree.stats.total_nodes, tree.stats.max_depth, actual.total_nodes, actual.max_depth
            ),
        ));
    }

    report
}

fn check_range(node: &TreeNode, report: &mut ValidationReport) {
    let range = node.page_index;
    if range.start == 0 || range.start > range.end {
        report.add(
            ValidationIssue::new(
                Severity::Error,
                format!("invalid range [{}-{}]", range.start, range.end),
            )
            .with_node(&node.node_id),
        );
    }
    for child in &node.children {
        if !range.contains(&child.page_index) {
            report.add(
                ValidationIssue::new(
                    Severity::Error,
                    format!(
                        "range [{}-{}] is outside parent {} [{}-{}]",
                        child.page_index.start,
                        child.page_index.end,
                        node.node_id,
                        range.start,
                        range.end
                    ),
                )
                .with_node(&child.node_id),
            );
        }
    }
}

fn check_summary(node: &TreeNode, report: &mut ValidationReport) {
    let consistent = match node.summary_source {
        SummarySource::Unsummarized => node.summary.is_none(),
        _ => node.summary.as_deref().is_some_and(|s| !s.trim().is_empty()),
    };
    if !consistent {
        report.add(
            ValidationIssue::new(
                Severity::Warning,
                format!("summary does not match its source ({:?})", node.summary_source),
            )
            .with_node(&node.node_id),
        );
    }
}
