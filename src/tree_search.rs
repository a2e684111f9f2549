//! Read-only traversal utilities over a [`DocumentTree`].
//!
//! Everything here is a pure function of a borrowed tree. The retrieval
//! engine calls these once per query per candidate tree, so traversal is
//! iterative and returns borrows rather than clones.

use crate::error::{KnowledgeBaseError, Result};
use crate::tree::{DocumentTree, TreeNode, TreeStats};
use serde::Serialize;
use std::collections::BTreeMap;

/// A node paired with its depth (0 for top-level nodes).
#[derive(Debug, Clone, Copy)]
pub struct FlatNode<'a> {
    pub depth: usize,
    pub node: &'a TreeNode,
}

/// Pre-order iterator over a forest.
pub struct Walk<'a> {
    stack: Vec<FlatNode<'a>>,
}

impl<'a> Iterator for Walk<'a> {
    type Item = FlatNode<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.stack.pop()?;
        for child in current.node.children.iter().rev() {
            self.stack.push(FlatNode {
                depth: current.depth + 1,
                node: child,
            });
        }
        Some(current)
    }
}

/// Walk a forest in document (pre-)order.
pub fn walk(nodes: &[TreeNode]) -> Walk<'_> {
    let stack = nodes
        .iter()
        .rev()
        .map(|node| FlatNode { depth: 0, node })
        .collect();
    Walk { stack }
}

/// Find a node by id. Ids are unique, so the first match is the only one.
pub fn find_node<'a>(tree: &'a DocumentTree, node_id: &str) -> Option<&'a TreeNode> {
    walk(&tree.nodes)
        .map(|flat| flat.node)
        .find(|node| node.node_id == node_id)
}

/// Depth of a node (0 for top-level), if present.
pub fn depth_of(tree: &DocumentTree, node_id: &str) -> Option<usize> {
    walk(&tree.nodes)
        .find(|flat| flat.node.node_id == node_id)
        .map(|flat| flat.depth)
}

/// Nodes from the top level down to `node_id`, inclusive.
///
/// Empty when the id is unknown.
pub fn path_to<'a>(tree: &'a DocumentTree, node_id: &str) -> Vec<&'a TreeNode> {
    fn descend<'a>(nodes: &'a [TreeNode], node_id: &str, path: &mut Vec<&'a TreeNode>) -> bool {
        for node in nodes {
            path.push(node);
            if node.node_id == node_id || descend(&node.children, node_id, path) {
                return true;
            }
            path.pop();
        }
        false
    }

    let mut path = Vec::new();
    descend(&tree.nodes, node_id, &mut path);
    path
}

/// Every node with its depth, in document order.
pub fn flatten(tree: &DocumentTree) -> Vec<FlatNode<'_>> {
    walk(&tree.nodes).collect()
}

/// Rebuild a forest from `(depth, node)` pairs in document order.
///
/// Any children already present on the incoming nodes are discarded; the
/// hierarchy is taken from the depths alone.
pub fn unflatten(entries: impl IntoIterator<Item = (usize, TreeNode)>) -> Result<Vec<TreeNode>> {
    fn close(stack: &mut Vec<TreeNode>, roots: &mut Vec<TreeNode>) {
        if let Some(done) = stack.pop() {
            match stack.last_mut() {
                Some(parent) => parent.children.push(done),
                None => roots.push(done),
            }
        }
    }

    let mut roots = Vec::new();
    let mut stack: Vec<TreeNode> = Vec::new();

    for (depth, mut node) in entries {
        if depth > stack.len() {
            return Err(KnowledgeBaseError::Parse(format!(
                "node '{}' at depth {} has no parent at depth {}",
                node.node_id,
                depth,
                depth - 1
            )));
        }
        while stack.len() > depth {
            close(&mut stack, &mut roots);
        }
        node.children.clear();
        stack.push(node);
    }
    while !stack.is_empty() {
        close(&mut stack, &mut roots);
    }

    Ok(roots)
}

/// Node count and depth of a forest.
pub fn stats_of(nodes: &[TreeNode]) -> TreeStats {
    walk(nodes).fold(TreeStats::default(), |acc, flat| TreeStats {
        total_nodes: acc.total_nodes + 1,
        max_depth: acc.max_depth.max(flat.depth + 1),
    })
}

/// Node count and depth of a tree, recomputed from its nodes.
pub fn stats(tree: &DocumentTree) -> TreeStats {
    stats_of(&tree.nodes)
}

/// Nodes without children, in document order.
pub fn leaves(tree: &DocumentTree) -> Vec<&TreeNode> {
    walk(&tree.nodes)
        .map(|flat| flat.node)
        .filter(|node| node.children.is_empty())
        .collect()
}

/// Other nodes sharing `node_id`'s parent. `None` if the id is unknown.
pub fn siblings<'a>(tree: &'a DocumentTree, node_id: &str) -> Option<Vec<&'a TreeNode>> {
    let path = path_to(tree, node_id);
    let level: &[TreeNode] = match path.len() {
        0 => return None,
        1 => &tree.nodes,
        n => &path[n - 2].children,
    };
    Some(level.iter().filter(|n| n.node_id != node_id).collect())
}

/// Nodes whose title contains `keyword`.
pub fn search_by_title<'a>(
    tree: &'a DocumentTree,
    keyword: &str,
    case_sensitive: bool,
) -> Vec<&'a TreeNode> {
    let needle = if case_sensitive {
        keyword.to_string()
    } else {
        keyword.to_lowercase()
    };

    walk(&tree.nodes)
        .map(|flat| flat.node)
        .filter(|node| {
            if case_sensitive {
                node.title.contains(&needle)
            } else {
                node.title.to_lowercase().contains(&needle)
            }
        })
        .collect()
}

/// Nodes whose depth lies in `min_depth..=max_depth` (0 is top level).
pub fn filter_by_depth(
    tree: &DocumentTree,
    min_depth: usize,
    max_depth: Option<usize>,
) -> Vec<FlatNode<'_>> {
    walk(&tree.nodes)
        .filter(|flat| flat.depth >= min_depth && max_depth.is_none_or(|max| flat.depth <= max))
        .collect()
}

/// Detailed shape statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TreeStatistics {
    pub total_nodes: usize,
    pub max_depth: usize,
    pub root_nodes: usize,
    pub leaf_nodes: usize,
    pub nodes_by_depth: BTreeMap<usize, usize>,
}

pub fn statistics(tree: &DocumentTree) -> TreeStatistics {
    let mut nodes_by_depth = BTreeMap::new();
    let mut leaf_nodes = 0;
    for flat in walk(&tree.nodes) {
        *nodes_by_depth.entry(flat.depth).or_insert(0) += 1;
        if flat.node.children.is_empty() {
            leaf_nodes += 1;
        }
    }
    let basic = stats(tree);

    TreeStatistics {
        total_nodes: basic.total_nodes,
        max_depth: basic.max_depth,
        root_nodes: tree.nodes.len(),
        leaf_nodes,
        nodes_by_depth,
    }
}

/// Compact indented `node_id — title — summary` listing, one node per line.
pub fn render_listing(tree: &DocumentTree) -> String {
    let mut out = String::new();
    for flat in walk(&tree.nodes) {
        let node = flat.node;
        let title = if node.title.trim().is_empty() {
            "(untitled)"
        } else {
            node.title.trim()
        };
        let summary = node
            .summary
            .as_deref()
            .map(|s| s.split_whitespace().collect::<Vec<_>>().join(" "))
            .unwrap_or_else(|| "(no summary)".to_string());

        out.push_str(&"  ".repeat(flat.depth));
        out.push_str(&format!("{} — {} — {}\n", node.node_id, title, summary));
    }
    out
}
