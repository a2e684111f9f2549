//! Tree indexer: turns a raw outline into a validated, summarized tree.
//!
//! Building happens in three steps:
//! 1. Validate the outline, partition the document text between nodes,
//!    collapse levels beyond `max_depth` and assign pre-order node ids.
//! 2. Summarize every node with the LLM in bounded-concurrency waves. The
//!    wave order depends on [`SummaryContext`]: leaves first when parents are
//!    summarized from their children, roots first when children see their
//!    parent's summary, a single wave otherwise.
//! 3. Assemble the immutable [`DocumentTree`] in one step.
//!
//! A node whose summary cannot be obtained from the model falls back to an
//! extractive summary; it never fails its siblings.

use crate::cancel::CancelToken;
use crate::document::Document;
use crate::error::{KnowledgeBaseError, Result};
use crate::llm::{LanguageModel, Prompts};
use crate::outline::{RawOutline, RawOutlineNode};
use crate::structured::{Resolution, ResolutionMethod, clean_prose};
use crate::tokens::{sentences, truncate_to_tokens};
use crate::tree::{DocumentTree, PageRange, SummarySource, TreeNode};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// What a node sees of its neighbours while being summarized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryContext {
    /// Nodes are summarized independently, all at once.
    None,
    /// Each node sees its parent's summary; waves run root to leaves.
    Parent,
    /// Each node sees its children's summaries; waves run leaves to root.
    #[default]
    Children,
}

/// Options for tree index generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexOptions {
    /// Maximum number of levels; deeper nodes are merged into their ancestor.
    pub max_depth: usize,
    /// Concurrent summarization requests per document.
    pub concurrency: usize,
    /// Token ceiling for the node text sent to the summarizer.
    pub summary_token_ceiling: usize,
    pub summary_context: SummaryContext,
    /// Sentences kept by the extractive fallback.
    pub fallback_sentences: usize,
    /// Overall build deadline in seconds; 0 disables it.
    pub timeout_secs: u64,
    /// When false, nodes are left `unsummarized` and no LLM call is made.
    pub generate_summaries: bool,
    /// Fail the build if any node could not reach the LLM.
    pub require_llm_summaries: bool,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            max_depth: 6,
            concurrency: 4,
            summary_token_ceiling: 2000,
            summary_context: SummaryContext::Children,
            fallback_sentences: 3,
            timeout_secs: 600,
            generate_summaries: true,
            require_llm_summaries: false,
        }
    }
}

/// A node after validation and text partitioning, before summarization.
#[derive(Debug, Clone)]
struct PendingNode {
    node_id: String,
    title: String,
    range: PageRange,
    text: String,
    depth: usize,
    parent: Option<usize>,
    children: Vec<usize>,
}

/// Everything one summarization request needs, detached from the arena.
struct SummaryJob {
    index: usize,
    node_id: String,
    title: String,
    content: String,
    context: String,
    fallback: String,
}

struct SummaryOutcome {
    resolution: Resolution<String>,
    llm_unavailable: bool,
}

/// Tree indexer that uses the LLM to summarize document structure.
#[derive(Clone)]
pub struct IndexEngine {
    llm: Arc<dyn LanguageModel>,
}

impl IndexEngine {
    /// Create a new index engine.
    pub fn new(llm: Arc<dyn LanguageModel>) -> Self {
        Self { llm }
    }

    /// Build a tree index for a document.
    pub async fn build_tree(
        &self,
        outline: &RawOutline,
        document: &Document,
        options: &IndexOptions,
    ) -> Result<DocumentTree> {
        self.build_tree_with_cancel(outline, document, options, &CancelToken::new())
            .await
    }

    /// Build a tree index, aborting outstanding LLM calls on cancellation.
    pub async fn build_tree_with_cancel(
        &self,
        outline: &RawOutline,
        document: &Document,
        options: &IndexOptions,
        cancel: &CancelToken,
    ) -> Result<DocumentTree> {
        let nodes = prepare_nodes(outline, document, options)?;
        info!(
            document = %document.name,
            nodes = nodes.len(),
            context = ?options.summary_context,
            "building tree index"
        );

        let summaries = if options.generate_summaries {
            self.summarize_all(&nodes, options, cancel).await?
        } else {
            vec![None; nodes.len()]
        };

        let roots: Vec<usize> = (0..nodes.len())
            .filter(|&i| nodes[i].parent.is_none())
            .collect();
        let tree_nodes = roots
            .iter()
            .map(|&i| assemble(i, &nodes, &summaries))
            .collect();

        let mut tree = DocumentTree::new(&document.name, tree_nodes);
        tree.description = describe(&tree);

        info!(
            document = %document.name,
            total_nodes = tree.node_count(),
            max_depth = tree.max_depth(),
            "tree index built"
        );
        Ok(tree)
    }

    async fn summarize_all(
        &self,
        nodes: &[PendingNode],
        options: &IndexOptions,
        cancel: &CancelToken,
    ) -> Result<Vec<Option<(String, SummarySource)>>> {
        let total = nodes.len();
        let waves = plan_waves(nodes, options.summary_context);
        let completed = AtomicUsize::new(0);
        let mut summaries: Vec<Option<(String, SummarySource)>> = vec![None; total];
        let mut unavailable = 0usize;

        let timeout_secs = options.timeout_secs;
        let deadline = async move {
            if timeout_secs == 0 {
                std::future::pending::<()>().await;
            } else {
                tokio::time::sleep(Duration::from_secs(timeout_secs)).await;
            }
        };
        tokio::pin!(deadline);

        for (wave_no, wave) in waves.iter().enumerate() {
            let jobs: Vec<SummaryJob> = wave
                .iter()
                .map(|&i| build_job(i, nodes, &summaries, options))
                .collect();
            debug!(wave = wave_no, size = jobs.len(), "starting summary wave");

            let completed_ref = &completed;
            let run = stream::iter(jobs)
                .map(|job| async move {
                    let outcome = self.summarize(&job).await;
                    completed_ref.fetch_add(1, Ordering::SeqCst);
                    (job.index, outcome)
                })
                .buffer_unordered(options.concurrency.max(1))
                .collect::<Vec<_>>();

            let results = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let done = completed.load(Ordering::SeqCst);
                    warn!(wave = wave_no, completed = done, total, "index build cancelled");
                    return Err(KnowledgeBaseError::Cancelled { completed: done, total });
                }
                _ = &mut deadline => {
                    let done = completed.load(Ordering::SeqCst);
                    warn!(wave = wave_no, completed = done, total, "index build timed out");
                    return Err(KnowledgeBaseError::Timeout { completed: done, total });
                }
                results = run => results,
            };

            for (index, outcome) in results {
                if outcome.llm_unavailable {
                    unavailable += 1;
                }
                let source = match outcome.resolution.method() {
                    ResolutionMethod::Structured => SummarySource::Generated,
                    ResolutionMethod::Reformatted => SummarySource::Regenerated,
                    ResolutionMethod::Fallback => SummarySource::Extractive,
                };
                summaries[index] = Some((outcome.resolution.into_inner(), source));
            }
        }

        if unavailable > 0 {
            if options.require_llm_summaries {
                return Err(KnowledgeBaseError::Summarization(format!(
                    "LLM unavailable for {} of {} nodes",
                    unavailable, total
                )));
            }
            warn!(unavailable, total, "LLM unavailable for some nodes, used extractive summaries");
        }

        Ok(summaries)
    }

    /// Summarize one node: first attempt, one stricter retry, then extractive.
    async fn summarize(&self, job: &SummaryJob) -> SummaryOutcome {
        let system = Some(Prompts::system_document_analyzer());

        let first = fill_summary_prompt(Prompts::node_summary(), job);
        match self.llm.complete(system, &first, None).await {
            Ok(reply) => {
                if let Some(summary) = clean_prose(&reply) {
                    return SummaryOutcome {
                        resolution: Resolution::Structured(summary),
                        llm_unavailable: false,
                    };
                }
                debug!(node_id = %job.node_id, "unusable summary, retrying with strict prompt");
            }
            Err(e) if e.is_unavailable() => {
                warn!(node_id = %job.node_id, error = %e, "LLM unavailable, using extractive summary");
                return fallback_outcome(job, true);
            }
            Err(e) => {
                debug!(node_id = %job.node_id, error = %e, "summary request failed, retrying");
            }
        }

        let strict = fill_summary_prompt(Prompts::node_summary_strict(), job);
        match self.llm.complete(system, &strict, None).await {
            Ok(reply) => match clean_prose(&reply) {
                Some(summary) => SummaryOutcome {
                    resolution: Resolution::Reformatted(summary),
                    llm_unavailable: false,
                },
                None => {
                    warn!(node_id = %job.node_id, "summary still unusable, using extractive summary");
                    fallback_outcome(job, false)
                }
            },
            Err(e) => {
                warn!(node_id = %job.node_id, error = %e, "summary retry failed, using extractive summary");
                fallback_outcome(job, e.is_unavailable())
            }
        }
    }
}

fn fallback_outcome(job: &SummaryJob, llm_unavailable: bool) -> SummaryOutcome {
    SummaryOutcome {
        resolution: Resolution::Fallback(job.fallback.clone()),
        llm_unavailable,
    }
}

fn fill_summary_prompt(template: &str, job: &SummaryJob) -> String {
    let title = if job.title.trim().is_empty() {
        "(untitled)"
    } else {
        job.title.as_str()
    };
    template
        .replace("{context}", &job.context)
        .replace("{title}", title)
        .replace("{content}", &job.content)
}

/// Deterministic summary: the first sentences of the node's own text.
pub fn extractive_summary(text: &str, max_sentences: usize) -> Option<String> {
    let picked: Vec<&str> = sentences(text)
        .into_iter()
        .map(|s| s.trim_start_matches('#').trim_start())
        .filter(|s| s.chars().any(|c| c.is_alphanumeric()))
        .take(max_sentences.max(1))
        .collect();
    if picked.is_empty() {
        return None;
    }
    let joined = picked.join(" ");
    Some(truncate_to_tokens(&joined, 160).to_string())
}

fn build_job(
    index: usize,
    nodes: &[PendingNode],
    summaries: &[Option<(String, SummarySource)>],
    options: &IndexOptions,
) -> SummaryJob {
    let node = &nodes[index];

    let context = match options.summary_context {
        SummaryContext::None => String::new(),
        SummaryContext::Parent => node
            .parent
            .and_then(|p| summaries[p].as_ref())
            .map(|(summary, _)| Prompts::parent_context().replace("{summary}", summary))
            .unwrap_or_default(),
        SummaryContext::Children => {
            let lines: Vec<String> = node
                .children
                .iter()
                .filter_map(|&c| {
                    summaries[c]
                        .as_ref()
                        .map(|(summary, _)| format!("- {}: {}", nodes[c].title, summary))
                })
                .collect();
            if lines.is_empty() {
                String::new()
            } else {
                let joined = lines.join("\n");
                let bounded = truncate_to_tokens(&joined, options.summary_token_ceiling / 2);
                Prompts::children_context().replace("{summaries}", bounded)
            }
        }
    };

    let content = if node.text.trim().is_empty() {
        "(This section has no body text of its own.)".to_string()
    } else {
        truncate_to_tokens(&node.text, options.summary_token_ceiling).to_string()
    };

    let fallback = extractive_summary(&node.text, options.fallback_sentences)
        .or_else(|| {
            let known: Vec<&str> = node
                .children
                .iter()
                .filter_map(|&c| summaries[c].as_ref().map(|(s, _)| s.as_str()))
                .collect();
            extractive_summary(&known.join(" "), options.fallback_sentences)
        })
        .or_else(|| {
            let titles: Vec<&str> = node
                .children
                .iter()
                .map(|&c| nodes[c].title.trim())
                .filter(|t| !t.is_empty())
                .collect();
            (!titles.is_empty()).then(|| format!("Covers: {}.", titles.join(", ")))
        })
        .unwrap_or_else(|| {
            if node.title.trim().is_empty() {
                "Untitled section.".to_string()
            } else {
                node.title.trim().to_string()
            }
        });

    SummaryJob {
        index,
        node_id: node.node_id.clone(),
        title: node.title.clone(),
        content,
        context,
        fallback,
    }
}

/// Group node indices into summarization waves.
fn plan_waves(nodes: &[PendingNode], mode: SummaryContext) -> Vec<Vec<usize>> {
    let level: Vec<usize> = match mode {
        SummaryContext::None => vec![0; nodes.len()],
        SummaryContext::Parent => nodes.iter().map(|n| n.depth).collect(),
        SummaryContext::Children => {
            // Children always follow their parent in pre-order, so a reverse
            // scan sees every child's height before the parent's.
            let mut height = vec![0usize; nodes.len()];
            for i in (0..nodes.len()).rev() {
                height[i] = nodes[i]
                    .children
                    .iter()
                    .map(|&c| height[c] + 1)
                    .max()
                    .unwrap_or(0);
            }
            height
        }
    };

    let levels = level.iter().copied().max().map_or(0, |m| m + 1);
    let mut waves = vec![Vec::new(); levels];
    for (i, &l) in level.iter().enumerate() {
        waves[l].push(i);
    }
    waves
}

/// Validate the outline and lay it out as a pre-order arena with text
/// partitioned and ids assigned.
fn prepare_nodes(
    outline: &RawOutline,
    document: &Document,
    options: &IndexOptions,
) -> Result<Vec<PendingNode>> {
    let segment_count = document.segment_count();

    // A document without headings becomes a single node.
    let single;
    let roots: &[RawOutlineNode] = if outline.nodes.is_empty() {
        if document.is_blank() {
            return Err(KnowledgeBaseError::Summarization(format!(
                "document '{}' has no text to index",
                document.name
            )));
        }
        single = [RawOutlineNode::new(&document.name, 1, segment_count)];
        &single
    } else {
        &outline.nodes
    };

    // Pre-order walk with validation.
    struct Entry<'a> {
        raw: &'a RawOutlineNode,
        depth: usize,
        parent: Option<usize>,
    }
    let mut entries: Vec<Entry<'_>> = Vec::new();
    let mut stack: Vec<(&RawOutlineNode, usize, Option<usize>)> =
        roots.iter().rev().map(|n| (n, 0, None)).collect();

    while let Some((raw, depth, parent)) = stack.pop() {
        validate_range(raw, parent.map(|p| entries[p].raw), segment_count)?;
        let index = entries.len();
        entries.push(Entry { raw, depth, parent });
        for child in raw.children.iter().rev() {
            stack.push((child, depth + 1, Some(index)));
        }
    }

    // Every segment belongs to the last node in pre-order covering it.
    let mut owner: Vec<Option<usize>> = vec![None; segment_count];
    for (i, entry) in entries.iter().enumerate() {
        let range = entry.raw.page_index;
        for segment in range.start..=range.end.min(segment_count) {
            owner[segment - 1] = Some(i);
        }
    }
    let mut owned: Vec<Vec<usize>> = vec![Vec::new(); entries.len()];
    for (segment, who) in owner.iter().enumerate() {
        if let Some(i) = who {
            owned[*i].push(segment + 1);
        }
    }

    let texts: Vec<String> = entries
        .iter()
        .zip(owned)
        .map(|(entry, segments)| match &entry.raw.text {
            Some(text) => text.trim().to_string(),
            None => document.join_segments(segments).trim().to_string(),
        })
        .collect();

    if texts.iter().all(|t| t.is_empty()) {
        return Err(KnowledgeBaseError::Summarization(format!(
            "document '{}' has no text to index",
            document.name
        )));
    }

    // Collapse levels beyond max_depth into their deepest allowed ancestor.
    let max_depth = options.max_depth.max(1);
    let mut nodes: Vec<PendingNode> = Vec::with_capacity(entries.len());
    let mut kept: Vec<Option<usize>> = vec![None; entries.len()];

    for (i, (entry, text)) in entries.iter().zip(texts).enumerate() {
        if entry.depth < max_depth {
            let parent = entry.parent.and_then(|p| kept[p]);
            let new_index = nodes.len();
            if let Some(p) = parent {
                nodes[p].children.push(new_index);
            }
            nodes.push(PendingNode {
                node_id: String::new(),
                title: entry.raw.title.trim().to_string(),
                range: entry.raw.page_index,
                text,
                depth: entry.depth,
                parent,
                children: Vec::new(),
            });
            kept[i] = Some(new_index);
        } else {
            let mut ancestor = entry.parent;
            while let Some(a) = ancestor {
                if entries[a].depth < max_depth {
                    break;
                }
                ancestor = entries[a].parent;
            }
            if let Some(target) = ancestor.and_then(|a| kept[a]) {
                let merged = &mut nodes[target].text;
                let title = entry.raw.title.trim();
                // Sliced text already starts with its heading line.
                let heading_present = text.lines().next().is_some_and(|l| l.contains(title));
                let title = if heading_present { "" } else { title };
                for piece in [title, text.as_str()] {
                    if !piece.is_empty() {
                        if !merged.is_empty() {
                            merged.push_str("\n\n");
                        }
                        merged.push_str(piece);
                    }
                }
            }
        }
    }

    if nodes.len() < entries.len() {
        debug!(
            merged = entries.len() - nodes.len(),
            max_depth, "collapsed nodes beyond max depth"
        );
    }

    let width = node_id_width(nodes.len());
    for (i, node) in nodes.iter_mut().enumerate() {
        node.node_id = format!("{:0width$}", i, width = width);
    }

    Ok(nodes)
}

/// Zero-padding width so that lexical id order equals numeric order.
fn node_id_width(count: usize) -> usize {
    let largest = count.saturating_sub(1);
    largest.to_string().len().max(4)
}

fn validate_range(
    raw: &RawOutlineNode,
    parent: Option<&RawOutlineNode>,
    segment_count: usize,
) -> Result<()> {
    let range = raw.page_index;
    let label = if raw.title.is_empty() {
        "(untitled)"
    } else {
        raw.title.as_str()
    };

    if range.start == 0 {
        return Err(KnowledgeBaseError::Parse(format!(
            "'{}': ranges are 1-indexed, got start 0",
            label
        )));
    }
    if range.start > range.end {
        return Err(KnowledgeBaseError::Parse(format!(
            "'{}': start {} is after end {}",
            label, range.start, range.end
        )));
    }
    if let Some(parent) = parent {
        if !parent.page_index.contains(&range) {
            return Err(KnowledgeBaseError::Parse(format!(
                "'{}' [{}-{}] is not contained in parent '{}' [{}-{}]",
                label,
                range.start,
                range.end,
                parent.title,
                parent.page_index.start,
                parent.page_index.end
            )));
        }
    }
    if raw.text.is_none() && range.end > segment_count {
        return Err(KnowledgeBaseError::Parse(format!(
            "'{}' ends at {} but the document has {} segments",
            label, range.end, segment_count
        )));
    }
    Ok(())
}

fn assemble(
    index: usize,
    nodes: &[PendingNode],
    summaries: &[Option<(String, SummarySource)>],
) -> TreeNode {
    let pending = &nodes[index];
    let mut node = TreeNode::new(&pending.node_id, &pending.title, pending.range)
        .with_text(pending.text.clone());
    if let Some((summary, source)) = &summaries[index] {
        node = node.with_summary(summary.clone(), *source);
    }
    node.children = pending
        .children
        .iter()
        .map(|&c| assemble(c, nodes, summaries))
        .collect();
    node
}

/// One-line description from the top-level summaries.
fn describe(tree: &DocumentTree) -> Option<String> {
    let firsts: Vec<&str> = tree
        .nodes
        .iter()
        .filter_map(|n| n.summary.as_deref())
        .filter_map(|s| sentences(s).into_iter().next())
        .collect();
    if firsts.is_empty() {
        return None;
    }
    Some(truncate_to_tokens(&firsts.join(" "), 120).to_string())
}
