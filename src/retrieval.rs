//! Query-time retrieval over one or more document trees.
//!
//! Per candidate tree the engine asks the LLM to pick relevant nodes from a
//! flattened `node_id — title — summary` listing. A reply that does not parse
//! gets one reformatting retry; after that, or when the LLM is unreachable,
//! a keyword-overlap scorer takes over. Selected nodes from all candidates
//! are merged, sorted and cut to `top_k`, and their text optionally becomes
//! the context for a grounded answer.

use crate::cancel::CancelToken;
use crate::error::{KnowledgeBaseError, Result};
use crate::llm::{LanguageModel, Prompts};
use crate::structured::{Resolution, ResolutionMethod, extract_json};
use crate::tokens::{estimate_tokens, truncate_to_tokens};
use crate::tree::{DocumentTree, PageRange};
use crate::tree_search::{depth_of, find_node, render_listing, walk};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Answer returned when no node was selected for the query.
pub const NO_RELEVANT_CONTENT: &str =
    "No relevant content was found in the indexed documents for this query.";

/// Answer returned when not even the best-scored node fits the context budget.
pub const CONTEXT_TOO_SMALL: &str =
    "Relevant sections were found, but none fits within the context budget, so no answer was generated.";

const CONTEXT_SEPARATOR: &str = "\n\n---\n\n";

/// Defaults for search requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalOptions {
    pub top_k: usize,
    pub max_context_tokens: usize,
    pub with_answer: bool,
    /// Candidate trees whose node selection runs at the same time.
    pub concurrency: usize,
    /// Overall deadline for one search in seconds; 0 disables it.
    pub timeout_secs: u64,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self {
            top_k: 5,
            max_context_tokens: 16000,
            with_answer: true,
            concurrency: 4,
            timeout_secs: 120,
        }
    }
}

/// One search call.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub query: String,
    pub top_k: usize,
    pub with_answer: bool,
    pub max_context_tokens: usize,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self::from_options(query, &RetrievalOptions::default())
    }

    pub fn from_options(query: impl Into<String>, options: &RetrievalOptions) -> Self {
        Self {
            query: query.into(),
            top_k: options.top_k,
            with_answer: options.with_answer,
            max_context_tokens: options.max_context_tokens,
        }
    }

    pub fn top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn with_answer(mut self, with_answer: bool) -> Self {
        self.with_answer = with_answer;
        self
    }

    pub fn max_context_tokens(mut self, max_context_tokens: usize) -> Self {
        self.max_context_tokens = max_context_tokens;
        self
    }
}

/// A ready tree offered to a search, shared read-only.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub document_id: String,
    pub tree: Arc<DocumentTree>,
}

impl Candidate {
    pub fn new(document_id: impl Into<String>, tree: Arc<DocumentTree>) -> Self {
        Self {
            document_id: document_id.into(),
            tree,
        }
    }
}

/// A node selected for a query, with its full text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub document_id: String,
    pub doc_name: String,
    pub node_id: String,
    pub title: String,
    pub summary: Option<String>,
    pub content: String,
    /// Confidence in `[0, 1]`. Not comparable across scoring methods.
    pub score: f64,
    pub page_index: PageRange,
    pub depth: usize,
    pub scoring_method: ResolutionMethod,
}

/// Ordered results plus the optional synthesized answer.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub results: Vec<SearchResult>,
    pub answer: Option<String>,
    /// Estimated tokens of the context sent for answer synthesis.
    pub context_tokens: usize,
    /// Results left out of the context to respect the budget.
    pub context_dropped: usize,
    /// The search deadline passed. Documents still selecting at that point
    /// were keyword scored, and no answer is synthesized after it.
    pub timed_out: bool,
    pub latency_ms: u64,
}

/// Node ids with scores, most relevant first.
pub type Selection = Vec<(String, f64)>;

#[derive(Debug, Deserialize)]
struct SelectionReply {
    nodes: Vec<SelectedNode>,
}

#[derive(Debug, Deserialize)]
struct SelectedNode {
    node_id: String,
    #[serde(alias = "score")]
    relevance_score: f64,
}

/// Parse and validate a node-selection reply against `tree`.
///
/// Unknown ids are dropped, duplicates keep their first occurrence, scores
/// are clamped to `[0, 1]` and the list is cut to `top_k`. An empty list is
/// a valid "nothing relevant" reply; a non-empty list naming only unknown
/// ids is not.
pub fn parse_selection(response: &str, tree: &DocumentTree, top_k: usize) -> Result<Selection> {
    let json = extract_json(response);
    let selected = match serde_json::from_str::<SelectionReply>(&json) {
        Ok(reply) => reply.nodes,
        Err(object_err) => serde_json::from_str::<Vec<SelectedNode>>(&json).map_err(|_| {
            KnowledgeBaseError::LlmMalformedOutput(format!("selection reply: {}", object_err))
        })?,
    };

    let proposed = selected.len();
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for node in selected {
        if node.relevance_score.is_nan() {
            return Err(KnowledgeBaseError::LlmMalformedOutput(format!(
                "relevance_score for {} is not a number",
                node.node_id
            )));
        }
        let node_id = node.node_id.trim().to_string();
        if find_node(tree, &node_id).is_none() {
            debug!(node_id = %node_id, "selection names an unknown node, dropping it");
            continue;
        }
        if seen.insert(node_id.clone()) {
            out.push((node_id, node.relevance_score.clamp(0.0, 1.0)));
        }
    }

    if proposed > 0 && out.is_empty() {
        return Err(KnowledgeBaseError::LlmMalformedOutput(
            "none of the selected node ids exist in the outline".to_string(),
        ));
    }

    out.truncate(top_k);
    Ok(out)
}

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "do", "does", "for", "from", "how", "in",
    "is", "it", "of", "on", "or", "the", "to", "what", "when", "where", "which", "who", "why",
    "with",
];

fn tokenize(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn query_terms(query: &str) -> BTreeSet<String> {
    let all = tokenize(query);
    let content: BTreeSet<String> = all
        .iter()
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .cloned()
        .collect();
    if content.is_empty() { all } else { content }
}

/// Keyword-overlap relevance: the share of query terms found in a node's
/// title and summary. Nodes without any overlap are left out. Results are
/// ordered by score, then document order.
pub fn keyword_scores(query: &str, tree: &DocumentTree) -> Selection {
    let terms = query_terms(query);
    if terms.is_empty() {
        return Vec::new();
    }

    let mut scored: Selection = walk(&tree.nodes)
        .filter_map(|flat| {
            let node = flat.node;
            let haystack = tokenize(&format!(
                "{} {}",
                node.title,
                node.summary.as_deref().unwrap_or_default()
            ));
            let matched = terms.iter().filter(|t| haystack.contains(*t)).count();
            (matched > 0).then(|| (node.node_id.clone(), matched as f64 / terms.len() as f64))
        })
        .collect();

    // Stable sort keeps document order among equal scores.
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));
    scored
}

/// Context assembled for answer synthesis.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextWindow {
    pub text: String,
    pub included: usize,
    pub dropped: usize,
    pub tokens: usize,
}

fn context_block(result: &SearchResult) -> String {
    let title = if result.title.is_empty() {
        "(untitled)"
    } else {
        result.title.as_str()
    };
    format!(
        "[{} / {} | node {} | {}-{}]\n{}",
        result.doc_name,
        title,
        result.node_id,
        result.page_index.start,
        result.page_index.end,
        result.content
    )
}

/// Concatenate whole node blocks in the given (score) order until the next
/// block would exceed `max_tokens`. Everything after that point is dropped,
/// so the lowest-scored nodes go first and no node is ever cut.
pub fn assemble_context(results: &[SearchResult], max_tokens: usize) -> ContextWindow {
    let mut blocks = Vec::new();
    let mut tokens = 0;

    for result in results {
        let block = context_block(result);
        let cost = estimate_tokens(&block);
        if tokens + cost > max_tokens {
            break;
        }
        tokens += cost;
        blocks.push(block);
    }

    ContextWindow {
        included: blocks.len(),
        dropped: results.len() - blocks.len(),
        text: blocks.join(CONTEXT_SEPARATOR),
        tokens,
    }
}

/// Position of a node in document order. Ids are zero-padded counters whose
/// width grows with the tree, so they compare as numbers, not strings.
fn node_ordinal(node_id: &str) -> (Option<u64>, &str) {
    (node_id.parse().ok(), node_id)
}

/// Deterministic result order: score descending, then document order.
fn rank(results: &mut [(usize, SearchResult)]) {
    results.sort_by(|(ia, a), (ib, b)| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| node_ordinal(&a.node_id).cmp(&node_ordinal(&b.node_id)))
            .then_with(|| a.depth.cmp(&b.depth))
            .then_with(|| ia.cmp(ib))
    });
}

/// LLM-driven retrieval engine.
#[derive(Clone)]
pub struct RetrievalEngine {
    llm: Arc<dyn LanguageModel>,
    concurrency: usize,
    timeout_secs: u64,
}

impl RetrievalEngine {
    pub fn new(llm: Arc<dyn LanguageModel>) -> Self {
        Self::with_options(llm, &RetrievalOptions::default())
    }

    pub fn with_options(llm: Arc<dyn LanguageModel>, options: &RetrievalOptions) -> Self {
        Self {
            llm,
            concurrency: options.concurrency.max(1),
            timeout_secs: options.timeout_secs,
        }
    }

    /// Search `candidates` for `request.query`.
    pub async fn search(
        &self,
        request: &SearchRequest,
        candidates: &[Candidate],
    ) -> Result<SearchResponse> {
        self.search_with_cancel(request, candidates, &CancelToken::new())
            .await
    }

    /// Search, aborting outstanding LLM calls on cancellation.
    pub async fn search_with_cancel(
        &self,
        request: &SearchRequest,
        candidates: &[Candidate],
        cancel: &CancelToken,
    ) -> Result<SearchResponse> {
        if candidates.is_empty() {
            return Err(KnowledgeBaseError::NoCandidates);
        }
        let started = Instant::now();
        let total = candidates.len();
        let top_k = request.top_k.max(1);
        info!(query = %request.query, candidates = total, top_k, "searching");

        let deadline = (self.timeout_secs > 0)
            .then(|| tokio::time::Instant::now() + Duration::from_secs(self.timeout_secs));
        let mut timed_out = false;

        let mut selecting = stream::iter(candidates.iter().enumerate())
            .map(|(index, candidate)| async move {
                (index, self.select(&request.query, candidate, top_k).await)
            })
            .buffer_unordered(self.concurrency);

        let mut finished: Vec<Option<Resolution<Selection>>> = vec![None; total];
        let mut done = 0;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!(completed = done, total, "search cancelled");
                    return Err(KnowledgeBaseError::Cancelled { completed: done, total });
                }
                _ = wait_until(deadline) => {
                    warn!(
                        completed = done,
                        total,
                        "search deadline reached, keyword scoring the remaining documents"
                    );
                    timed_out = true;
                    break;
                }
                next = selecting.next() => match next {
                    Some((index, selection)) => {
                        finished[index] = Some(selection);
                        done += 1;
                    }
                    None => break,
                },
            }
        }
        drop(selecting);

        let selections = finished.into_iter().enumerate().map(|(index, selection)| {
            let selection = selection.unwrap_or_else(|| {
                keyword_selection(&request.query, &candidates[index].tree, top_k)
            });
            (index, selection)
        });

        let mut merged = Vec::new();
        for (index, selection) in selections {
            let candidate = &candidates[index];
            let method = selection.method();
            for (node_id, score) in selection.into_inner() {
                if let Some(result) = resolve(candidate, &node_id, score, method) {
                    merged.push((index, result));
                }
            }
        }
        rank(&mut merged);
        merged.truncate(top_k);
        let results: Vec<SearchResult> = merged.into_iter().map(|(_, r)| r).collect();

        let mut response = SearchResponse {
            query: request.query.clone(),
            results,
            answer: None,
            context_tokens: 0,
            context_dropped: 0,
            timed_out,
            latency_ms: 0,
        };

        if request.with_answer {
            if response.results.is_empty() {
                response.answer = Some(NO_RELEVANT_CONTENT.to_string());
            } else {
                let window = assemble_context(&response.results, request.max_context_tokens);
                response.context_tokens = window.tokens;
                response.context_dropped = window.dropped;
                if window.dropped > 0 {
                    info!(
                        included = window.included,
                        dropped = window.dropped,
                        budget = request.max_context_tokens,
                        "dropped lowest-scored nodes from context"
                    );
                }

                if window.included == 0 {
                    response.answer = Some(CONTEXT_TOO_SMALL.to_string());
                } else if response.timed_out {
                    warn!("no time left for answer synthesis, returning results only");
                } else {
                    response.answer = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            warn!("search cancelled during answer synthesis");
                            return Err(KnowledgeBaseError::Cancelled { completed: total, total });
                        }
                        _ = wait_until(deadline) => {
                            warn!("search deadline reached during answer synthesis, returning results only");
                            response.timed_out = true;
                            None
                        }
                        answer = self.answer(&request.query, &window.text) => answer,
                    };
                }
            }
        }

        response.latency_ms = started.elapsed().as_millis() as u64;
        info!(
            results = response.results.len(),
            answered = response.answer.is_some(),
            latency_ms = response.latency_ms,
            "search complete"
        );
        Ok(response)
    }

    /// Pick nodes from one tree: structured reply, one reformat, then keywords.
    async fn select(&self, query: &str, candidate: &Candidate, top_k: usize) -> Resolution<Selection> {
        let tree = candidate.tree.as_ref();
        let document_id = candidate.document_id.as_str();
        let system = Some(Prompts::system_document_analyzer());
        let schema = Prompts::selection_schema();
        let prompt = Prompts::select_nodes()
            .replace("{doc_name}", &tree.doc_name)
            .replace("{top_k}", &top_k.to_string())
            .replace("{query}", query)
            .replace("{listing}", &render_listing(tree));

        let fallback = || keyword_selection(query, tree, top_k);

        let (previous, error) = match self.llm.complete(system, &prompt, Some(&schema)).await {
            Ok(reply) => match parse_selection(&reply, tree, top_k) {
                Ok(selection) => {
                    debug!(document_id, selected = selection.len(), method = "structured", "nodes selected");
                    return Resolution::Structured(selection);
                }
                Err(e) => (reply, e),
            },
            Err(e) if e.is_unavailable() => {
                warn!(document_id, error = %e, "LLM unavailable, using keyword scoring");
                return fallback();
            }
            Err(e) => (String::from("(no usable reply)"), e),
        };

        warn!(document_id, error = %error, "selection reply malformed, asking for a reformat");
        let reformat = Prompts::reformat_selection()
            .replace("{top_k}", &top_k.to_string())
            .replace("{error}", &error.to_string())
            .replace("{previous}", truncate_to_tokens(&previous, 1000));
        let retry_prompt = format!("{}\n\n{}", prompt, reformat);

        match self.llm.complete(system, &retry_prompt, Some(&schema)).await {
            Ok(reply) => match parse_selection(&reply, tree, top_k) {
                Ok(selection) => {
                    debug!(document_id, selected = selection.len(), method = "reformatted", "nodes selected");
                    Resolution::Reformatted(selection)
                }
                Err(e) => {
                    warn!(document_id, error = %e, "selection still malformed, using keyword scoring");
                    fallback()
                }
            },
            Err(e) => {
                warn!(document_id, error = %e, "selection retry failed, using keyword scoring");
                fallback()
            }
        }
    }

    async fn answer(&self, query: &str, context: &str) -> Option<String> {
        let prompt = Prompts::answer()
            .replace("{query}", query)
            .replace("{context}", context);
        match self.llm.complete(Some(Prompts::answer_system()), &prompt, None).await {
            Ok(answer) if !answer.trim().is_empty() => Some(answer.trim().to_string()),
            Ok(_) => {
                warn!("answer synthesis returned an empty reply");
                None
            }
            Err(e) => {
                warn!(error = %e, "answer synthesis failed, returning results only");
                None
            }
        }
    }
}

/// Keyword-scored selection, used when the LLM cannot provide one.
fn keyword_selection(query: &str, tree: &DocumentTree, top_k: usize) -> Resolution<Selection> {
    let mut scores = keyword_scores(query, tree);
    scores.truncate(top_k);
    Resolution::Fallback(scores)
}

/// Resolve at `deadline`, or never when there is none.
async fn wait_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn resolve(
    candidate: &Candidate,
    node_id: &str,
    score: f64,
    method: ResolutionMethod,
) -> Option<SearchResult> {
    let tree = candidate.tree.as_ref();
    let node = find_node(tree, node_id)?;
    let depth = depth_of(tree, node_id)?;
    Some(SearchResult {
        document_id: candidate.document_id.clone(),
        doc_name: tree.doc_name.clone(),
        node_id: node.node_id.clone(),
        title: node.title.clone(),
        summary: node.summary.clone(),
        content: node.text.clone(),
        score,
        page_index: node.page_index,
        depth,
        scoring_method: method,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{OfflineModel, ScriptedModel};
    use crate::tree::{SummarySource, TreeNode};

    fn leaf(id: &str, title: &str, summary: &str, text: &str, start: usize) -> TreeNode {
        TreeNode::new(id, title, PageRange::new(start, start))
            .with_summary(summary, SummarySource::Generated)
            .with_text(text)
    }

    fn pets() -> Arc<DocumentTree> {
        Arc::new(DocumentTree::new(
            "Pets",
            vec![
                leaf("0000", "A", "intro to cats", "Cats are independent.", 1),
                leaf("0001", "B", "intro to dogs", "Dogs are loyal.", 2),
            ],
        ))
    }

    fn candidates() -> Vec<Candidate> {
        vec![Candidate::new("pets", pets())]
    }

    /// Replies to selection prompts with `selection` and to answer prompts
    /// with a fixed answer.
    fn oracle(selection: &'static str) -> ScriptedModel {
        ScriptedModel::new(move |prompt| {
            if prompt.starts_with("Question:") {
                Ok("Dogs are loyal.".to_string())
            } else {
                Ok(selection.to_string())
            }
        })
    }

    #[test]
    fn test_keyword_fallback_ranks_dogs_node_first() {
        let tree = pets();
        let scores = keyword_scores("dogs", &tree);
        assert_eq!(scores[0].0, "0001");
        assert!(scores.iter().all(|(id, _)| id != "0000"));

        let scores = keyword_scores("intro to dogs", &tree);
        assert_eq!(scores, vec![("0001".to_string(), 1.0), ("0000".to_string(), 0.5)]);
    }

    #[test]
    fn test_keyword_scores_are_case_insensitive_ratios() {
        let tree = pets();
        let scores = keyword_scores("DOGS and Parrots", &tree);
        assert_eq!(scores, vec![("0001".to_string(), 0.5)]);
        assert!(keyword_scores("the", &tree).is_empty());
        assert!(keyword_scores("   ", &tree).is_empty());
    }

    #[test]
    fn test_parse_selection_validates_reply() {
        let tree = pets();
        let fenced = "```json\n{\"nodes\": [{\"node_id\": \"0001\", \"relevance_score\": 1.4}, {\"node_id\": \"0001\", \"relevance_score\": 0.2}, {\"node_id\": \"9999\", \"relevance_score\": 0.9}, {\"node_id\": \"0000\", \"relevance_score\": -1}]}\n```";
        let selection = parse_selection(fenced, &tree, 5).unwrap();
        assert_eq!(
            selection,
            vec![("0001".to_string(), 1.0), ("0000".to_string(), 0.0)]
        );

        let truncated = parse_selection(fenced, &tree, 1).unwrap();
        assert_eq!(truncated.len(), 1);

        let bare = r#"[{"node_id": "0000", "score": 0.3}]"#;
        assert_eq!(parse_selection(bare, &tree, 5).unwrap()[0].1, 0.3);

        assert!(parse_selection(r#"{"nodes": []}"#, &tree, 5).unwrap().is_empty());
    }

    #[test]
    fn test_parse_selection_rejects_garbage() {
        let tree = pets();
        for reply in [
            "I think section B is relevant.",
            r#"{"nodes": [{"node_id": "4242", "relevance_score": 0.8}]}"#,
            r#"{"nodes": [{"node_id": "0001"}]}"#,
        ] {
            assert!(matches!(
                parse_selection(reply, &tree, 5),
                Err(KnowledgeBaseError::LlmMalformedOutput(_))
            ));
        }
    }

    #[test]
    fn test_context_drops_lowest_scored_whole_nodes() {
        let result = |id: &str, score: f64, words: usize| SearchResult {
            document_id: "doc".into(),
            doc_name: "Doc".into(),
            node_id: id.into(),
            title: format!("Section {}", id),
            summary: None,
            content: vec!["word"; words].join(" "),
            score,
            page_index: PageRange::new(1, 1),
            depth: 0,
            scoring_method: ResolutionMethod::Structured,
        };
        let results = vec![result("0001", 0.9, 30), result("0002", 0.8, 30), result("0003", 0.1, 3)];

        let one = estimate_tokens(&context_block(&results[0]));
        let two = one + estimate_tokens(&context_block(&results[1]));
        let window = assemble_context(&results, two + 1);

        assert_eq!(window.included, 2);
        assert_eq!(window.dropped, 1);
        assert!(window.tokens <= two + 1);
        assert!(window.text.contains(&results[0].content));
        assert!(window.text.contains(&results[1].content));
        assert!(!window.text.contains("node 0003"));

        // Budget smaller than the second node keeps only the first, and the
        // small third node is not pulled in ahead of the second.
        let window = assemble_context(&results, two - 1);
        assert_eq!(window.included, 1);
        assert!(!window.text.contains("node 0003"));

        assert_eq!(assemble_context(&results, 1).included, 0);
    }

    #[test]
    fn test_rank_orders_ids_of_different_widths_numerically() {
        let hit = |document_id: &str, node_id: &str| SearchResult {
            document_id: document_id.into(),
            doc_name: document_id.into(),
            node_id: node_id.into(),
            title: String::new(),
            summary: None,
            content: String::new(),
            score: 0.5,
            page_index: PageRange::new(1, 1),
            depth: 1,
            scoring_method: ResolutionMethod::Structured,
        };
        // "01000" sorts before "0999" as a string
        let mut results = vec![(0, hit("large", "01000")), (1, hit("small", "0999"))];
        rank(&mut results);
        let order: Vec<&str> = results.iter().map(|(_, r)| r.node_id.as_str()).collect();
        assert_eq!(order, vec!["0999", "01000"]);
    }

    #[test]
    fn test_context_budget_counts_text_without_spaces() {
        let result = SearchResult {
            document_id: "doc".into(),
            doc_name: "手册".into(),
            node_id: "0001".into(),
            title: "安装".into(),
            summary: None,
            content: "安装前请先检查网络代理设置是否正确。".repeat(270),
            score: 0.9,
            page_index: PageRange::new(1, 1),
            depth: 0,
            scoring_method: ResolutionMethod::Structured,
        };
        assert!(result.content.chars().count() >= 4800);

        let window = assemble_context(std::slice::from_ref(&result), 50);
        assert_eq!(window.included, 0);
        assert_eq!(window.dropped, 1);
        assert!(window.text.is_empty());
    }

    #[tokio::test]
    async fn test_no_candidates_is_an_error() {
        let engine = RetrievalEngine::new(Arc::new(OfflineModel));
        let result = engine.search(&SearchRequest::new("dogs"), &[]).await;
        assert!(matches!(result, Err(KnowledgeBaseError::NoCandidates)));
    }

    #[tokio::test]
    async fn test_structured_selection_and_answer() {
        let model = oracle(r#"{"nodes": [{"node_id": "0001", "relevance_score": 0.92}]}"#);
        let engine = RetrievalEngine::new(Arc::new(model.clone()));

        let response = engine
            .search(&SearchRequest::new("Which pet is loyal?"), &candidates())
            .await
            .unwrap();

        assert_eq!(response.results.len(), 1);
        let hit = &response.results[0];
        assert_eq!(hit.node_id, "0001");
        assert_eq!(hit.content, "Dogs are loyal.");
        assert_eq!(hit.score, 0.92);
        assert_eq!(hit.scoring_method, ResolutionMethod::Structured);
        assert_eq!(response.answer.as_deref(), Some("Dogs are loyal."));
        assert_eq!(model.calls(), 2);
    }

    #[tokio::test]
    async fn test_reformat_retry_recovers() {
        let model = ScriptedModel::new(|prompt| {
            if prompt.contains("could not be parsed") {
                Ok(r#"{"nodes": [{"node_id": "0000", "relevance_score": 0.7}]}"#.to_string())
            } else {
                Ok("Section A, definitely.".to_string())
            }
        });
        let engine = RetrievalEngine::new(Arc::new(model.clone()));
        let request = SearchRequest::new("cats").with_answer(false);

        let response = engine.search(&request, &candidates()).await.unwrap();
        assert_eq!(response.results[0].node_id, "0000");
        assert_eq!(response.results[0].scoring_method, ResolutionMethod::Reformatted);
        assert_eq!(model.calls(), 2);
    }

    #[tokio::test]
    async fn test_malformed_twice_falls_back_to_keywords() {
        let model = ScriptedModel::constant("no json here, sorry");
        let engine = RetrievalEngine::new(Arc::new(model.clone()));
        let request = SearchRequest::new("dogs").with_answer(false);

        let response = engine.search(&request, &candidates()).await.unwrap();
        assert_eq!(response.results.len(), 1);
        assert_eq!(response.results[0].node_id, "0001");
        assert_eq!(response.results[0].score, 1.0);
        assert_eq!(response.results[0].scoring_method, ResolutionMethod::Fallback);
        assert_eq!(model.calls(), 2);
    }

    #[tokio::test]
    async fn test_nothing_relevant_skips_answer_call() {
        let model = ScriptedModel::new(|_| Err(KnowledgeBaseError::LlmUnavailable("down".into())));
        let engine = RetrievalEngine::new(Arc::new(model.clone()));

        let response = engine
            .search(&SearchRequest::new("quantum chromodynamics"), &candidates())
            .await
            .unwrap();

        assert!(response.results.is_empty());
        assert_eq!(response.answer.as_deref(), Some(NO_RELEVANT_CONTENT));
        // one selection attempt, no answer call
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test]
    async fn test_empty_selection_is_a_valid_zero_result() {
        let model = oracle(r#"{"nodes": []}"#);
        let engine = RetrievalEngine::new(Arc::new(model.clone()));

        let response = engine
            .search(&SearchRequest::new("dogs"), &candidates())
            .await
            .unwrap();
        assert!(response.results.is_empty());
        assert_eq!(response.answer.as_deref(), Some(NO_RELEVANT_CONTENT));
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test]
    async fn test_merge_sorts_and_breaks_ties_by_node_id() {
        let model = ScriptedModel::new(|prompt| {
            if prompt.contains("Document: Pets") {
                Ok(r#"{"nodes": [{"node_id": "0001", "relevance_score": 0.5}, {"node_id": "0000", "relevance_score": 0.4}]}"#.into())
            } else {
                Ok(r#"{"nodes": [{"node_id": "0000", "relevance_score": 0.5}, {"node_id": "0001", "relevance_score": 0.9}]}"#.into())
            }
        });
        let other = Arc::new(DocumentTree::new(
            "Birds",
            vec![
                leaf("0000", "Parrots", "talking birds", "Parrots talk.", 1),
                leaf("0001", "Owls", "night birds", "Owls hunt at night.", 2),
            ],
        ));
        let candidates = vec![Candidate::new("pets", pets()), Candidate::new("birds", other)];
        let engine = RetrievalEngine::new(Arc::new(model));
        let request = SearchRequest::new("animals").top_k(3).with_answer(false);

        let response = engine.search(&request, &candidates).await.unwrap();
        let order: Vec<(&str, &str)> = response
            .results
            .iter()
            .map(|r| (r.document_id.as_str(), r.node_id.as_str()))
            .collect();
        assert_eq!(order, vec![("birds", "0001"), ("birds", "0000"), ("pets", "0001")]);
    }

    #[tokio::test]
    async fn test_context_budget_too_small_for_any_node() {
        let model = oracle(r#"{"nodes": [{"node_id": "0001", "relevance_score": 0.9}]}"#);
        let engine = RetrievalEngine::new(Arc::new(model.clone()));
        let request = SearchRequest::new("dogs").max_context_tokens(1);

        let response = engine.search(&request, &candidates()).await.unwrap();
        assert_eq!(response.results.len(), 1);
        assert_eq!(response.answer.as_deref(), Some(CONTEXT_TOO_SMALL));
        assert_eq!(response.context_dropped, 1);
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_answer_keeps_results() {
        let model = ScriptedModel::new(|prompt| {
            if prompt.starts_with("Question:") {
                Err(KnowledgeBaseError::LlmUnavailable("down".into()))
            } else {
                Ok(r#"{"nodes": [{"node_id": "0000", "relevance_score": 0.6}]}"#.into())
            }
        });
        let engine = RetrievalEngine::new(Arc::new(model));

        let response = engine
            .search(&SearchRequest::new("cats"), &candidates())
            .await
            .unwrap();
        assert_eq!(response.results.len(), 1);
        assert!(response.answer.is_none());
    }

    #[tokio::test]
    async fn test_cancelled_search() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let model = oracle(r#"{"nodes": []}"#);
        let engine = RetrievalEngine::new(Arc::new(model.clone()));

        let result = engine
            .search_with_cancel(&SearchRequest::new("dogs"), &candidates(), &cancel)
            .await;
        assert!(matches!(result, Err(KnowledgeBaseError::Cancelled { completed: 0, total: 1 })));
        assert_eq!(model.calls(), 0);
    }

    /// Answers selection prompts for Pets at once and never returns for Birds.
    struct StallsOnBirds;

    #[async_trait::async_trait]
    impl LanguageModel for StallsOnBirds {
        async fn complete(
            &self,
            _system: Option<&str>,
            prompt: &str,
            _schema: Option<&crate::llm::ResponseSchema>,
        ) -> Result<String> {
            if prompt.contains("Document: Birds") {
                std::future::pending::<()>().await;
            }
            Ok(r#"{"nodes": [{"node_id": "0001", "relevance_score": 0.9}]}"#.to_string())
        }
    }

    #[tokio::test]
    async fn test_deadline_keeps_finished_selections() {
        let birds = Arc::new(DocumentTree::new(
            "Birds",
            vec![
                leaf("0000", "Parrots", "talking birds", "Parrots talk.", 1),
                leaf("0001", "Owls", "night birds", "Owls hunt at night.", 2),
            ],
        ));
        let candidates = vec![Candidate::new("pets", pets()), Candidate::new("birds", birds)];
        let options = RetrievalOptions {
            timeout_secs: 1,
            ..RetrievalOptions::default()
        };
        let engine = RetrievalEngine::with_options(Arc::new(StallsOnBirds), &options);

        let response = engine
            .search(&SearchRequest::new("loyal dogs and owls"), &candidates)
            .await
            .unwrap();

        assert!(response.timed_out);
        assert!(response.answer.is_none());
        let order: Vec<(&str, &str, ResolutionMethod)> = response
            .results
            .iter()
            .map(|r| (r.document_id.as_str(), r.node_id.as_str(), r.scoring_method))
            .collect();
        assert_eq!(
            order,
            vec![
                ("pets", "0001", ResolutionMethod::Structured),
                ("birds", "0001", ResolutionMethod::Fallback),
            ]
        );
    }

    #[test]
    fn test_retrieval_options_default() {
        let options = RetrievalOptions::default();
        let request = SearchRequest::from_options("q", &options);
        assert_eq!(request.top_k, 5);
        assert_eq!(request.max_context_tokens, 16000);
        assert!(request.with_answer);
    }
}
