//! Document lifecycle: `pending → indexing → ready | error`.
//!
//! The manager owns one entry per document and drives the [`IndexEngine`]
//! and [`RetrievalEngine`] against it. The map lock is only ever held for
//! bookkeeping, never across an LLM call or a store write. A new tree is
//! swapped in as one `Arc` once it is fully built and persisted, so readers
//! see either the old tree or the new one.

use crate::cancel::CancelToken;
use crate::config::Config;
use crate::document::Document;
use crate::error::{KnowledgeBaseError, Result};
use crate::indexer::{IndexEngine, IndexOptions};
use crate::llm::LanguageModel;
use crate::outline::RawOutline;
use crate::retrieval::{Candidate, RetrievalEngine, RetrievalOptions, SearchRequest, SearchResponse};
use crate::tree::{DocumentTree, TreeNode};
use crate::tree_search::find_node;
use crate::validate::{ValidationReport, validate_tree};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

/// Why a document ended in the `error` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Failed,
    Cancelled,
    TimedOut,
}

/// Lifecycle state of one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum DocumentState {
    Pending,
    Indexing,
    Ready,
    Error {
        kind: FailureKind,
        message: String,
        /// Nodes summarized before the build stopped, when known.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        completed: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total: Option<usize>,
    },
}

impl DocumentState {
    pub fn name(&self) -> &'static str {
        match self {
            DocumentState::Pending => "pending",
            DocumentState::Indexing => "indexing",
            DocumentState::Ready => "ready",
            DocumentState::Error { .. } => "error",
        }
    }

    /// Whether moving to `next` is a legal lifecycle step.
    pub fn can_transition_to(&self, next: &DocumentState) -> bool {
        matches!(
            (self, next),
            (DocumentState::Pending, DocumentState::Indexing)
                | (DocumentState::Indexing, DocumentState::Ready)
                | (DocumentState::Indexing, DocumentState::Error { .. })
                | (DocumentState::Ready, DocumentState::Indexing)
                | (DocumentState::Error { .. }, DocumentState::Indexing)
        )
    }

    /// Return `next` if the step is legal.
    pub fn transition(&self, next: DocumentState) -> Result<DocumentState> {
        if self.can_transition_to(&next) {
            Ok(next)
        } else {
            Err(KnowledgeBaseError::InvalidTransition {
                from: self.name().to_string(),
                to: next.name().to_string(),
            })
        }
    }

    /// Error state describing why an index build failed.
    pub fn from_failure(error: &KnowledgeBaseError) -> Self {
        let (kind, completed, total) = match error {
            KnowledgeBaseError::Cancelled { completed, total } => {
                (FailureKind::Cancelled, Some(*completed), Some(*total))
            }
            KnowledgeBaseError::Timeout { completed, total } => {
                (FailureKind::TimedOut, Some(*completed), Some(*total))
            }
            _ => (FailureKind::Failed, None, None),
        };
        DocumentState::Error {
            kind,
            message: error.to_string(),
            completed,
            total,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, DocumentState::Ready)
    }
}

impl fmt::Display for DocumentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentState::Error { message, .. } => write!(f, "error: {}", message),
            other => f.write_str(other.name()),
        }
    }
}

/// Persisted status record for one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentStatus {
    pub document_id: String,
    pub name: String,
    #[serde(flatten)]
    pub state: DocumentState,
    /// Version of the committed tree, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tree_version: Option<u64>,
    pub updated_at: DateTime<Utc>,
}

/// Storage collaborator for trees and status records.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn save_tree(&self, document_id: &str, tree: &DocumentTree) -> Result<()>;

    /// The stored tree, or `None` if nothing was saved for this document.
    async fn load_tree(&self, document_id: &str) -> Result<Option<DocumentTree>>;

    async fn set_status(&self, status: &DocumentStatus) -> Result<()>;

    /// Every known status record, ordered by document id.
    async fn list(&self) -> Result<Vec<DocumentStatus>>;

    /// Remove the tree and status of a document. Returns whether anything
    /// was stored for it.
    async fn delete(&self, document_id: &str) -> Result<bool>;

    /// Bytes used by stored trees and status records.
    async fn storage_bytes(&self) -> Result<u64>;
}

/// Process-local store, used by tests and the offline CLI paths.
#[derive(Debug, Default)]
pub struct MemoryStore {
    trees: tokio::sync::RwLock<HashMap<String, DocumentTree>>,
    statuses: tokio::sync::RwLock<BTreeMap<String, DocumentStatus>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn save_tree(&self, document_id: &str, tree: &DocumentTree) -> Result<()> {
        self.trees
            .write()
            .await
            .insert(document_id.to_string(), tree.clone());
        Ok(())
    }

    async fn load_tree(&self, document_id: &str) -> Result<Option<DocumentTree>> {
        Ok(self.trees.read().await.get(document_id).cloned())
    }

    async fn set_status(&self, status: &DocumentStatus) -> Result<()> {
        self.statuses
            .write()
            .await
            .insert(status.document_id.clone(), status.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<DocumentStatus>> {
        Ok(self.statuses.read().await.values().cloned().collect())
    }

    async fn delete(&self, document_id: &str) -> Result<bool> {
        let tree = self.trees.write().await.remove(document_id);
        let status = self.statuses.write().await.remove(document_id);
        Ok(tree.is_some() || status.is_some())
    }

    // Sized as the JSON a FileStore would write.
    async fn storage_bytes(&self) -> Result<u64> {
        let mut total = 0;
        for tree in self.trees.read().await.values() {
            total += serde_json::to_vec(tree)?.len() as u64;
        }
        for status in self.statuses.read().await.values() {
            total += serde_json::to_vec(status)?.len() as u64;
        }
        Ok(total)
    }
}

/// One document of an [`DocumentManager::index_batch`] run.
#[derive(Debug, Clone)]
pub struct IndexJob {
    pub document_id: String,
    pub outline: RawOutline,
    pub document: Document,
}

/// Outcome of a batch run; both lists are ordered by document id.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchReport {
    pub succeeded: Vec<String>,
    /// `(document_id, error message)`
    pub failed: Vec<(String, String)>,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }
}

/// Document counts and storage use.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StorageStats {
    pub total_documents: usize,
    /// Count per lifecycle state name; every state is present.
    pub by_state: BTreeMap<String, usize>,
    /// Nodes across all committed trees.
    pub total_nodes: usize,
    pub storage_bytes: u64,
}

struct Entry {
    name: String,
    state: DocumentState,
    tree: Option<Arc<DocumentTree>>,
    cancel: Option<CancelToken>,
    /// Bumped by every index run; a finishing run only commits if it is
    /// still the latest.
    generation: u64,
    updated_at: DateTime<Utc>,
}

impl Entry {
    fn new(name: String) -> Self {
        Self {
            name,
            state: DocumentState::Pending,
            tree: None,
            cancel: None,
            generation: 0,
            updated_at: Utc::now(),
        }
    }

    fn set_state(&mut self, state: DocumentState) {
        self.state = state;
        self.updated_at = Utc::now();
    }

    /// A committed tree is searchable while ready and while being re-indexed.
    fn searchable_tree(&self) -> Option<&Arc<DocumentTree>> {
        match self.state {
            DocumentState::Ready | DocumentState::Indexing => self.tree.as_ref(),
            _ => None,
        }
    }

    fn status(&self, document_id: &str) -> DocumentStatus {
        DocumentStatus {
            document_id: document_id.to_string(),
            name: self.name.clone(),
            state: self.state.clone(),
            tree_version: self.tree.as_ref().map(|t| t.version),
            updated_at: self.updated_at,
        }
    }
}

/// Marks the document cancelled if an index future is dropped before it
/// reaches a terminal state.
struct IndexingGuard<'a> {
    manager: &'a DocumentManager,
    document_id: &'a str,
    generation: u64,
    armed: bool,
}

impl Drop for IndexingGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let status = {
            let mut documents = self.manager.write_documents();
            match documents.get_mut(self.document_id) {
                Some(entry)
                    if entry.generation == self.generation
                        && entry.state == DocumentState::Indexing =>
                {
                    warn!(document_id = self.document_id, "index operation dropped before completion");
                    entry.cancel = None;
                    entry.set_state(DocumentState::Error {
                        kind: FailureKind::Cancelled,
                        message: "index operation was abandoned before completion".to_string(),
                        completed: None,
                        total: None,
                    });
                    entry.status(self.document_id)
                }
                _ => return,
            }
        };

        // Drop cannot await; hand the write to the runtime that was driving us.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let store = self.manager.store.clone();
                handle.spawn(async move {
                    if let Err(e) = store.set_status(&status).await {
                        warn!(document_id = %status.document_id, error = %e, "failed to persist cancelled status");
                    }
                });
            }
            Err(_) => warn!(
                document_id = self.document_id,
                "no runtime available, cancelled status not persisted"
            ),
        }
    }
}

/// Coordinates indexing and search against document lifecycle state.
pub struct DocumentManager {
    documents: RwLock<HashMap<String, Entry>>,
    indexer: IndexEngine,
    retriever: RetrievalEngine,
    store: Arc<dyn DocumentStore>,
    index_options: IndexOptions,
    retrieval_options: RetrievalOptions,
}

impl DocumentManager {
    pub fn new(llm: Arc<dyn LanguageModel>, store: Arc<dyn DocumentStore>) -> Self {
        Self::with_options(llm, store, IndexOptions::default(), RetrievalOptions::default())
    }

    pub fn with_options(
        llm: Arc<dyn LanguageModel>,
        store: Arc<dyn DocumentStore>,
        index_options: IndexOptions,
        retrieval_options: RetrievalOptions,
    ) -> Self {
        Self {
            documents: RwLock::new(HashMap::new()),
            indexer: IndexEngine::new(llm.clone()),
            retriever: RetrievalEngine::with_options(llm, &retrieval_options),
            store,
            index_options,
            retrieval_options,
        }
    }

    /// Manager configured from the `index` and `retrieval` config sections.
    pub fn from_config(
        llm: Arc<dyn LanguageModel>,
        store: Arc<dyn DocumentStore>,
        config: &Config,
    ) -> Self {
        Self::with_options(llm, store, config.index.clone(), config.retrieval.clone())
    }

    pub fn index_options(&self) -> &IndexOptions {
        &self.index_options
    }

    pub fn retrieval_options(&self) -> &RetrievalOptions {
        &self.retrieval_options
    }

    // A panic while holding the lock cannot leave an entry half-written:
    // every mutation is a single field assignment.
    fn read_documents(&self) -> RwLockReadGuard<'_, HashMap<String, Entry>> {
        self.documents.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_documents(&self) -> RwLockWriteGuard<'_, HashMap<String, Entry>> {
        self.documents.write().unwrap_or_else(|e| e.into_inner())
    }

    async fn persist_status(&self, status: DocumentStatus) {
        if let Err(e) = self.store.set_status(&status).await {
            warn!(document_id = %status.document_id, error = %e, "failed to persist document status");
        }
    }

    /// Register a document as `pending`. Registering a known id is a no-op
    /// that returns its current status.
    pub async fn register(&self, document_id: &str, name: &str) -> DocumentStatus {
        let (status, created) = {
            let mut documents = self.write_documents();
            match documents.get(document_id) {
                Some(entry) => (entry.status(document_id), false),
                None => {
                    let entry = Entry::new(name.to_string());
                    let status = entry.status(document_id);
                    documents.insert(document_id.to_string(), entry);
                    (status, true)
                }
            }
        };
        if created {
            info!(document_id, name, "document registered");
            self.persist_status(status.clone()).await;
        }
        status
    }

    /// Index (or re-index) a document and commit the new tree.
    ///
    /// Unknown ids are registered first. On failure the document moves to
    /// `error` and any previously committed tree is kept.
    pub async fn index(
        &self,
        document_id: &str,
        outline: &RawOutline,
        document: &Document,
        options: Option<&IndexOptions>,
    ) -> Result<Arc<DocumentTree>> {
        self.register(document_id, &document.name).await;

        let cancel = CancelToken::new();
        let (generation, previous_version, status) = {
            let mut documents = self.write_documents();
            let entry = documents
                .get_mut(document_id)
                .ok_or_else(|| KnowledgeBaseError::DocumentNotFound(document_id.to_string()))?;
            let next = entry.state.transition(DocumentState::Indexing)?;
            entry.set_state(next);
            entry.name = document.name.clone();
            entry.generation += 1;
            entry.cancel = Some(cancel.clone());
            (
                entry.generation,
                entry.tree.as_ref().map(|t| t.version),
                entry.status(document_id),
            )
        };

        let mut guard = IndexingGuard {
            manager: self,
            document_id,
            generation,
            armed: true,
        };
        info!(document_id, generation, "indexing started");
        self.persist_status(status).await;

        let options = options.unwrap_or(&self.index_options);
        let built = self
            .indexer
            .build_tree_with_cancel(outline, document, options, &cancel)
            .await;

        let built = match built {
            Ok(mut tree) => {
                tree.version = previous_version.map_or(1, |v| v + 1);
                self.store
                    .save_tree(document_id, &tree)
                    .await
                    .map(|()| Arc::new(tree))
            }
            Err(e) => Err(e),
        };

        let (result, status) = {
            let mut documents = self.write_documents();
            let entry = documents
                .get_mut(document_id)
                .ok_or_else(|| KnowledgeBaseError::DocumentNotFound(document_id.to_string()))?;
            guard.armed = false;
            if entry.generation != generation {
                debug!(document_id, generation, "superseded index run finished, discarding");
                return Err(KnowledgeBaseError::Cancelled {
                    completed: 0,
                    total: 0,
                });
            }
            entry.cancel = None;

            let result = match built {
                Ok(tree) => {
                    entry.tree = Some(tree.clone());
                    entry.set_state(DocumentState::Ready);
                    info!(
                        document_id,
                        version = tree.version,
                        nodes = tree.node_count(),
                        "tree committed"
                    );
                    Ok(tree)
                }
                Err(e) => {
                    let failed = DocumentState::from_failure(&e);
                    warn!(document_id, error = %e, "indexing failed");
                    entry.set_state(failed);
                    Err(e)
                }
            };
            (result, entry.status(document_id))
        };

        self.persist_status(status).await;
        result
    }

    /// Index several documents, at most `max_concurrent` at a time.
    ///
    /// One document failing does not stop the others; each ends in its own
    /// `ready` or `error` state.
    pub async fn index_batch(&self, jobs: &[IndexJob], max_concurrent: usize) -> BatchReport {
        info!(documents = jobs.len(), max_concurrent, "batch indexing started");
        let mut report = BatchReport::default();

        let mut runs = stream::iter(jobs)
            .map(|job| async move {
                let result = self
                    .index(&job.document_id, &job.outline, &job.document, None)
                    .await;
                (job.document_id.as_str(), result)
            })
            .buffer_unordered(max_concurrent.max(1));

        while let Some((document_id, result)) = runs.next().await {
            match result {
                Ok(_) => report.succeeded.push(document_id.to_string()),
                Err(e) => report.failed.push((document_id.to_string(), e.to_string())),
            }
        }

        report.succeeded.sort();
        report.failed.sort();
        info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "batch indexing finished"
        );
        report
    }

    /// Forget a document and remove everything stored for it.
    ///
    /// Refused while the document is indexing; cancel the run first.
    pub async fn delete(&self, document_id: &str) -> Result<()> {
        {
            let mut documents = self.write_documents();
            let entry = documents
                .get(document_id)
                .ok_or_else(|| KnowledgeBaseError::DocumentNotFound(document_id.to_string()))?;
            if entry.state == DocumentState::Indexing {
                return Err(KnowledgeBaseError::DocumentBusy(document_id.to_string()));
            }
            documents.remove(document_id);
        }
        let removed = self.store.delete(document_id).await?;
        info!(document_id, removed, "document deleted");
        Ok(())
    }

    /// Request cancellation of an in-flight index run.
    ///
    /// Returns whether a run was signalled. The run itself records the
    /// `error` state once its outstanding LLM calls are dropped.
    pub fn cancel(&self, document_id: &str) -> Result<bool> {
        let documents = self.read_documents();
        let entry = documents
            .get(document_id)
            .ok_or_else(|| KnowledgeBaseError::DocumentNotFound(document_id.to_string()))?;
        match &entry.cancel {
            Some(token) if entry.state == DocumentState::Indexing => {
                info!(document_id, "cancelling index run");
                token.cancel();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub fn state(&self, document_id: &str) -> Result<DocumentState> {
        self.read_documents()
            .get(document_id)
            .map(|entry| entry.state.clone())
            .ok_or_else(|| KnowledgeBaseError::DocumentNotFound(document_id.to_string()))
    }

    pub fn status(&self, document_id: &str) -> Result<DocumentStatus> {
        self.read_documents()
            .get(document_id)
            .map(|entry| entry.status(document_id))
            .ok_or_else(|| KnowledgeBaseError::DocumentNotFound(document_id.to_string()))
    }

    /// Status of every document, ordered by id.
    pub fn statuses(&self) -> Vec<DocumentStatus> {
        let documents = self.read_documents();
        let mut all: Vec<DocumentStatus> = documents
            .iter()
            .map(|(id, entry)| entry.status(id))
            .collect();
        all.sort_by(|a, b| a.document_id.cmp(&b.document_id));
        all
    }

    /// Statuses whose state is named `state` (`pending`, `indexing`,
    /// `ready` or `error`), ordered by id.
    pub fn statuses_in(&self, state: &str) -> Vec<DocumentStatus> {
        self.statuses()
            .into_iter()
            .filter(|status| status.state.name() == state)
            .collect()
    }

    pub async fn storage_stats(&self) -> Result<StorageStats> {
        let mut stats = StorageStats::default();
        for name in ["pending", "indexing", "ready", "error"] {
            stats.by_state.insert(name.to_string(), 0);
        }
        {
            let documents = self.read_documents();
            stats.total_documents = documents.len();
            for entry in documents.values() {
                *stats
                    .by_state
                    .entry(entry.state.name().to_string())
                    .or_default() += 1;
                stats.total_nodes += entry.tree.as_ref().map_or(0, |t| t.node_count());
            }
        }
        stats.storage_bytes = self.store.storage_bytes().await?;
        Ok(stats)
    }

    /// Check the committed tree of a document, whatever its state.
    pub fn validate(&self, document_id: &str) -> Result<ValidationReport> {
        let tree = {
            let documents = self.read_documents();
            let entry = documents
                .get(document_id)
                .ok_or_else(|| KnowledgeBaseError::DocumentNotFound(document_id.to_string()))?;
            entry
                .tree
                .clone()
                .ok_or_else(|| KnowledgeBaseError::DocumentNotReady {
                    id: document_id.to_string(),
                    state: entry.state.name().to_string(),
                })?
        };
        let report = validate_tree(&tree);
        if !report.is_healthy() {
            warn!(document_id, issues = report.issues.len(), "tree failed validation");
        }
        Ok(report)
    }

    /// The committed tree of a searchable document.
    pub fn tree(&self, document_id: &str) -> Result<Arc<DocumentTree>> {
        let documents = self.read_documents();
        let entry = documents
            .get(document_id)
            .ok_or_else(|| KnowledgeBaseError::DocumentNotFound(document_id.to_string()))?;
        entry
            .searchable_tree()
            .cloned()
            .ok_or_else(|| KnowledgeBaseError::DocumentNotReady {
                id: document_id.to_string(),
                state: entry.state.name().to_string(),
            })
    }

    /// Candidate trees for a search.
    ///
    /// With explicit ids every document must exist and be searchable. Without
    /// ids, every searchable document is offered.
    pub fn candidates(&self, document_ids: Option<&[String]>) -> Result<Vec<Candidate>> {
        match document_ids {
            Some(ids) => ids
                .iter()
                .map(|id| self.tree(id).map(|tree| Candidate::new(id.clone(), tree)))
                .collect(),
            None => {
                let documents = self.read_documents();
                let mut candidates: Vec<Candidate> = documents
                    .iter()
                    .filter_map(|(id, entry)| {
                        entry
                            .searchable_tree()
                            .map(|tree| Candidate::new(id.clone(), tree.clone()))
                    })
                    .collect();
                candidates.sort_by(|a, b| a.document_id.cmp(&b.document_id));
                Ok(candidates)
            }
        }
    }

    /// Search the given documents, or every searchable one.
    pub async fn search(
        &self,
        request: &SearchRequest,
        document_ids: Option<&[String]>,
    ) -> Result<SearchResponse> {
        self.search_with_cancel(request, document_ids, &CancelToken::new())
            .await
    }

    pub async fn search_with_cancel(
        &self,
        request: &SearchRequest,
        document_ids: Option<&[String]>,
        cancel: &CancelToken,
    ) -> Result<SearchResponse> {
        let candidates = self.candidates(document_ids)?;
        self.retriever
            .search_with_cancel(request, &candidates, cancel)
            .await
    }

    /// A single node (without its children) from a searchable document.
    pub fn node_content(&self, document_id: &str, node_id: &str) -> Result<TreeNode> {
        let tree = self.tree(document_id)?;
        find_node(&tree, node_id)
            .map(TreeNode::detached)
            .ok_or_else(|| KnowledgeBaseError::NodeNotFound {
                document_id: document_id.to_string(),
                node_id: node_id.to_string(),
            })
    }

    /// Rebuild in-memory state from the store. Returns the number of
    /// documents restored.
    ///
    /// A document recorded as `indexing` was interrupted by a shutdown and
    /// comes back as `error`; so does a `ready` document whose tree is
    /// missing or fails validation.
    pub async fn restore(&self) -> Result<usize> {
        let records = self.store.list().await?;
        let mut restored = Vec::with_capacity(records.len());

        for record in records {
            let mut entry = Entry::new(record.name.clone());
            entry.updated_at = record.updated_at;
            let tree = self.store.load_tree(&record.document_id).await?;

            entry.state = match (&record.state, tree) {
                (DocumentState::Ready, Some(tree)) => {
                    let report = validate_tree(&tree);
                    match report.worst().filter(|_| !report.is_healthy()) {
                        Some(issue) => {
                            warn!(document_id = %record.document_id, %issue, "stored tree failed validation");
                            DocumentState::Error {
                                kind: FailureKind::Failed,
                                message: format!("stored tree failed validation: {}", issue),
                                completed: None,
                                total: None,
                            }
                        }
                        None => {
                            entry.tree = Some(Arc::new(tree));
                            DocumentState::Ready
                        }
                    }
                }
                (DocumentState::Ready, None) => DocumentState::Error {
                    kind: FailureKind::Failed,
                    message: "stored tree is missing".to_string(),
                    completed: None,
                    total: None,
                },
                (DocumentState::Indexing, _) => DocumentState::Error {
                    kind: FailureKind::Failed,
                    message: "indexing was interrupted".to_string(),
                    completed: None,
                    total: None,
                },
                (other, _) => other.clone(),
            };
            restored.push((record.document_id, entry));
        }

        let count = restored.len();
        {
            let mut documents = self.write_documents();
            for (id, entry) in restored {
                documents.insert(id, entry);
            }
        }
        info!(documents = count, "restored document states");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ResponseSchema, ScriptedModel};
    use crate::outline::from_markdown;
    use crate::retrieval::NO_RELEVANT_CONTENT;
    use crate::tree::SummarySource;
    use std::time::Duration;
    use tokio::sync::Notify;

    const GUIDE: &str = "# Cats\nCats purr.\n# Dogs\nDogs bark at night.";

    fn helpful() -> ScriptedModel {
        ScriptedModel::new(|prompt| {
            if prompt.contains("Document sections:") {
                Ok(r#"{"nodes": [{"node_id": "0001", "relevance_score": 0.8}]}"#.into())
            } else if prompt.starts_with("Question:") {
                Ok("Dogs bark at night.".into())
            } else {
                Ok("A section about household pets.".into())
            }
        })
    }

    fn manager_with(model: impl LanguageModel + 'static) -> (DocumentManager, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let manager = DocumentManager::new(Arc::new(model), store.clone());
        (manager, store)
    }

    async fn index_guide(manager: &DocumentManager, id: &str) -> Result<Arc<DocumentTree>> {
        let document = Document::from_text("guide", GUIDE);
        manager
            .index(id, &from_markdown(GUIDE), &document, None)
            .await
    }

    /// Signals when the first LLM call starts, then never answers.
    struct Stalled {
        started: Arc<Notify>,
    }

    #[async_trait]
    impl LanguageModel for Stalled {
        async fn complete(
            &self,
            _system: Option<&str>,
            _prompt: &str,
            _schema: Option<&ResponseSchema>,
        ) -> Result<String> {
            self.started.notify_one();
            std::future::pending::<()>().await;
            Ok(String::new())
        }
    }

    #[test]
    fn test_transition_rules() {
        let failed = DocumentState::Error {
            kind: FailureKind::Failed,
            message: "boom".into(),
            completed: None,
            total: None,
        };
        let legal = [
            (DocumentState::Pending, DocumentState::Indexing),
            (DocumentState::Indexing, DocumentState::Ready),
            (DocumentState::Indexing, failed.clone()),
            (DocumentState::Ready, DocumentState::Indexing),
            (failed.clone(), DocumentState::Indexing),
        ];
        for (from, to) in legal {
            assert!(from.transition(to).is_ok());
        }

        let illegal = [
            (DocumentState::Pending, DocumentState::Ready),
            (DocumentState::Pending, failed.clone()),
            (DocumentState::Indexing, DocumentState::Indexing),
            (DocumentState::Ready, DocumentState::Ready),
            (failed.clone(), DocumentState::Ready),
        ];
        for (from, to) in illegal {
            assert!(matches!(
                from.transition(to),
                Err(KnowledgeBaseError::InvalidTransition { .. })
            ));
        }
    }

    #[test]
    fn test_failure_state_keeps_progress() {
        let state = DocumentState::from_failure(&KnowledgeBaseError::Timeout {
            completed: 3,
            total: 7,
        });
        assert_eq!(
            state,
            DocumentState::Error {
                kind: FailureKind::TimedOut,
                message: "Operation timed out after 3/7 steps".into(),
                completed: Some(3),
                total: Some(7),
            }
        );
    }

    #[test]
    fn test_status_serializes_with_state_tag() {
        let status = DocumentStatus {
            document_id: "doc".into(),
            name: "Doc".into(),
            state: DocumentState::Error {
                kind: FailureKind::Cancelled,
                message: "stop".into(),
                completed: Some(1),
                total: None,
            },
            tree_version: None,
            updated_at: Utc::now(),
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "error");
        assert_eq!(json["kind"], "cancelled");
        assert!(json.get("total").is_none());

        let back: DocumentStatus = serde_json::from_value(json).unwrap();
        assert_eq!(back, status);
    }

    #[tokio::test]
    async fn test_index_commits_ready_tree() {
        let (manager, store) = manager_with(helpful());
        let status = manager.register("guide", "guide").await;
        assert_eq!(status.state, DocumentState::Pending);

        let tree = index_guide(&manager, "guide").await.unwrap();
        assert_eq!(tree.node_count(), 2);
        assert_eq!(tree.version, 1);
        assert_eq!(manager.state("guide").unwrap(), DocumentState::Ready);
        assert!(store.load_tree("guide").await.unwrap().is_some());

        let persisted = store.list().await.unwrap();
        assert_eq!(persisted[0].state, DocumentState::Ready);
        assert_eq!(persisted[0].tree_version, Some(1));
    }

    #[tokio::test]
    async fn test_reindex_swaps_tree_and_bumps_version() {
        let (manager, _) = manager_with(helpful());
        let first = index_guide(&manager, "guide").await.unwrap();
        let second = index_guide(&manager, "guide").await.unwrap();

        assert_eq!(second.version, 2);
        assert!(first.is_stale_against(&second));
        assert!(Arc::ptr_eq(&manager.tree("guide").unwrap(), &second));
        // readers holding the old snapshot still see it intact
        assert_eq!(first.node_count(), 2);
    }

    #[tokio::test]
    async fn test_parse_failure_records_error_and_keeps_old_tree() {
        let (manager, _) = manager_with(helpful());
        let old = index_guide(&manager, "guide").await.unwrap();

        let document = Document::from_text("guide", GUIDE);
        let bad = RawOutline::new(vec![crate::outline::RawOutlineNode::new("Broken", 3, 1)]);
        let err = manager.index("guide", &bad, &document, None).await.unwrap_err();
        assert!(matches!(err, KnowledgeBaseError::Parse(_)));

        match manager.state("guide").unwrap() {
            DocumentState::Error { kind, message, .. } => {
                assert_eq!(kind, FailureKind::Failed);
                assert!(message.contains("Malformed outline"));
            }
            other => panic!("unexpected state {:?}", other),
        }
        assert!(matches!(
            manager.tree("guide"),
            Err(KnowledgeBaseError::DocumentNotReady { .. })
        ));

        // an explicit re-index recovers
        let fresh = index_guide(&manager, "guide").await.unwrap();
        assert_eq!(fresh.version, old.version + 1);
    }

    #[tokio::test]
    async fn test_search_rejects_pending_document() {
        let (manager, _) = manager_with(helpful());
        manager.register("waiting", "waiting").await;
        index_guide(&manager, "guide").await.unwrap();

        let ids = vec!["waiting".to_string()];
        let result = manager.search(&SearchRequest::new("dogs"), Some(&ids)).await;
        assert!(matches!(result, Err(KnowledgeBaseError::DocumentNotReady { .. })));

        let ids = vec!["missing".to_string()];
        let result = manager.search(&SearchRequest::new("dogs"), Some(&ids)).await;
        assert!(matches!(result, Err(KnowledgeBaseError::DocumentNotFound(_))));

        // implicit candidates skip the pending document
        let candidates = manager.candidates(None).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].document_id, "guide");
    }

    #[tokio::test]
    async fn test_search_over_ready_documents() {
        let (manager, _) = manager_with(helpful());
        index_guide(&manager, "guide").await.unwrap();

        let response = manager
            .search(&SearchRequest::new("What do dogs do?"), None)
            .await
            .unwrap();
        assert_eq!(response.results[0].node_id, "0001");
        assert_eq!(response.results[0].content, "# Dogs\nDogs bark at night.");
        assert_eq!(response.answer.as_deref(), Some("Dogs bark at night."));
    }

    #[tokio::test]
    async fn test_search_without_ready_documents_has_no_candidates() {
        let (manager, _) = manager_with(helpful());
        manager.register("waiting", "waiting").await;
        let result = manager.search(&SearchRequest::new("dogs"), None).await;
        assert!(matches!(result, Err(KnowledgeBaseError::NoCandidates)));
    }

    #[tokio::test]
    async fn test_search_with_empty_selection_answers_explicitly() {
        let model = ScriptedModel::new(|prompt| {
            if prompt.contains("Document sections:") {
                Ok(r#"{"nodes": []}"#.into())
            } else {
                Ok("A section about household pets.".into())
            }
        });
        let (manager, _) = manager_with(model);
        index_guide(&manager, "guide").await.unwrap();

        let response = manager
            .search(&SearchRequest::new("volcanoes"), None)
            .await
            .unwrap();
        assert!(response.results.is_empty());
        assert_eq!(response.answer.as_deref(), Some(NO_RELEVANT_CONTENT));
    }

    #[tokio::test]
    async fn test_cancel_mid_wave_records_cancelled_error() {
        let started = Arc::new(Notify::new());
        let store = Arc::new(MemoryStore::new());
        let manager = Arc::new(DocumentManager::new(
            Arc::new(Stalled {
                started: started.clone(),
            }),
            store.clone(),
        ));

        let worker = manager.clone();
        let run = tokio::spawn(async move { index_guide(&worker, "guide").await });

        started.notified().await;
        assert_eq!(manager.state("guide").unwrap(), DocumentState::Indexing);
        assert!(manager.cancel("guide").unwrap());

        let result = run.await.unwrap();
        assert!(matches!(result, Err(KnowledgeBaseError::Cancelled { .. })));

        match manager.state("guide").unwrap() {
            DocumentState::Error { kind, .. } => assert_eq!(kind, FailureKind::Cancelled),
            other => panic!("unexpected state {:?}", other),
        }
        assert!(store.load_tree("guide").await.unwrap().is_none());
        assert!(manager.tree("guide").is_err());
        assert!(!manager.cancel("guide").unwrap());
    }

    #[tokio::test]
    async fn test_dropped_index_future_is_not_stuck_indexing() {
        let (manager, store) = manager_with(Stalled {
            started: Arc::new(Notify::new()),
        });

        let attempt = tokio::time::timeout(Duration::from_millis(50), index_guide(&manager, "guide")).await;
        assert!(attempt.is_err());

        match manager.state("guide").unwrap() {
            DocumentState::Error { kind, .. } => assert_eq!(kind, FailureKind::Cancelled),
            other => panic!("unexpected state {:?}", other),
        }

        // the record is written by a spawned task
        let mut persisted = None;
        for _ in 0..100 {
            let records = store.list().await.unwrap();
            if records[0].state != DocumentState::Indexing {
                persisted = Some(records[0].state.clone());
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(matches!(
            persisted,
            Some(DocumentState::Error { kind: FailureKind::Cancelled, .. })
        ));

        let restarted = DocumentManager::new(Arc::new(helpful()), store);
        restarted.restore().await.unwrap();
        match restarted.state("guide").unwrap() {
            DocumentState::Error { kind, message, .. } => {
                assert_eq!(kind, FailureKind::Cancelled);
                assert!(message.contains("abandoned"));
            }
            other => panic!("unexpected state {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_delete_refused_while_indexing() {
        let started = Arc::new(Notify::new());
        let store = Arc::new(MemoryStore::new());
        let manager = Arc::new(DocumentManager::new(
            Arc::new(Stalled {
                started: started.clone(),
            }),
            store.clone(),
        ));

        let worker = manager.clone();
        let run = tokio::spawn(async move { index_guide(&worker, "guide").await });
        started.notified().await;

        assert!(matches!(
            manager.delete("guide").await,
            Err(KnowledgeBaseError::DocumentBusy(_))
        ));
        assert_eq!(store.list().await.unwrap().len(), 1);

        manager.cancel("guide").unwrap();
        assert!(run.await.unwrap().is_err());

        manager.delete("guide").await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
        assert!(matches!(
            manager.state("guide"),
            Err(KnowledgeBaseError::DocumentNotFound(_))
        ));
        assert!(matches!(
            manager.delete("guide").await,
            Err(KnowledgeBaseError::DocumentNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_ready_document() {
        let (manager, store) = manager_with(helpful());
        index_guide(&manager, "guide").await.unwrap();
        index_guide(&manager, "other").await.unwrap();

        manager.delete("guide").await.unwrap();
        assert!(store.load_tree("guide").await.unwrap().is_none());
        let candidates = manager.candidates(None).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].document_id, "other");
    }

    #[tokio::test]
    async fn test_index_batch_isolates_failures() {
        let (manager, _) = manager_with(helpful());
        let job = |id: &str, outline: RawOutline| IndexJob {
            document_id: id.to_string(),
            outline,
            document: Document::from_text(id, GUIDE),
        };
        let jobs = vec![
            job("c", from_markdown(GUIDE)),
            job(
                "b",
                RawOutline::new(vec![crate::outline::RawOutlineNode::new("Broken", 3, 1)]),
            ),
            job("a", from_markdown(GUIDE)),
        ];

        let report = manager.index_batch(&jobs, 2).await;
        assert_eq!(report.succeeded, vec!["a", "c"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "b");
        assert!(report.failed[0].1.contains("Malformed outline"));
        assert_eq!(report.total(), 3);

        assert_eq!(manager.state("a").unwrap(), DocumentState::Ready);
        assert_eq!(manager.state("b").unwrap().name(), "error");
    }

    #[tokio::test]
    async fn test_storage_stats_and_state_filter() {
        let (manager, _) = manager_with(helpful());
        index_guide(&manager, "guide").await.unwrap();
        manager.register("later", "later").await;
        manager.register("queued", "queued").await;

        let stats = manager.storage_stats().await.unwrap();
        assert_eq!(stats.total_documents, 3);
        assert_eq!(stats.by_state["pending"], 2);
        assert_eq!(stats.by_state["ready"], 1);
        assert_eq!(stats.by_state["indexing"], 0);
        assert_eq!(stats.by_state["error"], 0);
        assert_eq!(stats.total_nodes, 2);
        assert!(stats.storage_bytes > 0);

        let pending: Vec<String> = manager
            .statuses_in("pending")
            .into_iter()
            .map(|s| s.document_id)
            .collect();
        assert_eq!(pending, vec!["later", "queued"]);
        assert!(manager.statuses_in("error").is_empty());
    }

    #[tokio::test]
    async fn test_validate_committed_tree() {
        let (manager, _) = manager_with(helpful());
        index_guide(&manager, "guide").await.unwrap();
        manager.register("later", "later").await;

        assert!(manager.validate("guide").unwrap().is_clean());
        assert!(matches!(
            manager.validate("later"),
            Err(KnowledgeBaseError::DocumentNotReady { .. })
        ));
    }

    #[tokio::test]
    async fn test_restore_rejects_corrupt_tree() {
        let store = Arc::new(MemoryStore::new());
        {
            let manager = DocumentManager::new(Arc::new(helpful()), store.clone());
            index_guide(&manager, "guide").await.unwrap();
        }
        let mut tree = store.load_tree("guide").await.unwrap().unwrap();
        tree.nodes[1].node_id = "0000".into();
        store.save_tree("guide", &tree).await.unwrap();

        let manager = DocumentManager::new(Arc::new(helpful()), store);
        manager.restore().await.unwrap();
        match manager.state("guide").unwrap() {
            DocumentState::Error { kind, message, .. } => {
                assert_eq!(kind, FailureKind::Failed);
                assert!(message.contains("duplicate node id"));
            }
            other => panic!("unexpected state {:?}", other),
        }
        assert!(manager.tree("guide").is_err());
    }

    #[tokio::test]
    async fn test_overall_timeout_is_error_with_progress() {
        let store = Arc::new(MemoryStore::new());
        let options = IndexOptions {
            timeout_secs: 1,
            ..Default::default()
        };
        let manager = DocumentManager::with_options(
            Arc::new(Stalled {
                started: Arc::new(Notify::new()),
            }),
            store.clone(),
            options,
            RetrievalOptions::default(),
        );

        let result = index_guide(&manager, "guide").await;
        assert!(matches!(result, Err(KnowledgeBaseError::Timeout { .. })));
        match manager.state("guide").unwrap() {
            DocumentState::Error {
                kind, total, ..
            } => {
                assert_eq!(kind, FailureKind::TimedOut);
                assert_eq!(total, Some(2));
            }
            other => panic!("unexpected state {:?}", other),
        }
        assert!(store.load_tree("guide").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_node_content() {
        let (manager, _) = manager_with(helpful());
        index_guide(&manager, "guide").await.unwrap();

        let node = manager.node_content("guide", "0000").unwrap();
        assert_eq!(node.title, "Cats");
        assert_eq!(node.text, "# Cats\nCats purr.");
        assert_eq!(node.summary_source, SummarySource::Generated);

        assert!(matches!(
            manager.node_content("guide", "0042"),
            Err(KnowledgeBaseError::NodeNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_restore_from_store() {
        let store = Arc::new(MemoryStore::new());
        {
            let manager = DocumentManager::new(Arc::new(helpful()), store.clone());
            index_guide(&manager, "guide").await.unwrap();
            manager.register("later", "later").await;
        }
        store
            .set_status(&DocumentStatus {
                document_id: "crashed".into(),
                name: "crashed".into(),
                state: DocumentState::Indexing,
                tree_version: None,
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        let manager = DocumentManager::new(Arc::new(helpful()), store);
        assert_eq!(manager.restore().await.unwrap(), 3);

        assert_eq!(manager.state("guide").unwrap(), DocumentState::Ready);
        assert_eq!(manager.tree("guide").unwrap().node_count(), 2);
        assert_eq!(manager.state("later").unwrap(), DocumentState::Pending);
        assert!(matches!(
            manager.state("crashed").unwrap(),
            DocumentState::Error { kind: FailureKind::Failed, .. }
        ));
        assert_eq!(manager.statuses().len(), 3);
    }
}
