//! Tree Knowledge Base - vectorless, LLM-navigated document retrieval.
//!
//! Documents are indexed into hierarchical trees (chapters → sections →
//! subsections) whose nodes carry LLM-generated summaries. At query time an
//! LLM reads a compact outline of each tree, picks the relevant nodes, and
//! their full text becomes the context for a grounded answer. No chunking,
//! no embeddings.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use tree_knowledge_base::{
//!     config::Config,
//!     document::Document,
//!     llm::LlmClient,
//!     manager::DocumentManager,
//!     outline::from_markdown,
//!     persistence::FileStore,
//!     retrieval::SearchRequest,
//! };
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     config.validate()?;
//!
//!     let llm = Arc::new(LlmClient::new(config.llm.clone())?);
//!     let store = Arc::new(FileStore::new(config.data_dir(), config.storage.format));
//!     let manager = DocumentManager::from_config(llm, store, &config);
//!     manager.restore().await?;
//!
//!     let document = Document::from_text_file(Path::new("guide.md"))?;
//!     let outline = from_markdown(&document.raw_content());
//!     manager.index("guide", &outline, &document, None).await?;
//!
//!     let response = manager
//!         .search(&SearchRequest::new("How do I reset the device?"), None)
//!         .await?;
//!     for result in &response.results {
//!         println!("{} [{}] {:.2}", result.title, result.node_id, result.score);
//!     }
//!     if let Some(answer) = response.answer {
//!         println!("{}", answer);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - **tree_search**: pure lookups, paths, flattening and statistics
//! - **indexer**: [`IndexEngine`] turns a raw outline into a summarized tree
//! - **retrieval**: [`RetrievalEngine`] selects nodes and synthesizes answers
//! - **manager**: [`DocumentManager`] enforces the document lifecycle
//! - **validate**: structural checks for stored trees
//! - **llm**: the [`LanguageModel`] seam plus an OpenAI-compatible client

pub mod cancel;
pub mod config;
pub mod document;
pub mod error;
pub mod indexer;
pub mod llm;
pub mod manager;
pub mod outline;
pub mod persistence;
pub mod retrieval;
pub mod structured;
pub mod tokens;
pub mod tree;
pub mod tree_search;
pub mod validate;

// Re-export commonly used types
pub use cancel::CancelToken;
pub use config::Config;
pub use document::Document;
pub use error::{KnowledgeBaseError, Result};
pub use indexer::{IndexEngine, IndexOptions, SummaryContext};
pub use llm::{LanguageModel, LlmClient};
pub use manager::{
    BatchReport, DocumentManager, DocumentState, DocumentStore, IndexJob, MemoryStore, StorageStats,
};
pub use outline::{RawOutline, RawOutlineNode};
pub use persistence::{FileStore, SaveFormat, load_tree, save_tree};
pub use retrieval::{Candidate, RetrievalEngine, SearchRequest, SearchResponse, SearchResult};
pub use structured::{Resolution, ResolutionMethod};
pub use tree::{DocumentTree, PageRange, TreeNode};
pub use validate::{Severity, ValidationReport, validate_tree};
