//! Error types for the knowledge base.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using our custom error.
pub type Result<T> = std::result::Result<T, KnowledgeBaseError>;

/// Errors that can occur while indexing or searching documents.
#[derive(Error, Debug)]
pub enum KnowledgeBaseError {
    /// Error reading or writing files.
    #[error("I/O error for path '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Error during serialization/deserialization.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration file or value error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The raw outline is structurally invalid. Never retried.
    #[error("Malformed outline: {0}")]
    Parse(String),

    /// Summarization failed even after the local fallback.
    #[error("Summarization failed: {0}")]
    Summarization(String),

    /// The LLM could not be reached after the transport's own retries.
    #[error("LLM unavailable: {0}")]
    LlmUnavailable(String),

    /// The LLM answered, but not in the requested shape.
    #[error("LLM returned malformed output: {0}")]
    LlmMalformedOutput(String),

    /// `search` was called without any candidate trees.
    #[error("No candidate documents to search")]
    NoCandidates,

    /// The document id is unknown.
    #[error("Document '{0}' not found")]
    DocumentNotFound(String),

    /// The node id does not exist in the document's tree.
    #[error("Node '{node_id}' not found in document '{document_id}'")]
    NodeNotFound {
        document_id: String,
        node_id: String,
    },

    /// The document exists but has no committed tree to search.
    #[error("Document '{id}' is not ready (state: {state})")]
    DocumentNotReady { id: String, state: String },

    /// The document is being indexed and cannot be removed.
    #[error("Document '{0}' is being indexed")]
    DocumentBusy(String),

    /// Illegal lifecycle transition.
    #[error("Invalid document state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// The operation was cancelled by the caller.
    #[error("Operation cancelled after {completed}/{total} steps")]
    Cancelled { completed: usize, total: usize },

    /// The overall operation deadline elapsed.
    #[error("Operation timed out after {completed}/{total} steps")]
    Timeout { completed: usize, total: usize },
}

impl KnowledgeBaseError {
    /// Create an I/O error with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error means the LLM could not be used at all.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::LlmUnavailable(_))
    }
}

impl From<reqwest::Error> for KnowledgeBaseError {
    fn from(err: reqwest::Error) -> Self {
        KnowledgeBaseError::LlmUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for KnowledgeBaseError {
    fn from(err: serde_json::Error) -> Self {
        KnowledgeBaseError::Serialization(err.to_string())
    }
}
