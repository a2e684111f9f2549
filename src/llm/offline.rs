//! Models that never touch the network.

use super::{LanguageModel, ResponseSchema};
use crate::error::{KnowledgeBaseError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Always unavailable. Forces every deterministic fallback path: extractive
/// summaries while indexing, keyword scoring while searching.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineModel;

#[async_trait]
impl LanguageModel for OfflineModel {
    async fn complete(
        &self,
        _system: Option<&str>,
        _prompt: &str,
        _schema: Option<&ResponseSchema>,
    ) -> Result<String> {
        Err(KnowledgeBaseError::LlmUnavailable(
            "offline mode: no model configured".to_string(),
        ))
    }

    fn name(&self) -> &str {
        "offline"
    }
}

type Responder = dyn Fn(&str) -> Result<String> + Send + Sync;

/// Answers every prompt with a caller-supplied function and counts calls.
#[derive(Clone)]
pub struct ScriptedModel {
    responder: Arc<Responder>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedModel {
    pub fn new(responder: impl Fn(&str) -> Result<String> + Send + Sync + 'static) -> Self {
        Self {
            responder: Arc::new(responder),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Reply with the same text to every prompt.
    pub fn constant(reply: impl Into<String>) -> Self {
        let reply = reply.into();
        Self::new(move |_| Ok(reply.clone()))
    }

    /// Number of completions requested so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(
        &self,
        _system: Option<&str>,
        prompt: &str,
        _schema: Option<&ResponseSchema>,
    ) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.responder)(prompt)
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_offline_is_unavailable() {
        let err = OfflineModel.complete(None, "anything", None).await.unwrap_err();
        assert!(err.is_unavailable());
    }

    #[tokio::test]
    async fn test_scripted_counts_calls() {
        let model = ScriptedModel::new(|prompt| Ok(prompt.to_uppercase()));
        assert_eq!(model.complete(None, "abc", None).await.unwrap(), "ABC");
        assert_eq!(model.clone().complete(None, "x", None).await.unwrap(), "X");
        assert_eq!(model.calls(), 2);
    }
}
