//! LLM integration module.
//!
//! The engine talks to language models only through [`LanguageModel`]. The
//! OpenAI-compatible [`LlmClient`] is the production implementation;
//! [`OfflineModel`] and [`ScriptedModel`] cover offline runs and tests.

mod client;
mod offline;
mod prompts;

pub use client::{LlmClient, Message, Role};
pub use offline::{OfflineModel, ScriptedModel};
pub use prompts::Prompts;

use crate::error::Result;
use async_trait::async_trait;
use serde::Serialize;

/// JSON schema the response must follow, sent as `response_format`.
#[derive(Debug, Clone, Serialize)]
pub struct ResponseSchema {
    pub name: String,
    pub schema: serde_json::Value,
}

impl ResponseSchema {
    pub fn new(name: impl Into<String>, schema: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            schema,
        }
    }
}

/// A completion oracle.
///
/// Implementations own their transport retry policy. Errors must be
/// `LlmUnavailable` when the model could not be reached and
/// `LlmMalformedOutput` when it answered with something unusable.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(
        &self,
        system: Option<&str>,
        prompt: &str,
        schema: Option<&ResponseSchema>,
    ) -> Result<String>;

    /// Short label for logs.
    fn name(&self) -> &str {
        "llm"
    }
}
