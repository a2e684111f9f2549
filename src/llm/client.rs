//! OpenAI-compatible LLM client.
//!
//! Works with any endpoint exposing `/v1/chat/completions`. Transport
//! failures, 429s and 5xx responses are retried with exponential backoff;
//! everything else is reported immediately.

use super::{LanguageModel, ResponseSchema};
use crate::config::LlmConfig;
use crate::error::{KnowledgeBaseError, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Message role in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A message in the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Request body for chat completion.
#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
}

/// Response from chat completion.
#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI API error response.
#[derive(Debug, Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Outcome of a single HTTP attempt.
enum Attempt {
    Done(String),
    Retry(String),
}

/// OpenAI-compatible LLM client.
#[derive(Clone)]
pub struct LlmClient {
    client: Client,
    config: LlmConfig,
}

impl LlmClient {
    /// Create a new LLM client with the given configuration.
    pub fn new(config: LlmConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| KnowledgeBaseError::Config(format!("HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    /// Get the API endpoint URL.
    fn endpoint(&self) -> String {
        let base = self.config.api_base.trim_end_matches('/');
        format!("{}/v1/chat/completions", base)
    }

    fn backoff(attempt: u32) -> Duration {
        Duration::from_millis(500 * 2u64.pow(attempt.min(6)))
    }

    /// Send a chat completion request, retrying transient failures.
    pub async fn chat(
        &self,
        messages: &[Message],
        schema: Option<&ResponseSchema>,
    ) -> Result<String> {
        let response_format = schema.map(|format| {
            serde_json::json!({
                "type": "json_schema",
                "json_schema": {
                    "name": format.name,
                    "schema": format.schema,
                    "strict": false
                }
            })
        });
        let request = ChatCompletionRequest {
            model: &self.config.model,
            messages,
            max_tokens: Some(self.config.max_tokens),
            temperature: Some(self.config.temperature),
            response_format,
        };

        let mut attempt = 0;
        loop {
            match self.send_once(&request).await? {
                Attempt::Done(content) => return Ok(content),
                Attempt::Retry(reason) if attempt < self.config.max_retries => {
                    let delay = Self::backoff(attempt);
                    warn!(attempt, ?delay, %reason, "retrying LLM request");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Attempt::Retry(reason) => {
                    return Err(KnowledgeBaseError::LlmUnavailable(format!(
                        "giving up after {} attempts: {}",
                        attempt + 1,
                        reason
                    )));
                }
            }
        }
    }

    async fn send_once(&self, request: &ChatCompletionRequest<'_>) -> Result<Attempt> {
        let sent = self
            .client
            .post(self.endpoint())
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await;

        let response = match sent {
            Ok(response) => response,
            Err(e) => return Ok(Attempt::Retry(e.to_string())),
        };

        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => return Ok(Attempt::Retry(e.to_string())),
        };

        if !status.is_success() {
            let detail = serde_json::from_str::<ApiError>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);
            let reason = format!("API error ({}): {}", status, detail);
            if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                return Ok(Attempt::Retry(reason));
            }
            return Err(KnowledgeBaseError::LlmUnavailable(reason));
        }

        let completion: ChatCompletionResponse = serde_json::from_str(&body)
            .map_err(|e| KnowledgeBaseError::LlmMalformedOutput(format!("bad envelope: {}", e)))?;

        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| {
                KnowledgeBaseError::LlmMalformedOutput("No choices in response".to_string())
            })?;

        debug!(chars = content.len(), "LLM response received");
        Ok(Attempt::Done(content))
    }

    /// Test connectivity to the API.
    pub async fn test_connection(&self) -> Result<()> {
        let messages = [Message::user("Say 'hello' and nothing else.")];

        let response = self.chat(&messages, None).await?;

        if response.to_lowercase().contains("hello") {
            Ok(())
        } else {
            Err(KnowledgeBaseError::LlmMalformedOutput(format!(
                "Unexpected response: {}",
                response
            )))
        }
    }
}

#[async_trait]
impl LanguageModel for LlmClient {
    async fn complete(
        &self,
        system: Option<&str>,
        prompt: &str,
        schema: Option<&ResponseSchema>,
    ) -> Result<String> {
        let mut messages = Vec::with_capacity(2);
        if let Some(sys) = system {
            messages.push(Message::system(sys));
        }
        messages.push(Message::user(prompt));

        self.chat(&messages, schema).await
    }

    fn name(&self) -> &str {
        &self.config.model
    }
}
