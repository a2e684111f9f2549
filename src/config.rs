//! Configuration for the knowledge base.
//!
//! Supports both environment variables and YAML config file.
//! Environment variables take precedence over config file values.

use crate::error::{KnowledgeBaseError, Result};
use crate::indexer::IndexOptions;
use crate::persistence::SaveFormat;
use crate::retrieval::RetrievalOptions;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// LLM configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL for the LLM API (e.g., "https://api.openai.com")
    pub api_base: String,

    /// API key for authentication
    pub api_key: String,

    /// Model name (e.g., "gpt-4o")
    pub model: String,

    /// Maximum tokens for response
    pub max_tokens: u32,

    /// Temperature for generation
    pub temperature: f32,

    /// Per-call timeout in seconds
    pub timeout_secs: u64,

    /// Retries for transient transport failures
    pub max_retries: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_base: String::new(),
            api_key: String::new(),
            model: "gpt-4o".to_string(),
            max_tokens: 4096,
            temperature: 0.0,
            timeout_secs: 60,
            max_retries: 2,
        }
    }
}

/// Where trees and status records are kept.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Data directory; the platform data dir when unset.
    pub data_dir: Option<PathBuf>,

    /// Tree file format.
    pub format: SaveFormat,
}

/// Full application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// LLM settings
    pub llm: LlmConfig,

    /// Index build defaults
    pub index: IndexOptions,

    /// Search defaults
    pub retrieval: RetrievalOptions,

    pub storage: StorageConfig,
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl Config {
    /// Load configuration from environment variables and optional config file.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables (LLM_*, KB_*)
    /// 2. Config file (~/.config/tree-knowledge-base/config.yaml)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        let mut config = Config::default();

        if let Some(config_path) = Self::config_file_path() {
            if config_path.exists() {
                config = Self::load_from_file(&config_path)?;
            }
        }

        config.apply_env();
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| KnowledgeBaseError::io(path, e))?;
        Self::from_yaml(&content)
    }

    /// Parse a YAML document; missing sections and keys keep their defaults.
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| KnowledgeBaseError::Config(format!("Failed to parse config file: {}", e)))
    }

    /// Override values from environment variables.
    pub fn apply_env(&mut self) {
        if let Ok(api_base) = env::var("LLM_API_BASE") {
            self.llm.api_base = api_base;
        }
        if let Ok(api_key) = env::var("LLM_API_KEY") {
            self.llm.api_key = api_key;
        }
        if let Ok(model) = env::var("LLM_MODEL") {
            self.llm.model = model;
        }
        if let Some(max_tokens) = env_parse("LLM_MAX_TOKENS") {
            self.llm.max_tokens = max_tokens;
        }
        if let Some(temperature) = env_parse("LLM_TEMPERATURE") {
            self.llm.temperature = temperature;
        }
        if let Some(timeout) = env_parse("LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = timeout;
        }
        if let Some(retries) = env_parse("LLM_MAX_RETRIES") {
            self.llm.max_retries = retries;
        }

        if let Some(depth) = env_parse("KB_MAX_DEPTH") {
            self.index.max_depth = depth;
        }
        if let Some(concurrency) = env_parse("KB_INDEX_CONCURRENCY") {
            self.index.concurrency = concurrency;
        }
        if let Some(timeout) = env_parse("KB_INDEX_TIMEOUT_SECS") {
            self.index.timeout_secs = timeout;
        }
        if let Some(top_k) = env_parse("KB_TOP_K") {
            self.retrieval.top_k = top_k;
        }
        if let Some(max_context) = env_parse("KB_MAX_CONTEXT_TOKENS") {
            self.retrieval.max_context_tokens = max_context;
        }
        if let Ok(dir) = env::var("KB_DATA_DIR") {
            self.storage.data_dir = Some(PathBuf::from(dir));
        }
    }

    /// Get the default config file path.
    pub fn config_file_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "tree-knowledge-base")
            .map(|dirs| dirs.config_dir().join("config.yaml"))
    }

    /// Resolved data directory.
    pub fn data_dir(&self) -> PathBuf {
        if let Some(dir) = &self.storage.data_dir {
            return dir.clone();
        }
        directories::ProjectDirs::from("", "", "tree-knowledge-base")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("data"))
    }

    /// Validate that required LLM configuration is present, plus limits.
    pub fn validate(&self) -> Result<()> {
        if self.llm.api_base.is_empty() {
            return Err(KnowledgeBaseError::Config(
                "LLM API base URL is required. Set LLM_API_BASE environment variable or add to config file.".to_string()
            ));
        }

        if self.llm.api_key.is_empty() {
            return Err(KnowledgeBaseError::Config(
                "LLM API key is required. Set LLM_API_KEY environment variable or add to config file.".to_string()
            ));
        }

        if self.llm.model.is_empty() {
            return Err(KnowledgeBaseError::Config(
                "LLM model is required. Set LLM_MODEL environment variable or add to config file."
                    .to_string(),
            ));
        }

        self.validate_limits()
    }

    /// Validate numeric limits only (enough for offline use).
    pub fn validate_limits(&self) -> Result<()> {
        let checks = [
            ("index.max_depth", self.index.max_depth),
            ("index.concurrency", self.index.concurrency),
            ("retrieval.top_k", self.retrieval.top_k),
            ("retrieval.max_context_tokens", self.retrieval.max_context_tokens),
            ("retrieval.concurrency", self.retrieval.concurrency),
        ];
        for (name, value) in checks {
            if value == 0 {
                return Err(KnowledgeBaseError::Config(format!("{} must be at least 1", name)));
            }
        }
        Ok(())
    }

    /// Create a config from explicit values (useful for testing).
    pub fn with_llm(
        api_base: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            llm: LlmConfig {
                api_base: api_base.into(),
                api_key: api_key.into(),
                model: model.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}
