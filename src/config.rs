//! Configuration parsing and validation.
//!
//! Grounded Knowledge is configured by an optional TOML file. Every section
//! and field has a default, so an absent file (or `Config::default()`)
//! yields a valid lexical-only setup:
//!
//! ```toml
//! [storage]
//! backend = "memory"
//!
//! [retrieval]
//! default_limit = 10
//! min_score = 0.0
//! search_timeout_secs = 30
//! default_search_type = "hybrid"
//!
//! [embedding]
//! provider = "hash"        # "disabled" | "hash" | "openai"
//! model = "sha256-stub"
//! dims = 256
//!
//! [answer]
//! max_citations = 5
//! max_answer_chars = 500
//! excerpt_chars = 200
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;

use grounded_core::models::SearchType;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub answer: AnswerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
        }
    }
}

fn default_backend() -> String {
    "memory".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_limit")]
    pub default_limit: usize,
    #[serde(default)]
    pub min_score: f64,
    #[serde(default = "default_search_timeout_secs")]
    pub search_timeout_secs: u64,
    #[serde(default = "default_search_type")]
    pub default_search_type: String,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            min_score: 0.0,
            search_timeout_secs: default_search_timeout_secs(),
            default_search_type: default_search_type(),
        }
    }
}

impl RetrievalConfig {
    /// Parsed `default_search_type`; `load_config` has already validated it.
    pub fn search_type(&self) -> SearchType {
        self.default_search_type.parse().unwrap_or_default()
    }
}

fn default_limit() -> usize {
    10
}
fn default_search_timeout_secs() -> u64 {
    30
}
fn default_search_type() -> String {
    "hybrid".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnswerConfig {
    /// Citations per answer when the caller does not pass a limit.
    #[serde(default = "default_max_citations")]
    pub max_citations: usize,
    #[serde(default = "default_max_answer_chars")]
    pub max_answer_chars: usize,
    #[serde(default = "default_excerpt_chars")]
    pub excerpt_chars: usize,
}

impl Default for AnswerConfig {
    fn default() -> Self {
        Self {
            max_citations: default_max_citations(),
            max_answer_chars: default_max_answer_chars(),
            excerpt_chars: default_excerpt_chars(),
        }
    }
}

fn default_max_citations() -> usize {
    5
}
fn default_max_answer_chars() -> usize {
    500
}
fn default_excerpt_chars() -> usize {
    200
}

/// Read, parse, and validate a config file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Check cross-field constraints that serde defaults cannot express.
pub fn validate(config: &Config) -> Result<()> {
    if config.storage.backend != "memory" {
        bail!(
            "Unknown storage backend: '{}'. Only 'memory' is available.",
            config.storage.backend
        );
    }

    // Validate retrieval
    if config.retrieval.default_limit < 1 {
        bail!("retrieval.default_limit must be >= 1");
    }
    if !config.retrieval.min_score.is_finite() {
        bail!("retrieval.min_score must be a finite number");
    }
    if config.retrieval.search_timeout_secs < 1 {
        bail!("retrieval.search_timeout_secs must be >= 1");
    }
    config
        .retrieval
        .default_search_type
        .parse::<SearchType>()
        .with_context(|| "Invalid retrieval.default_search_type")?;

    // Validate embedding
    match config.embedding.provider.as_str() {
        "disabled" | "hash" | "openai" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, hash, or openai.",
            other
        ),
    }
    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.batch_size == 0 {
            bail!("embedding.batch_size must be > 0");
        }
        if config.embedding.timeout_secs == 0 {
            bail!("embedding.timeout_secs must be > 0");
        }
    }

    // Validate answer
    if config.answer.max_citations < 1 {
        bail!("answer.max_citations must be >= 1");
    }
    if config.answer.excerpt_chars < 1 || config.answer.max_answer_chars < 1 {
        bail!("answer.excerpt_chars and answer.max_answer_chars must be >= 1");
    }

    Ok(())
}
