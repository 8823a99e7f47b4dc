//! Embedding provider implementations.
//!
//! Implements [`EmbeddingProvider`] for:
//! - **[`HashEmbeddingProvider`]**: deterministic SHA-256 derived unit vectors.
//!   Offline and reproducible, but carries no semantic meaning; use it for
//!   development and tests.
//! - **[`OpenAIProvider`]**: calls the OpenAI embeddings API with batching,
//!   retry, and backoff.
//!
//! # Provider Selection
//!
//! Use [`create_provider`] to instantiate the provider named in the
//! configuration. `"disabled"` yields `None`, which the retriever treats as
//! lexical-only operation:
//!
//! ```rust
//! # use grounded_knowledge::config::EmbeddingConfig;
//! # use grounded_knowledge::embedding::create_provider;
//! let config = EmbeddingConfig::default(); // provider = "disabled"
//! let provider = create_provider(&config).unwrap();
//! assert!(provider.is_none());
//! ```
//!
//! # Retry Strategy
//!
//! The OpenAI provider uses exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use anyhow::{bail, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

use grounded_core::embedding::normalize;
pub use grounded_core::embedding::{cosine_similarity, EmbeddingProvider};

use crate::config::EmbeddingConfig;

/// Build the provider named by `config.provider`.
///
/// Returns `Ok(None)` for `"disabled"`.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Option<Arc<dyn EmbeddingProvider>>> {
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "hash" => Ok(Some(Arc::new(HashEmbeddingProvider::from_config(config)?))),
        "openai" => Ok(Some(Arc::new(OpenAIProvider::new(config)?))),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

// ============ Hash Provider ============

/// Deterministic pseudo-embeddings derived from SHA-256.
///
/// Identical texts map to identical unit vectors; different texts map to
/// nearly orthogonal ones.
pub struct HashEmbeddingProvider {
    model: String,
    dims: usize,
}

impl HashEmbeddingProvider {
    pub const DEFAULT_MODEL: &'static str = "sha256-stub";

    pub fn new(dims: usize) -> Self {
        Self {
            model: Self::DEFAULT_MODEL.to_string(),
            dims,
        }
    }

    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        let dims = config
            .dims
            .filter(|d| *d > 0)
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for hash provider"))?;
        let model = config
            .model
            .clone()
            .unwrap_or_else(|| Self::DEFAULT_MODEL.to_string());
        Ok(Self { model, dims })
    }

    fn hash_vector(&self, text: &str) -> Vec<f32> {
        let seed = Sha256::digest(text.as_bytes());
        let mut vec = Vec::with_capacity(self.dims);
        let mut counter: u32 = 0;
        while vec.len() < self.dims {
            let mut hasher = Sha256::new();
            hasher.update(seed);
            hasher.update(counter.to_le_bytes());
            let block = hasher.finalize();
            for chunk in block.chunks_exact(4) {
                if vec.len() == self.dims {
                    break;
                }
                let raw = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                vec.push((raw as f64 / u32::MAX as f64 * 2.0 - 1.0) as f32);
            }
            counter += 1;
        }
        normalize(&mut vec);
        vec
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbeddingProvider {
    fn name(&self) -> &str {
        "hash"
    }
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.hash_vector(text))
    }
}

// ============ OpenAI Provider ============

const OPENAI_EMBEDDINGS_URL: &str = "https://api.openai.com/v1/embeddings";

/// Embedding provider using the OpenAI API.
///
/// Calls the `POST /v1/embeddings` endpoint with the configured model.
/// Requires the `OPENAI_API_KEY` environment variable to be set.
///
/// # Features
///
/// - Batched embedding (`batch_size` texts per API call)
/// - Exponential backoff retry for rate limits and server errors
/// - Configurable timeout and max retries
pub struct OpenAIProvider {
    /// Model name (e.g. `"text-embedding-3-small"`).
    model: String,
    /// Vector dimensionality (e.g. `1536`).
    dims: usize,
    batch_size: usize,
    max_retries: u32,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAIProvider {
    /// Create a new OpenAI provider from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if `model` or `dims` is not set in config,
    /// or if `OPENAI_API_KEY` is not in the environment.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;

        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model,
            dims,
            batch_size: config.batch_size.max(1),
            max_retries: config.max_retries,
            api_key,
            client,
        })
    }

    /// One API call with retry/backoff.
    ///
    /// Retry strategy:
    /// - HTTP 429 or 5xx → retry with exponential backoff
    /// - HTTP 4xx (not 429) → fail immediately
    /// - Network error → retry
    async fn request(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(OPENAI_EMBEDDINGS_URL)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        let vectors = parse_openai_response(&json)?;
                        if vectors.len() != texts.len() {
                            bail!(
                                "OpenAI returned {} embeddings for {} inputs",
                                vectors.len(),
                                texts.len()
                            );
                        }
                        return Ok(vectors);
                    }

                    // Rate limited or server error: retry
                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        tracing::warn!(%status, attempt, "OpenAI embeddings request will be retried");
                        last_err = Some(anyhow::anyhow!(
                            "OpenAI API error {}: {}",
                            status,
                            body_text
                        ));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    bail!("OpenAI API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Embedding failed after retries")))
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn name(&self) -> &str {
        "openai"
    }
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.request(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            out.extend(self.request(batch).await?);
        }
        Ok(out)
    }
}

/// Parse the OpenAI embeddings API response JSON.
///
/// Extracts the `data[].embedding` arrays and returns them ordered by
/// their `index` field (input order).
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing data array"))?;

    let mut embeddings = Vec::with_capacity(data.len());

    for (position, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing embedding"))?;

        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();

        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map_or(position, |i| i as usize);
        embeddings.push((index, vec));
    }

    embeddings.sort_by_key(|(index, _)| *index);
    Ok(embeddings.into_iter().map(|(_, vec)| vec).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash_config(dims: usize) -> EmbeddingConfig {
        EmbeddingConfig {
            provider: "hash".to_string(),
            model: None,
            dims: Some(dims),
            ..EmbeddingConfig::default()
        }
    }

    #[test]
    fn disabled_provider_is_none() {
        assert!(create_provider(&EmbeddingConfig::default())
            .unwrap()
            .is_none());
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let config = EmbeddingConfig {
            provider: "telepathy".to_string(),
            ..EmbeddingConfig::default()
        };
        assert!(create_provider(&config).is_err());
    }

    #[test]
    fn hash_provider_requires_dims() {
        let config = EmbeddingConfig {
            provider: "hash".to_string(),
            ..EmbeddingConfig::default()
        };
        assert!(create_provider(&config).is_err());
    }

    #[tokio::test]
    async fn hash_embeddings_are_deterministic_unit_vectors() {
        let provider = create_provider(&hash_config(48)).unwrap().unwrap();
        assert_eq!(provider.name(), "hash");
        assert_eq!(provider.model_name(), HashEmbeddingProvider::DEFAULT_MODEL);

        let a = provider.embed("vacation policy").await.unwrap();
        let b = provider.embed("vacation policy").await.unwrap();
        let c = provider.embed("expense policy").await.unwrap();
        assert_eq!(a.len(), 48);
        assert_eq!(a, b);
        assert_ne!(a, c);

        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn hash_batch_matches_single_calls() {
        let provider = HashEmbeddingProvider::new(16);
        let texts = vec!["one".to_string(), "two".to_string()];
        let batch = provider.embed_batch(&texts).await.unwrap();
        assert_eq!(batch[0], provider.embed("one").await.unwrap());
        assert_eq!(batch[1], provider.embed("two").await.unwrap());
    }

    #[test]
    fn parse_openai_response_orders_by_index() {
        let json = serde_json::json!({
            "data": [
                { "index": 1, "embedding": [0.5, 0.5] },
                { "index": 0, "embedding": [1.0, 0.0] }
            ]
        });
        let vecs = parse_openai_response(&json).unwrap();
        assert_eq!(vecs, vec![vec![1.0, 0.0], vec![0.5, 0.5]]);
    }

    #[test]
    fn parse_openai_response_rejects_malformed_json() {
        assert!(parse_openai_response(&serde_json::json!({})).is_err());
        let missing = serde_json::json!({ "data": [ { "index": 0 } ] });
        assert!(parse_openai_response(&missing).is_err());
    }
}
