//! Embedder abstraction, provider registry, and vector utilities.
//!
//! An [`Embedder`] maps texts to fixed-dimension vectors, deterministically
//! for a fixed provider, parameters and model version. Collections store an
//! [`EmbedderConfig`]; the [`EmbedderRegistry`] turns it into an embedder.
//!
//! # Providers
//!
//! | Provider | Embedder | Notes |
//! |----------|----------|-------|
//! | `openai` | [`OpenAIEmbedder`] | needs `OPENAI_API_KEY`; `model`, `dims` required |
//! | `ollama` | [`OllamaEmbedder`] | `model`, `dims` required; `url` defaults to `http://localhost:11434` |
//! | `hashing` | [`HashingEmbedder`] | offline feature hashing; `dims` defaults to 256 |
//! | `local` | `LocalEmbedder` | fastembed, behind the `local-embeddings-fastembed` feature |
//!
//! # Retry Strategy
//!
//! The HTTP providers use exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

mod hashing;
#[cfg(feature = "local-embeddings-fastembed")]
mod local;
mod ollama;
mod openai;

pub use hashing::HashingEmbedder;
#[cfg(feature = "local-embeddings-fastembed")]
pub use local::LocalEmbedder;
pub use ollama::OllamaEmbedder;
pub use openai::OpenAIEmbedder;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Error;
use crate::models::{ComponentInfo, EmbedderConfig, Metadata};

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    fn dims(&self) -> usize;

    /// One vector per input text, in input order.
    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_documents(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("Empty embedding response"))
    }
}

pub type EmbedderFactory = Arc<dyn Fn(&Metadata) -> Result<Arc<dyn Embedder>> + Send + Sync>;

struct Provider {
    description: String,
    factory: EmbedderFactory,
}

/// Provider name to embedder factory lookup.
#[derive(Default)]
pub struct EmbedderRegistry {
    providers: BTreeMap<String, Provider>,
}

impl EmbedderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        let builtins: Vec<(&str, &str, EmbedderFactory)> = vec![
            (
                "openai",
                "OpenAI embeddings API",
                Arc::new(|p: &Metadata| Ok(Arc::new(OpenAIEmbedder::new(p)?) as Arc<dyn Embedder>)),
            ),
            (
                "ollama",
                "Embeddings from a local Ollama server",
                Arc::new(|p: &Metadata| Ok(Arc::new(OllamaEmbedder::new(p)?) as Arc<dyn Embedder>)),
            ),
            (
                "hashing",
                "Deterministic offline feature-hashing embedder",
                Arc::new(|p: &Metadata| Ok(Arc::new(HashingEmbedder::from_params(p)?) as Arc<dyn Embedder>)),
            ),
            #[cfg(feature = "local-embeddings-fastembed")]
            (
                "local",
                "Local ONNX models via fastembed",
                Arc::new(|p: &Metadata| Ok(Arc::new(LocalEmbedder::new(p)?) as Arc<dyn Embedder>)),
            ),
        ];
        for (name, description, factory) in builtins {
            registry.providers.insert(
                name.to_string(),
                Provider {
                    description: description.to_string(),
                    factory,
                },
            );
        }
        registry
    }

    pub fn register(
        &mut self,
        provider: impl Into<String>,
        description: impl Into<String>,
        factory: EmbedderFactory,
    ) -> Result<()> {
        let provider = provider.into();
        if self.providers.contains_key(&provider) {
            return Err(Error::config(format!(
                "an embedder is already registered for provider '{}'",
                provider
            )));
        }
        self.providers.insert(
            provider,
            Provider {
                description: description.into(),
                factory,
            },
        );
        Ok(())
    }

    /// Builds the embedder for `config`. Unknown providers and invalid
    /// parameters are configuration errors.
    pub fn resolve(&self, config: &EmbedderConfig) -> Result<Arc<dyn Embedder>> {
        let provider = self.providers.get(&config.provider).ok_or_else(|| {
            Error::config(format!(
                "no embedder registered with provider '{}'",
                config.provider
            ))
        })?;
        (provider.factory)(&config.config)
    }

    pub fn list(&self) -> Vec<ComponentInfo> {
        self.providers
            .iter()
            .map(|(name, p)| ComponentInfo {
                name: name.clone(),
                description: p.description.clone(),
            })
            .collect()
    }
}

/// Deserializes provider parameters, reporting problems as configuration errors.
pub(crate) fn parse_params<T: DeserializeOwned>(provider: &str, params: &Metadata) -> Result<T> {
    serde_json::from_value(serde_json::Value::Object(params.clone())).map_err(|e| {
        Error::config(format!("invalid embedder config for provider '{}': {}", provider, e))
    })
}

pub(crate) fn default_timeout_secs() -> u64 {
    30
}

pub(crate) fn default_max_retries() -> u32 {
    5
}

/// POSTs `body` and returns the JSON response, retrying 429/5xx and
/// transport errors with exponential backoff.
pub(crate) async fn post_json_with_retry(
    request: impl Fn() -> reqwest::RequestBuilder,
    max_retries: u32,
    service: &str,
) -> Result<serde_json::Value> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tracing::debug!(service, attempt, ?delay, "retrying embedding request");
            tokio::time::sleep(delay).await;
        }

        match request().send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    return Ok(response.json().await?);
                }

                let body_text = response.text().await.unwrap_or_default();
                if status.as_u16() == 429 || status.is_server_error() {
                    last_err = Some(anyhow!("{} API error {}: {}", service, status, body_text));
                    continue;
                }

                bail!("{} API error {}: {}", service, status, body_text);
            }
            Err(e) => {
                last_err = Some(anyhow!("{} connection error: {}", service, e));
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("{} embedding failed after retries", service)))
}

/// Checks that a provider returned one `dims`-sized vector per input.
pub(crate) fn check_shape(vectors: &[Vec<f32>], expected: usize, dims: usize) -> Result<()> {
    if vectors.len() != expected {
        bail!(
            "embedding response has {} vectors for {} inputs",
            vectors.len(),
            expected
        );
    }
    if let Some(v) = vectors.iter().find(|v| v.len() != dims) {
        bail!(
            "embedding has {} dimensions, collection expects {}",
            v.len(),
            dims
        );
    }
    Ok(())
}

fn json_to_vec(value: &serde_json::Value) -> Option<Vec<f32>> {
    value
        .as_array()
        .map(|arr| arr.iter().map(|v| v.as_f64().unwrap_or(0.0) as f32).collect())
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`; `0.0` for empty or mismatched vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }

    #[test]
    fn test_cosine_identical_and_orthogonal() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    }

    #[test]
    fn test_resolve_unknown_provider_is_config_error() {
        let registry = EmbedderRegistry::with_builtins();
        let err = registry
            .resolve(&EmbedderConfig::new("telepathy"))
            .err()
            .unwrap();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Config(_))));
    }

    #[test]
    fn test_resolve_hashing_with_params() {
        let registry = EmbedderRegistry::with_builtins();
        let embedder = registry
            .resolve(&EmbedderConfig::new("hashing").with_param("dims", 64))
            .unwrap();
        assert_eq!(embedder.dims(), 64);
    }

    #[test]
    fn test_duplicate_provider_rejected() {
        let mut registry = EmbedderRegistry::with_builtins();
        let factory: EmbedderFactory =
            Arc::new(|_: &Metadata| Ok(Arc::new(HashingEmbedder::new(8)) as Arc<dyn Embedder>));
        assert!(registry.register("hashing", "again", factory.clone()).is_err());
        registry.register("tiny", "8-dim hashing", factory).unwrap();
        assert!(registry.list().iter().any(|c| c.name == "tiny"));
    }

    #[test]
    fn test_check_shape() {
        assert!(check_shape(&[vec![0.0; 3]], 1, 3).is_ok());
        assert!(check_shape(&[vec![0.0; 3]], 2, 3).is_err());
        assert!(check_shape(&[vec![0.0; 4]], 1, 3).is_err());
    }

    #[test]
    fn test_params_errors_are_config() {
        let mut params = Metadata::new();
        params.insert("dims".into(), "many".into());
        let err = parse_params::<hashing::HashingParams>("hashing", &params).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Config(_))));
    }
}
