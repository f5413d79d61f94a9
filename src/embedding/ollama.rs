use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use super::{
    check_shape, default_max_retries, default_timeout_secs, json_to_vec, parse_params,
    post_json_with_retry, Embedder,
};
use crate::error::Error;
use crate::models::Metadata;

#[derive(Debug, Deserialize)]
struct OllamaParams {
    model: String,
    dims: usize,
    #[serde(default = "default_url")]
    url: String,
    #[serde(default = "default_timeout_secs")]
    timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    max_retries: u32,
}

fn default_url() -> String {
    "http://localhost:11434".to_string()
}

/// Embedding provider using a local Ollama instance.
///
/// Calls `POST /api/embed` on the configured URL. Requires Ollama to be
/// running with an embedding model pulled (e.g. `ollama pull nomic-embed-text`).
pub struct OllamaEmbedder {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    dims: usize,
    max_retries: u32,
}

impl OllamaEmbedder {
    pub fn new(params: &Metadata) -> Result<Self> {
        let params: OllamaParams = parse_params("ollama", params)?;
        if params.dims == 0 {
            return Err(Error::config("ollama embedder requires dims > 0"));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(params.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/api/embed", params.url.trim_end_matches('/')),
            model: params.model,
            dims: params.dims,
            max_retries: params.max_retries,
        })
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow!("Invalid Ollama response: missing embeddings array"))?;

    embeddings
        .iter()
        .map(|e| {
            json_to_vec(e)
                .ok_or_else(|| anyhow!("Invalid Ollama response: embedding is not an array"))
        })
        .collect()
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let json = post_json_with_retry(
            || self.client.post(&self.endpoint).json(&body),
            self.max_retries,
            "Ollama",
        )
        .await?;
        let vectors = parse_ollama_response(&json)?;
        check_shape(&vectors, texts.len(), self.dims)?;
        Ok(vectors)
    }
}
