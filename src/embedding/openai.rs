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

const DEFAULT_URL: &str = "https://api.openai.com/v1/embeddings";

#[derive(Debug, Deserialize)]
struct OpenAIParams {
    model: String,
    dims: usize,
    #[serde(default)]
    url: Option<String>,
    #[serde(default = "default_batch_size")]
    batch_size: usize,
    #[serde(default = "default_timeout_secs")]
    timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    max_retries: u32,
}

fn default_batch_size() -> usize {
    64
}

/// Embeddings from the OpenAI API (`POST /v1/embeddings`).
///
/// Requires the `OPENAI_API_KEY` environment variable.
pub struct OpenAIEmbedder {
    client: reqwest::Client,
    api_key: String,
    url: String,
    model: String,
    dims: usize,
    batch_size: usize,
    max_retries: u32,
}

impl OpenAIEmbedder {
    pub fn new(params: &Metadata) -> Result<Self> {
        let params: OpenAIParams = parse_params("openai", params)?;
        if params.dims == 0 {
            return Err(Error::config("openai embedder requires dims > 0"));
        }
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| Error::config("OPENAI_API_KEY not set"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(params.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            api_key,
            url: params.url.unwrap_or_else(|| DEFAULT_URL.to_string()),
            model: params.model,
            dims: params.dims,
            batch_size: params.batch_size.max(1),
            max_retries: params.max_retries,
        })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        // Only the text-embedding-3 family accepts a requested size.
        if self.model.starts_with("text-embedding-3") {
            body["dimensions"] = self.dims.into();
        }
        let json = post_json_with_retry(
            || {
                self.client
                    .post(&self.url)
                    .bearer_auth(&self.api_key)
                    .json(&body)
            },
            self.max_retries,
            "OpenAI",
        )
        .await?;
        parse_openai_response(&json)
    }
}

/// Extracts `data[].embedding`, ordered by `data[].index` when present.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow!("Invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(json_to_vec)
            .ok_or_else(|| anyhow!("Invalid OpenAI response: missing embedding"))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        indexed.push((index, embedding));
    }
    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            vectors.extend(self.embed_batch(batch).await?);
        }
        check_shape(&vectors, texts.len(), self.dims)?;
        Ok(vectors)
    }
}
