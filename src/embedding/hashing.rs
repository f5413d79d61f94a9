use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use super::{parse_params, Embedder};
use crate::error::Error;
use crate::models::Metadata;

#[derive(Debug, Deserialize)]
pub(super) struct HashingParams {
    #[serde(default = "default_dims")]
    dims: usize,
}

fn default_dims() -> usize {
    256
}

/// Offline feature-hashing embedder.
///
/// Each lowercase alphanumeric token is hashed with SHA-256; the first
/// eight bytes choose a bucket and the ninth a sign. The summed vector is
/// L2-normalized, so texts sharing vocabulary score high under cosine
/// similarity. Text with no tokens maps to the zero vector.
pub struct HashingEmbedder {
    dims: usize,
    model: String,
}

impl HashingEmbedder {
    pub fn new(dims: usize) -> Self {
        let dims = dims.max(1);
        Self {
            dims,
            model: format!("feature-hashing-{}", dims),
        }
    }

    pub(super) fn from_params(params: &Metadata) -> Result<Self> {
        let params: HashingParams = parse_params("hashing", params)?;
        if params.dims == 0 {
            return Err(Error::config("hashing embedder requires dims > 0"));
        }
        Ok(Self::new(params.dims))
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dims];
        let lowered = text.to_lowercase();
        for token in lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let digest = Sha256::digest(token.as_bytes());
            let mut bucket_bytes = [0u8; 8];
            bucket_bytes.copy_from_slice(&digest[..8]);
            let bucket = (u64::from_le_bytes(bucket_bytes) % self.dims as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::cosine_similarity;

    #[tokio::test]
    async fn test_deterministic_and_normalized() {
        let embedder = HashingEmbedder::new(64);
        let texts = vec!["Rust ownership rules".to_string()];
        let a = embedder.embed_documents(&texts).await.unwrap();
        let b = embedder.embed_documents(&texts).await.unwrap();
        assert_eq!(a, b);
        let norm: f32 = a[0].iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_shared_vocabulary_scores_higher() {
        let embedder = HashingEmbedder::new(256);
        let query = embedder.embed_one("vector database");
        let near = embedder.embed_one("a database of vector embeddings");
        let far = embedder.embed_one("banana bread recipe");
        assert!(cosine_similarity(&query, &near) > cosine_similarity(&query, &far));
    }

    #[test]
    fn test_empty_text_is_zero_vector() {
        let embedder = HashingEmbedder::new(16);
        assert!(embedder.embed_one("  ... ").iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_case_insensitive() {
        let embedder = HashingEmbedder::new(32);
        assert_eq!(embedder.embed_one("Hello World"), embedder.embed_one("hello world"));
    }
}
