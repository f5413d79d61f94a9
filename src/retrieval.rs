//! Query-time retrieval over a collection.
//!
//! The retriever is a tagged union on `search_type`:
//!
//! ```json
//! {"search_type": "similarity", "k": 4}
//! {"search_type": "mmr", "k": 4, "fetch_k": 20, "lambda_mult": 0.5}
//! {"search_type": "similarity_score_threshold", "k": 4, "score_threshold": 0.3}
//! ```
//!
//! Every variant accepts an optional `filter`: metadata keys that must be
//! present with equal values on a chunk for it to be considered.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::embedding::{cosine_similarity, EmbedderRegistry};
use crate::error::Error;
use crate::metadata_store::MetadataStore;
use crate::models::Metadata;
use crate::vector_db::{SearchHit, VectorDb};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "search_type", rename_all = "snake_case")]
pub enum RetrieverConfig {
    Similarity {
        #[serde(default = "default_k")]
        k: usize,
        #[serde(default)]
        filter: Option<Metadata>,
    },
    /// Maximal marginal relevance: fetch `fetch_k` candidates, then pick
    /// `k` trading query relevance against redundancy with `lambda_mult`
    /// (1.0 = pure relevance, 0.0 = pure diversity).
    Mmr {
        #[serde(default = "default_k")]
        k: usize,
        #[serde(default = "default_fetch_k")]
        fetch_k: usize,
        #[serde(default = "default_lambda_mult")]
        lambda_mult: f32,
        #[serde(default)]
        filter: Option<Metadata>,
    },
    SimilarityScoreThreshold {
        #[serde(default = "default_k")]
        k: usize,
        score_threshold: f32,
        #[serde(default)]
        filter: Option<Metadata>,
    },
}

fn default_k() -> usize {
    4
}

fn default_fetch_k() -> usize {
    20
}

fn default_lambda_mult() -> f32 {
    0.5
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        RetrieverConfig::Similarity {
            k: default_k(),
            filter: None,
        }
    }
}

impl RetrieverConfig {
    pub fn k(&self) -> usize {
        match self {
            RetrieverConfig::Similarity { k, .. }
            | RetrieverConfig::Mmr { k, .. }
            | RetrieverConfig::SimilarityScoreThreshold { k, .. } => *k,
        }
    }

    pub fn filter(&self) -> Option<&Metadata> {
        match self {
            RetrieverConfig::Similarity { filter, .. }
            | RetrieverConfig::Mmr { filter, .. }
            | RetrieverConfig::SimilarityScoreThreshold { filter, .. } => filter.as_ref(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.k() == 0 {
            return Err(Error::bad_request("k must be >= 1"));
        }
        match self {
            RetrieverConfig::Mmr {
                k,
                fetch_k,
                lambda_mult,
                ..
            } => {
                if fetch_k < k {
                    return Err(Error::bad_request(format!(
                        "fetch_k ({}) must be >= k ({})",
                        fetch_k, k
                    )));
                }
                if !(0.0..=1.0).contains(lambda_mult) {
                    return Err(Error::bad_request("lambda_mult must be within [0, 1]"));
                }
            }
            RetrieverConfig::SimilarityScoreThreshold {
                score_threshold, ..
            } => {
                if !(-1.0..=1.0).contains(score_threshold) {
                    return Err(Error::bad_request(
                        "score_threshold must be within [-1, 1]",
                    ));
                }
            }
            RetrieverConfig::Similarity { .. } => {}
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrieveRequest {
    pub collection_name: String,
    pub query: String,
    #[serde(default)]
    pub retriever_config: RetrieverConfig,
}

/// Embeds `query` with the collection's embedder and returns the chunks
/// selected by `config`, best first.
pub async fn retrieve(
    metadata_store: &dyn MetadataStore,
    vector_db: &dyn VectorDb,
    embedders: &EmbedderRegistry,
    collection_name: &str,
    query: &str,
    config: &RetrieverConfig,
) -> Result<Vec<SearchHit>> {
    config.validate()?;
    if query.trim().is_empty() {
        return Err(Error::bad_request("query must not be empty"));
    }

    let collection = metadata_store
        .get_collection_by_name(collection_name)
        .await?
        .ok_or_else(|| Error::not_found(format!("collection '{}'", collection_name)))?;
    let embedder = embedders.resolve(&collection.embedder_config)?;
    let query_vector = embedder.embed_query(query).await?;

    let hits = match config {
        RetrieverConfig::Similarity { k, filter } => {
            vector_db
                .search(collection_name, &query_vector, *k, filter.as_ref())
                .await?
        }
        RetrieverConfig::Mmr {
            k,
            fetch_k,
            lambda_mult,
            filter,
        } => {
            let candidates = vector_db
                .search(collection_name, &query_vector, *fetch_k, filter.as_ref())
                .await?;
            maximal_marginal_relevance(candidates, *k, *lambda_mult)
        }
        RetrieverConfig::SimilarityScoreThreshold {
            k,
            score_threshold,
            filter,
        } => vector_db
            .search(collection_name, &query_vector, *k, filter.as_ref())
            .await?
            .into_iter()
            .filter(|hit| hit.score >= *score_threshold)
            .collect(),
    };

    tracing::debug!(collection = %collection_name, hits = hits.len(), "retrieved");
    Ok(hits)
}

/// Greedy MMR over `candidates`, whose `score` is their similarity to the
/// query.
fn maximal_marginal_relevance(
    mut candidates: Vec<SearchHit>,
    k: usize,
    lambda_mult: f32,
) -> Vec<SearchHit> {
    let mut selected: Vec<SearchHit> = Vec::with_capacity(k.min(candidates.len()));
    while selected.len() < k && !candidates.is_empty() {
        let mut best = 0;
        let mut best_score = f32::NEG_INFINITY;
        for (i, candidate) in candidates.iter().enumerate() {
            let redundancy = selected
                .iter()
                .map(|s| cosine_similarity(&candidate.vector, &s.vector))
                .fold(f32::NEG_INFINITY, f32::max);
            let redundancy = if selected.is_empty() { 0.0 } else { redundancy };
            let score = lambda_mult * candidate.score - (1.0 - lambda_mult) * redundancy;
            if score > best_score {
                best = i;
                best_score = score;
            }
        }
        selected.push(candidates.remove(best));
    }
    selected
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(id: &str, score: f32, vector: Vec<f32>) -> SearchHit {
        SearchHit {
            id: id.into(),
            content: id.into(),
            metadata: Metadata::new(),
            score,
            vector,
        }
    }

    #[test]
    fn test_config_is_tagged_on_search_type() {
        let config: RetrieverConfig =
            serde_json::from_str(r#"{"search_type": "mmr", "k": 2}"#).unwrap();
        assert_eq!(
            config,
            RetrieverConfig::Mmr {
                k: 2,
                fetch_k: 20,
                lambda_mult: 0.5,
                filter: None
            }
        );

        let config: RetrieverConfig = serde_json::from_str(
            r#"{"search_type": "similarity_score_threshold", "score_threshold": 0.4, "filter": {"lang": "en"}}"#,
        )
        .unwrap();
        assert_eq!(config.k(), 4);
        assert_eq!(config.filter().unwrap()["lang"], "en");

        assert!(serde_json::from_str::<RetrieverConfig>(r#"{"search_type": "bm25"}"#).is_err());
        // The threshold has no default.
        assert!(serde_json::from_str::<RetrieverConfig>(
            r#"{"search_type": "similarity_score_threshold"}"#
        )
        .is_err());
    }

    #[test]
    fn test_validate_rejects_bad_parameters() {
        assert!(RetrieverConfig::Similarity { k: 0, filter: None }
            .validate()
            .is_err());
        assert!(RetrieverConfig::Mmr {
            k: 5,
            fetch_k: 3,
            lambda_mult: 0.5,
            filter: None
        }
        .validate()
        .is_err());
        assert!(RetrieverConfig::Mmr {
            k: 2,
            fetch_k: 3,
            lambda_mult: 1.5,
            filter: None
        }
        .validate()
        .is_err());
        assert!(RetrieverConfig::default().validate().is_ok());
    }

    #[test]
    fn test_mmr_prefers_diverse_results() {
        let candidates = vec![
            hit("a", 0.95, vec![1.0, 0.0]),
            hit("a-dup", 0.94, vec![1.0, 0.0]),
            hit("b", 0.70, vec![0.0, 1.0]),
        ];
        let picked = maximal_marginal_relevance(candidates, 2, 0.5);
        let ids: Vec<_> = picked.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_mmr_with_full_relevance_keeps_score_order() {
        let candidates = vec![
            hit("a", 0.95, vec![1.0, 0.0]),
            hit("a-dup", 0.94, vec![1.0, 0.0]),
            hit("b", 0.70, vec![0.0, 1.0]),
        ];
        let picked = maximal_marginal_relevance(candidates, 3, 1.0);
        let ids: Vec<_> = picked.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "a-dup", "b"]);
    }
}
