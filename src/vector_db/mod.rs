//! Vector stores: collection lifecycle plus point-level upsert, listing,
//! deletion and similarity search.
//!
//! # Point identity
//!
//! Each chunk is one point. Its id is a UUIDv5 of
//! `data_point_fqn + "::" + chunk_index` ([`point_id`]), so re-upserting
//! the same chunk of the same document overwrites the stored point.
//!
//! # Atomicity
//!
//! `upsert_documents` embeds every chunk before touching storage and then
//! writes all points under one lock (memory) or one transaction (sqlite).
//! Either every point of the call lands or none does.
//!
//! # Backends
//!
//! | Provider | Store |
//! |----------|-------|
//! | `memory` | [`MemoryVectorDb`] |
//! | `sqlite` | [`SqliteVectorDb`] |

mod memory;
mod sqlite;

pub use memory::MemoryVectorDb;
pub use sqlite::SqliteVectorDb;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::VectorDbConfig;
use crate::embedding::{check_shape, Embedder};
use crate::error::Error;
use crate::models::{
    DataPointVector, Metadata, ParsedChunk, FQN_SEPARATOR, META_CHUNK_INDEX,
    META_DATA_POINT_FQN, META_DATA_POINT_HASH, META_DATA_SOURCE_FQN,
};

/// A stored chunk returned by [`VectorDb::search`], best match first.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub id: String,
    pub content: String,
    pub metadata: Metadata,
    /// Cosine similarity to the query vector.
    pub score: f32,
    #[serde(skip)]
    pub vector: Vec<f32>,
}

#[async_trait]
pub trait VectorDb: Send + Sync {
    /// Creates `name` sized for `embedder`. Re-creating an existing
    /// collection with the same dimensions is a no-op.
    async fn create_collection(&self, name: &str, embedder: &dyn Embedder) -> Result<()>;

    /// Drops the collection and all its points. Missing collections are ignored.
    async fn delete_collection(&self, name: &str) -> Result<()>;

    async fn list_collections(&self) -> Result<Vec<String>>;

    /// Embeds and writes `chunks`, returning the point ids in input order.
    ///
    /// Every chunk must carry `_data_point_fqn` metadata. A data point is
    /// touched when a chunk carries it or `data_point_fqns` names it, which
    /// covers documents that now parse to no chunks at all. With
    /// `incremental`, stored points of a touched data point that this call
    /// did not rewrite are removed in the same write.
    async fn upsert_documents(
        &self,
        collection: &str,
        chunks: &[ParsedChunk],
        data_point_fqns: &[String],
        embedder: &dyn Embedder,
        incremental: bool,
    ) -> Result<Vec<String>>;

    /// All points of one data source, fetched `batch_size` at a time.
    async fn list_data_point_vectors(
        &self,
        collection: &str,
        data_source_fqn: &str,
        batch_size: usize,
    ) -> Result<Vec<DataPointVector>>;

    async fn delete_data_point_vectors(
        &self,
        collection: &str,
        vectors: &[DataPointVector],
        batch_size: usize,
    ) -> Result<()>;

    /// Top `limit` points by cosine similarity. `filter` keeps only points
    /// whose metadata equals every given key/value.
    async fn search(
        &self,
        collection: &str,
        query: &[f32],
        limit: usize,
        filter: Option<&Metadata>,
    ) -> Result<Vec<SearchHit>>;
}

/// Opens the store named by `config.provider`.
pub async fn connect(config: &VectorDbConfig) -> Result<Arc<dyn VectorDb>> {
    match config.provider.as_str() {
        "memory" => Ok(Arc::new(MemoryVectorDb::new())),
        "sqlite" => {
            let path = config
                .path
                .as_ref()
                .ok_or_else(|| Error::config("vector_db.path is required for sqlite"))?;
            Ok(Arc::new(SqliteVectorDb::open(path).await?))
        }
        other => Err(Error::config(format!(
            "unknown vector_db provider '{}'",
            other
        ))),
    }
}

/// Deterministic point id for chunk `chunk_index` of `data_point_fqn`.
pub fn point_id(data_point_fqn: &str, chunk_index: u64) -> String {
    let key = format!("{}{}{}", data_point_fqn, FQN_SEPARATOR, chunk_index);
    Uuid::new_v5(&Uuid::NAMESPACE_URL, key.as_bytes()).to_string()
}

/// A chunk with its identity resolved and its vector computed.
#[derive(Debug, Clone)]
pub(crate) struct PreparedPoint {
    pub id: String,
    pub data_point_fqn: String,
    pub data_point_hash: String,
    pub data_source_fqn: String,
    pub chunk_index: u64,
    pub content: String,
    pub metadata: Metadata,
    pub vector: Vec<f32>,
}

impl PreparedPoint {
    pub fn as_data_point_vector(&self) -> DataPointVector {
        DataPointVector {
            data_point_vector_id: self.id.clone(),
            data_point_fqn: self.data_point_fqn.clone(),
            data_point_hash: self.data_point_hash.clone(),
        }
    }
}

/// Resolves ids and embeds `chunks`. Chunks without an explicit
/// `_chunk_index` are numbered by their position among the chunks of the
/// same data point in this call.
pub(crate) async fn prepare_points(
    chunks: &[ParsedChunk],
    embedder: &dyn Embedder,
) -> Result<Vec<PreparedPoint>> {
    let mut next_index: HashMap<String, u64> = HashMap::new();
    let mut points = Vec::with_capacity(chunks.len());

    for chunk in chunks {
        let fqn = chunk
            .meta_str(META_DATA_POINT_FQN)
            .ok_or_else(|| {
                Error::bad_request(format!("chunk is missing '{}' metadata", META_DATA_POINT_FQN))
            })?
            .to_string();
        let position = next_index.entry(fqn.clone()).or_insert(0);
        let chunk_index = chunk.chunk_index().unwrap_or(*position);
        *position = chunk_index + 1;

        let data_source_fqn = chunk
            .meta_str(META_DATA_SOURCE_FQN)
            .map(str::to_string)
            .or_else(|| fqn.rsplit_once(FQN_SEPARATOR).map(|(s, _)| s.to_string()))
            .unwrap_or_default();

        points.push(PreparedPoint {
            id: point_id(&fqn, chunk_index),
            data_point_hash: chunk
                .meta_str(META_DATA_POINT_HASH)
                .unwrap_or_default()
                .to_string(),
            data_source_fqn,
            data_point_fqn: fqn,
            chunk_index,
            content: chunk.content.clone(),
            metadata: chunk.metadata.clone(),
            vector: Vec::new(),
        });
    }

    if points.is_empty() {
        return Ok(points);
    }

    let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
    let vectors = embedder.embed_documents(&texts).await?;
    check_shape(&vectors, texts.len(), embedder.dims())?;
    for (point, vector) in points.iter_mut().zip(vectors) {
        point.vector = vector;
    }
    Ok(points)
}

/// Data points whose stored points an upsert of `points` replaces.
pub(crate) fn touched_data_points<'a>(
    points: &'a [PreparedPoint],
    data_point_fqns: &'a [String],
) -> HashSet<&'a str> {
    points
        .iter()
        .map(|p| p.data_point_fqn.as_str())
        .chain(data_point_fqns.iter().map(String::as_str))
        .collect()
}

/// True if `metadata` holds every key of `filter` with an equal value.
pub(crate) fn matches_filter(metadata: &Metadata, filter: Option<&Metadata>) -> bool {
    filter.map_or(true, |f| {
        f.iter().all(|(key, value)| metadata.get(key) == Some(value))
    })
}

pub(crate) fn check_dims(collection: &str, stored: usize, embedder: &dyn Embedder) -> Result<()> {
    if stored != embedder.dims() {
        return Err(Error::config(format!(
            "collection '{}' stores {}-dimensional vectors but embedder '{}' produces {}",
            collection,
            stored,
            embedder.model_name(),
            embedder.dims()
        )));
    }
    Ok(())
}

pub(crate) fn missing_collection(name: &str) -> anyhow::Error {
    Error::not_found(format!("vector collection '{}'", name))
}

/// Sorts hits best first and keeps the top `limit`.
pub(crate) fn top_hits(mut hits: Vec<SearchHit>, limit: usize) -> Vec<SearchHit> {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    hits.truncate(limit);
    hits
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::embedding::HashingEmbedder;

    pub fn chunk(fqn: &str, hash: &str, index: u64, text: &str) -> ParsedChunk {
        let mut meta = Metadata::new();
        meta.insert(META_DATA_POINT_FQN.into(), fqn.into());
        meta.insert(META_DATA_POINT_HASH.into(), hash.into());
        meta.insert(META_DATA_SOURCE_FQN.into(), "localdir::/data".into());
        meta.insert(META_CHUNK_INDEX.into(), index.into());
        ParsedChunk::new(text, meta)
    }

    /// Exercises the contract every backend must honor.
    pub async fn exercise_backend(db: &dyn VectorDb) {
        let embedder = HashingEmbedder::new(32);
        db.create_collection("docs", &embedder).await.unwrap();
        db.create_collection("docs", &embedder).await.unwrap();
        assert_eq!(db.list_collections().await.unwrap(), vec!["docs"]);

        let a = "localdir::/data::a.txt";
        let b = "localdir::/data::b.txt";
        let ids = db
            .upsert_documents(
                "docs",
                &[
                    chunk(a, "h1", 0, "alpha one"),
                    chunk(a, "h1", 1, "alpha two"),
                    chunk(b, "h2", 0, "bravo"),
                ],
                &[],
                &embedder,
                true,
            )
            .await
            .unwrap();
        assert_eq!(ids[0], point_id(a, 0));
        assert_eq!(ids.len(), 3);

        // Re-upsert overwrites and drops the stale tail chunk of `a`.
        db.upsert_documents("docs", &[chunk(a, "h3", 0, "alpha again")], &[], &embedder, true)
            .await
            .unwrap();
        let vectors = db
            .list_data_point_vectors("docs", "localdir::/data", 1)
            .await
            .unwrap();
        assert_eq!(vectors.len(), 2);
        let snapshot = crate::indexer::get_data_point_fqn_to_hash_map(&vectors);
        assert_eq!(snapshot[a], "h3");
        assert_eq!(snapshot[b], "h2");
        assert!(db
            .list_data_point_vectors("docs", "web::https://x", 10)
            .await
            .unwrap()
            .is_empty());

        let query = embedder.embed_one("bravo");
        let hits = db.search("docs", &query, 1, None).await.unwrap();
        assert_eq!(hits[0].content, "bravo");
        let mut filter = Metadata::new();
        filter.insert(META_DATA_POINT_FQN.into(), a.into());
        let hits = db.search("docs", &query, 5, Some(&filter)).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "alpha again");

        let doomed: Vec<_> = vectors
            .into_iter()
            .filter(|v| v.data_point_fqn == b)
            .collect();
        db.delete_data_point_vectors("docs", &doomed, 1).await.unwrap();
        let left = db
            .list_data_point_vectors("docs", "localdir::/data", 10)
            .await
            .unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].data_point_fqn, a);

        // Naming a data point without chunks only prunes when incremental.
        db.upsert_documents("docs", &[], &[a.to_string()], &embedder, false)
            .await
            .unwrap();
        assert_eq!(
            db.list_data_point_vectors("docs", "localdir::/data", 10)
                .await
                .unwrap()
                .len(),
            1
        );
        let ids = db
            .upsert_documents("docs", &[], &[a.to_string()], &embedder, true)
            .await
            .unwrap();
        assert!(ids.is_empty());
        assert!(db
            .list_data_point_vectors("docs", "localdir::/data", 10)
            .await
            .unwrap()
            .is_empty());

        let err = db
            .upsert_documents("nope", &[chunk(a, "h", 0, "x")], &[], &embedder, true)
            .await
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::NotFound(_))));

        let wide = HashingEmbedder::new(64);
        assert!(db
            .upsert_documents("docs", &[chunk(a, "h", 0, "x")], &[], &wide, true)
            .await
            .is_err());

        db.delete_collection("docs").await.unwrap();
        db.delete_collection("docs").await.unwrap();
        assert!(db.list_collections().await.unwrap().is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_id_is_deterministic() {
        let a = point_id("localdir::/data::a.md", 0);
        assert_eq!(a, point_id("localdir::/data::a.md", 0));
        assert_ne!(a, point_id("localdir::/data::a.md", 1));
        assert_ne!(a, point_id("localdir::/data::b.md", 0));
    }

    #[test]
    fn test_matches_filter() {
        let mut meta = Metadata::new();
        meta.insert("type".into(), "code".into());
        meta.insert("language".into(), "rust".into());
        let mut filter = Metadata::new();
        filter.insert("language".into(), "rust".into());
        assert!(matches_filter(&meta, Some(&filter)));
        assert!(matches_filter(&meta, None));
        filter.insert("type".into(), "text".into());
        assert!(!matches_filter(&meta, Some(&filter)));
    }

    #[tokio::test]
    async fn test_prepare_points_numbers_missing_indices() {
        let embedder = crate::embedding::HashingEmbedder::new(8);
        let mut meta = Metadata::new();
        meta.insert(META_DATA_POINT_FQN.into(), "t::s::p".into());
        let chunks = vec![
            ParsedChunk::new("one", meta.clone()),
            ParsedChunk::new("two", meta),
        ];
        let points = prepare_points(&chunks, &embedder).await.unwrap();
        assert_eq!(points[1].chunk_index, 1);
        assert_eq!(points[1].data_source_fqn, "t::s");
        assert_eq!(points[0].vector.len(), 8);

        let bare = vec![ParsedChunk::new("orphan", Metadata::new())];
        assert!(prepare_points(&bare, &embedder).await.is_err());
    }
}
