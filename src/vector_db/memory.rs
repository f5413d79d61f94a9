use anyhow::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use tokio::sync::RwLock;

use super::{
    check_dims, matches_filter, missing_collection, prepare_points, top_hits,
    touched_data_points, PreparedPoint, SearchHit, VectorDb,
};
use crate::embedding::{cosine_similarity, Embedder};
use crate::models::{DataPointVector, Metadata, ParsedChunk};

struct MemoryCollection {
    dims: usize,
    points: BTreeMap<String, PreparedPoint>,
}

/// Process-local vector store. Contents vanish with the process.
#[derive(Default)]
pub struct MemoryVectorDb {
    collections: RwLock<BTreeMap<String, MemoryCollection>>,
}

impl MemoryVectorDb {
    pub fn new() -> Self {
        Self::default()
    }

    async fn dims_of(&self, collection: &str) -> Result<usize> {
        self.collections
            .read()
            .await
            .get(collection)
            .map(|c| c.dims)
            .ok_or_else(|| missing_collection(collection))
    }
}

#[async_trait]
impl VectorDb for MemoryVectorDb {
    async fn create_collection(&self, name: &str, embedder: &dyn Embedder) -> Result<()> {
        let mut collections = self.collections.write().await;
        if let Some(existing) = collections.get(name) {
            return check_dims(name, existing.dims, embedder);
        }
        collections.insert(
            name.to_string(),
            MemoryCollection {
                dims: embedder.dims(),
                points: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn delete_collection(&self, name: &str) -> Result<()> {
        self.collections.write().await.remove(name);
        Ok(())
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        Ok(self.collections.read().await.keys().cloned().collect())
    }

    async fn upsert_documents(
        &self,
        collection: &str,
        chunks: &[ParsedChunk],
        data_point_fqns: &[String],
        embedder: &dyn Embedder,
        incremental: bool,
    ) -> Result<Vec<String>> {
        check_dims(collection, self.dims_of(collection).await?, embedder)?;
        let points = prepare_points(chunks, embedder).await?;
        let ids: Vec<String> = points.iter().map(|p| p.id.clone()).collect();

        let mut collections = self.collections.write().await;
        let target = collections
            .get_mut(collection)
            .ok_or_else(|| missing_collection(collection))?;

        if incremental {
            let written: HashSet<&str> = ids.iter().map(String::as_str).collect();
            let touched = touched_data_points(&points, data_point_fqns);
            target.points.retain(|id, p| {
                !touched.contains(p.data_point_fqn.as_str()) || written.contains(id.as_str())
            });
        }
        for point in points {
            target.points.insert(point.id.clone(), point);
        }
        Ok(ids)
    }

    async fn list_data_point_vectors(
        &self,
        collection: &str,
        data_source_fqn: &str,
        _batch_size: usize,
    ) -> Result<Vec<DataPointVector>> {
        let collections = self.collections.read().await;
        let target = collections
            .get(collection)
            .ok_or_else(|| missing_collection(collection))?;
        Ok(target
            .points
            .values()
            .filter(|p| p.data_source_fqn == data_source_fqn)
            .map(PreparedPoint::as_data_point_vector)
            .collect())
    }

    async fn delete_data_point_vectors(
        &self,
        collection: &str,
        vectors: &[DataPointVector],
        _batch_size: usize,
    ) -> Result<()> {
        let mut collections = self.collections.write().await;
        let target = collections
            .get_mut(collection)
            .ok_or_else(|| missing_collection(collection))?;
        for vector in vectors {
            target.points.remove(&vector.data_point_vector_id);
        }
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        query: &[f32],
        limit: usize,
        filter: Option<&Metadata>,
    ) -> Result<Vec<SearchHit>> {
        let collections = self.collections.read().await;
        let target = collections
            .get(collection)
            .ok_or_else(|| missing_collection(collection))?;
        let hits = target
            .points
            .values()
            .filter(|p| matches_filter(&p.metadata, filter))
            .map(|p| SearchHit {
                id: p.id.clone(),
                content: p.content.clone(),
                metadata: p.metadata.clone(),
                score: cosine_similarity(query, &p.vector),
                vector: p.vector.clone(),
            })
            .collect();
        Ok(top_hits(hits, limit))
    }
}
