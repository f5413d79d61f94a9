use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;
use std::path::Path;

use super::{
    check_dims, matches_filter, missing_collection, prepare_points, top_hits,
    touched_data_points, SearchHit, VectorDb,
};
use crate::db;
use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob, Embedder};
use crate::migrate;
use crate::models::{DataPointVector, Metadata, ParsedChunk};

/// Vector store in a SQLite file. Similarity is computed in process over
/// the collection's stored embeddings.
pub struct SqliteVectorDb {
    pool: SqlitePool,
}

impl SqliteVectorDb {
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = db::connect(path).await?;
        migrate::run_vector_migrations(&pool).await?;
        Ok(Self { pool })
    }

    async fn stored_dims(&self, collection: &str) -> Result<Option<usize>> {
        let dims: Option<i64> =
            sqlx::query_scalar("SELECT dims FROM vector_collections WHERE name = ?")
                .bind(collection)
                .fetch_optional(&self.pool)
                .await?;
        Ok(dims.map(|d| d as usize))
    }

    async fn dims_of(&self, collection: &str) -> Result<usize> {
        self.stored_dims(collection)
            .await?
            .ok_or_else(|| missing_collection(collection))
    }
}

#[async_trait]
impl VectorDb for SqliteVectorDb {
    async fn create_collection(&self, name: &str, embedder: &dyn Embedder) -> Result<()> {
        if let Some(dims) = self.stored_dims(name).await? {
            return check_dims(name, dims, embedder);
        }
        sqlx::query(
            "INSERT INTO vector_collections (name, model, dims, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(name)
        .bind(embedder.model_name())
        .bind(embedder.dims() as i64)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to create vector collection '{}'", name))?;
        Ok(())
    }

    async fn delete_collection(&self, name: &str) -> Result<()> {
        let mut tx = db::begin_write(&self.pool).await?;
        sqlx::query("DELETE FROM vectors WHERE collection = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM vector_collections WHERE name = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        let names = sqlx::query_scalar("SELECT name FROM vector_collections ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(names)
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

        let mut tx = db::begin_write(&self.pool).await?;

        if incremental {
            let written: HashSet<&str> = ids.iter().map(String::as_str).collect();
            let touched = touched_data_points(&points, data_point_fqns);
            for fqn in touched {
                let existing: Vec<String> = sqlx::query_scalar(
                    "SELECT id FROM vectors WHERE collection = ? AND data_point_fqn = ?",
                )
                .bind(collection)
                .bind(fqn)
                .fetch_all(&mut *tx)
                .await?;
                for id in existing.iter().filter(|id| !written.contains(id.as_str())) {
                    sqlx::query("DELETE FROM vectors WHERE collection = ? AND id = ?")
                        .bind(collection)
                        .bind(id)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }

        for point in &points {
            sqlx::query(
                r#"
                INSERT INTO vectors (collection, id, data_point_fqn, data_point_hash,
                                     data_source_fqn, chunk_index, content, metadata_json, embedding)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(collection, id) DO UPDATE SET
                    data_point_fqn = excluded.data_point_fqn,
                    data_point_hash = excluded.data_point_hash,
                    data_source_fqn = excluded.data_source_fqn,
                    chunk_index = excluded.chunk_index,
                    content = excluded.content,
                    metadata_json = excluded.metadata_json,
                    embedding = excluded.embedding
                "#,
            )
            .bind(collection)
            .bind(&point.id)
            .bind(&point.data_point_fqn)
            .bind(&point.data_point_hash)
            .bind(&point.data_source_fqn)
            .bind(point.chunk_index as i64)
            .bind(&point.content)
            .bind(serde_json::to_string(&point.metadata)?)
            .bind(vec_to_blob(&point.vector))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(ids)
    }

    async fn list_data_point_vectors(
        &self,
        collection: &str,
        data_source_fqn: &str,
        batch_size: usize,
    ) -> Result<Vec<DataPointVector>> {
        self.dims_of(collection).await?;
        let page = batch_size.max(1) as i64;
        let mut vectors = Vec::new();
        let mut offset = 0i64;
        loop {
            let rows = sqlx::query(
                r#"
                SELECT id, data_point_fqn, data_point_hash
                FROM vectors
                WHERE collection = ? AND data_source_fqn = ?
                ORDER BY id
                LIMIT ? OFFSET ?
                "#,
            )
            .bind(collection)
            .bind(data_source_fqn)
            .bind(page)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

            let fetched = rows.len() as i64;
            vectors.extend(rows.iter().map(|row| DataPointVector {
                data_point_vector_id: row.get("id"),
                data_point_fqn: row.get("data_point_fqn"),
                data_point_hash: row.get("data_point_hash"),
            }));
            if fetched < page {
                break;
            }
            offset += fetched;
        }
        Ok(vectors)
    }

    async fn delete_data_point_vectors(
        &self,
        collection: &str,
        vectors: &[DataPointVector],
        batch_size: usize,
    ) -> Result<()> {
        self.dims_of(collection).await?;
        for batch in vectors.chunks(batch_size.max(1)) {
            let mut tx = db::begin_write(&self.pool).await?;
            for vector in batch {
                sqlx::query("DELETE FROM vectors WHERE collection = ? AND id = ?")
                    .bind(collection)
                    .bind(&vector.data_point_vector_id)
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await?;
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
        self.dims_of(collection).await?;
        let rows = sqlx::query(
            "SELECT id, content, metadata_json, embedding FROM vectors WHERE collection = ?",
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in rows {
            let metadata_json: String = row.get("metadata_json");
            let id: String = row.get("id");
            let metadata: Metadata = serde_json::from_str(&metadata_json)
                .with_context(|| format!("corrupt metadata for point '{}'", id))?;
            if !matches_filter(&metadata, filter) {
                continue;
            }
            let blob: Vec<u8> = row.get("embedding");
            let vector = blob_to_vec(&blob);
            hits.push(SearchHit {
                id,
                content: row.get("content"),
                metadata,
                score: cosine_similarity(query, &vector),
                vector,
            });
        }
        Ok(top_hits(hits, limit))
    }
}
