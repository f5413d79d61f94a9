use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::collections::HashMap;
use std::path::Path;

use super::{
    association, collection_from_request, collection_not_found, data_source_not_found,
    metrics_entry, run_not_found, validate_data_source, MetadataStore,
};
use crate::db;
use crate::error::Error;
use crate::migrate;
use crate::models::{
    Collection, CreateCollection, CreateDataIngestionRun, DataIngestionRun,
    DataIngestionRunStatus, DataSource, ParserConfig,
};

/// Document-style store: `collections`, `data_sources` and `runs` tables,
/// each row a JSON document keyed by name or fqn.
pub struct SqliteMetadataStore {
    pool: SqlitePool,
}

fn decode<T: DeserializeOwned>(doc: &str) -> Result<T> {
    serde_json::from_str(doc).context("corrupt metadata document")
}

fn encode<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

impl SqliteMetadataStore {
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = db::connect(path).await?;
        migrate::run_metadata_migrations(&pool).await?;
        Ok(Self { pool })
    }

    async fn load_collection(
        tx: &mut Transaction<'_, Sqlite>,
        name: &str,
    ) -> Result<Collection> {
        let doc: Option<String> = sqlx::query_scalar("SELECT doc FROM collections WHERE name = ?")
            .bind(name)
            .fetch_optional(&mut **tx)
            .await?;
        decode(&doc.ok_or_else(|| collection_not_found(name))?)
    }

    async fn load_data_source(
        tx: &mut Transaction<'_, Sqlite>,
        fqn: &str,
    ) -> Result<DataSource> {
        let doc: Option<String> = sqlx::query_scalar("SELECT doc FROM data_sources WHERE fqn = ?")
            .bind(fqn)
            .fetch_optional(&mut **tx)
            .await?;
        decode(&doc.ok_or_else(|| data_source_not_found(fqn))?)
    }

    async fn save_collection(
        tx: &mut Transaction<'_, Sqlite>,
        collection: &Collection,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO collections (name, doc) VALUES (?, ?)
            ON CONFLICT(name) DO UPDATE SET doc = excluded.doc
            "#,
        )
        .bind(&collection.name)
        .bind(encode(collection)?)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Read-modify-write of one run document inside a transaction.
    async fn update_run<F>(&self, name: &str, update: F) -> Result<()>
    where
        F: FnOnce(&mut DataIngestionRun) + Send,
    {
        let mut tx = db::begin_write(&self.pool).await?;
        let doc: Option<String> = sqlx::query_scalar("SELECT doc FROM runs WHERE name = ?")
            .bind(name)
            .fetch_optional(&mut *tx)
            .await?;
        let mut run: DataIngestionRun = decode(&doc.ok_or_else(|| run_not_found(name))?)?;
        update(&mut run);
        sqlx::query("UPDATE runs SET doc = ? WHERE name = ?")
            .bind(encode(&run)?)
            .bind(name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn create_collection(&self, request: CreateCollection) -> Result<Collection> {
        let mut collection = collection_from_request(&request)?;
        let mut tx = db::begin_write(&self.pool).await?;

        let exists: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM collections WHERE name = ?")
            .bind(&collection.name)
            .fetch_one(&mut *tx)
            .await?;
        if exists {
            return Err(Error::AlreadyExists(format!("collection '{}'", collection.name)).into());
        }

        for requested in request.associated_data_sources {
            let data_source = Self::load_data_source(&mut tx, &requested.data_source_fqn).await?;
            let bound = association(data_source, requested.parser_config)?;
            collection
                .associated_data_sources
                .insert(bound.data_source_fqn.clone(), bound);
        }

        Self::save_collection(&mut tx, &collection).await?;
        tx.commit().await?;
        Ok(collection)
    }

    async fn get_collection_by_name(&self, name: &str) -> Result<Option<Collection>> {
        let doc: Option<String> = sqlx::query_scalar("SELECT doc FROM collections WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        doc.as_deref().map(decode).transpose()
    }

    async fn get_collections(&self) -> Result<Vec<Collection>> {
        let docs: Vec<String> = sqlx::query_scalar("SELECT doc FROM collections ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        docs.iter().map(|d| decode(d)).collect()
    }

    async fn delete_collection(&self, name: &str, include_runs: bool) -> Result<()> {
        let mut tx = db::begin_write(&self.pool).await?;
        let deleted = sqlx::query("DELETE FROM collections WHERE name = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if deleted == 0 {
            return Err(collection_not_found(name));
        }
        if include_runs {
            sqlx::query("DELETE FROM runs WHERE collection_name = ?")
                .bind(name)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn create_data_source(&self, data_source: DataSource) -> Result<DataSource> {
        validate_data_source(&data_source)?;
        let fqn = data_source.fqn();
        let inserted = sqlx::query("INSERT OR IGNORE INTO data_sources (fqn, doc) VALUES (?, ?)")
            .bind(&fqn)
            .bind(encode(&data_source)?)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if inserted == 0 {
            return Err(Error::AlreadyExists(format!("data source '{}'", fqn)).into());
        }
        Ok(data_source)
    }

    async fn get_data_source_from_fqn(&self, fqn: &str) -> Result<Option<DataSource>> {
        let doc: Option<String> = sqlx::query_scalar("SELECT doc FROM data_sources WHERE fqn = ?")
            .bind(fqn)
            .fetch_optional(&self.pool)
            .await?;
        doc.as_deref().map(decode).transpose()
    }

    async fn get_data_sources(&self) -> Result<Vec<DataSource>> {
        let docs: Vec<String> = sqlx::query_scalar("SELECT doc FROM data_sources ORDER BY fqn")
            .fetch_all(&self.pool)
            .await?;
        docs.iter().map(|d| decode(d)).collect()
    }

    async fn associate_data_source_with_collection(
        &self,
        collection_name: &str,
        data_source_fqn: &str,
        parser_config: ParserConfig,
    ) -> Result<Collection> {
        let mut tx = db::begin_write(&self.pool).await?;
        let mut collection = Self::load_collection(&mut tx, collection_name).await?;
        let data_source = Self::load_data_source(&mut tx, data_source_fqn).await?;
        let bound = association(data_source, parser_config)?;
        collection
            .associated_data_sources
            .insert(bound.data_source_fqn.clone(), bound);
        Self::save_collection(&mut tx, &collection).await?;
        tx.commit().await?;
        Ok(collection)
    }

    async fn unassociate_data_source_with_collection(
        &self,
        collection_name: &str,
        data_source_fqn: &str,
    ) -> Result<Collection> {
        let mut tx = db::begin_write(&self.pool).await?;
        let mut collection = Self::load_collection(&mut tx, collection_name).await?;
        if collection
            .associated_data_sources
            .remove(data_source_fqn)
            .is_some()
        {
            Self::save_collection(&mut tx, &collection).await?;
        }
        tx.commit().await?;
        Ok(collection)
    }

    async fn create_data_ingestion_run(
        &self,
        request: CreateDataIngestionRun,
    ) -> Result<DataIngestionRun> {
        let run = DataIngestionRun::from_request(request);
        sqlx::query(
            "INSERT INTO runs (name, collection_name, data_source_fqn, created_at, doc) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&run.name)
        .bind(&run.collection_name)
        .bind(&run.data_source_fqn)
        .bind(run.created_at.to_rfc3339())
        .bind(encode(&run)?)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to record data ingestion run {}", run.name))?;
        Ok(run)
    }

    async fn get_data_ingestion_run(&self, name: &str) -> Result<Option<DataIngestionRun>> {
        let doc: Option<String> = sqlx::query_scalar("SELECT doc FROM runs WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        doc.as_deref().map(decode).transpose()
    }

    async fn get_data_ingestion_runs(
        &self,
        collection_name: &str,
        data_source_fqn: Option<&str>,
    ) -> Result<Vec<DataIngestionRun>> {
        let docs: Vec<String> = match data_source_fqn {
            Some(fqn) => {
                sqlx::query_scalar(
                    "SELECT doc FROM runs WHERE collection_name = ? AND data_source_fqn = ? ORDER BY rowid",
                )
                .bind(collection_name)
                .bind(fqn)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_scalar("SELECT doc FROM runs WHERE collection_name = ? ORDER BY rowid")
                    .bind(collection_name)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        docs.iter().map(|d| decode(d)).collect()
    }

    async fn update_data_ingestion_run_status(
        &self,
        name: &str,
        status: DataIngestionRunStatus,
    ) -> Result<()> {
        self.update_run(name, |run| run.status = status).await
    }

    async fn log_errors_for_data_ingestion_run(
        &self,
        name: &str,
        errors: Vec<serde_json::Value>,
    ) -> Result<()> {
        self.update_run(name, |run| run.errors.extend(errors)).await
    }

    async fn log_metrics_for_data_ingestion_run(
        &self,
        name: &str,
        metrics: HashMap<String, f64>,
        step: u64,
    ) -> Result<()> {
        let entry = metrics_entry(metrics, step);
        self.update_run(name, |run| run.metrics.push(entry)).await
    }
}
