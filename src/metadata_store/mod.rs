//! Durable records of collections, data sources, their associations and
//! ingestion runs.
//!
//! Two interchangeable backends implement [`MetadataStore`]:
//!
//! | Provider | Store | Scope |
//! |----------|-------|-------|
//! | `sqlite` | [`SqliteMetadataStore`] | any number of collections; runs persisted |
//! | `file` | [`FileMetadataStore`] | one collection with one data source; runs in memory |
//!
//! A run's `status` is a single field overwritten on every transition.
//! Errors and metrics are appended.

mod file;
mod sqlite;

pub use file::FileMetadataStore;
pub use sqlite::SqliteMetadataStore;

use anyhow::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::config::MetadataStoreConfig;
use crate::error::Error;
use crate::models::{
    split_data_source_fqn, validate_collection_name, AssociatedDataSource, Collection,
    CreateCollection, CreateDataIngestionRun, DataIngestionRun, DataIngestionRunStatus,
    DataSource, ParserConfig, RunMetrics,
};

#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Fails with `AlreadyExists` for a taken name and `NotFound` when a
    /// requested association names an unknown data source.
    async fn create_collection(&self, request: CreateCollection) -> Result<Collection>;
    async fn get_collection_by_name(&self, name: &str) -> Result<Option<Collection>>;
    async fn get_collections(&self) -> Result<Vec<Collection>>;
    /// Removes the collection record, and its runs when `include_runs`.
    async fn delete_collection(&self, name: &str, include_runs: bool) -> Result<()>;

    async fn create_data_source(&self, data_source: DataSource) -> Result<DataSource>;
    async fn get_data_source_from_fqn(&self, fqn: &str) -> Result<Option<DataSource>>;
    async fn get_data_sources(&self) -> Result<Vec<DataSource>>;

    /// Binds a data source to a collection. Idempotent on the fqn:
    /// re-associating replaces the parser config.
    async fn associate_data_source_with_collection(
        &self,
        collection_name: &str,
        data_source_fqn: &str,
        parser_config: ParserConfig,
    ) -> Result<Collection>;

    /// Removing an association that does not exist is a no-op.
    async fn unassociate_data_source_with_collection(
        &self,
        collection_name: &str,
        data_source_fqn: &str,
    ) -> Result<Collection>;

    async fn create_data_ingestion_run(
        &self,
        request: CreateDataIngestionRun,
    ) -> Result<DataIngestionRun>;
    async fn get_data_ingestion_run(&self, name: &str) -> Result<Option<DataIngestionRun>>;
    /// Runs of a collection, optionally of one data source, oldest first.
    async fn get_data_ingestion_runs(
        &self,
        collection_name: &str,
        data_source_fqn: Option<&str>,
    ) -> Result<Vec<DataIngestionRun>>;

    async fn update_data_ingestion_run_status(
        &self,
        name: &str,
        status: DataIngestionRunStatus,
    ) -> Result<()>;
    async fn log_errors_for_data_ingestion_run(
        &self,
        name: &str,
        errors: Vec<serde_json::Value>,
    ) -> Result<()>;
    async fn log_metrics_for_data_ingestion_run(
        &self,
        name: &str,
        metrics: HashMap<String, f64>,
        step: u64,
    ) -> Result<()>;
}

/// Opens the store named by `config.provider`.
pub async fn connect(config: &MetadataStoreConfig) -> Result<Arc<dyn MetadataStore>> {
    match config.provider.as_str() {
        "sqlite" => Ok(Arc::new(SqliteMetadataStore::open(&config.path).await?)),
        "file" => Ok(Arc::new(FileMetadataStore::open(&config.path).await?)),
        other => Err(Error::config(format!(
            "unknown metadata_store provider '{}'",
            other
        ))),
    }
}

/// Validates a creation request and returns the bare collection, without
/// associations.
pub(crate) fn collection_from_request(request: &CreateCollection) -> Result<Collection> {
    validate_collection_name(&request.name)?;
    if request.embedder_config.provider.is_empty() {
        return Err(Error::bad_request("embedder_config.provider must be set"));
    }
    for association in &request.associated_data_sources {
        association.parser_config.validate()?;
    }
    Ok(Collection {
        name: request.name.clone(),
        description: request.description.clone(),
        embedder_config: request.embedder_config.clone(),
        associated_data_sources: BTreeMap::new(),
    })
}

pub(crate) fn validate_data_source(data_source: &DataSource) -> Result<()> {
    let fqn = data_source.fqn();
    split_data_source_fqn(&fqn)?;
    Ok(())
}

pub(crate) fn association(
    data_source: DataSource,
    parser_config: ParserConfig,
) -> Result<AssociatedDataSource> {
    parser_config.validate()?;
    Ok(AssociatedDataSource {
        data_source_fqn: data_source.fqn(),
        parser_config,
        data_source: Some(data_source),
    })
}

pub(crate) fn collection_not_found(name: &str) -> anyhow::Error {
    Error::not_found(format!("collection '{}'", name))
}

pub(crate) fn data_source_not_found(fqn: &str) -> anyhow::Error {
    Error::not_found(format!("data source '{}'", fqn))
}

pub(crate) fn run_not_found(name: &str) -> anyhow::Error {
    Error::not_found(format!("data ingestion run '{}'", name))
}

pub(crate) fn metrics_entry(metrics: HashMap<String, f64>, step: u64) -> RunMetrics {
    RunMetrics {
        step,
        values: metrics,
        logged_at: chrono::Utc::now(),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::models::{AssociateDataSource, DataIngestionMode, EmbedderConfig};

    pub fn create_request(name: &str, sources: &[&str]) -> CreateCollection {
        CreateCollection {
            name: name.to_string(),
            description: Some("test collection".into()),
            embedder_config: EmbedderConfig::new("hashing"),
            associated_data_sources: sources
                .iter()
                .map(|fqn| AssociateDataSource {
                    data_source_fqn: fqn.to_string(),
                    parser_config: ParserConfig::default(),
                })
                .collect(),
        }
    }

    pub fn run_request(collection: &str, fqn: &str) -> CreateDataIngestionRun {
        CreateDataIngestionRun {
            collection_name: collection.to_string(),
            data_source_fqn: fqn.to_string(),
            embedder_config: EmbedderConfig::new("hashing"),
            parser_config: ParserConfig::default(),
            data_ingestion_mode: DataIngestionMode::Full,
            raise_error_on_failure: true,
        }
    }

    fn is_kind(err: &anyhow::Error, check: fn(&Error) -> bool) -> bool {
        err.downcast_ref::<Error>().map(check).unwrap_or(false)
    }

    /// The contract shared by every backend, limited to one collection and
    /// one data source so the file backend can honor it too.
    pub async fn exercise_store(store: &dyn MetadataStore) {
        let source = DataSource::new("localdir", "/data");
        let fqn = source.fqn();

        let err = store
            .create_collection(create_request("docs", &[&fqn]))
            .await
            .unwrap_err();
        assert!(is_kind(&err, |e| matches!(e, Error::NotFound(_))));

        store.create_data_source(source.clone()).await.unwrap();
        let err = store.create_data_source(source.clone()).await.unwrap_err();
        assert!(is_kind(&err, |e| matches!(e, Error::AlreadyExists(_))));
        assert_eq!(store.get_data_source_from_fqn(&fqn).await.unwrap(), Some(source.clone()));
        assert_eq!(store.get_data_sources().await.unwrap().len(), 1);

        let err = store
            .create_collection(create_request("Bad Name", &[]))
            .await
            .unwrap_err();
        assert!(is_kind(&err, |e| matches!(e, Error::BadRequest(_))));

        let created = store
            .create_collection(create_request("docs", &[&fqn]))
            .await
            .unwrap();
        assert!(created.associated_data_sources.contains_key(&fqn));
        let err = store
            .create_collection(create_request("docs", &[]))
            .await
            .unwrap_err();
        assert!(is_kind(&err, |e| matches!(e, Error::AlreadyExists(_))));

        // Re-association replaces the parser config.
        let tuned = ParserConfig {
            chunk_size: 300,
            ..ParserConfig::default()
        };
        let updated = store
            .associate_data_source_with_collection("docs", &fqn, tuned)
            .await
            .unwrap();
        assert_eq!(updated.associated_data_sources.len(), 1);
        assert_eq!(updated.associated_data_sources[&fqn].parser_config.chunk_size, 300);
        assert_eq!(
            updated.associated_data_sources[&fqn].data_source.as_ref(),
            Some(&source)
        );

        let err = store
            .associate_data_source_with_collection("ghost", &fqn, ParserConfig::default())
            .await
            .unwrap_err();
        assert!(is_kind(&err, |e| matches!(e, Error::NotFound(_))));

        let run = store
            .create_data_ingestion_run(run_request("docs", &fqn))
            .await
            .unwrap();
        assert_eq!(run.status, DataIngestionRunStatus::Initialized);
        store
            .update_data_ingestion_run_status(&run.name, DataIngestionRunStatus::DataIngestionStarted)
            .await
            .unwrap();
        store
            .log_errors_for_data_ingestion_run(
                &run.name,
                vec![serde_json::json!({"failed_data_point_fqns": ["x"], "error": "boom"})],
            )
            .await
            .unwrap();
        store
            .log_metrics_for_data_ingestion_run(
                &run.name,
                HashMap::from([("chunks_upserted".to_string(), 4.0)]),
                1,
            )
            .await
            .unwrap();
        let fetched = store.get_data_ingestion_run(&run.name).await.unwrap().unwrap();
        assert_eq!(fetched.status, DataIngestionRunStatus::DataIngestionStarted);
        assert_eq!(fetched.errors.len(), 1);
        assert_eq!(fetched.metrics[0].values["chunks_upserted"], 4.0);

        let second = store
            .create_data_ingestion_run(run_request("docs", &fqn))
            .await
            .unwrap();
        let runs = store.get_data_ingestion_runs("docs", None).await.unwrap();
        let names: Vec<_> = runs.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec![run.name.as_str(), second.name.as_str()]);
        assert!(store
            .get_data_ingestion_runs("docs", Some("web::https://x"))
            .await
            .unwrap()
            .is_empty());

        let err = store
            .update_data_ingestion_run_status("missing", DataIngestionRunStatus::Completed)
            .await
            .unwrap_err();
        assert!(is_kind(&err, |e| matches!(e, Error::NotFound(_))));

        let after = store
            .unassociate_data_source_with_collection("docs", &fqn)
            .await
            .unwrap();
        assert!(after.associated_data_sources.is_empty());
        store
            .unassociate_data_source_with_collection("docs", &fqn)
            .await
            .unwrap();

        store.delete_collection("docs", true).await.unwrap();
        assert!(store.get_collection_by_name("docs").await.unwrap().is_none());
        assert!(store.get_data_ingestion_run(&run.name).await.unwrap().is_none());
        let err = store.delete_collection("docs", true).await.unwrap_err();
        assert!(is_kind(&err, |e| matches!(e, Error::NotFound(_))));
    }
}
