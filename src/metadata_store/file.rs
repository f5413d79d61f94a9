use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use super::{
    association, collection_from_request, collection_not_found, data_source_not_found,
    metrics_entry, run_not_found, validate_data_source, MetadataStore,
};
use crate::error::Error;
use crate::models::{
    Collection, CreateCollection, CreateDataIngestionRun, DataIngestionRun,
    DataIngestionRunStatus, DataSource, EmbedderConfig, ParserConfig,
};

/// On-disk shape of the file store: one collection bound to at most one
/// data source.
///
/// ```toml
/// collection_name = "docs"
///
/// [embedder_config]
/// provider = "hashing"
///
/// [data_source]
/// type = "localdir"
/// uri = "./sample-data"
///
/// [parser_config]
/// chunk_size = 800
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct CollectionDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    collection_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    embedder_config: Option<EmbedderConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data_source: Option<DataSource>,
    /// Present iff the data source is associated with the collection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parser_config: Option<ParserConfig>,
}

impl CollectionDocument {
    fn collection(&self) -> Option<Collection> {
        let name = self.collection_name.clone()?;
        let embedder_config = self.embedder_config.clone()?;
        let mut associated_data_sources = BTreeMap::new();
        if let (Some(source), Some(parser_config)) = (&self.data_source, &self.parser_config) {
            associated_data_sources.insert(
                source.fqn(),
                crate::models::AssociatedDataSource {
                    data_source_fqn: source.fqn(),
                    parser_config: parser_config.clone(),
                    data_source: Some(source.clone()),
                },
            );
        }
        Some(Collection {
            name,
            description: self.description.clone(),
            embedder_config,
            associated_data_sources,
        })
    }

    fn require_collection(&self, name: &str) -> Result<()> {
        match &self.collection_name {
            Some(existing) if existing == name => Ok(()),
            _ => Err(collection_not_found(name)),
        }
    }

    fn require_data_source(&self, fqn: &str) -> Result<DataSource> {
        self.data_source
            .clone()
            .filter(|ds| ds.fqn() == fqn)
            .ok_or_else(|| data_source_not_found(fqn))
    }
}

/// Single-collection store backed by one TOML document. Ingestion runs
/// live in memory for the lifetime of the process.
pub struct FileMetadataStore {
    path: PathBuf,
    document: Mutex<CollectionDocument>,
    runs: Mutex<Vec<DataIngestionRun>>,
}

impl FileMetadataStore {
    pub async fn open(path: &Path) -> Result<Self> {
        let document = if path.exists() {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read metadata file: {}", path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse metadata file: {}", path.display()))?
        } else {
            CollectionDocument::default()
        };
        Ok(Self {
            path: path.to_path_buf(),
            document: Mutex::new(document),
            runs: Mutex::new(Vec::new()),
        })
    }

    async fn save(&self, document: &CollectionDocument) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let content = toml::to_string(document).context("failed to serialize metadata file")?;
        tokio::fs::write(&self.path, content)
            .await
            .with_context(|| format!("Failed to write metadata file: {}", self.path.display()))?;
        Ok(())
    }

    async fn update_run<F>(&self, name: &str, update: F) -> Result<()>
    where
        F: FnOnce(&mut DataIngestionRun) + Send,
    {
        let mut runs = self.runs.lock().await;
        let run = runs
            .iter_mut()
            .find(|r| r.name == name)
            .ok_or_else(|| run_not_found(name))?;
        update(run);
        Ok(())
    }
}

fn single_collection_limit(existing: &str) -> anyhow::Error {
    Error::bad_request(format!(
        "the file metadata store holds a single collection ('{}')",
        existing
    ))
}

#[async_trait]
impl MetadataStore for FileMetadataStore {
    async fn create_collection(&self, request: CreateCollection) -> Result<Collection> {
        let collection = collection_from_request(&request)?;
        let mut document = self.document.lock().await;
        if let Some(existing) = &document.collection_name {
            if *existing == collection.name {
                return Err(
                    Error::AlreadyExists(format!("collection '{}'", collection.name)).into(),
                );
            }
            return Err(single_collection_limit(existing));
        }
        if request.associated_data_sources.len() > 1 {
            return Err(Error::bad_request(
                "the file metadata store binds at most one data source",
            ));
        }

        let mut next = document.clone();
        next.collection_name = Some(collection.name.clone());
        next.description = collection.description.clone();
        next.embedder_config = Some(collection.embedder_config.clone());
        next.parser_config = None;
        if let Some(requested) = request.associated_data_sources.into_iter().next() {
            let data_source = document.require_data_source(&requested.data_source_fqn)?;
            let bound = association(data_source, requested.parser_config)?;
            next.parser_config = Some(bound.parser_config);
        }

        self.save(&next).await?;
        *document = next;
        document
            .collection()
            .ok_or_else(|| anyhow::anyhow!("collection document incomplete after create"))
    }

    async fn get_collection_by_name(&self, name: &str) -> Result<Option<Collection>> {
        Ok(self
            .document
            .lock()
            .await
            .collection()
            .filter(|c| c.name == name))
    }

    async fn get_collections(&self) -> Result<Vec<Collection>> {
        Ok(self.document.lock().await.collection().into_iter().collect())
    }

    async fn delete_collection(&self, name: &str, include_runs: bool) -> Result<()> {
        let mut document = self.document.lock().await;
        document.require_collection(name)?;
        let next = CollectionDocument {
            data_source: document.data_source.clone(),
            ..CollectionDocument::default()
        };
        self.save(&next).await?;
        *document = next;
        if include_runs {
            self.runs.lock().await.retain(|r| r.collection_name != name);
        }
        Ok(())
    }

    async fn create_data_source(&self, data_source: DataSource) -> Result<DataSource> {
        validate_data_source(&data_source)?;
        let mut document = self.document.lock().await;
        if let Some(existing) = &document.data_source {
            if existing.fqn() == data_source.fqn() {
                return Err(
                    Error::AlreadyExists(format!("data source '{}'", data_source.fqn())).into(),
                );
            }
            return Err(Error::bad_request(format!(
                "the file metadata store holds a single data source ('{}')",
                existing.fqn()
            )));
        }
        let mut next = document.clone();
        next.data_source = Some(data_source.clone());
        self.save(&next).await?;
        *document = next;
        Ok(data_source)
    }

    async fn get_data_source_from_fqn(&self, fqn: &str) -> Result<Option<DataSource>> {
        Ok(self.document.lock().await.require_data_source(fqn).ok())
    }

    async fn get_data_sources(&self) -> Result<Vec<DataSource>> {
        Ok(self
            .document
            .lock()
            .await
            .data_source
            .clone()
            .into_iter()
            .collect())
    }

    async fn associate_data_source_with_collection(
        &self,
        collection_name: &str,
        data_source_fqn: &str,
        parser_config: ParserConfig,
    ) -> Result<Collection> {
        let mut document = self.document.lock().await;
        document.require_collection(collection_name)?;
        let data_source = document.require_data_source(data_source_fqn)?;
        let bound = association(data_source, parser_config)?;
        let mut next = document.clone();
        next.parser_config = Some(bound.parser_config);
        self.save(&next).await?;
        *document = next;
        document
            .collection()
            .ok_or_else(|| collection_not_found(collection_name))
    }

    async fn unassociate_data_source_with_collection(
        &self,
        collection_name: &str,
        data_source_fqn: &str,
    ) -> Result<Collection> {
        let mut document = self.document.lock().await;
        document.require_collection(collection_name)?;
        if document.require_data_source(data_source_fqn).is_ok() && document.parser_config.is_some()
        {
            let mut next = document.clone();
            next.parser_config = None;
            self.save(&next).await?;
            *document = next;
        }
        document
            .collection()
            .ok_or_else(|| collection_not_found(collection_name))
    }

    async fn create_data_ingestion_run(
        &self,
        request: CreateDataIngestionRun,
    ) -> Result<DataIngestionRun> {
        let run = DataIngestionRun::from_request(request);
        self.runs.lock().await.push(run.clone());
        Ok(run)
    }

    async fn get_data_ingestion_run(&self, name: &str) -> Result<Option<DataIngestionRun>> {
        Ok(self
            .runs
            .lock()
            .await
            .iter()
            .find(|r| r.name == name)
            .cloned())
    }

    async fn get_data_ingestion_runs(
        &self,
        collection_name: &str,
        data_source_fqn: Option<&str>,
    ) -> Result<Vec<DataIngestionRun>> {
        Ok(self
            .runs
            .lock()
            .await
            .iter()
            .filter(|r| r.collection_name == collection_name)
            .filter(|r| data_source_fqn.map_or(true, |fqn| r.data_source_fqn == fqn))
            .cloned()
            .collect())
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
