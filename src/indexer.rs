//! Ingestion orchestrator: syncs one data source into one collection.
//!
//! Every run walks this state machine, persisting each transition through
//! the metadata store before doing the work of the next step:
//!
//! ```text
//! INITIALIZED
//!   → FETCHING_EXISTING_VECTORS   → FETCHING_EXISTING_VECTORS_FAILED
//!   → DATA_INGESTION_STARTED      → DATA_INGESTION_FAILED
//!   → DATA_INGESTION_COMPLETED
//!   → DATA_CLEANUP_STARTED (FULL) → DATA_CLEANUP_FAILED
//!   → COMPLETED
//! ```
//!
//! Batches are processed strictly in order. A failing batch either ends
//! the run at once (`raise_error_on_failure`) or is recorded and skipped;
//! in the latter case the run still ends `DATA_INGESTION_FAILED` after
//! every batch has been attempted.
//!
//! At most one run may target a `(collection, data source)` pair at a
//! time. A second one fails with [`Error::RunInProgress`] before any run
//! record is written.

use anyhow::{anyhow, Result};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::embedding::{Embedder, EmbedderRegistry};
use crate::error::Error;
use crate::loader::{Fingerprint, LoaderRegistry, Snapshot};
use crate::metadata_store::{self, MetadataStore};
use crate::models::{
    Collection, CreateCollection, CreateDataIngestionRun, DataIngestionConfig, DataIngestionMode,
    DataIngestionRunStatus, DataPointVector, DataSource, IngestDataToCollection,
    LoadedDataPoint, ParsedChunk, META_CHUNK_INDEX, META_DATA_POINT_FQN, META_DATA_POINT_HASH,
    META_DATA_SOURCE_FQN,
};
use crate::parser::ParserRegistry;
use crate::vector_db::{self, VectorDb};

/// The pluggable pieces of the pipeline, looked up by string key.
pub struct Components {
    pub loaders: LoaderRegistry,
    pub parsers: ParserRegistry,
    pub embedders: EmbedderRegistry,
}

impl Components {
    pub fn builtin(fingerprint: Fingerprint) -> Self {
        Self {
            loaders: LoaderRegistry::with_builtins(fingerprint),
            parsers: ParserRegistry::with_builtins(),
            embedders: EmbedderRegistry::with_builtins(),
        }
    }
}

/// `data_point_fqn -> data_point_hash`. Chunks of one data point share a
/// hash, so the first vector seen for an fqn decides.
pub fn get_data_point_fqn_to_hash_map(vectors: &[DataPointVector]) -> Snapshot {
    let mut map = Snapshot::new();
    for vector in vectors {
        map.entry(vector.data_point_fqn.clone())
            .or_insert_with(|| vector.data_point_hash.clone());
    }
    map
}

// ═══════════════════════════════════════════════════════════════════════
// Per-target run locks
// ═══════════════════════════════════════════════════════════════════════

type Target = (String, String);

#[derive(Default)]
struct RunLocks {
    held: Arc<Mutex<HashSet<Target>>>,
}

/// Releases its targets when dropped.
struct TargetGuard {
    held: Arc<Mutex<HashSet<Target>>>,
    targets: Vec<Target>,
}

impl RunLocks {
    /// Claims every target or none of them.
    fn acquire(&self, targets: Vec<Target>) -> Result<TargetGuard> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| anyhow!("ingestion run lock poisoned"))?;
        if let Some((collection, data_source_fqn)) = targets.iter().find(|t| held.contains(*t)) {
            return Err(Error::RunInProgress {
                collection: collection.clone(),
                data_source_fqn: data_source_fqn.clone(),
            }
            .into());
        }
        held.extend(targets.iter().cloned());
        Ok(TargetGuard {
            held: Arc::clone(&self.held),
            targets,
        })
    }
}

impl Drop for TargetGuard {
    fn drop(&mut self) {
        if let Ok(mut held) = self.held.lock() {
            for target in &self.targets {
                held.remove(target);
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Indexer
// ═══════════════════════════════════════════════════════════════════════

/// What one batch contributed.
struct BatchOutcome {
    point_ids: Vec<String>,
    chunks_upserted: usize,
}

pub struct Indexer {
    metadata_store: Arc<dyn MetadataStore>,
    vector_db: Arc<dyn VectorDb>,
    components: Components,
    staging_root: Option<PathBuf>,
    vector_batch_size: usize,
    locks: RunLocks,
}

impl Indexer {
    pub fn new(
        metadata_store: Arc<dyn MetadataStore>,
        vector_db: Arc<dyn VectorDb>,
        components: Components,
    ) -> Self {
        Self {
            metadata_store,
            vector_db,
            components,
            staging_root: None,
            vector_batch_size: 1000,
            locks: RunLocks::default(),
        }
    }

    /// Opens both stores named by `config` with the built-in components.
    pub async fn open(config: &Config) -> Result<Self> {
        let metadata_store = metadata_store::connect(&config.metadata_store).await?;
        let vector_db = vector_db::connect(&config.vector_db).await?;
        Ok(Self::new(
            metadata_store,
            vector_db,
            Components::builtin(config.ingestion.fingerprint),
        )
        .with_staging_root(config.ingestion.staging_dir.clone())
        .with_vector_batch_size(config.vector_db.batch_size))
    }

    /// Parent directory for per-run scratch dirs (default: the OS temp dir).
    pub fn with_staging_root(mut self, root: Option<PathBuf>) -> Self {
        self.staging_root = root;
        self
    }

    /// Page size for listing and deleting vectors.
    pub fn with_vector_batch_size(mut self, batch_size: usize) -> Self {
        self.vector_batch_size = batch_size.max(1);
        self
    }

    pub fn metadata_store(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata_store
    }

    pub fn vector_db(&self) -> &Arc<dyn VectorDb> {
        &self.vector_db
    }

    pub fn components(&self) -> &Components {
        &self.components
    }

    // ── Collections ──────────────────────────────────────────────────────

    /// Records the collection and creates its vector collection.
    pub async fn create_collection(&self, request: CreateCollection) -> Result<Collection> {
        let embedder = self.components.embedders.resolve(&request.embedder_config)?;
        let collection = self.metadata_store.create_collection(request).await?;
        self.vector_db
            .create_collection(&collection.name, embedder.as_ref())
            .await?;
        info!(collection = %collection.name, model = embedder.model_name(), "created collection");
        Ok(collection)
    }

    /// Drops the collection's vectors, record and runs.
    pub async fn delete_collection(&self, name: &str) -> Result<()> {
        if self.metadata_store.get_collection_by_name(name).await?.is_none() {
            return Err(Error::not_found(format!("collection '{}'", name)));
        }
        self.vector_db.delete_collection(name).await?;
        self.metadata_store.delete_collection(name, true).await?;
        info!(collection = %name, "deleted collection");
        Ok(())
    }

    // ── Data sources ─────────────────────────────────────────────────────

    /// Records a data source whose type has a registered loader.
    pub async fn create_data_source(&self, data_source: DataSource) -> Result<DataSource> {
        if !self.components.loaders.contains(&data_source.source_type) {
            return Err(Error::bad_request(format!(
                "no data loader registered for type '{}'",
                data_source.source_type
            )));
        }
        let created = self.metadata_store.create_data_source(data_source).await?;
        info!(data_source = %created.fqn(), "created data source");
        Ok(created)
    }

    // ── Ingestion ────────────────────────────────────────────────────────

    /// Starts one run per targeted association of the collection and
    /// executes them in order. Returns the run names.
    pub async fn ingest_data(&self, request: IngestDataToCollection) -> Result<Vec<String>> {
        if request.batch_size == 0 {
            return Err(Error::bad_request("batch_size must be >= 1"));
        }
        let collection = self
            .metadata_store
            .get_collection_by_name(&request.collection_name)
            .await?
            .ok_or_else(|| {
                Error::not_found(format!(
                    "collection with name {} does not exist",
                    request.collection_name
                ))
            })?;

        if collection.associated_data_sources.is_empty() {
            return Err(Error::bad_request(format!(
                "collection {} does not have any associated data sources",
                collection.name
            )));
        }

        let targets: Vec<_> = match &request.data_source_fqn {
            Some(fqn) => vec![collection.associated_data_sources.get(fqn).ok_or_else(|| {
                Error::not_found(format!(
                    "data source {} is not associated with collection {}",
                    fqn, collection.name
                ))
            })?],
            None => collection.associated_data_sources.values().collect(),
        };

        // Configuration errors surface before anything is recorded.
        self.components.embedders.resolve(&collection.embedder_config)?;

        let _guard = self.locks.acquire(
            targets
                .iter()
                .map(|a| (collection.name.clone(), a.data_source_fqn.clone()))
                .collect(),
        )?;

        let mut run_names = Vec::with_capacity(targets.len());
        for associated in targets {
            let data_source = match &associated.data_source {
                Some(ds) => ds.clone(),
                None => self
                    .metadata_store
                    .get_data_source_from_fqn(&associated.data_source_fqn)
                    .await?
                    .ok_or_else(|| {
                        Error::not_found(format!("data source '{}'", associated.data_source_fqn))
                    })?,
            };
            self.components.loaders.get(&data_source.source_type)?;

            let run = self
                .metadata_store
                .create_data_ingestion_run(CreateDataIngestionRun {
                    collection_name: collection.name.clone(),
                    data_source_fqn: associated.data_source_fqn.clone(),
                    embedder_config: collection.embedder_config.clone(),
                    parser_config: associated.parser_config.clone(),
                    data_ingestion_mode: request.data_ingestion_mode,
                    raise_error_on_failure: request.raise_error_on_failure,
                })
                .await?;
            info!(run = %run.name, data_source = %run.data_source_fqn, "starting data ingestion run");
            run_names.push(run.name.clone());

            self.run_sync(DataIngestionConfig {
                collection_name: run.collection_name,
                data_ingestion_run_name: run.name,
                data_source,
                embedder_config: run.embedder_config,
                parser_config: run.parser_config,
                data_ingestion_mode: run.data_ingestion_mode,
                raise_error_on_failure: run.raise_error_on_failure,
                batch_size: request.batch_size,
            })
            .await?;
        }
        Ok(run_names)
    }

    /// Executes one already-recorded run, holding its target lock.
    pub async fn sync_data_source_to_collection(&self, config: DataIngestionConfig) -> Result<()> {
        let _guard = self.locks.acquire(vec![(
            config.collection_name.clone(),
            config.data_source.fqn(),
        )])?;
        self.run_sync(config).await
    }

    #[tracing::instrument(skip_all, fields(collection = %config.collection_name, run = %config.data_ingestion_run_name))]
    async fn run_sync(&self, config: DataIngestionConfig) -> Result<()> {
        let result = self.run_steps(&config).await;
        if let Err(e) = &result {
            self.mark_unfinished_as_error(&config.data_ingestion_run_name, e)
                .await;
        }
        result
    }

    /// A failure outside the step handlers (a status write, say) would
    /// leave the run in a non-terminal status; record `ERROR` instead.
    async fn mark_unfinished_as_error(&self, run: &str, cause: &anyhow::Error) {
        match self.metadata_store.get_data_ingestion_run(run).await {
            Ok(Some(record)) if !record.status.is_terminal() => {
                error!(status = %record.status, error = %format!("{:#}", cause), "data ingestion run aborted");
                if let Err(e) = self
                    .metadata_store
                    .update_data_ingestion_run_status(run, DataIngestionRunStatus::Error)
                    .await
                {
                    error!(error = %e, "failed to record run status");
                }
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "failed to read run status"),
        }
    }

    async fn run_steps(&self, config: &DataIngestionConfig) -> Result<()> {
        let run = config.data_ingestion_run_name.as_str();
        let data_source_fqn = config.data_source.fqn();

        self.set_status(run, DataIngestionRunStatus::FetchingExistingVectors)
            .await?;
        let existing = match self
            .vector_db
            .list_data_point_vectors(
                &config.collection_name,
                &data_source_fqn,
                self.vector_batch_size,
            )
            .await
        {
            Ok(existing) => existing,
            Err(e) => {
                return Err(self
                    .fail(run, DataIngestionRunStatus::FetchingExistingVectorsFailed, e)
                    .await)
            }
        };
        let previous_snapshot = get_data_point_fqn_to_hash_map(&existing);
        info!(
            existing_vectors = existing.len(),
            existing_data_points = previous_snapshot.len(),
            "fetched existing vectors"
        );

        self.set_status(run, DataIngestionRunStatus::DataIngestionStarted)
            .await?;
        let written = match self.ingest_batches(config, &previous_snapshot).await {
            Ok(written) => written,
            Err(e) => {
                return Err(self
                    .fail(run, DataIngestionRunStatus::DataIngestionFailed, e)
                    .await)
            }
        };
        self.set_status(run, DataIngestionRunStatus::DataIngestionCompleted)
            .await?;

        if config.data_ingestion_mode == DataIngestionMode::Full {
            self.set_status(run, DataIngestionRunStatus::DataCleanupStarted)
                .await?;
            let stale: Vec<DataPointVector> = existing
                .into_iter()
                .filter(|v| !written.contains(&v.data_point_vector_id))
                .collect();
            info!(stale_vectors = stale.len(), "deleting vectors of removed data points");
            if let Err(e) = self
                .vector_db
                .delete_data_point_vectors(&config.collection_name, &stale, self.vector_batch_size)
                .await
            {
                return Err(self
                    .fail(run, DataIngestionRunStatus::DataCleanupFailed, e)
                    .await);
            }
        }

        self.set_status(run, DataIngestionRunStatus::Completed).await?;
        info!("data ingestion run completed");
        Ok(())
    }

    /// Loads and ingests every batch; returns the ids of all points written.
    async fn ingest_batches(
        &self,
        config: &DataIngestionConfig,
        previous_snapshot: &Snapshot,
    ) -> Result<HashSet<String>> {
        let run = config.data_ingestion_run_name.as_str();
        let embedder = self.components.embedders.resolve(&config.embedder_config)?;
        let loader = self.components.loaders.get(&config.data_source.source_type)?;

        let staging = match &self.staging_root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                tempfile::Builder::new().prefix("ragsync-").tempdir_in(root)?
            }
            None => tempfile::Builder::new().prefix("ragsync-").tempdir()?,
        };

        info!(data_source = %config.data_source.fqn(), mode = %config.data_ingestion_mode, "loading data from data source");
        let mut batches = loader
            .load_filtered_data(
                &config.data_source,
                staging.path(),
                previous_snapshot,
                config.batch_size,
                config.data_ingestion_mode,
            )
            .await?;

        let mut written = HashSet::new();
        let mut failed_data_point_fqns: Vec<String> = Vec::new();
        let mut documents_ingested = 0usize;
        let mut step = 0u64;

        while let Some(batch) = batches.next_batch().await {
            // Discovery errors end the run whatever the failure policy.
            let batch = batch?;
            if batch.is_empty() {
                continue;
            }
            step += 1;
            let fqns: Vec<String> = batch
                .iter()
                .map(|p| p.data_point.data_point_fqn())
                .collect();

            match self.ingest_batch(config, embedder.as_ref(), &batch).await {
                Ok(outcome) => {
                    documents_ingested += batch.len();
                    written.extend(outcome.point_ids);
                    self.metadata_store
                        .log_metrics_for_data_ingestion_run(
                            run,
                            HashMap::from([
                                ("documents_ingested".to_string(), documents_ingested as f64),
                                ("chunks_upserted".to_string(), outcome.chunks_upserted as f64),
                                (
                                    "failed_data_points".to_string(),
                                    failed_data_point_fqns.len() as f64,
                                ),
                            ]),
                            step,
                        )
                        .await?;
                }
                Err(e) => {
                    error!(batch = step, data_points = fqns.len(), error = %e, "failed to ingest batch");
                    self.metadata_store
                        .log_errors_for_data_ingestion_run(
                            run,
                            vec![json!({
                                "failed_data_point_fqns": fqns,
                                "error": format!("{:#}", e),
                            })],
                        )
                        .await?;
                    if config.raise_error_on_failure {
                        return Err(e);
                    }
                    failed_data_point_fqns.extend(fqns);
                }
            }
        }

        if !failed_data_point_fqns.is_empty() {
            error!(
                count = failed_data_point_fqns.len(),
                fqns = ?failed_data_point_fqns,
                "failed to ingest data points"
            );
            return Err(Error::IngestionFailed {
                count: failed_data_point_fqns.len(),
            }
            .into());
        }

        info!(documents_ingested, "ingested all batches");
        Ok(written)
    }

    /// Parses every point of `batch`, then upserts all chunks in one call.
    async fn ingest_batch(
        &self,
        config: &DataIngestionConfig,
        embedder: &dyn Embedder,
        batch: &[LoadedDataPoint],
    ) -> Result<BatchOutcome> {
        let mut chunks: Vec<ParsedChunk> = Vec::new();
        let mut parsed_fqns: Vec<String> = Vec::new();

        for loaded in batch {
            let point = &loaded.data_point;
            let fqn = point.data_point_fqn();
            let parser = match self
                .components
                .parsers
                .resolve(&loaded.file_extension, &config.parser_config)?
            {
                Some(parser) => parser,
                None => {
                    warn!(
                        data_point = %fqn,
                        extension = %loaded.file_extension,
                        "no parser found for file extension; skipping"
                    );
                    continue;
                }
            };

            let parsed = parser
                .get_chunks(&loaded.local_filepath, &point.metadata)
                .await?;
            info!(data_point = %fqn, parser = parser.name(), chunks = parsed.len(), "parsed");
            parsed_fqns.push(fqn.clone());

            for (index, mut chunk) in parsed.into_iter().enumerate() {
                for (key, value) in &point.metadata {
                    chunk.metadata.insert(key.clone(), value.clone());
                }
                chunk
                    .metadata
                    .insert(META_DATA_POINT_FQN.to_string(), fqn.clone().into());
                chunk.metadata.insert(
                    META_DATA_POINT_HASH.to_string(),
                    point.data_point_hash.clone().into(),
                );
                chunk.metadata.insert(
                    META_DATA_SOURCE_FQN.to_string(),
                    point.data_source_fqn.clone().into(),
                );
                chunk
                    .metadata
                    .insert(META_CHUNK_INDEX.to_string(), (index as u64).into());
                chunks.push(chunk);
            }
        }

        if chunks.is_empty() {
            warn!("no chunks to index in batch");
        }
        // Documents that parsed to nothing still replace their stored points.
        let point_ids = if parsed_fqns.is_empty() {
            Vec::new()
        } else {
            self.vector_db
                .upsert_documents(
                    &config.collection_name,
                    &chunks,
                    &parsed_fqns,
                    embedder,
                    config.data_ingestion_mode == DataIngestionMode::Incremental,
                )
                .await?
        };

        for loaded in batch {
            if let Err(e) = tokio::fs::remove_file(&loaded.local_filepath).await {
                warn!(file = %loaded.local_filepath.display(), error = %e, "failed to delete staged file");
            }
        }

        Ok(BatchOutcome {
            point_ids,
            chunks_upserted: chunks.len(),
        })
    }

    async fn set_status(&self, run: &str, status: DataIngestionRunStatus) -> Result<()> {
        info!(%status, "run status");
        self.metadata_store
            .update_data_ingestion_run_status(run, status)
            .await
    }

    /// Records a terminal failure status and hands back the cause.
    async fn fail(
        &self,
        run: &str,
        status: DataIngestionRunStatus,
        cause: anyhow::Error,
    ) -> anyhow::Error {
        error!(%status, error = %format!("{:#}", cause), "data ingestion run failed");
        if let Err(e) = self
            .metadata_store
            .update_data_ingestion_run_status(run, status)
            .await
        {
            error!(error = %e, "failed to record run status");
        }
        cause
    }
}
