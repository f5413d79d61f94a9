//! Data loaders: discover data points in a data source and stage them as
//! local files, in batches.
//!
//! A loader call returns a [`LoadedBatches`] sequence. It is lazy, finite
//! and not restartable: hashing and copying happen while it is consumed,
//! and a fresh discovery needs a fresh call.
//!
//! # Change detection
//!
//! In [`DataIngestionMode::Incremental`] a point is skipped iff the
//! previous snapshot holds its fqn with a hash equal to the freshly
//! computed one. No timestamps are consulted. The hash is produced by the
//! configured [`Fingerprint`] policy.
//!
//! # Registered loaders
//!
//! | Type | Loader |
//! |------|--------|
//! | `localdir` | [`LocalDirLoader`] |
//! | `web` | [`WebLoader`] |

mod localdir;
mod walk;
mod web;

pub use localdir::LocalDirLoader;
pub(crate) use walk::file_extension;
pub use walk::DirectoryWalk;
pub use web::WebLoader;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use crate::error::Error;
use crate::models::{ComponentInfo, DataIngestionMode, DataSource, LoadedDataPoint};

/// `data_point_fqn -> data_point_hash` as of the last successful ingestion.
pub type Snapshot = HashMap<String, String>;

// ═══════════════════════════════════════════════════════════════════════
// Fingerprints
// ═══════════════════════════════════════════════════════════════════════

/// How a data point's content fingerprint is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Fingerprint {
    /// Hex SHA-256 of the file content, streamed.
    #[default]
    Sha256,
    /// Byte size. Cheap, but blind to same-size edits.
    Size,
}

impl Fingerprint {
    pub fn compute(self, path: &Path) -> std::io::Result<String> {
        match self {
            Fingerprint::Sha256 => {
                let mut file = std::fs::File::open(path)?;
                let mut hasher = Sha256::new();
                std::io::copy(&mut file, &mut hasher)?;
                Ok(format!("{:x}", hasher.finalize()))
            }
            Fingerprint::Size => Ok(std::fs::metadata(path)?.len().to_string()),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Batching
// ═══════════════════════════════════════════════════════════════════════

type PointIter = Box<dyn Iterator<Item = Result<LoadedDataPoint>> + Send>;

/// Batches of loaded data points.
///
/// Every batch but the last holds exactly `batch_size` points; the last
/// holds between zero and `batch_size` and is always produced, so an
/// empty source still yields one (empty) batch. A discovery error is
/// yielded once and ends the sequence.
pub struct LoadedBatches {
    points: PointIter,
    batch_size: usize,
    done: bool,
}

impl LoadedBatches {
    pub fn new(
        points: impl Iterator<Item = Result<LoadedDataPoint>> + Send + 'static,
        batch_size: usize,
    ) -> Self {
        Self {
            points: Box::new(points),
            batch_size: batch_size.max(1),
            done: false,
        }
    }

    /// A sequence that yields a single empty batch.
    pub fn empty(batch_size: usize) -> Self {
        Self::new(std::iter::empty(), batch_size)
    }

    fn exhausted() -> Self {
        Self {
            points: Box::new(std::iter::empty()),
            batch_size: 1,
            done: true,
        }
    }

    /// Pulls the next batch on the blocking pool so file hashing and
    /// copying never stall the async runtime.
    pub async fn next_batch(&mut self) -> Option<Result<Vec<LoadedDataPoint>>> {
        if self.done {
            return None;
        }
        let mut this = std::mem::replace(self, Self::exhausted());
        let joined = tokio::task::spawn_blocking(move || {
            let item = this.next();
            (this, item)
        })
        .await;
        match joined {
            Ok((this, item)) => {
                *self = this;
                item
            }
            Err(e) => Some(Err(anyhow!("loader task failed: {}", e))),
        }
    }
}

impl Iterator for LoadedBatches {
    type Item = Result<Vec<LoadedDataPoint>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut batch = Vec::with_capacity(self.batch_size);
        for item in self.points.by_ref() {
            match item {
                Ok(point) => {
                    batch.push(point);
                    if batch.len() >= self.batch_size {
                        return Some(Ok(batch));
                    }
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
        self.done = true;
        Some(Ok(batch))
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Loader trait
// ═══════════════════════════════════════════════════════════════════════

#[async_trait]
pub trait DataLoader: Send + Sync {
    fn description(&self) -> &str;

    /// Discovers the source's data points and stages the ones that need
    /// ingesting under `dest_dir`.
    ///
    /// Fails with [`Error::SourceUnavailable`] when the source location
    /// cannot be reached. Hidden files are never yielded.
    async fn load_filtered_data(
        &self,
        data_source: &DataSource,
        dest_dir: &Path,
        previous_snapshot: &Snapshot,
        batch_size: usize,
        mode: DataIngestionMode,
    ) -> Result<LoadedBatches>;

    async fn load_full_data(
        &self,
        data_source: &DataSource,
        dest_dir: &Path,
        batch_size: usize,
    ) -> Result<LoadedBatches> {
        self.load_filtered_data(
            data_source,
            dest_dir,
            &Snapshot::new(),
            batch_size,
            DataIngestionMode::Full,
        )
        .await
    }

    async fn load_incremental_data(
        &self,
        data_source: &DataSource,
        dest_dir: &Path,
        previous_snapshot: &Snapshot,
        batch_size: usize,
    ) -> Result<LoadedBatches> {
        self.load_filtered_data(
            data_source,
            dest_dir,
            previous_snapshot,
            batch_size,
            DataIngestionMode::Incremental,
        )
        .await
    }
}

/// Data source type to loader lookup.
#[derive(Default)]
pub struct LoaderRegistry {
    loaders: BTreeMap<String, Arc<dyn DataLoader>>,
}

impl LoaderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins(fingerprint: Fingerprint) -> Self {
        let mut registry = Self::new();
        registry.loaders.insert(
            "localdir".to_string(),
            Arc::new(LocalDirLoader::new(fingerprint)),
        );
        registry
            .loaders
            .insert("web".to_string(), Arc::new(WebLoader::new(fingerprint)));
        registry
    }

    /// Registers a loader; a type can only be claimed once.
    pub fn register(
        &mut self,
        source_type: impl Into<String>,
        loader: Arc<dyn DataLoader>,
    ) -> Result<()> {
        let source_type = source_type.into();
        if source_type.is_empty() {
            return Err(Error::config("data loader type must be a non-empty string"));
        }
        if self.loaders.contains_key(&source_type) {
            return Err(Error::config(format!(
                "a data loader is already registered for type '{}'",
                source_type
            )));
        }
        self.loaders.insert(source_type, loader);
        Ok(())
    }

    pub fn get(&self, source_type: &str) -> Result<Arc<dyn DataLoader>> {
        self.loaders.get(source_type).cloned().ok_or_else(|| {
            Error::config(format!("no data loader registered for type '{}'", source_type))
        })
    }

    pub fn contains(&self, source_type: &str) -> bool {
        self.loaders.contains_key(source_type)
    }

    pub fn list(&self) -> Vec<ComponentInfo> {
        self.loaders
            .iter()
            .map(|(name, loader)| ComponentInfo {
                name: name.clone(),
                description: loader.description().to_string(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DataPoint, Metadata};
    use std::path::PathBuf;

    fn point(i: usize) -> LoadedDataPoint {
        LoadedDataPoint {
            data_point: DataPoint {
                data_source_fqn: "test::src".into(),
                data_point_uri: format!("f{}.txt", i),
                data_point_hash: i.to_string(),
                metadata: Metadata::new(),
            },
            local_filepath: PathBuf::from(format!("/tmp/f{}.txt", i)),
            file_extension: ".txt".into(),
        }
    }

    #[test]
    fn test_batches_are_full_until_the_last() {
        let batches: Vec<_> = LoadedBatches::new((0..7).map(|i| Ok(point(i))), 3)
            .map(|b| b.unwrap().len())
            .collect();
        assert_eq!(batches, vec![3, 3, 1]);
    }

    #[test]
    fn test_exact_multiple_ends_with_empty_batch() {
        let batches: Vec<_> = LoadedBatches::new((0..6).map(|i| Ok(point(i))), 3)
            .map(|b| b.unwrap().len())
            .collect();
        assert_eq!(batches, vec![3, 3, 0]);
    }

    #[test]
    fn test_empty_source_yields_one_empty_batch() {
        let batches: Vec<_> = LoadedBatches::empty(10).collect();
        assert_eq!(batches.len(), 1);
        assert!(batches[0].as_ref().unwrap().is_empty());
    }

    #[test]
    fn test_error_ends_the_sequence() {
        let items = vec![Ok(point(0)), Err(anyhow!("disk gone")), Ok(point(2))];
        let mut batches = LoadedBatches::new(items.into_iter(), 5);
        assert!(batches.next().unwrap().is_err());
        assert!(batches.next().is_none());
    }

    #[tokio::test]
    async fn test_next_batch_drives_iterator() {
        let mut batches = LoadedBatches::new((0..4).map(|i| Ok(point(i))), 2);
        let mut sizes = Vec::new();
        while let Some(batch) = batches.next_batch().await {
            sizes.push(batch.unwrap().len());
        }
        assert_eq!(sizes, vec![2, 2, 0]);
    }

    #[test]
    fn test_fingerprints() {
        let dir = tempfile::TempDir::new().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        std::fs::write(&a, "hello").unwrap();
        std::fs::write(&b, "world").unwrap();
        assert_eq!(Fingerprint::Size.compute(&a).unwrap(), "5");
        assert_eq!(
            Fingerprint::Size.compute(&a).unwrap(),
            Fingerprint::Size.compute(&b).unwrap()
        );
        assert_ne!(
            Fingerprint::Sha256.compute(&a).unwrap(),
            Fingerprint::Sha256.compute(&b).unwrap()
        );
        assert_eq!(
            Fingerprint::Sha256.compute(&a).unwrap(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_registry_rejects_duplicates_and_unknown() {
        let mut registry = LoaderRegistry::with_builtins(Fingerprint::Sha256);
        let err = registry
            .register("localdir", Arc::new(LocalDirLoader::new(Fingerprint::Size)))
            .unwrap_err();
        assert!(err.to_string().contains("already registered"));
        assert!(registry.get("localdir").is_ok());
        assert!(registry.get("s3").is_err());
        let names: Vec<_> = registry.list().into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["localdir", "web"]);
    }
}
