use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::{DataLoader, DirectoryWalk, Fingerprint, LoadedBatches, Snapshot};
use crate::error::Error;
use crate::models::{DataIngestionMode, DataSource};

/// Loads files from a local directory. The data source uri is the
/// directory path; relative paths resolve against the working directory.
///
/// Data source metadata may carry `exclude_globs` (array of glob strings
/// matched against `/`-separated relative paths).
pub struct LocalDirLoader {
    fingerprint: Fingerprint,
}

impl LocalDirLoader {
    pub fn new(fingerprint: Fingerprint) -> Self {
        Self { fingerprint }
    }
}

pub(crate) fn resolve_source_dir(uri: &str) -> Result<PathBuf> {
    let path = Path::new(uri);
    let path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    if !path.is_dir() {
        return Err(Error::SourceUnavailable(format!(
            "source directory does not exist: {}",
            path.display()
        ))
        .into());
    }
    Ok(path)
}

pub(crate) fn exclude_globs(data_source: &DataSource) -> Vec<String> {
    data_source
        .metadata
        .get("exclude_globs")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl DataLoader for LocalDirLoader {
    fn description(&self) -> &str {
        "Loads files from a local directory tree"
    }

    async fn load_filtered_data(
        &self,
        data_source: &DataSource,
        dest_dir: &Path,
        previous_snapshot: &Snapshot,
        batch_size: usize,
        mode: DataIngestionMode,
    ) -> Result<LoadedBatches> {
        let source_dir = resolve_source_dir(&data_source.uri)?;
        info!(
            source_dir = %source_dir.display(),
            dest_dir = %dest_dir.display(),
            %mode,
            "loading local directory"
        );

        let same_dir = match (source_dir.canonicalize(), dest_dir.canonicalize()) {
            (Ok(a), Ok(b)) => a == b,
            _ => source_dir == dest_dir,
        };
        if same_dir {
            debug!("source and destination are the same directory; nothing to stage");
            return Ok(LoadedBatches::empty(batch_size));
        }

        let walk = DirectoryWalk::new(
            &source_dir,
            data_source.fqn(),
            previous_snapshot,
            mode,
            self.fingerprint,
        )
        .exclude(&exclude_globs(data_source))?
        .stage_to(dest_dir);

        Ok(LoadedBatches::new(walk, batch_size))
    }
}
