use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

use super::{Fingerprint, Snapshot};
use crate::models::{DataIngestionMode, DataPoint, LoadedDataPoint, Metadata};

type EntryIter = Box<dyn Iterator<Item = walkdir::Result<DirEntry>> + Send>;

/// Lazy traversal of a directory tree into [`LoadedDataPoint`]s.
///
/// Entries are visited in file-name order. Hidden files and directories are
/// skipped, as are paths matching the exclude globs (relative, `/`-separated).
/// Each file is hashed before anything else happens to it so unchanged
/// points in incremental mode are never copied. With a staging directory
/// set, yielded files are copied there under their relative path;
/// otherwise the walked files are already staged and are used in place.
pub struct DirectoryWalk {
    entries: EntryIter,
    root: PathBuf,
    data_source_fqn: String,
    snapshot: Snapshot,
    mode: DataIngestionMode,
    fingerprint: Fingerprint,
    excludes: Option<GlobSet>,
    stage_to: Option<PathBuf>,
    point_metadata: Metadata,
}

impl DirectoryWalk {
    pub fn new(
        root: &Path,
        data_source_fqn: impl Into<String>,
        snapshot: &Snapshot,
        mode: DataIngestionMode,
        fingerprint: Fingerprint,
    ) -> Self {
        let entries = WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_hidden(e));
        Self {
            entries: Box::new(entries),
            root: root.to_path_buf(),
            data_source_fqn: data_source_fqn.into(),
            snapshot: snapshot.clone(),
            mode,
            fingerprint,
            excludes: None,
            stage_to: None,
            point_metadata: Metadata::new(),
        }
    }

    /// Copy yielded files into `dest` and never descend into it.
    pub fn stage_to(mut self, dest: &Path) -> Self {
        let dest = dest.to_path_buf();
        let entries = std::mem::replace(&mut self.entries, Box::new(std::iter::empty()));
        let skip = dest.clone();
        self.entries = Box::new(entries.filter(move |e| match e {
            Ok(entry) => !entry.path().starts_with(&skip),
            Err(_) => true,
        }));
        self.stage_to = Some(dest);
        self
    }

    pub fn exclude(mut self, patterns: &[String]) -> Result<Self> {
        if !patterns.is_empty() {
            self.excludes = Some(build_globset(patterns)?);
        }
        Ok(self)
    }

    /// Metadata copied onto every yielded data point.
    pub fn with_point_metadata(mut self, metadata: Metadata) -> Self {
        self.point_metadata = metadata;
        self
    }

    fn visit(&self, entry: &DirEntry) -> Result<Option<LoadedDataPoint>> {
        let path = entry.path();
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        let rel_str = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if let Some(excludes) = &self.excludes {
            if excludes.is_match(&rel_str) {
                return Ok(None);
            }
        }

        let hash = self
            .fingerprint
            .compute(path)
            .with_context(|| format!("failed to fingerprint {}", path.display()))?;

        let data_point = DataPoint {
            data_source_fqn: self.data_source_fqn.clone(),
            data_point_uri: rel_str,
            data_point_hash: hash,
            metadata: self.point_metadata.clone(),
        };

        if self.mode == DataIngestionMode::Incremental
            && self.snapshot.get(&data_point.data_point_fqn()) == Some(&data_point.data_point_hash)
        {
            return Ok(None);
        }

        let local_filepath = match &self.stage_to {
            Some(dest) => {
                let target = dest.join(relative);
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::copy(path, &target).with_context(|| {
                    format!("failed to stage {} -> {}", path.display(), target.display())
                })?;
                target
            }
            None => path.to_path_buf(),
        };

        Ok(Some(LoadedDataPoint {
            data_point,
            file_extension: file_extension(path),
            local_filepath,
        }))
    }
}

impl Iterator for DirectoryWalk {
    type Item = Result<LoadedDataPoint>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.entries.next()? {
                Ok(entry) => entry,
                Err(e) => return Some(Err(e.into())),
            };
            if !entry.file_type().is_file() {
                continue;
            }
            match self.visit(&entry) {
                Ok(Some(point)) => return Some(Ok(point)),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|s| s.starts_with('.'))
        .unwrap_or(false)
}

/// Lowercased extension with its leading dot, or empty.
pub(crate) fn file_extension(path: &Path) -> String {
    path.extension()
        .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
        .unwrap_or_default()
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
