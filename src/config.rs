use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::loader::Fingerprint;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub vector_db: VectorDbConfig,
    pub metadata_store: MetadataStoreConfig,
    #[serde(default)]
    pub ingestion: IngestionConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct VectorDbConfig {
    #[serde(default = "default_vector_provider")]
    pub provider: String,
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Page size for listing and deleting stored vectors.
    #[serde(default = "default_vector_batch_size")]
    pub batch_size: usize,
}

fn default_vector_provider() -> String {
    "sqlite".to_string()
}
fn default_vector_batch_size() -> usize {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct MetadataStoreConfig {
    #[serde(default = "default_metadata_provider")]
    pub provider: String,
    /// SQLite file for `sqlite`, the collection document for `file`.
    pub path: PathBuf,
}

fn default_metadata_provider() -> String {
    "sqlite".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestionConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub fingerprint: Fingerprint,
    /// Parent directory for per-run staging dirs; the OS temp dir if unset.
    #[serde(default)]
    pub staging_dir: Option<PathBuf>,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            fingerprint: Fingerprint::default(),
            staging_dir: None,
        }
    }
}

fn default_batch_size() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is not set.
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
        }
    }
}

fn default_log_filter() -> String {
    "info".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    match config.vector_db.provider.as_str() {
        "memory" => {}
        "sqlite" => {
            if config.vector_db.path.is_none() {
                anyhow::bail!("vector_db.path must be set when provider is 'sqlite'");
            }
        }
        other => anyhow::bail!(
            "Unknown vector_db provider: '{}'. Must be sqlite or memory.",
            other
        ),
    }

    if config.vector_db.batch_size == 0 {
        anyhow::bail!("vector_db.batch_size must be > 0");
    }

    match config.metadata_store.provider.as_str() {
        "sqlite" | "file" => {}
        other => anyhow::bail!(
            "Unknown metadata_store provider: '{}'. Must be sqlite or file.",
            other
        ),
    }

    if config.ingestion.batch_size == 0 {
        anyhow::bail!("ingestion.batch_size must be > 0");
    }

    Ok(())
}
