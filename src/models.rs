//! Core data models shared by the ingestion pipeline, the stores, and the
//! HTTP/CLI surfaces.
//!
//! Identities are composite strings ("fqn"s):
//!
//! | Entity | Identity |
//! |--------|----------|
//! | [`DataSource`] | `type::uri` |
//! | [`DataPoint`] | `data_source_fqn::data_point_uri` |
//! | [`Collection`] | `name` (also the vector-store collection id) |
//! | [`DataIngestionRun`] | `name` (UUID) |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::Error;

pub const FQN_SEPARATOR: &str = "::";

/// Chunk metadata key holding the owning data point's fqn.
pub const META_DATA_POINT_FQN: &str = "_data_point_fqn";
/// Chunk metadata key holding the owning data point's content fingerprint.
pub const META_DATA_POINT_HASH: &str = "_data_point_hash";
pub const META_DATA_SOURCE_FQN: &str = "_data_source_fqn";
pub const META_CHUNK_INDEX: &str = "_chunk_index";

pub type Metadata = serde_json::Map<String, serde_json::Value>;

// ═══════════════════════════════════════════════════════════════════════
// Data sources and data points
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSource {
    #[serde(rename = "type")]
    pub source_type: String,
    pub uri: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl DataSource {
    pub fn new(source_type: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            source_type: source_type.into(),
            uri: uri.into(),
            metadata: Metadata::new(),
        }
    }

    pub fn fqn(&self) -> String {
        format!("{}{}{}", self.source_type, FQN_SEPARATOR, self.uri)
    }
}

/// Splits a data source fqn into `(type, uri)`. The uri may itself contain
/// the separator (e.g. `web::https://...`), so only the first one counts.
pub fn split_data_source_fqn(fqn: &str) -> Result<(&str, &str), Error> {
    fqn.split_once(FQN_SEPARATOR)
        .filter(|(t, u)| !t.is_empty() && !u.is_empty())
        .ok_or_else(|| Error::BadRequest(format!("invalid data source fqn: {}", fqn)))
}

/// One discoverable unit inside a data source, usually a file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub data_source_fqn: String,
    pub data_point_uri: String,
    pub data_point_hash: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl DataPoint {
    pub fn data_point_fqn(&self) -> String {
        format!(
            "{}{}{}",
            self.data_source_fqn, FQN_SEPARATOR, self.data_point_uri
        )
    }
}

/// A [`DataPoint`] materialized into the run's staging directory.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedDataPoint {
    pub data_point: DataPoint,
    pub local_filepath: PathBuf,
    /// Lowercased, with the leading dot (`".md"`); empty when the file has none.
    pub file_extension: String,
}

/// The vector store's view of one stored chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPointVector {
    pub data_point_vector_id: String,
    pub data_point_fqn: String,
    pub data_point_hash: String,
}

/// A chunk produced by a parser, ready to be embedded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedChunk {
    pub content: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl ParsedChunk {
    pub fn new(content: impl Into<String>, metadata: Metadata) -> Self {
        Self {
            content: content.into(),
            metadata,
        }
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    pub fn chunk_index(&self) -> Option<u64> {
        self.metadata.get(META_CHUNK_INDEX).and_then(|v| v.as_u64())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Modes and statuses
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataIngestionMode {
    None,
    #[default]
    Incremental,
    Full,
}

impl fmt::Display for DataIngestionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DataIngestionMode::None => "NONE",
            DataIngestionMode::Incremental => "INCREMENTAL",
            DataIngestionMode::Full => "FULL",
        };
        f.write_str(s)
    }
}

impl FromStr for DataIngestionMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NONE" => Ok(DataIngestionMode::None),
            "INCREMENTAL" => Ok(DataIngestionMode::Incremental),
            "FULL" => Ok(DataIngestionMode::Full),
            other => Err(Error::BadRequest(format!(
                "unknown data ingestion mode '{}': expected NONE, INCREMENTAL or FULL",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataIngestionRunStatus {
    Initialized,
    FetchingExistingVectors,
    FetchingExistingVectorsFailed,
    DataIngestionStarted,
    DataIngestionCompleted,
    DataIngestionFailed,
    DataCleanupStarted,
    DataCleanupFailed,
    Completed,
    Error,
}

impl DataIngestionRunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DataIngestionRunStatus::FetchingExistingVectorsFailed
                | DataIngestionRunStatus::DataIngestionFailed
                | DataIngestionRunStatus::DataCleanupFailed
                | DataIngestionRunStatus::Completed
                | DataIngestionRunStatus::Error
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DataIngestionRunStatus::Initialized => "INITIALIZED",
            DataIngestionRunStatus::FetchingExistingVectors => "FETCHING_EXISTING_VECTORS",
            DataIngestionRunStatus::FetchingExistingVectorsFailed => {
                "FETCHING_EXISTING_VECTORS_FAILED"
            }
            DataIngestionRunStatus::DataIngestionStarted => "DATA_INGESTION_STARTED",
            DataIngestionRunStatus::DataIngestionCompleted => "DATA_INGESTION_COMPLETED",
            DataIngestionRunStatus::DataIngestionFailed => "DATA_INGESTION_FAILED",
            DataIngestionRunStatus::DataCleanupStarted => "DATA_CLEANUP_STARTED",
            DataIngestionRunStatus::DataCleanupFailed => "DATA_CLEANUP_FAILED",
            DataIngestionRunStatus::Completed => "COMPLETED",
            DataIngestionRunStatus::Error => "ERROR",
        }
    }
}

impl fmt::Display for DataIngestionRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Component configuration
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbedderConfig {
    pub provider: String,
    /// Provider-specific parameters (`model`, `dims`, `url`, ...).
    #[serde(default)]
    pub config: Metadata,
}

impl EmbedderConfig {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            config: Metadata::new(),
        }
    }

    pub fn with_param(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.config.insert(key.to_string(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParserConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    /// Extension (`".md"`) to parser name overrides.
    #[serde(default = "default_parser_map", alias = "parse_map")]
    pub parser_map: BTreeMap<String, String>,
    #[serde(default)]
    pub additional_config: Metadata,
}

fn default_chunk_size() -> usize {
    1000
}

fn default_chunk_overlap() -> usize {
    20
}

fn default_parser_map() -> BTreeMap<String, String> {
    BTreeMap::from([
        (".md".to_string(), "MarkdownParser".to_string()),
        (".pdf".to_string(), "PdfParserFast".to_string()),
    ])
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            parser_map: default_parser_map(),
            additional_config: Metadata::new(),
        }
    }
}

impl ParserConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.chunk_size == 0 {
            return Err(Error::Config("parser_config.chunk_size must be >= 1".into()));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(Error::Config(format!(
                "parser_config.chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        for ext in self.parser_map.keys() {
            if !ext.starts_with('.') {
                return Err(Error::Config(format!(
                    "parser_config.parser_map keys must be extensions starting with '.', got '{}'",
                    ext
                )));
            }
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Collections
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssociatedDataSource {
    pub data_source_fqn: String,
    #[serde(default)]
    pub parser_config: ParserConfig,
    pub data_source: Option<DataSource>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub embedder_config: EmbedderConfig,
    #[serde(default)]
    pub associated_data_sources: BTreeMap<String, AssociatedDataSource>,
}

/// Collection names double as vector-store identifiers: a lowercase ASCII
/// letter followed by lowercase letters, digits, `_` or `-`.
pub fn validate_collection_name(name: &str) -> Result<(), Error> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_lowercase() => chars
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-'),
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(Error::BadRequest(format!(
            "invalid collection name '{}': use lowercase letters, digits, '_' or '-', starting with a letter",
            name
        )))
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Ingestion runs
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateDataIngestionRun {
    pub collection_name: String,
    pub data_source_fqn: String,
    pub embedder_config: EmbedderConfig,
    #[serde(default)]
    pub parser_config: ParserConfig,
    #[serde(default)]
    pub data_ingestion_mode: DataIngestionMode,
    #[serde(default = "default_true")]
    pub raise_error_on_failure: bool,
}

/// One metric sample logged against a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub step: u64,
    pub values: HashMap<String, f64>,
    pub logged_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataIngestionRun {
    pub name: String,
    pub collection_name: String,
    pub data_source_fqn: String,
    pub embedder_config: EmbedderConfig,
    pub parser_config: ParserConfig,
    pub data_ingestion_mode: DataIngestionMode,
    pub raise_error_on_failure: bool,
    pub status: DataIngestionRunStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub errors: Vec<serde_json::Value>,
    #[serde(default)]
    pub metrics: Vec<RunMetrics>,
}

impl DataIngestionRun {
    pub fn from_request(req: CreateDataIngestionRun) -> Self {
        Self {
            name: uuid::Uuid::new_v4().to_string(),
            collection_name: req.collection_name,
            data_source_fqn: req.data_source_fqn,
            embedder_config: req.embedder_config,
            parser_config: req.parser_config,
            data_ingestion_mode: req.data_ingestion_mode,
            raise_error_on_failure: req.raise_error_on_failure,
            status: DataIngestionRunStatus::Initialized,
            created_at: Utc::now(),
            errors: Vec::new(),
            metrics: Vec::new(),
        }
    }
}

/// Everything the orchestrator needs to execute one run.
#[derive(Debug, Clone)]
pub struct DataIngestionConfig {
    pub collection_name: String,
    pub data_ingestion_run_name: String,
    pub data_source: DataSource,
    pub embedder_config: EmbedderConfig,
    pub parser_config: ParserConfig,
    pub data_ingestion_mode: DataIngestionMode,
    pub raise_error_on_failure: bool,
    pub batch_size: usize,
}

// ═══════════════════════════════════════════════════════════════════════
// Request payloads
// ═══════════════════════════════════════════════════════════════════════

fn default_true() -> bool {
    true
}

fn default_batch_size() -> usize {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCollection {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub embedder_config: EmbedderConfig,
    #[serde(default)]
    pub associated_data_sources: Vec<AssociateDataSource>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssociateDataSource {
    pub data_source_fqn: String,
    #[serde(default)]
    pub parser_config: ParserConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssociateDataSourceWithCollection {
    pub collection_name: String,
    pub data_source_fqn: String,
    #[serde(default)]
    pub parser_config: ParserConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnassociateDataSourceWithCollection {
    pub collection_name: String,
    pub data_source_fqn: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestDataToCollection {
    pub collection_name: String,
    #[serde(default)]
    pub data_source_fqn: Option<String>,
    #[serde(default)]
    pub data_ingestion_mode: DataIngestionMode,
    #[serde(default = "default_true")]
    pub raise_error_on_failure: bool,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListDataIngestionRuns {
    pub collection_name: String,
    #[serde(default)]
    pub data_source_fqn: Option<String>,
}

/// Name and description of a registered component, for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentInfo {
    pub name: String,
    pub description: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fqns_compose() {
        let source = DataSource::new("localdir", "/data");
        assert_eq!(source.fqn(), "localdir::/data");
        let point = DataPoint {
            data_source_fqn: source.fqn(),
            data_point_uri: "old.txt".into(),
            data_point_hash: "h".into(),
            metadata: Metadata::new(),
        };
        assert_eq!(point.data_point_fqn(), "localdir::/data::old.txt");
    }

    #[test]
    fn test_split_fqn_keeps_separator_in_uri() {
        let (t, u) = split_data_source_fqn("web::https://example.com/a::b").unwrap();
        assert_eq!(t, "web");
        assert_eq!(u, "https://example.com/a::b");
        assert!(split_data_source_fqn("localdir").is_err());
        assert!(split_data_source_fqn("::/x").is_err());
    }

    #[test]
    fn test_mode_serde_and_parse() {
        let m: DataIngestionMode = serde_json::from_str("\"FULL\"").unwrap();
        assert_eq!(m, DataIngestionMode::Full);
        assert_eq!("incremental".parse::<DataIngestionMode>().unwrap(), DataIngestionMode::Incremental);
        assert!("sometimes".parse::<DataIngestionMode>().is_err());
        assert_eq!(DataIngestionMode::default(), DataIngestionMode::Incremental);
    }

    #[test]
    fn test_status_serializes_screaming() {
        let s = serde_json::to_string(&DataIngestionRunStatus::FetchingExistingVectorsFailed).unwrap();
        assert_eq!(s, "\"FETCHING_EXISTING_VECTORS_FAILED\"");
        assert_eq!(
            DataIngestionRunStatus::DataCleanupStarted.to_string(),
            "DATA_CLEANUP_STARTED"
        );
        assert!(DataIngestionRunStatus::Completed.is_terminal());
        assert!(!DataIngestionRunStatus::DataIngestionCompleted.is_terminal());
    }

    #[test]
    fn test_parser_config_defaults_and_alias() {
        let cfg: ParserConfig =
            serde_json::from_str(r#"{"chunk_size": 500, "parse_map": {".txt": "TextParser"}}"#)
                .unwrap();
        assert_eq!(cfg.chunk_size, 500);
        assert_eq!(cfg.chunk_overlap, 20);
        assert_eq!(cfg.parser_map.get(".txt").map(String::as_str), Some("TextParser"));
        assert!(cfg.validate().is_ok());

        let bad = ParserConfig {
            chunk_size: 10,
            chunk_overlap: 10,
            ..ParserConfig::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_collection_name_rules() {
        assert!(validate_collection_name("docs").is_ok());
        assert!(validate_collection_name("team-docs_2").is_ok());
        assert!(validate_collection_name("").is_err());
        assert!(validate_collection_name("2docs").is_err());
        assert!(validate_collection_name("Docs").is_err());
        assert!(validate_collection_name("my docs").is_err());
    }

    #[test]
    fn test_ingest_request_defaults() {
        let req: IngestDataToCollection =
            serde_json::from_str(r#"{"collection_name": "docs"}"#).unwrap();
        assert!(req.raise_error_on_failure);
        assert_eq!(req.batch_size, 100);
        assert_eq!(req.data_ingestion_mode, DataIngestionMode::Incremental);
        assert!(req.data_source_fqn.is_none());
    }
}
