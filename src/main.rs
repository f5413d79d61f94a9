//! # ragsync CLI
//!
//! The `ragsync` binary manages collections and data sources, runs
//! ingestion, and serves the HTTP API.
//!
//! ## Usage
//!
//! ```bash
//! ragsync --config ./config/ragsync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ragsync init` | Create the configured stores and run migrations |
//! | `ragsync serve` | Start the HTTP server |
//! | `ragsync collections list\|create\|delete` | Manage collections |
//! | `ragsync sources list\|add` | Manage data sources |
//! | `ragsync associate <collection> <fqn>` | Bind a data source to a collection |
//! | `ragsync unassociate <collection> <fqn>` | Unbind a data source |
//! | `ragsync ingest <collection>` | Sync associated data sources into the collection |
//! | `ragsync runs list\|status` | Inspect ingestion runs |
//! | `ragsync search <collection> "<query>"` | Retrieve chunks for a query |
//! | `ragsync components <kind>` | List parsers, embedders or dataloaders |
//!
//! ## Examples
//!
//! ```bash
//! ragsync init
//! ragsync sources add localdir ./docs
//! ragsync collections create docs --embedder hashing --data-source localdir::./docs
//! ragsync ingest docs --mode FULL
//! ragsync search docs "deployment checklist" --k 5
//! ```
//!
//! Command output goes to stdout; logs go to stderr.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use ragsync::config::{self, LoggingConfig};
use ragsync::indexer::Indexer;
use ragsync::models::{
    AssociateDataSource, CreateCollection, DataIngestionMode, DataSource, EmbedderConfig,
    IngestDataToCollection, ParserConfig,
};
use ragsync::retrieval::{self, RetrieverConfig};
use ragsync::server;

/// ragsync: incremental document ingestion into vector-store collections.
#[derive(Parser)]
#[command(name = "ragsync", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ragsync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the configured stores and run schema migrations. Idempotent.
    Init,

    /// Start the HTTP server on `[server].bind`.
    Serve,

    /// Manage collections.
    Collections {
        #[command(subcommand)]
        action: CollectionsAction,
    },

    /// Manage data sources.
    Sources {
        #[command(subcommand)]
        action: SourcesAction,
    },

    /// Bind a data source to a collection, replacing any previous parser config.
    Associate {
        collection: String,
        data_source_fqn: String,
        /// Target chunk size in characters.
        #[arg(long)]
        chunk_size: Option<usize>,
        /// Overlap between consecutive chunks in characters.
        #[arg(long)]
        chunk_overlap: Option<usize>,
        /// Parser override as `extension=parser`, e.g. `.md=text`.
        #[arg(long = "parser", value_parser = parse_key_val)]
        parsers: Vec<(String, String)>,
    },

    /// Unbind a data source from a collection.
    Unassociate {
        collection: String,
        data_source_fqn: String,
    },

    /// Sync the collection's data sources into its vector collection.
    Ingest {
        collection: String,
        /// Only ingest this associated data source.
        #[arg(long)]
        data_source: Option<String>,
        /// `INCREMENTAL`, `FULL` or `NONE`.
        #[arg(long, default_value = "INCREMENTAL")]
        mode: DataIngestionMode,
        /// Keep going past failing batches; the run still ends failed.
        #[arg(long)]
        no_raise_error_on_failure: bool,
        /// Data points per batch (defaults to `[ingestion].batch_size`).
        #[arg(long)]
        batch_size: Option<usize>,
    },

    /// Inspect ingestion runs.
    Runs {
        #[command(subcommand)]
        action: RunsAction,
    },

    /// Retrieve the chunks most relevant to a query.
    Search {
        collection: String,
        query: String,
        #[arg(long, default_value_t = 4)]
        k: usize,
        /// Diversify results with maximal marginal relevance.
        #[arg(long, conflicts_with = "score_threshold")]
        mmr: bool,
        /// Drop results scoring below this cosine similarity.
        #[arg(long)]
        score_threshold: Option<f32>,
    },

    /// List registered components: `parsers`, `embedders` or `dataloaders`.
    Components { kind: String },
}

#[derive(Subcommand)]
enum CollectionsAction {
    List,
    Create {
        name: String,
        #[arg(long)]
        description: Option<String>,
        /// Embedding provider (see `ragsync components embedders`).
        #[arg(long, default_value = "hashing")]
        embedder: String,
        /// Provider parameter as `key=value`; values parse as JSON when they can.
        #[arg(long = "embedder-param", value_parser = parse_key_val)]
        embedder_params: Vec<(String, String)>,
        /// Data source fqn to associate with default parser settings. Repeatable.
        #[arg(long = "data-source")]
        data_sources: Vec<String>,
    },
    /// Delete a collection with its vectors and runs.
    Delete { name: String },
}

#[derive(Subcommand)]
enum SourcesAction {
    List,
    Add {
        /// Loader type (see `ragsync components dataloaders`).
        source_type: String,
        uri: String,
    },
}

#[derive(Subcommand)]
enum RunsAction {
    List {
        collection: String,
        #[arg(long)]
        data_source: Option<String>,
    },
    Status { name: String },
}

/// Parse a `key=value` pair.
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no '=' found in '{}'", s))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.filter));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    init_tracing(&cfg.logging);

    let indexer = Indexer::open(&cfg).await?;

    match cli.command {
        Commands::Init => {
            println!("Stores initialized.");
            println!(
                "  metadata store: {} ({})",
                cfg.metadata_store.provider,
                cfg.metadata_store.path.display()
            );
            match &cfg.vector_db.path {
                Some(path) => println!(
                    "  vector db:      {} ({})",
                    cfg.vector_db.provider,
                    path.display()
                ),
                None => println!("  vector db:      {}", cfg.vector_db.provider),
            }
        }
        Commands::Serve => {
            server::run_server(&cfg.server.bind, Arc::new(indexer)).await?;
        }
        Commands::Collections { action } => match action {
            CollectionsAction::List => {
                let collections = indexer.metadata_store().get_collections().await?;
                if collections.is_empty() {
                    println!("No collections.");
                }
                for c in collections {
                    println!(
                        "{}  embedder={}  data_sources={}",
                        c.name,
                        c.embedder_config.provider,
                        c.associated_data_sources.len()
                    );
                    for fqn in c.associated_data_sources.keys() {
                        println!("  - {}", fqn);
                    }
                }
            }
            CollectionsAction::Create {
                name,
                description,
                embedder,
                embedder_params,
                data_sources,
            } => {
                let mut embedder_config = EmbedderConfig::new(embedder);
                for (key, value) in embedder_params {
                    let value = serde_json::from_str(&value)
                        .unwrap_or(serde_json::Value::String(value));
                    embedder_config = embedder_config.with_param(&key, value);
                }
                let collection = indexer
                    .create_collection(CreateCollection {
                        name,
                        description,
                        embedder_config,
                        associated_data_sources: data_sources
                            .into_iter()
                            .map(|fqn| AssociateDataSource {
                                data_source_fqn: fqn,
                                parser_config: ParserConfig::default(),
                            })
                            .collect(),
                    })
                    .await?;
                println!("Created collection {}", collection.name);
            }
            CollectionsAction::Delete { name } => {
                indexer.delete_collection(&name).await?;
                println!("Deleted collection {}", name);
            }
        },
        Commands::Sources { action } => match action {
            SourcesAction::List => {
                let sources = indexer.metadata_store().get_data_sources().await?;
                if sources.is_empty() {
                    println!("No data sources.");
                }
                for ds in sources {
                    println!("{}", ds.fqn());
                }
            }
            SourcesAction::Add { source_type, uri } => {
                let ds = indexer
                    .create_data_source(DataSource::new(source_type, uri))
                    .await?;
                println!("Added data source {}", ds.fqn());
            }
        },
        Commands::Associate {
            collection,
            data_source_fqn,
            chunk_size,
            chunk_overlap,
            parsers,
        } => {
            let mut parser_config = ParserConfig::default();
            if let Some(size) = chunk_size {
                parser_config.chunk_size = size;
            }
            if let Some(overlap) = chunk_overlap {
                parser_config.chunk_overlap = overlap;
            }
            parser_config.parser_map.extend(parsers);
            indexer
                .metadata_store()
                .associate_data_source_with_collection(&collection, &data_source_fqn, parser_config)
                .await?;
            println!("Associated {} with {}", data_source_fqn, collection);
        }
        Commands::Unassociate {
            collection,
            data_source_fqn,
        } => {
            indexer
                .metadata_store()
                .unassociate_data_source_with_collection(&collection, &data_source_fqn)
                .await?;
            println!("Unassociated {} from {}", data_source_fqn, collection);
        }
        Commands::Ingest {
            collection,
            data_source,
            mode,
            no_raise_error_on_failure,
            batch_size,
        } => {
            let run_names = indexer
                .ingest_data(IngestDataToCollection {
                    collection_name: collection,
                    data_source_fqn: data_source,
                    data_ingestion_mode: mode,
                    raise_error_on_failure: !no_raise_error_on_failure,
                    batch_size: batch_size.unwrap_or(cfg.ingestion.batch_size),
                })
                .await?;
            for name in run_names {
                println!("{}  COMPLETED", name);
            }
        }
        Commands::Runs { action } => match action {
            RunsAction::List {
                collection,
                data_source,
            } => {
                let runs = indexer
                    .metadata_store()
                    .get_data_ingestion_runs(&collection, data_source.as_deref())
                    .await?;
                if runs.is_empty() {
                    println!("No runs.");
                }
                for run in runs {
                    println!(
                        "{}  {}  {}  {}",
                        run.name, run.data_source_fqn, run.data_ingestion_mode, run.status
                    );
                }
            }
            RunsAction::Status { name } => {
                let run = indexer
                    .metadata_store()
                    .get_data_ingestion_run(&name)
                    .await?
                    .ok_or_else(|| {
                        ragsync::error::Error::not_found(format!("data ingestion run '{}'", name))
                    })?;
                println!("{}", run.status);
                for error in &run.errors {
                    println!("  error: {}", error);
                }
            }
        },
        Commands::Search {
            collection,
            query,
            k,
            mmr,
            score_threshold,
        } => {
            let retriever = match (mmr, score_threshold) {
                (true, _) => RetrieverConfig::Mmr {
                    k,
                    fetch_k: (k * 5).max(20),
                    lambda_mult: 0.5,
                    filter: None,
                },
                (false, Some(score_threshold)) => RetrieverConfig::SimilarityScoreThreshold {
                    k,
                    score_threshold,
                    filter: None,
                },
                (false, None) => RetrieverConfig::Similarity { k, filter: None },
            };
            let hits = retrieval::retrieve(
                indexer.metadata_store().as_ref(),
                indexer.vector_db().as_ref(),
                &indexer.components().embedders,
                &collection,
                &query,
                &retriever,
            )
            .await?;
            if hits.is_empty() {
                println!("No results.");
            }
            for (i, hit) in hits.iter().enumerate() {
                let source = hit
                    .metadata
                    .get(ragsync::models::META_DATA_POINT_FQN)
                    .and_then(|v| v.as_str())
                    .unwrap_or("-");
                println!("{}. [{:.3}] {}", i + 1, hit.score, source);
                let snippet: String = hit.content.chars().take(200).collect();
                println!("   {}", snippet.replace('\n', " "));
            }
        }
        Commands::Components { kind } => {
            let components = indexer.components();
            let listed = match kind.as_str() {
                "parsers" => components.parsers.list(),
                "embedders" => components.embedders.list(),
                "dataloaders" => components.loaders.list(),
                other => anyhow::bail!(
                    "Unknown component kind: {}. Use parsers, embedders or dataloaders.",
                    other
                ),
            };
            for c in listed {
                println!("{:<12} {}", c.name, c.description);
            }
        }
    }

    Ok(())
}
