//! # ragsync
//!
//! Incremental document ingestion into vector-store collections for
//! retrieval-augmented generation.
//!
//! A collection is bound to one or more data sources. An ingestion run
//! syncs one data source into one collection: it discovers the source's
//! documents, skips the ones whose content fingerprint has not changed,
//! parses the rest into chunks, embeds them and upserts them, then (in
//! `FULL` mode) purges vectors of documents that disappeared.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌──────────┐   ┌───────────┐
//! │  Loader  │──▶│  Parser  │──▶│ Embedder │──▶│ Vector DB │
//! │ dir/web  │   │ by ext.  │   │ provider │   │ sqlite/mem│
//! └──────────┘   └──────────┘   └──────────┘   └───────────┘
//!        ▲                                           │
//!        └────────────── Indexer ◀───────────────────┘
//!                           │
//!                    ┌──────────────┐
//!                    │Metadata store│  collections, sources, runs
//!                    └──────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types and request bodies |
//! | [`error`] | Domain error conditions |
//! | [`loader`] | Data source discovery and staging |
//! | [`parser`] | File-to-chunk parsers |
//! | [`embedding`] | Embedding providers |
//! | [`vector_db`] | Vector storage backends |
//! | [`metadata_store`] | Collection, data source and run records |
//! | [`indexer`] | Ingestion orchestrator |
//! | [`retrieval`] | Query-time retrieval |
//! | [`server`] | HTTP API |
//! | [`db`] | SQLite connection |
//! | [`migrate`] | Schema migrations |

pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod indexer;
pub mod loader;
pub mod metadata_store;
pub mod migrate;
pub mod models;
pub mod parser;
pub mod retrieval;
pub mod server;
pub mod vector_db;
