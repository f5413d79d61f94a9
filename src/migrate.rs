//! Idempotent schema setup for the SQLite-backed stores.

use anyhow::Result;
use sqlx::SqlitePool;

pub async fn run_vector_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS vector_collections (
            name TEXT PRIMARY KEY,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // One row per chunk; the embedding is little-endian f32 bytes.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS vectors (
            collection TEXT NOT NULL,
            id TEXT NOT NULL,
            data_point_fqn TEXT NOT NULL,
            data_point_hash TEXT NOT NULL,
            data_source_fqn TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            content TEXT NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            embedding BLOB NOT NULL,
            PRIMARY KEY (collection, id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_vectors_source ON vectors(collection, data_source_fqn)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_vectors_point ON vectors(collection, data_point_fqn)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Document-style tables: each row is a JSON document keyed by its identity.
pub async fn run_metadata_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS collections (
            name TEXT PRIMARY KEY,
            doc TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS data_sources (
            fqn TEXT PRIMARY KEY,
            doc TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS runs (
            name TEXT PRIMARY KEY,
            collection_name TEXT NOT NULL,
            data_source_fqn TEXT NOT NULL,
            created_at TEXT NOT NULL,
            doc TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_runs_collection ON runs(collection_name, created_at)")
        .execute(pool)
        .await?;

    Ok(())
}
