//! Database schema migrations.
//!
//! Creates all required tables (entities, embedding_chunks, remotes,
//! store_watermark) and the extension-backed indexes for the configured
//! search backends. Designed to be run via `mhub init` and safe to re-run;
//! every statement is idempotent.
//!
//! The `pg_trgm` and `vector` extensions are only created when the matching
//! backend is configured, so a hub running with both backends set to `none`
//! works against a stock Postgres.

use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::config::{Config, LexicalBackend, VectorBackend};

pub async fn run_migrations(pool: &PgPool, config: &Config) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS entities (
            uid TEXT PRIMARY KEY,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            version TEXT NOT NULL,
            name TEXT NOT NULL,
            summary TEXT,
            description TEXT,
            homepage TEXT,
            publisher TEXT,
            license TEXT,
            capabilities TEXT[] NOT NULL DEFAULT '{}',
            frameworks TEXT[] NOT NULL DEFAULT '{}',
            providers TEXT[] NOT NULL DEFAULT '{}',
            manifest JSONB NOT NULL,
            content_hash TEXT NOT NULL,
            search_text TEXT NOT NULL,
            quality_score DOUBLE PRECISION NOT NULL DEFAULT 0,
            pending BOOLEAN NOT NULL DEFAULT FALSE,
            source_url TEXT NOT NULL,
            source_commit TEXT,
            gateway_registered_at TIMESTAMPTZ,
            gateway_error TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            UNIQUE (entity_type, entity_id, version)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_entities_type ON entities(entity_type)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_entities_updated_at ON entities(updated_at DESC)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS remotes (
            url TEXT PRIMARY KEY,
            last_fetched_at TIMESTAMPTZ,
            last_etag TEXT,
            last_status TEXT,
            last_error TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS store_watermark (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            value BIGINT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query("INSERT INTO store_watermark (id, value) VALUES (1, 0) ON CONFLICT (id) DO NOTHING")
        .execute(pool)
        .await?;

    if config.search.lexical_backend == LexicalBackend::Pgtrgm {
        sqlx::query("CREATE EXTENSION IF NOT EXISTS pg_trgm")
            .execute(pool)
            .await
            .context("pg_trgm extension unavailable; set search.lexical_backend = \"none\" or install it")?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_entities_search_trgm \
             ON entities USING gin (search_text gin_trgm_ops)",
        )
        .execute(pool)
        .await?;
    }

    if config.search.vector_backend == VectorBackend::Pgvector {
        sqlx::query("CREATE EXTENSION IF NOT EXISTS vector")
            .execute(pool)
            .await
            .context("vector extension unavailable; set search.vector_backend = \"none\" or install it")?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS embedding_chunks (
                entity_uid TEXT NOT NULL REFERENCES entities(uid) ON DELETE CASCADE,
                chunk_ordinal INTEGER NOT NULL,
                source TEXT NOT NULL,
                text TEXT NOT NULL,
                embedding vector,
                PRIMARY KEY (entity_uid, chunk_ordinal)
            )
            "#,
        )
        .execute(pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_chunks_entity_uid ON embedding_chunks(entity_uid)",
        )
        .execute(pool)
        .await?;
    }

    Ok(())
}
