//! Catalog store: the single owner of persistence.
//!
//! Ingestion and install write through this type; search reads from it. All
//! multi-statement operations run in a transaction, and every materializing
//! write advances the store watermark inside that same transaction, which is
//! what invalidates search ETags.
//!
//! Upserts are idempotent for identical content: the canonicalized manifest is
//! hashed, and a matching `content_hash` short-circuits before any row is
//! touched, so `updated_at` only advances on material change.
//!
//! Lexical ranking is delegated to `pg_trgm` similarity over the denormalized
//! `search_text` column; semantic ranking to `pgvector` cosine distance over
//! `embedding_chunks`, max-pooled to entity level.

use chrono::{DateTime, Utc};
use pgvector::Vector;
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::str::FromStr;

use crate::error::{HubError, HubResult};
use crate::manifest::Manifest;
use crate::models::{
    EmbeddingChunk, Entity, EntityType, Remote, SearchFilters, Uid, UpsertOutcome,
};

/// A lexical or semantic candidate: entity UID plus the backend's raw score.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub uid: String,
    pub score: f64,
}

#[derive(Clone)]
pub struct CatalogStore {
    pool: PgPool,
    /// Whether the `embedding_chunks` table exists (vector backend enabled).
    chunks_enabled: bool,
}

impl CatalogStore {
    pub fn new(pool: PgPool, chunks_enabled: bool) -> Self {
        Self {
            pool,
            chunks_enabled,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Cheap liveness probe used by `/health?check_db=true`.
    pub async fn probe(&self) -> HubResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    // ============ Watermark ============

    /// Current watermark value. Monotonically advances on any write.
    pub async fn watermark(&self) -> HubResult<i64> {
        let value: i64 = sqlx::query_scalar("SELECT value FROM store_watermark WHERE id = 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(value)
    }

    async fn bump_watermark(tx: &mut Transaction<'_, Postgres>) -> HubResult<()> {
        sqlx::query("UPDATE store_watermark SET value = value + 1 WHERE id = 1")
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    // ============ Entities ============

    /// Insert or update an entity from a validated manifest.
    ///
    /// Identical content is a no-op (`Unchanged`); nothing is written and the
    /// watermark does not move. With `allow_update = false` (inline installs),
    /// an existing UID with divergent content is a `Conflict` instead of an
    /// update — callers that own the UID's source of truth (ingestion) pass
    /// `true`.
    ///
    /// On material change any stored embedding chunks are dropped; the caller
    /// re-chunks afterwards.
    pub async fn upsert_entity(
        &self,
        manifest: &Manifest,
        source_url: &str,
        pending: bool,
        allow_update: bool,
    ) -> HubResult<(Uid, UpsertOutcome)> {
        let mut tx = self.pool.begin().await?;
        let result = self
            .upsert_in_tx(&mut tx, manifest, source_url, pending, allow_update)
            .await?;
        if result.1 != UpsertOutcome::Unchanged {
            Self::bump_watermark(&mut tx).await?;
        }
        tx.commit().await?;
        Ok(result)
    }

    /// Upsert a primary manifest and a derived companion (the synthetic
    /// `tool` yielded by an `mcp_server`) atomically: both land, or neither.
    pub async fn upsert_with_derived(
        &self,
        primary: &Manifest,
        derived: &Manifest,
        source_url: &str,
    ) -> HubResult<((Uid, UpsertOutcome), (Uid, UpsertOutcome))> {
        let mut tx = self.pool.begin().await?;
        let first = self
            .upsert_in_tx(&mut tx, primary, source_url, false, true)
            .await?;
        let second = self
            .upsert_in_tx(&mut tx, derived, source_url, true, true)
            .await?;
        if first.1 != UpsertOutcome::Unchanged || second.1 != UpsertOutcome::Unchanged {
            Self::bump_watermark(&mut tx).await?;
        }
        tx.commit().await?;
        Ok((first, second))
    }

    async fn upsert_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        manifest: &Manifest,
        source_url: &str,
        pending: bool,
        allow_update: bool,
    ) -> HubResult<(Uid, UpsertOutcome)> {
        let uid = manifest.uid();
        let uid_str = uid.to_string();
        let content_hash = content_hash(&manifest.raw);
        let search_text = build_search_text(manifest);
        let quality = manifest.quality_score.unwrap_or(0.0).clamp(0.0, 1.0);
        let source_commit = manifest
            .raw
            .get("source_commit")
            .and_then(Value::as_str)
            .map(|s| s.to_string());

        let existing: Option<String> =
            sqlx::query_scalar("SELECT content_hash FROM entities WHERE uid = $1 FOR UPDATE")
                .bind(&uid_str)
                .fetch_optional(&mut **tx)
                .await?;

        match &existing {
            Some(h) if *h == content_hash => {
                return Ok((uid, UpsertOutcome::Unchanged));
            }
            Some(_) if !allow_update => {
                return Err(HubError::Conflict(format!(
                    "entity {} already exists with different content; re-ingest it from its source instead",
                    uid_str
                )));
            }
            _ => {}
        }

        sqlx::query(
            r#"
            INSERT INTO entities (
                uid, entity_type, entity_id, version, name,
                summary, description, homepage, publisher, license,
                capabilities, frameworks, providers,
                manifest, content_hash, search_text, quality_score,
                pending, source_url, source_commit
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                    $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
            ON CONFLICT (uid) DO UPDATE SET
                name = excluded.name,
                summary = excluded.summary,
                description = excluded.description,
                homepage = excluded.homepage,
                publisher = excluded.publisher,
                license = excluded.license,
                capabilities = excluded.capabilities,
                frameworks = excluded.frameworks,
                providers = excluded.providers,
                manifest = excluded.manifest,
                content_hash = excluded.content_hash,
                search_text = excluded.search_text,
                quality_score = excluded.quality_score,
                pending = entities.pending AND excluded.pending,
                source_url = excluded.source_url,
                source_commit = excluded.source_commit,
                updated_at = now()
            "#,
        )
        .bind(&uid_str)
        .bind(uid.entity_type.as_str())
        .bind(&uid.id)
        .bind(&uid.version)
        .bind(&manifest.name)
        .bind(&manifest.summary)
        .bind(&manifest.description)
        .bind(&manifest.homepage)
        .bind(&manifest.publisher)
        .bind(&manifest.license)
        .bind(&manifest.capabilities)
        .bind(&manifest.frameworks)
        .bind(&manifest.providers)
        .bind(&manifest.raw)
        .bind(&content_hash)
        .bind(&search_text)
        .bind(quality)
        .bind(pending)
        .bind(source_url)
        .bind(&source_commit)
        .execute(&mut **tx)
        .await?;

        if self.chunks_enabled && existing.is_some() {
            sqlx::query("DELETE FROM embedding_chunks WHERE entity_uid = $1")
                .bind(&uid_str)
                .execute(&mut **tx)
                .await?;
        }

        let outcome = if existing.is_some() {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Created
        };
        Ok((uid, outcome))
    }

    pub async fn get(&self, uid: &str) -> HubResult<Option<Entity>> {
        let row = sqlx::query("SELECT * FROM entities WHERE uid = $1")
            .bind(uid)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_entity(&r)).transpose()
    }

    pub async fn get_many(&self, uids: &[String]) -> HubResult<Vec<Entity>> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query("SELECT * FROM entities WHERE uid = ANY($1)")
            .bind(uids)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_entity).collect()
    }

    pub async fn list_by_type(
        &self,
        entity_type: EntityType,
        limit: i64,
        offset: i64,
    ) -> HubResult<Vec<Entity>> {
        let rows = sqlx::query(
            "SELECT * FROM entities WHERE entity_type = $1 \
             ORDER BY updated_at DESC, uid ASC LIMIT $2 OFFSET $3",
        )
        .bind(entity_type.as_str())
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_entity).collect()
    }

    /// Record a gateway registration attempt. Success clears `pending` and
    /// stamps `gateway_registered_at`; failure keeps prior state and stores
    /// the error.
    pub async fn mark_gateway_registered(
        &self,
        uid: &str,
        ok: bool,
        err: Option<&str>,
    ) -> HubResult<()> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE entities SET
                gateway_registered_at = CASE WHEN $2 THEN now() ELSE gateway_registered_at END,
                gateway_error = $3,
                pending = pending AND NOT $2
            WHERE uid = $1
            "#,
        )
        .bind(uid)
        .bind(ok)
        .bind(err)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(HubError::NotFound(format!("entity {} not found", uid)));
        }

        Self::bump_watermark(&mut tx).await?;
        tx.commit().await?;
        Ok(())
    }

    // ============ Search backends ============

    /// Trigram similarity over `search_text`, filtered in SQL.
    pub async fn search_lexical(
        &self,
        query: &str,
        filters: &SearchFilters,
        k: i64,
    ) -> HubResult<Vec<Candidate>> {
        let rows = sqlx::query(
            r#"
            SELECT uid, similarity(search_text, $1)::float8 AS score
            FROM entities
            WHERE similarity(search_text, $1) > 0
              AND ($2::text IS NULL OR entity_type = $2)
              AND (cardinality($3::text[]) = 0 OR capabilities @> $3)
              AND (cardinality($4::text[]) = 0 OR frameworks @> $4)
              AND (cardinality($5::text[]) = 0 OR providers @> $5)
              AND (NOT pending OR $6::bool)
            ORDER BY score DESC, created_at DESC, uid ASC
            LIMIT $7
            "#,
        )
        .bind(query)
        .bind(filters.entity_type.map(|t| t.as_str().to_string()))
        .bind(&filters.capabilities)
        .bind(&filters.frameworks)
        .bind(&filters.providers)
        .bind(filters.include_pending)
        .bind(k)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| Candidate {
                uid: r.get("uid"),
                score: r.get("score"),
            })
            .collect())
    }

    /// Cosine similarity between the query vector and stored chunk embeddings,
    /// max-pooled per entity.
    pub async fn search_semantic(
        &self,
        query_vec: &[f32],
        filters: &SearchFilters,
        k: i64,
    ) -> HubResult<Vec<Candidate>> {
        if !self.chunks_enabled {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT e.uid, MAX(1 - (c.embedding <=> $1))::float8 AS score
            FROM embedding_chunks c
            JOIN entities e ON e.uid = c.entity_uid
            WHERE c.embedding IS NOT NULL
              AND ($2::text IS NULL OR e.entity_type = $2)
              AND (cardinality($3::text[]) = 0 OR e.capabilities @> $3)
              AND (cardinality($4::text[]) = 0 OR e.frameworks @> $4)
              AND (cardinality($5::text[]) = 0 OR e.providers @> $5)
              AND (NOT e.pending OR $6::bool)
            GROUP BY e.uid
            ORDER BY score DESC
            LIMIT $7
            "#,
        )
        .bind(Vector::from(query_vec.to_vec()))
        .bind(filters.entity_type.map(|t| t.as_str().to_string()))
        .bind(&filters.capabilities)
        .bind(&filters.frameworks)
        .bind(&filters.providers)
        .bind(filters.include_pending)
        .bind(k)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| Candidate {
                uid: r.get("uid"),
                score: r.get("score"),
            })
            .collect())
    }

    /// Best-matching chunk texts for one entity, used for RAG fit reasons.
    pub async fn top_chunks(
        &self,
        uid: &str,
        query_vec: &[f32],
        k: i64,
    ) -> HubResult<Vec<String>> {
        if !self.chunks_enabled {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            "SELECT text FROM embedding_chunks \
             WHERE entity_uid = $1 AND embedding IS NOT NULL \
             ORDER BY embedding <=> $2 LIMIT $3",
        )
        .bind(uid)
        .bind(Vector::from(query_vec.to_vec()))
        .bind(k)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get("text")).collect())
    }

    /// Replace all chunks for an entity in one transaction.
    pub async fn replace_chunks(&self, uid: &str, chunks: &[EmbeddingChunk]) -> HubResult<()> {
        if !self.chunks_enabled {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM embedding_chunks WHERE entity_uid = $1")
            .bind(uid)
            .execute(&mut *tx)
            .await?;

        for chunk in chunks {
            sqlx::query(
                "INSERT INTO embedding_chunks (entity_uid, chunk_ordinal, source, text, embedding) \
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(&chunk.entity_uid)
            .bind(chunk.chunk_ordinal)
            .bind(chunk.source.as_str())
            .bind(&chunk.text)
            .bind(chunk.vector.clone().map(Vector::from))
            .execute(&mut *tx)
            .await?;
        }

        Self::bump_watermark(&mut tx).await?;
        tx.commit().await?;
        Ok(())
    }

    // ============ Remotes ============

    pub async fn upsert_remote(&self, url: &str) -> HubResult<()> {
        sqlx::query("INSERT INTO remotes (url) VALUES ($1) ON CONFLICT (url) DO NOTHING")
            .bind(url)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_remote(&self, url: &str) -> HubResult<bool> {
        let result = sqlx::query("DELETE FROM remotes WHERE url = $1")
            .bind(url)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_remotes(&self) -> HubResult<Vec<Remote>> {
        let rows = sqlx::query(
            "SELECT url, last_fetched_at, last_etag, last_status, last_error \
             FROM remotes ORDER BY url",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| Remote {
                url: r.get("url"),
                last_fetched_at: r.get("last_fetched_at"),
                last_etag: r.get("last_etag"),
                last_status: r.get("last_status"),
                last_error: r.get("last_error"),
            })
            .collect())
    }

    pub async fn get_remote(&self, url: &str) -> HubResult<Option<Remote>> {
        let row = sqlx::query(
            "SELECT url, last_fetched_at, last_etag, last_status, last_error \
             FROM remotes WHERE url = $1",
        )
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| Remote {
            url: r.get("url"),
            last_fetched_at: r.get("last_fetched_at"),
            last_etag: r.get("last_etag"),
            last_status: r.get("last_status"),
            last_error: r.get("last_error"),
        }))
    }

    /// Record the outcome of one poll. The stored ETag is only replaced when
    /// the poll produced a fresh one, so a `304` keeps the old validator.
    pub async fn record_remote_poll(
        &self,
        url: &str,
        status: &str,
        etag: Option<&str>,
        err: Option<&str>,
    ) -> HubResult<()> {
        sqlx::query(
            r#"
            UPDATE remotes SET
                last_fetched_at = now(),
                last_status = $2,
                last_etag = COALESCE($3, last_etag),
                last_error = $4
            WHERE url = $1
            "#,
        )
        .bind(url)
        .bind(status)
        .bind(etag)
        .bind(err)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ============ Helpers ============

fn row_to_entity(row: &sqlx::postgres::PgRow) -> HubResult<Entity> {
    let entity_type_str: String = row.get("entity_type");
    let created_at: DateTime<Utc> = row.get("created_at");
    let updated_at: DateTime<Utc> = row.get("updated_at");

    Ok(Entity {
        uid: row.get("uid"),
        entity_type: EntityType::from_str(&entity_type_str)
            .map_err(|_| HubError::Integrity(format!("bad entity_type '{}'", entity_type_str)))?,
        id: row.get("entity_id"),
        version: row.get("version"),
        name: row.get("name"),
        summary: row.get("summary"),
        description: row.get("description"),
        homepage: row.get("homepage"),
        publisher: row.get("publisher"),
        license: row.get("license"),
        capabilities: row.get("capabilities"),
        frameworks: row.get("frameworks"),
        providers: row.get("providers"),
        manifest: row.get("manifest"),
        quality_score: row.get("quality_score"),
        pending: row.get("pending"),
        source_url: row.get("source_url"),
        source_commit: row.get("source_commit"),
        gateway_registered_at: row.get("gateway_registered_at"),
        gateway_error: row.get("gateway_error"),
        created_at,
        updated_at,
    })
}

/// SHA-256 over a key-sorted rendering of the manifest, so hash equality
/// means semantic equality regardless of document key order.
pub fn content_hash(doc: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(doc).as_bytes());
    format!("{:x}", hasher.finalize())
}

fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).expect("string serializes"),
                        canonical_json(&map[k.as_str()])
                    )
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", rendered.join(","))
        }
        other => serde_json::to_string(other).expect("scalar serializes"),
    }
}

/// Composite field backing the trigram index:
/// `name || summary || description || capabilities`.
fn build_search_text(manifest: &Manifest) -> String {
    let mut parts: Vec<&str> = vec![manifest.name.as_str()];
    if let Some(s) = &manifest.summary {
        parts.push(s);
    }
    if let Some(d) = &manifest.description {
        parts.push(d);
    }
    for cap in &manifest.capabilities {
        parts.push(cap);
    }
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::validate_manifest;
    use serde_json::json;

    #[test]
    fn content_hash_ignores_key_order() {
        let a = json!({"b": 1, "a": {"y": [1, 2], "x": "v"}});
        let b = json!({"a": {"x": "v", "y": [1, 2]}, "b": 1});
        assert_eq!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn content_hash_detects_material_change() {
        let a = json!({"a": 1});
        let b = json!({"a": 2});
        assert_ne!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn search_text_includes_capabilities() {
        let doc = json!({
            "schema_version": 1,
            "type": "tool",
            "id": "pdf",
            "version": "1.4.2",
            "name": "PDF Summarizer",
            "summary": "Summarize PDFs",
            "capabilities": ["pdf", "summarize"],
            "implementation": {"runtime": "python3.11", "entrypoint": "x:y"}
        });
        let m = validate_manifest(&doc).unwrap();
        let text = build_search_text(&m);
        assert!(text.contains("PDF Summarizer"));
        assert!(text.contains("pdf"));
        assert!(text.contains("summarize"));
    }
}
