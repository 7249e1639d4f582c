//! Ingestion engine.
//!
//! Coordinates the full pull flow per remote: conditional index fetch →
//! shape detection → manifest fetch/validate → content-addressed upsert →
//! optional tool derivation → best-effort gateway registration.
//!
//! Failures are per-item: one bad manifest never aborts the cycle. A
//! remote-wide failure (index unreachable, auth rejected) short-circuits that
//! remote with its outcome recorded on the remotes table. Gateway
//! registration is enqueued as a detached task; ingestion does not wait on
//! it.

use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};
use url::Url;

use crate::chunker::chunk_entity;
use crate::config::{Config, VectorBackend};
use crate::embedding::EmbeddingProvider;
use crate::error::{HubError, HubResult};
use crate::gateway::GatewayClient;
use crate::index_doc::collect_manifest_urls;
use crate::manifest::{parse_document, validate_manifest, Manifest, McpRegistration};
use crate::models::{EntityType, UpsertOutcome};
use crate::store::CatalogStore;

/// Overall status of one remote poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    Ok,
    Partial,
    Error,
    NotModified,
}

impl IngestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestStatus::Ok => "ok",
            IngestStatus::Partial => "partial",
            IngestStatus::Error => "error",
            IngestStatus::NotModified => "not_modified",
        }
    }
}

/// Counts and errors for one remote poll.
#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub url: String,
    pub status: IngestStatus,
    pub manifests_seen: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub derived: usize,
    pub errors: Vec<String>,
}

impl IngestOutcome {
    fn failed(url: &str, message: String) -> Self {
        Self {
            url: url.to_string(),
            status: IngestStatus::Error,
            manifests_seen: 0,
            created: 0,
            updated: 0,
            unchanged: 0,
            derived: 0,
            errors: vec![message],
        }
    }
}

/// Result of processing a single manifest URL within a cycle.
struct ManifestResult {
    outcome: UpsertOutcome,
    derived: bool,
    /// UIDs to mark once the enqueued gateway registration finishes.
    registration: Option<(Vec<String>, McpRegistration)>,
}

#[derive(Clone)]
pub struct IngestEngine {
    store: CatalogStore,
    http: reqwest::Client,
    config: Arc<Config>,
    gateway: Option<Arc<GatewayClient>>,
    embedder: Arc<EmbeddingProvider>,
}

impl IngestEngine {
    pub fn new(
        store: CatalogStore,
        http: reqwest::Client,
        config: Arc<Config>,
        gateway: Option<Arc<GatewayClient>>,
        embedder: Arc<EmbeddingProvider>,
    ) -> Self {
        Self {
            store,
            http,
            config,
            gateway,
            embedder,
        }
    }

    /// Poll every registered remote in sequence. Callers are responsible for
    /// holding the single-writer lease.
    pub async fn ingest_all(&self) -> HubResult<Vec<IngestOutcome>> {
        let remotes = self.store.list_remotes().await?;
        let mut outcomes = Vec::with_capacity(remotes.len());
        for remote in remotes {
            outcomes.push(self.ingest_remote(&remote.url).await);
        }
        Ok(outcomes)
    }

    /// Poll one index URL: conditional GET, shape detection, then bounded
    /// parallel manifest processing.
    pub async fn ingest_remote(&self, url_str: &str) -> IngestOutcome {
        let index_url = match Url::parse(url_str) {
            Ok(u) if u.scheme() == "http" || u.scheme() == "https" => u,
            _ => {
                return IngestOutcome::failed(
                    url_str,
                    format!("'{}' is not an absolute http(s) URL", url_str),
                )
            }
        };

        let remote = self.store.get_remote(url_str).await.ok().flatten();
        let is_registered_remote = remote.is_some();
        let known_etag = remote.and_then(|r| r.last_etag);

        let mut request = self.http.get(index_url.clone());
        if let Some(etag) = &known_etag {
            request = request.header(reqwest::header::IF_NONE_MATCH, etag);
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                let outcome =
                    IngestOutcome::failed(url_str, format!("index fetch failed: {}", e));
                self.record_poll(is_registered_remote, url_str, &outcome, None)
                    .await;
                return outcome;
            }
        };

        if response.status() == reqwest::StatusCode::NOT_MODIFIED {
            let outcome = IngestOutcome {
                url: url_str.to_string(),
                status: IngestStatus::NotModified,
                manifests_seen: 0,
                created: 0,
                updated: 0,
                unchanged: 0,
                derived: 0,
                errors: Vec::new(),
            };
            self.record_poll(is_registered_remote, url_str, &outcome, None)
                .await;
            return outcome;
        }

        if !response.status().is_success() {
            let outcome = IngestOutcome::failed(
                url_str,
                format!("index returned HTTP {}", response.status()),
            );
            self.record_poll(is_registered_remote, url_str, &outcome, None)
                .await;
            return outcome;
        }

        let fresh_etag = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let doc: Value = match response.json().await {
            Ok(v) => v,
            Err(e) => {
                let outcome =
                    IngestOutcome::failed(url_str, format!("index body is not JSON: {}", e));
                self.record_poll(is_registered_remote, url_str, &outcome, None)
                    .await;
                return outcome;
            }
        };

        let manifest_urls = match collect_manifest_urls(&doc, &index_url) {
            Ok(urls) => urls,
            Err(e) => {
                let outcome = IngestOutcome::failed(url_str, e.to_string());
                self.record_poll(is_registered_remote, url_str, &outcome, fresh_etag.as_deref())
                    .await;
                return outcome;
            }
        };

        let mut outcome = IngestOutcome {
            url: url_str.to_string(),
            status: IngestStatus::Ok,
            manifests_seen: manifest_urls.len(),
            created: 0,
            updated: 0,
            unchanged: 0,
            derived: 0,
            errors: Vec::new(),
        };

        // Bounded worker pool over manifests.
        let semaphore = Arc::new(Semaphore::new(self.config.ingest.worker_pool.max(1)));
        let mut join_set: JoinSet<Result<ManifestResult, String>> = JoinSet::new();

        for manifest_url in manifest_urls {
            let engine = self.clone();
            let semaphore = Arc::clone(&semaphore);
            join_set.spawn(async move {
                let _permit = semaphore.acquire().await;
                engine
                    .process_manifest(&manifest_url)
                    .await
                    .map_err(|e| format!("{}: {}", manifest_url, e))
            });
        }

        let mut registrations: Vec<(Vec<String>, McpRegistration)> = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Ok(result)) => {
                    match result.outcome {
                        UpsertOutcome::Created => outcome.created += 1,
                        UpsertOutcome::Updated => outcome.updated += 1,
                        UpsertOutcome::Unchanged => outcome.unchanged += 1,
                    }
                    if result.derived {
                        outcome.derived += 1;
                    }
                    if let Some(reg) = result.registration {
                        registrations.push(reg);
                    }
                }
                Ok(Err(message)) => outcome.errors.push(message),
                Err(e) => outcome.errors.push(format!("worker panicked: {}", e)),
            }
        }

        // Best-effort gateway registration; the cycle does not wait on it.
        for (uids, reg) in registrations {
            self.spawn_registration(uids, reg);
        }

        outcome.status = if outcome.errors.is_empty() {
            IngestStatus::Ok
        } else if outcome.created + outcome.updated + outcome.unchanged > 0 {
            IngestStatus::Partial
        } else {
            IngestStatus::Error
        };

        self.record_poll(is_registered_remote, url_str, &outcome, fresh_etag.as_deref())
            .await;

        info!(
            remote = url_str,
            status = outcome.status.as_str(),
            seen = outcome.manifests_seen,
            created = outcome.created,
            updated = outcome.updated,
            errors = outcome.errors.len(),
            "ingest cycle for remote finished"
        );

        outcome
    }

    /// Fetch, validate, and upsert one manifest. Returns a per-item error
    /// string on failure so the cycle can keep going.
    async fn process_manifest(&self, manifest_url: &Url) -> Result<ManifestResult, HubError> {
        let response = self.http.get(manifest_url.clone()).send().await?;
        if !response.status().is_success() {
            return Err(HubError::RemoteFailure(format!(
                "manifest returned HTTP {}",
                response.status()
            )));
        }
        let body = response.text().await?;
        let doc = parse_document(&body)?;
        let manifest = validate_manifest(&doc)?;

        // A broken derivation never blocks the primary entity.
        let derived_manifest = match self.derive_tool(&manifest) {
            Ok(d) => d,
            Err(e) => {
                warn!(uid = %manifest.uid(), error = %e, "tool derivation failed");
                None
            }
        };

        let (primary, derived) = match &derived_manifest {
            Some(d) => {
                let (p, d2) = self
                    .store
                    .upsert_with_derived(&manifest, d, manifest_url.as_str())
                    .await?;
                (p, Some(d2))
            }
            None => {
                let p = self
                    .store
                    .upsert_entity(&manifest, manifest_url.as_str(), false, true)
                    .await?;
                (p, None)
            }
        };

        let (uid, outcome) = primary;

        if outcome != UpsertOutcome::Unchanged {
            self.refresh_chunks(&uid.to_string(), &manifest).await;
        }

        let registration = manifest
            .mcp_registration
            .as_ref()
            .filter(|reg| reg.server.as_ref().is_some_and(|s| s.url.is_some()))
            .map(|reg| {
                let mut uids = vec![uid.to_string()];
                if let Some((derived_uid, _)) = &derived {
                    uids.push(derived_uid.to_string());
                }
                (uids, reg.clone())
            });

        Ok(ManifestResult {
            outcome,
            derived: derived.is_some(),
            registration,
        })
    }

    /// Build the synthetic `tool` manifest an `mcp_server` yields when
    /// derivation is enabled. The tool inherits provenance and classification
    /// and points back at the server through its implementation block.
    fn derive_tool(&self, manifest: &Manifest) -> HubResult<Option<Manifest>> {
        if !self.config.ingest.derive_tools_from_mcp
            || manifest.entity_type != EntityType::McpServer
        {
            return Ok(None);
        }
        let Some(reg) = &manifest.mcp_registration else {
            return Ok(None);
        };
        let Some(tool) = &reg.tool else {
            return Ok(None);
        };

        let doc = json!({
            "schema_version": manifest.raw.get("schema_version").cloned().unwrap_or(json!(1)),
            "type": "tool",
            "id": tool.id,
            "version": manifest.version,
            "name": tool.name.clone().unwrap_or_else(|| tool.id.clone()),
            "summary": tool.description,
            "capabilities": manifest.capabilities,
            "frameworks": manifest.frameworks,
            "providers": manifest.providers,
            "implementation": {
                "runtime": "mcp",
                "entrypoint": manifest.uid().to_string()
            }
        });

        let derived = validate_manifest(&doc).map_err(|e| {
            HubError::InvalidRequest(format!(
                "derived tool from {} is invalid: {}",
                manifest.uid(),
                e
            ))
        })?;
        Ok(Some(derived))
    }

    /// Re-chunk and re-embed an entity after a material change. Non-fatal:
    /// a failed embedding never fails the ingest item.
    async fn refresh_chunks(&self, uid: &str, manifest: &Manifest) {
        if self.config.search.vector_backend != VectorBackend::Pgvector
            || !self.embedder.is_enabled()
        {
            return;
        }

        let mut chunks = chunk_entity(uid, manifest);
        if chunks.is_empty() {
            return;
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        match self
            .embedder
            .embed_texts(&self.config.embedding, &texts)
            .await
        {
            Ok(vectors) if vectors.len() == chunks.len() => {
                for (chunk, vector) in chunks.iter_mut().zip(vectors) {
                    chunk.vector = Some(vector);
                }
                if let Err(e) = self.store.replace_chunks(uid, &chunks).await {
                    warn!(uid = uid, error = %e, "failed to store embedding chunks");
                }
            }
            Ok(vectors) => {
                warn!(
                    uid = uid,
                    expected = chunks.len(),
                    got = vectors.len(),
                    "embedding batch size mismatch; skipping chunks"
                );
            }
            Err(e) => {
                warn!(uid = uid, error = %e, "embedding failed; entity stays lexical-only");
            }
        }
    }

    fn spawn_registration(&self, uids: Vec<String>, reg: McpRegistration) {
        let Some(gateway) = self.gateway.clone() else {
            return;
        };
        let store = self.store.clone();
        tokio::spawn(async move {
            let report = gateway.register(&reg).await;
            let err = report.error_summary();
            for uid in &uids {
                if let Err(e) = store
                    .mark_gateway_registered(uid, report.ok, err.as_deref())
                    .await
                {
                    warn!(uid = %uid, error = %e, "failed to record gateway outcome");
                }
            }
            if report.ok {
                info!(uids = ?uids, "gateway registration succeeded");
            } else {
                warn!(uids = ?uids, error = ?err, "gateway registration failed");
            }
        });
    }

    async fn record_poll(
        &self,
        is_registered: bool,
        url: &str,
        outcome: &IngestOutcome,
        etag: Option<&str>,
    ) {
        // One-shot ingests of unregistered URLs leave no remote row behind.
        if !is_registered {
            return;
        }
        let err = if outcome.errors.is_empty() {
            None
        } else {
            Some(outcome.errors.join("; "))
        };
        if let Err(e) = self
            .store
            .record_remote_poll(url, outcome.status.as_str(), etag, err.as_deref())
            .await
        {
            warn!(remote = url, error = %e, "failed to record remote poll");
        }
    }
}
