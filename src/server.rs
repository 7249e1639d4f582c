//! HTTP API surface.
//!
//! Binds the catalog, search engine, ingestion engine, install executor, and
//! gateway client to the stable endpoint table:
//!
//! | Method | Path | Purpose | Auth |
//! |--------|------|---------|------|
//! | `GET`  | `/health[?check_db=true]` | liveness + optional DB probe | none |
//! | `GET`  | `/catalog/search` | hybrid search with ETag/304 | none |
//! | `GET`  | `/catalog/entities/{uid}` | full entity detail | none |
//! | `POST` | `/catalog/install` | compute + execute an install plan | optional bearer |
//! | `GET`  | `/remotes` | list registered remotes | admin |
//! | `POST` | `/remotes` | add a remote `{url}` | admin |
//! | `DELETE` | `/remotes` | remove a remote `{url}` | admin |
//! | `POST` | `/ingest` | one-shot ingest `{url}` | admin |
//! | `POST` | `/remotes/sync` | ingest all remotes | admin |
//!
//! Admin endpoints require `Authorization: Bearer <admin_token>` when the
//! token is configured; without one they are disabled unless
//! `security.allow_unauthenticated_admin` is set.
//!
//! Every request runs inside a tracing span carrying a generated correlation
//! id, so one request's events can be grepped out of interleaved logs.

use axum::extract::{Path as AxumPath, Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{HubError, HubResult};
use crate::executor::{InstallCoordinator, InstallExecutor};
use crate::ingest::IngestEngine;
use crate::manifest::validate_manifest;
use crate::models::{SearchFilters, Uid};
use crate::scheduler::IngestLease;
use crate::search::{compute_etag, RerankMode, SearchCache, SearchEngine, SearchMode, SearchParams};
use crate::store::CatalogStore;

const SEARCH_CACHE_CAPACITY: usize = 128;
const MAX_SEARCH_LIMIT: i64 = 100;

/// Shared application state; every field is cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: CatalogStore,
    pub search: SearchEngine,
    pub ingest: IngestEngine,
    pub executor: InstallExecutor,
    pub cache: Arc<SearchCache>,
    pub lease: IngestLease,
    pub installs: Arc<InstallCoordinator>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/catalog/search", get(handle_search))
        .route("/catalog/entities/{uid}", get(handle_entity))
        .route("/catalog/install", post(handle_install))
        .route(
            "/remotes",
            get(handle_remotes_list)
                .post(handle_remotes_add)
                .delete(handle_remotes_delete),
        )
        .route("/remotes/sync", post(handle_sync))
        .route("/ingest", post(handle_ingest))
        .layer(middleware::from_fn(request_context))
        .layer(cors)
        .with_state(state)
}

/// Serve until the shutdown future resolves.
pub async fn run_server(
    state: AppState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let bind_addr = state.config.server.bind.clone();

    if state.config.public_base_is_loopback() {
        warn!(
            public_base_url = %state.config.server.public_base_url,
            "public_base_url points at a loopback address; install links will not resolve for remote clients"
        );
    }

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(bind = %bind_addr, "hub listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Wrap each request in a span with a correlation id.
async fn request_context(request: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4();
    let span = tracing::info_span!(
        "request",
        id = %request_id,
        method = %request.method(),
        path = %request.uri().path(),
    );
    next.run(request).instrument(span).await
}

// ============ Auth ============

fn bearer_matches(headers: &HeaderMap, token: &str) -> bool {
    let expected = format!("Bearer {}", token);
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false)
}

fn is_admin(state: &AppState, headers: &HeaderMap) -> bool {
    match &state.config.security.admin_token {
        Some(token) => bearer_matches(headers, token),
        None => state.config.security.allow_unauthenticated_admin,
    }
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> HubResult<()> {
    match &state.config.security.admin_token {
        Some(token) => {
            if bearer_matches(headers, token) {
                Ok(())
            } else {
                Err(HubError::Unauthorized(
                    "a valid admin bearer token is required".to_string(),
                ))
            }
        }
        None if state.config.security.allow_unauthenticated_admin => Ok(()),
        None => Err(HubError::Forbidden(
            "admin endpoints are disabled: no admin token is configured".to_string(),
        )),
    }
}

// ============ GET /health ============

#[derive(Deserialize)]
struct HealthQuery {
    #[serde(default)]
    check_db: bool,
}

async fn handle_health(
    State(state): State<AppState>,
    Query(query): Query<HealthQuery>,
) -> Result<Json<Value>, HubError> {
    let db = if query.check_db {
        state.store.probe().await?;
        Some("ok")
    } else {
        None
    };

    Ok(Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "db": db,
        "diagnostics": {
            "public_base_url_loopback": state.config.public_base_is_loopback(),
        },
    })))
}

// ============ GET /catalog/search ============

#[derive(Deserialize, Default)]
struct SearchQuery {
    #[serde(default)]
    q: String,
    #[serde(rename = "type")]
    entity_type: Option<String>,
    capabilities: Option<String>,
    frameworks: Option<String>,
    providers: Option<String>,
    mode: Option<String>,
    limit: Option<i64>,
    #[serde(default)]
    include_pending: bool,
    #[serde(default)]
    with_rag: bool,
    rerank: Option<String>,
}

fn csv_set(raw: &Option<String>) -> Vec<String> {
    raw.as_deref()
        .map(|s| {
            s.split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn parse_search_params(
    state: &AppState,
    query: &SearchQuery,
    admin: bool,
) -> HubResult<SearchParams> {
    let mut limit = query.limit.unwrap_or(state.config.search.public_limit_cap);
    if !(1..=MAX_SEARCH_LIMIT).contains(&limit) {
        return Err(HubError::InvalidRequest(format!(
            "limit must be between 1 and {}",
            MAX_SEARCH_LIMIT
        )));
    }
    if !admin {
        limit = limit.min(state.config.search.public_limit_cap);
    }

    let filters = SearchFilters {
        entity_type: query
            .entity_type
            .as_deref()
            .map(FromStr::from_str)
            .transpose()?,
        capabilities: csv_set(&query.capabilities),
        frameworks: csv_set(&query.frameworks),
        providers: csv_set(&query.providers),
        include_pending: query.include_pending,
    };

    Ok(SearchParams {
        query: query.q.clone(),
        filters,
        mode: SearchMode::parse(query.mode.as_deref().unwrap_or("hybrid"))?,
        limit,
        with_rag: query.with_rag,
        rerank: RerankMode::parse(query.rerank.as_deref().unwrap_or("none"))?,
    })
}

async fn handle_search(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SearchQuery>,
) -> Result<Response, HubError> {
    let admin = is_admin(&state, &headers);
    let params = parse_search_params(&state, &query, admin)?;

    let watermark = state.store.watermark().await?;
    let etag = compute_etag(&params, watermark);

    if let Some(candidate) = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
    {
        if candidate == etag {
            return Ok((StatusCode::NOT_MODIFIED, [(header::ETAG, etag)]).into_response());
        }
    }

    if let Some(cached) = state.cache.get(&etag) {
        return Ok((
            [(header::ETAG, etag)],
            Json(json!({ "items": &*cached })),
        )
            .into_response());
    }

    let items = state.search.run(&params).await?;
    let body = json!({ "items": items });
    state.cache.put(etag.clone(), Arc::new(items));

    Ok(([(header::ETAG, etag)], Json(body)).into_response())
}

// ============ GET /catalog/entities/{uid} ============

async fn handle_entity(
    State(state): State<AppState>,
    AxumPath(uid): AxumPath<String>,
) -> Result<Response, HubError> {
    // Parse first so malformed UIDs are a 400, not a silent 404.
    let parsed: Uid = uid.parse()?;
    match state.store.get(&parsed.to_string()).await? {
        Some(entity) => Ok(Json(entity).into_response()),
        None => Err(HubError::NotFound(format!("entity {} not found", uid))),
    }
}

// ============ POST /catalog/install ============

#[derive(Deserialize)]
struct InstallRequest {
    id: Option<String>,
    manifest: Option<Value>,
    target: String,
}

async fn handle_install(
    State(state): State<AppState>,
    Json(request): Json<InstallRequest>,
) -> Result<Response, HubError> {
    if request.target.trim().is_empty() {
        return Err(HubError::InvalidRequest("target must not be empty".to_string()));
    }

    let manifest = match (&request.id, &request.manifest) {
        (Some(_), Some(_)) => {
            return Err(HubError::InvalidRequest(
                "provide either id or manifest, not both".to_string(),
            ))
        }
        (Some(uid_str), None) => {
            let uid: Uid = uid_str.parse()?;
            let entity = state
                .store
                .get(&uid.to_string())
                .await?
                .ok_or_else(|| HubError::NotFound(format!("entity {} not found", uid)))?;
            validate_manifest(&entity.manifest).map_err(|e| {
                HubError::Integrity(format!("stored manifest for {} is invalid: {}", uid, e))
            })?
        }
        (None, Some(doc)) => {
            let manifest = validate_manifest(doc)?;
            let source = format!("inline://{}", manifest.uid());
            // Inline installs register the entity but must not silently
            // overwrite a divergent catalog record.
            state
                .store
                .upsert_entity(&manifest, &source, false, false)
                .await?;
            manifest
        }
        (None, None) => {
            return Err(HubError::InvalidRequest(
                "provide an entity id or an inline manifest".to_string(),
            ))
        }
    };

    let plan = crate::planner::derive_plan(&manifest, &request.target)?;
    let key = InstallCoordinator::key(&plan.uid, &plan.target);

    // Spawned so a client disconnect does not abandon a half-applied install;
    // the lockfile always reflects whatever progress was made.
    let installs = Arc::clone(&state.installs);
    let executor = state.executor.clone();
    let handle = tokio::spawn(async move {
        installs
            .run(key, async move { executor.execute(&plan).await })
            .await
    });
    let result = handle
        .await
        .map_err(|e| HubError::Integrity(format!("install task failed: {}", e)))??;

    Ok(Json((*result).clone()).into_response())
}

// ============ Remotes ============

#[derive(Deserialize)]
struct RemoteRequest {
    url: String,
}

fn validate_remote_url(url: &str) -> HubResult<()> {
    match url::Url::parse(url) {
        Ok(u) if u.scheme() == "http" || u.scheme() == "https" => Ok(()),
        _ => Err(HubError::InvalidRequest(format!(
            "'{}' is not an absolute http(s) URL",
            url
        ))),
    }
}

async fn handle_remotes_list(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, HubError> {
    require_admin(&state, &headers)?;
    let remotes = state.store.list_remotes().await?;
    Ok(Json(json!({ "remotes": remotes })))
}

async fn handle_remotes_add(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<RemoteRequest>,
) -> Result<Json<Value>, HubError> {
    require_admin(&state, &headers)?;
    validate_remote_url(&request.url)?;
    state.store.upsert_remote(&request.url).await?;
    Ok(Json(json!({ "ok": true, "url": request.url })))
}

async fn handle_remotes_delete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<RemoteRequest>,
) -> Result<Json<Value>, HubError> {
    require_admin(&state, &headers)?;
    if !state.store.delete_remote(&request.url).await? {
        return Err(HubError::NotFound(format!(
            "remote {} is not registered",
            request.url
        )));
    }
    Ok(Json(json!({ "ok": true })))
}

// ============ Ingest ============

async fn handle_ingest(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<RemoteRequest>,
) -> Result<Json<Value>, HubError> {
    require_admin(&state, &headers)?;
    validate_remote_url(&request.url)?;

    // Ingest is background work: a client disconnect must not cancel it.
    let lease = state.lease.clone();
    let ingest = state.ingest.clone();
    let handle = tokio::spawn(async move {
        let _lease = lease.acquire().await;
        ingest.ingest_remote(&request.url).await
    });
    let outcome = handle
        .await
        .map_err(|e| HubError::Integrity(format!("ingest task failed: {}", e)))?;
    Ok(Json(json!(outcome)))
}

async fn handle_sync(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, HubError> {
    require_admin(&state, &headers)?;

    let lease = state.lease.clone();
    let ingest = state.ingest.clone();
    let handle = tokio::spawn(async move {
        let _lease = lease.acquire().await;
        ingest.ingest_all().await
    });
    let outcomes = handle
        .await
        .map_err(|e| HubError::Integrity(format!("sync task failed: {}", e)))??;
    Ok(Json(json!({ "outcomes": outcomes })))
}

// ============ State assembly ============

impl AppState {
    /// Wire every component from a loaded configuration. Fails fast on a bad
    /// database URL or unusable gateway/embedding configuration.
    pub async fn build(config: Config) -> anyhow::Result<Self> {
        let config = Arc::new(config);

        let pool = crate::db::connect(&config).await?;
        let chunks_enabled =
            config.search.vector_backend == crate::config::VectorBackend::Pgvector;
        let store = CatalogStore::new(pool, chunks_enabled);

        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.total_timeout())
            .user_agent(concat!("matrix-hub/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let gateway = match &config.gateway {
            Some(gw) => Some(Arc::new(crate::gateway::GatewayClient::new(gw.clone())?)),
            None => None,
        };

        let embedder = Arc::new(crate::embedding::EmbeddingProvider::from_config(
            &config.embedding,
        )?);

        let search = SearchEngine::new(
            store.clone(),
            Arc::clone(&config),
            Arc::clone(&embedder),
            http.clone(),
        );
        let ingest = IngestEngine::new(
            store.clone(),
            http.clone(),
            Arc::clone(&config),
            gateway.clone(),
            embedder,
        );
        let executor = InstallExecutor::new(
            http,
            gateway,
            Some(store.clone()),
            std::time::Duration::from_secs(config.install.step_timeout_secs),
        );

        Ok(AppState {
            config,
            store,
            search,
            ingest,
            executor,
            cache: Arc::new(SearchCache::new(SEARCH_CACHE_CAPACITY)),
            lease: IngestLease::new(),
            installs: Arc::new(InstallCoordinator::new()),
        })
    }

    /// Register configured remotes so the first scheduled cycle sees them.
    pub async fn seed_remotes(&self) -> HubResult<()> {
        for url in &self.config.ingest.remotes {
            self.store.upsert_remote(url).await?;
        }
        Ok(())
    }
}
