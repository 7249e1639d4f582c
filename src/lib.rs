//! # Matrix Hub
//!
//! **A catalog and installer service for a marketplace of AI agents, tools,
//! and MCP servers.**
//!
//! Matrix Hub ingests manifest documents from remote index URLs on a
//! schedule, normalizes them into a queryable Postgres catalog, serves a
//! hybrid (lexical + semantic) ranked search over that catalog, derives and
//! executes per-entity install plans against a local filesystem target, and
//! idempotently registers runtime artifacts with an external MCP Gateway
//! admin API.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────────┐   ┌────────────┐
//! │ Remotes  │──▶│   Ingestion    │──▶│  Postgres   │
//! │ (index   │   │ fetch/validate │   │ pg_trgm +   │
//! │  URLs)   │   │ upsert/derive  │   │ pgvector    │
//! └──────────┘   └───────┬───────┘   └─────┬──────┘
//!                        │                  │
//!                  ┌─────▼─────┐      ┌─────▼─────┐      ┌──────────┐
//!                  │  Gateway  │      │  Search    │      │ Install  │
//!                  │  client   │      │  engine    │      │ planner/ │
//!                  │ (best-    │      │ (fusion +  │      │ executor │
//!                  │  effort)  │      │  ETag)     │      │ +lockfile│
//!                  └───────────┘      └─────┬─────┘      └────┬─────┘
//!                                            │                 │
//!                                      ┌─────▼─────────────────▼─────┐
//!                                      │       HTTP API (Axum)        │
//!                                      └──────────────────────────────┘
//! ```
//!
//! ## Data Flow
//!
//! 1. The **scheduler** ([`scheduler`]) fires ingest cycles under a
//!    single-writer lease; manual triggers share the same lease.
//! 2. The **ingestion engine** ([`ingest`]) performs conditional GETs against
//!    each remote, recognizes the three accepted index shapes
//!    ([`index_doc`]), validates manifests ([`manifest`]), and upserts
//!    entities through the **catalog store** ([`store`]).
//! 3. Entities are optionally chunked ([`chunker`]) and embedded
//!    ([`embedding`]) for the semantic backend.
//! 4. The **search engine** ([`search`]) unions lexical and semantic
//!    candidates, fuses scores with recency and quality priors, and caches
//!    responses behind watermark-derived ETags.
//! 5. The **planner** ([`planner`]) derives deterministic install plans; the
//!    **executor** ([`executor`]) runs them against a confined target and
//!    emits `matrix.lock.json`.
//! 6. The **gateway client** ([`gateway`]) registers tools, resources,
//!    prompts, and federated gateways, resolving IDs across 409 conflicts.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration with env overrides and validation |
//! | [`error`] | Typed error enum and HTTP error contract |
//! | [`models`] | Core data types: `Entity`, `Uid`, `Remote`, filters |
//! | [`manifest`] | Manifest schema types and the pure validator |
//! | [`db`] | Postgres connection pool |
//! | [`migrate`] | Idempotent schema migrations |
//! | [`store`] | Catalog store: upserts, search SQL, remotes, watermark |
//! | [`chunker`] | Entity text chunking for embeddings |
//! | [`embedding`] | Embedding providers (openai, ollama, disabled) |
//! | [`index_doc`] | The three accepted index-document shapes |
//! | [`ingest`] | Ingestion engine and tool derivation |
//! | [`scheduler`] | Periodic ingest with a single-writer lease |
//! | [`search`] | Hybrid ranking, ETag contract, result cache |
//! | [`planner`] | Pure install-plan derivation |
//! | [`executor`] | Stepwise plan execution, lockfile, coalescing |
//! | [`gateway`] | MCP Gateway admin-API client |
//! | [`server`] | Axum HTTP surface and state assembly |

pub mod chunker;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod executor;
pub mod gateway;
pub mod index_doc;
pub mod ingest;
pub mod manifest;
pub mod migrate;
pub mod models;
pub mod planner;
pub mod scheduler;
pub mod search;
pub mod server;
pub mod store;
