//! `mhub` — the Matrix Hub CLI and server entry point.
//!
//! Subcommands mirror the HTTP surface so everything the API can do is also
//! scriptable: `init` (migrations), `serve` (HTTP + scheduler), `ingest` /
//! `sync`, `search`, `install`, and `remotes` management.
//!
//! Exit codes: 0 on success, 1 on operational error, 2 on misconfiguration.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use matrix_hub::config::{self, Config};
use matrix_hub::error::HubError;
use matrix_hub::executor::InstallCoordinator;
use matrix_hub::manifest::validate_manifest;
use matrix_hub::models::{SearchFilters, Uid};
use matrix_hub::scheduler::Scheduler;
use matrix_hub::search::{RerankMode, SearchMode, SearchParams};
use matrix_hub::server::{run_server, AppState};
use matrix_hub::{db, migrate, planner};

#[derive(Parser)]
#[command(
    name = "mhub",
    about = "Matrix Hub — a catalog and installer service for AI agents, tools, and MCP servers",
    version
)]
struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, default_value = "./config/hub.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema
    Init,

    /// Start the HTTP server and the background ingest scheduler
    Serve,

    /// Ingest a single index URL now
    Ingest {
        /// Index document URL
        url: String,
    },

    /// Ingest every registered remote now
    Sync,

    /// Search the catalog
    Search {
        /// Search query
        query: String,

        /// Search mode: keyword, semantic, or hybrid
        #[arg(long, default_value = "hybrid")]
        mode: String,

        /// Filter by entity type (agent, tool, mcp_server)
        #[arg(long = "type")]
        entity_type: Option<String>,

        /// Require a capability (repeatable)
        #[arg(long = "capability")]
        capabilities: Vec<String>,

        /// Maximum number of results
        #[arg(long, default_value_t = 5)]
        limit: i64,

        /// Include pending entities
        #[arg(long)]
        include_pending: bool,
    },

    /// Compute and execute an install plan for a catalog entity
    Install {
        /// Entity UID, e.g. tool:pdf@1.4.2
        id: String,

        /// Target project directory
        #[arg(long)]
        target: String,
    },

    /// Manage index remotes
    Remotes {
        #[command(subcommand)]
        action: RemotesAction,
    },
}

#[derive(Subcommand)]
enum RemotesAction {
    /// Register an index URL
    Add { url: String },
    /// List registered remotes and their last poll outcomes
    List,
    /// Remove a registered remote
    Remove { url: String },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match config::load_config(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {:#}", e);
            std::process::exit(2);
        }
    };

    if let Err(e) = run(cli.command, config).await {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(command: Commands, config: Config) -> anyhow::Result<()> {
    match command {
        Commands::Init => {
            let pool = db::connect(&config).await?;
            migrate::run_migrations(&pool, &config).await?;
            println!("Database initialized successfully.");
        }

        Commands::Serve => {
            let interval = Duration::from_secs(config.ingest.interval_minutes * 60);
            let state = AppState::build(config).await?;
            state.seed_remotes().await?;

            let scheduler =
                Scheduler::start(state.ingest.clone(), state.lease.clone(), interval);

            run_server(state, shutdown_signal()).await?;
            scheduler.stop().await;
        }

        Commands::Ingest { url } => {
            let state = AppState::build(config).await?;
            let _lease = state.lease.acquire().await;
            let outcome = state.ingest.ingest_remote(&url).await;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if !outcome.errors.is_empty() {
                anyhow::bail!("{} manifest(s) failed", outcome.errors.len());
            }
        }

        Commands::Sync => {
            let state = AppState::build(config).await?;
            let _lease = state.lease.acquire().await;
            let outcomes = state.ingest.ingest_all().await?;
            println!("{}", serde_json::to_string_pretty(&outcomes)?);
        }

        Commands::Search {
            query,
            mode,
            entity_type,
            capabilities,
            limit,
            include_pending,
        } => {
            if !(1..=100).contains(&limit) {
                anyhow::bail!("limit must be between 1 and 100");
            }
            let state = AppState::build(config).await?;
            let params = SearchParams {
                query,
                filters: SearchFilters {
                    entity_type: entity_type.as_deref().map(str::parse).transpose()?,
                    capabilities,
                    frameworks: Vec::new(),
                    providers: Vec::new(),
                    include_pending,
                },
                mode: SearchMode::parse(&mode)?,
                limit,
                with_rag: false,
                rerank: RerankMode::None,
            };

            let items = state.search.run(&params).await?;
            if items.is_empty() {
                println!("No results.");
                return Ok(());
            }
            for (i, item) in items.iter().enumerate() {
                println!("{}. [{:.3}] {}", i + 1, item.score_final, item.id);
                println!("    name: {}", item.name);
                if let Some(summary) = &item.summary {
                    println!("    summary: {}", summary);
                }
                println!(
                    "    scores: lex={:.3} sem={:.3} rec={:.3} qual={:.3}",
                    item.score_lexical, item.score_semantic, item.score_recency, item.score_quality
                );
                println!("    install: {}", item.install_url);
                println!();
            }
        }

        Commands::Install { id, target } => {
            let uid: Uid = id.parse()?;
            let state = AppState::build(config).await?;
            let entity = state
                .store
                .get(&uid.to_string())
                .await?
                .ok_or_else(|| HubError::NotFound(format!("entity {} not found", uid)))?;
            let manifest = validate_manifest(&entity.manifest)
                .map_err(|e| anyhow::anyhow!("stored manifest is invalid: {}", e))?;

            let plan = planner::derive_plan(&manifest, &target)?;
            let key = InstallCoordinator::key(&plan.uid, &plan.target);
            let executor = state.executor.clone();
            let plan_for_run = plan.clone();
            let result = state
                .installs
                .run(key, async move { executor.execute(&plan_for_run).await })
                .await?;

            for step in &result.results {
                let marker = if step.ok { "ok" } else { "FAILED" };
                println!("[{}] {} ({:.2}s)", marker, step.step, step.elapsed_secs);
                if let Some(err) = &step.stderr_excerpt {
                    if !step.ok {
                        println!("    {}", err.lines().next().unwrap_or(err));
                    }
                }
            }
            println!("files written: {}", result.files_written.len());
            for path in &result.files_written {
                println!("    {}", path);
            }
            if result.results.iter().any(|r| !r.ok) {
                anyhow::bail!("install finished with failed steps");
            }
        }

        Commands::Remotes { action } => {
            let state = AppState::build(config).await?;
            match action {
                RemotesAction::Add { url } => {
                    if url::Url::parse(&url).is_err() {
                        anyhow::bail!("'{}' is not an absolute URL", url);
                    }
                    state.store.upsert_remote(&url).await?;
                    println!("added {}", url);
                }
                RemotesAction::List => {
                    let remotes = state.store.list_remotes().await?;
                    if remotes.is_empty() {
                        println!("No remotes registered.");
                    }
                    for remote in remotes {
                        let status = remote.last_status.as_deref().unwrap_or("never polled");
                        println!("{} [{}]", remote.url, status);
                        if let Some(err) = &remote.last_error {
                            println!("    last error: {}", err);
                        }
                    }
                }
                RemotesAction::Remove { url } => {
                    if state.store.delete_remote(&url).await? {
                        println!("removed {}", url);
                    } else {
                        anyhow::bail!("remote {} is not registered", url);
                    }
                }
            }
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "cannot listen for shutdown signal");
    }
}
