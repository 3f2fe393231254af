//! # Container Fleet
//!
//! A retrieval service that groups a tenant's documents into named
//! "containers," ingests them through a chunk/embed/dedup pipeline, and
//! exposes hybrid (keyword + vector + graph) search over HTTP.
//!
//! ## Architecture
//!
//! ```text
//! HTTP /containers/add → job queue → ingest pipeline → Postgres / vector store / object store / graph store
//!                                                              ↓
//!                                          HTTP /search → hybrid search engine → NL→Cypher graph context
//! ```
//!
//! ## Modules
//!
//! - [`container_fleet::config`] — TOML configuration parsing, env overlay, and validation
//! - [`container_fleet::context`] — `AppContext` construction and store wiring
//! - [`container_fleet::db`] — Postgres connection pool management
//! - [`container_fleet::migrate`] — schema migrations
//! - [`container_fleet::pipeline`] — ingestion: chunk, embed, dedup, commit
//! - [`container_fleet::search`] — hybrid search engine (C9)
//! - [`container_fleet::graph_search`] — NL→graph-query orchestration (C11)
//! - [`container_fleet::worker`] — job queue worker pool (C7)
//! - [`container_fleet::routes`] — HTTP surface (Axum)

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use container_fleet::{config, context, db, migrate, routes, worker};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "fleetd",
    about = "Container Fleet — ingestion, hybrid search, and job queue service",
    version
)]
struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, default_value = "./config/fleet.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply schema migrations and exit
    Init,

    /// Start the HTTP server and job queue workers
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    let pool = db::connect(&cfg).await?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&pool).await?;
            println!("Schema migrations applied successfully.");
        }
        Commands::Serve => {
            if cfg.relational.auto_migrate {
                migrate::run_migrations(&pool).await?;
            }

            let (relational, vector, object, graph) = context::build_stores(&cfg, pool).await?;
            let ctx = context::AppContext::new(std::sync::Arc::new(cfg.clone()), relational, vector, object, graph);

            worker::spawn_worker_pool(ctx.clone());

            let app = routes::build_router(ctx);
            let listener = tokio::net::TcpListener::bind(&cfg.server.bind).await?;
            tracing::info!(bind = %cfg.server.bind, "fleetd listening");
            axum::serve(listener, app).await?;
        }
    }

    Ok(())
}
