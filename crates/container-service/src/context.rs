//! Explicit application context (§9 Design Notes: replace per-process global
//! singletons with a context instantiated once at startup and passed into
//! every service instead of reached for through statics).
//!
//! The teacher's `server.rs` carries only `AppState { config: Arc<Config> }`
//! because its storage is a single SQLite file opened per-request. This
//! crate's storage is four independent backends behind trait objects, so
//! `AppContext` generalizes that shape: one `Arc<dyn Trait>` per store, the
//! config, and the in-memory manifest cache (C1). Handlers and the ingestion
//! pipeline/search engine all take `&AppContext` rather than looking
//! anything up from ambient state.

use std::sync::Arc;

use anyhow::Result;
use container_core::store::{GraphStore, ObjectStore, RelationalStore, VectorStore};

use crate::agent_activity::AgentActivitySink;
use crate::config::Config;
use crate::manifest_loader::ManifestLoader;

/// Bundle of everything a request handler, pipeline worker, or search call
/// needs. Cheap to clone: every field is an `Arc`.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    pub relational: Arc<dyn RelationalStore>,
    pub vector: Arc<dyn VectorStore>,
    pub object: Arc<dyn ObjectStore>,
    pub graph: Arc<dyn GraphStore>,
    pub manifests: Arc<ManifestLoader>,
    pub agent_activity: Arc<AgentActivitySink>,
}

impl AppContext {
    pub fn new(
        config: Arc<Config>,
        relational: Arc<dyn RelationalStore>,
        vector: Arc<dyn VectorStore>,
        object: Arc<dyn ObjectStore>,
        graph: Arc<dyn GraphStore>,
    ) -> Self {
        let manifests = Arc::new(ManifestLoader::new(relational.clone()));
        let agent_activity = Arc::new(AgentActivitySink::new(relational.clone()));
        Self { config, relational, vector, object, graph, manifests, agent_activity }
    }
}

/// Construct the four store adapters from config. Split out from
/// `AppContext::new` so `fleetd init`/migrate subcommands can build just the
/// relational store without paying for HTTP client setup they don't need.
pub async fn build_stores(
    config: &Config,
    pool: crate::db::PgPool,
) -> Result<(
    Arc<dyn RelationalStore>,
    Arc<dyn VectorStore>,
    Arc<dyn ObjectStore>,
    Arc<dyn GraphStore>,
)> {
    let relational: Arc<dyn RelationalStore> = Arc::new(crate::pg_store::PostgresStore::new(pool));
    let vector: Arc<dyn VectorStore> = Arc::new(crate::vector_store_http::HttpVectorStore::new(
        config.vector.url.clone(),
        config.vector.api_key.clone(),
        config.vector.timeout_ms,
    )?);
    let object: Arc<dyn ObjectStore> = Arc::new(crate::object_store_s3::S3ObjectStore::new(&config.object)?);
    let graph: Arc<dyn GraphStore> = Arc::new(crate::graph_store_http::HttpGraphStore::new(&config.graph)?);
    Ok((relational, vector, object, graph))
}
