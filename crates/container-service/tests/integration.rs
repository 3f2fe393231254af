//! End-to-end ingest-then-search integration test.
//!
//! The teacher's `tests/integration.rs` spawns the `ctx` binary against a
//! throwaway SQLite file. `fleetd` needs a live Postgres/vector/object/
//! graph backend to even start, so a process-spawn test here would only
//! prove a Postgres instance was reachable, not the pipeline's logic.
//! Instead this drives the same ingest → search round trip directly
//! through the library's `AppContext`, wired to the in-memory store
//! fakes, the way `traits_integration.rs`-style tests exercise a trait's
//! contract without a real backend.

use std::sync::Arc;

use container_core::memory::{MemoryGraphStore, MemoryObjectStore, MemoryRelationalStore, MemoryVectorStore};
use container_core::models::{Container, ContainerState, ContainerStats, Modality};
use container_fleet::config::Config;
use container_fleet::context::AppContext;
use container_fleet::pipeline::{self, IngestSource};
use container_fleet::search::{self, SearchMode, SearchRequest};
use uuid::Uuid;

fn test_config() -> Config {
    let toml = r#"
    [relational]
    dsn = "postgres://unused/test"

    [server]
    bind = "127.0.0.1:0"
    "#;
    let mut config: Config = toml::from_str(toml).unwrap();
    config.server.bearer_token = "test-token".to_string();
    config
}

fn test_ctx() -> AppContext {
    let relational: Arc<dyn container_core::store::RelationalStore> = Arc::new(MemoryRelationalStore::new());
    let vector: Arc<dyn container_core::store::VectorStore> = Arc::new(MemoryVectorStore::new());
    let object: Arc<dyn container_core::store::ObjectStore> = Arc::new(MemoryObjectStore::new());
    let graph: Arc<dyn container_core::store::GraphStore> = Arc::new(MemoryGraphStore::new());
    AppContext::new(Arc::new(test_config()), relational, vector, object, graph)
}

async fn seed_container(ctx: &AppContext, slug: &str) -> Uuid {
    let container = Container {
        id: Uuid::new_v4(),
        slug: slug.to_string(),
        theme: None,
        parent_id: None,
        allowed_modalities: vec![Modality::Text],
        embedder_id: "disabled".to_string(),
        embedder_version: "v1".to_string(),
        embedding_dims: 8,
        acl: Default::default(),
        state: ContainerState::Active,
        stats: ContainerStats::default(),
        graph_enabled: false,
        guiding_document_id: None,
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
    };
    let created = ctx.relational.create_container(container).await.unwrap();
    created.id
}

fn text_source(uri: &str, text: &str) -> IngestSource {
    IngestSource {
        uri: uri.to_string(),
        mime: Some("text/plain".to_string()),
        modality: Some("text".to_string()),
        title: Some(uri.to_string()),
        meta: serde_json::json!({ "text": text }),
    }
}

#[tokio::test]
async fn ingest_then_bm25_search_finds_the_document() {
    let ctx = test_ctx();
    let container_id = seed_container(&ctx, "demo").await;

    let source = text_source(
        "inline:alpha.md",
        "Alpha document about Rust programming and cargo crates.",
    );
    let outcome = pipeline::run_ingest(&ctx, container_id, &source).await.unwrap();
    assert_eq!(outcome.chunk_count, 1);
    assert!(!outcome.no_op);

    let request = SearchRequest {
        containers: vec!["demo".to_string()],
        query: Some("Rust programming".to_string()),
        image_base64: None,
        mode: SearchMode::Bm25,
        k: Some(5),
        principal: "tester".to_string(),
        rerank: Some(false),
        max_hops: 2,
        neighbor_k: 5,
    };
    let response = search::run_search(&ctx, request).await.unwrap();
    assert!(!response.results.is_empty(), "expected at least one bm25 hit");
}

#[tokio::test]
async fn reingesting_identical_content_is_a_no_op() {
    let ctx = test_ctx();
    let container_id = seed_container(&ctx, "demo").await;
    let source = text_source("inline:beta.md", "Beta document about deployment and infrastructure.");

    let first = pipeline::run_ingest(&ctx, container_id, &source).await.unwrap();
    assert!(!first.no_op);

    let second = pipeline::run_ingest(&ctx, container_id, &source).await.unwrap();
    assert!(second.no_op, "identical content hash must short-circuit to a no-op");
    assert_eq!(second.document_id, first.document_id);
}

#[tokio::test]
async fn k_zero_is_rejected() {
    let ctx = test_ctx();
    let request = SearchRequest {
        containers: vec!["demo".to_string()],
        query: Some("anything".to_string()),
        image_base64: None,
        mode: SearchMode::Bm25,
        k: Some(0),
        principal: "tester".to_string(),
        rerank: Some(false),
        max_hops: 2,
        neighbor_k: 5,
    };
    assert!(search::run_search(&ctx, request).await.is_err());
}

#[tokio::test]
async fn k_above_max_is_rejected() {
    let ctx = test_ctx();
    let request = SearchRequest {
        containers: vec!["demo".to_string()],
        query: Some("anything".to_string()),
        image_base64: None,
        mode: SearchMode::Bm25,
        k: Some(51),
        principal: "tester".to_string(),
        rerank: Some(false),
        max_hops: 2,
        neighbor_k: 5,
    };
    assert!(search::run_search(&ctx, request).await.is_err());
}

#[tokio::test]
async fn crossmodal_with_malformed_image_base64_reports_issue_without_failing() {
    let toml = r#"
    [relational]
    dsn = "postgres://unused/test"

    [server]
    bind = "127.0.0.1:0"

    [embedding]
    provider = "openai"
    dims = 8
    "#;
    let mut config: Config = toml::from_str(toml).unwrap();
    config.server.bearer_token = "test-token".to_string();

    let relational: Arc<dyn container_core::store::RelationalStore> = Arc::new(MemoryRelationalStore::new());
    let vector: Arc<dyn container_core::store::VectorStore> = Arc::new(MemoryVectorStore::new());
    let object: Arc<dyn container_core::store::ObjectStore> = Arc::new(MemoryObjectStore::new());
    let graph: Arc<dyn container_core::store::GraphStore> = Arc::new(MemoryGraphStore::new());
    let ctx = AppContext::new(Arc::new(config), relational, vector, object, graph);
    seed_container(&ctx, "demo").await;

    let request = SearchRequest {
        containers: vec!["demo".to_string()],
        query: None,
        image_base64: Some("not-valid-base64!!!".to_string()),
        mode: SearchMode::Crossmodal,
        k: Some(5),
        principal: "tester".to_string(),
        rerank: Some(false),
        max_hops: 2,
        neighbor_k: 5,
    };
    let response = search::run_search(&ctx, request).await.unwrap();
    assert!(response.diagnostics.issues.contains(&"INVALID_IMAGE".to_string()));
}

#[tokio::test]
async fn search_across_unknown_container_reports_issue_without_failing() {
    let ctx = test_ctx();
    let request = SearchRequest {
        containers: vec!["does-not-exist".to_string()],
        query: Some("anything".to_string()),
        image_base64: None,
        mode: SearchMode::Bm25,
        k: Some(5),
        principal: "tester".to_string(),
        rerank: Some(false),
        max_hops: 2,
        neighbor_k: 5,
    };
    let response = search::run_search(&ctx, request).await.unwrap();
    assert!(response.results.is_empty());
}
