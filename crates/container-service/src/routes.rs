//! HTTP surface (§6 External Interfaces).
//!
//! The spec calls this transport "out of scope... thin glue; re-implementing
//! it changes no design," but carries it anyway per the ambient-stack rule:
//! `axum` for routing, bearer-token middleware, and the agent-activity ping
//! middleware, matching the teacher's `server.rs` shape (an `AppError` that
//! implements `IntoResponse`, a handful of `Router::new().route(...)` calls,
//! a permissive `CorsLayer`) generalized from one `AppState { config }` to
//! the four-store `AppContext`.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use container_core::error::ServiceError;
use container_core::manifest::Manifest;
use container_core::models::{Container, ContainerState, ContainerStats, GraphEdge, GraphNode, JobKind, Modality, Role};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::context::AppContext;
use crate::graph_search;
use crate::pipeline::{self, IngestJobPayload, IngestSource};
use crate::search::{self, SearchMode, SearchRequest};

pub fn build_router(ctx: AppContext) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/containers/list", post(list_containers))
        .route("/containers/describe", post(describe_container))
        .route("/containers/create", post(create_container))
        .route("/containers/add", post(add_sources))
        .route("/search", post(run_search))
        .route("/jobs/status", post(jobs_status))
        .route("/containers/graph_upsert", post(graph_upsert))
        .route("/containers/graph_search", post(graph_search_endpoint))
        .route("/containers/graph_schema", get(graph_schema))
        .route("/system/status", get(system_status))
        .layer(middleware::from_fn_with_state(ctx.clone(), agent_activity_middleware))
        .layer(middleware::from_fn_with_state(ctx.clone(), bearer_auth_middleware))
        .layer(cors)
        .with_state(ctx)
}

// ============ Error handling ============

struct AppError(ServiceError);

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        AppError(err)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<ServiceError>() {
            Ok(service_err) => AppError(service_err),
            Err(err) => AppError(ServiceError::Fatal(err.to_string())),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = json!({
            "version": "v1",
            "request_id": Uuid::new_v4(),
            "issues": [self.0.issue_code()],
            "message": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

fn forbidden(code: &'static str, message: impl Into<String>) -> AppError {
    AppError(ServiceError::Validation { code, message: message.into() })
}

// ============ Middleware ============

async fn bearer_auth_middleware(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    let expected = &ctx.config.server.bearer_token;
    let presented = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match presented {
        Some(token) if token == expected => next.run(request).await,
        _ => AppError(ServiceError::Auth).into_response(),
    }
}

async fn agent_activity_middleware(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    if let Some(agent_id) = headers.get("x-agent-id").and_then(|v| v.to_str().ok()) {
        ctx.agent_activity.record(agent_id);
    }
    next.run(request).await
}

// ============ /containers/list ============

#[derive(Deserialize)]
struct ContainersListRequest {
    #[serde(default)]
    state: Option<String>,
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
    #[serde(default)]
    search: Option<String>,
    #[serde(default)]
    include_stats: bool,
}

fn default_limit() -> i64 {
    50
}

#[derive(Serialize)]
struct ContainerSummary {
    id: Uuid,
    slug: String,
    state: ContainerState,
    allowed_modalities: Vec<Modality>,
    stats: Option<ContainerStats>,
}

async fn list_containers(
    State(ctx): State<AppContext>,
    Json(req): Json<ContainersListRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    if req.limit < 1 || req.limit > 100 {
        return Err(forbidden("INVALID_LIMIT", format!("limit must be between 1 and 100, got {}", req.limit)));
    }
    let limit = req.limit;
    let (containers, total) = ctx
        .relational
        .list_containers(req.state.as_deref(), req.search.as_deref(), limit, req.offset)
        .await?;

    let summaries: Vec<ContainerSummary> = containers
        .into_iter()
        .map(|c| ContainerSummary {
            id: c.id,
            slug: c.slug,
            state: c.state,
            allowed_modalities: c.allowed_modalities,
            stats: req.include_stats.then_some(c.stats),
        })
        .collect();

    Ok(Json(json!({
        "version": "v1",
        "request_id": Uuid::new_v4(),
        "containers": summaries,
        "total": total,
        "issues": Vec::<String>::new(),
    })))
}

// ============ /containers/describe ============

#[derive(Deserialize)]
struct DescribeContainerRequest {
    container: String,
}

async fn describe_container(
    State(ctx): State<AppContext>,
    Json(req): Json<DescribeContainerRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let container = ctx
        .relational
        .get_container(&req.container)
        .await?
        .ok_or(ServiceError::NotFound { code: "CONTAINER_NOT_FOUND" })?;

    Ok(Json(json!({
        "version": "v1",
        "request_id": Uuid::new_v4(),
        "container": container,
        "issues": Vec::<String>::new(),
    })))
}

// ============ /containers/create ============

static SLUG_PATTERN: once_cell::sync::Lazy<regex::Regex> =
    once_cell::sync::Lazy::new(|| regex::Regex::new(r"^[a-z0-9_-]+$").unwrap());

#[derive(Deserialize)]
struct CreateContainerRequest {
    slug: String,
    #[serde(default)]
    theme: Option<String>,
    #[serde(default)]
    parent_id: Option<Uuid>,
    allowed_modalities: Vec<Modality>,
    #[serde(default = "default_embedder_id")]
    embedder_id: String,
    #[serde(default = "default_embedder_version")]
    embedder_version: String,
    embedding_dims: usize,
    #[serde(default)]
    acl: std::collections::HashMap<String, Role>,
    #[serde(default)]
    graph_enabled: bool,
}

fn default_embedder_id() -> String {
    "disabled".to_string()
}
fn default_embedder_version() -> String {
    "v1".to_string()
}

async fn create_container(
    State(ctx): State<AppContext>,
    Json(req): Json<CreateContainerRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    if !SLUG_PATTERN.is_match(&req.slug) {
        return Err(ServiceError::Validation {
            code: "INVALID_SLUG",
            message: "slug must match [a-z0-9_-]+".to_string(),
        }
        .into());
    }
    if req.allowed_modalities.is_empty() {
        return Err(ServiceError::Validation {
            code: "EMPTY_MODALITIES",
            message: "allowed_modalities must not be empty".to_string(),
        }
        .into());
    }
    if req.embedding_dims == 0 {
        return Err(ServiceError::Validation { code: "INVALID_DIMS", message: "embedding_dims must be > 0".to_string() }.into());
    }
    if ctx.relational.get_container(&req.slug).await?.is_some() {
        return Err(forbidden("SLUG_EXISTS", format!("container '{}' already exists", req.slug)));
    }

    let now = Utc::now();
    let container = Container {
        id: Uuid::new_v4(),
        slug: req.slug,
        theme: req.theme,
        parent_id: req.parent_id,
        allowed_modalities: req.allowed_modalities,
        embedder_id: req.embedder_id,
        embedder_version: req.embedder_version,
        embedding_dims: req.embedding_dims,
        acl: req.acl,
        state: ContainerState::Active,
        stats: ContainerStats::default(),
        graph_enabled: req.graph_enabled,
        guiding_document_id: None,
        created_at: now,
        updated_at: now,
    };
    let created = ctx.relational.create_container(container).await?;

    Ok(Json(json!({
        "version": "v1",
        "request_id": Uuid::new_v4(),
        "container": created,
        "issues": Vec::<String>::new(),
    })))
}

// ============ /containers/add ============

#[derive(Deserialize)]
struct AddSourcesRequest {
    container: String,
    sources: Vec<IngestSource>,
    #[serde(default = "default_mode")]
    mode: String,
}

fn default_mode() -> String {
    "async".to_string()
}

#[derive(Serialize)]
struct SourceOutcome {
    uri: String,
    job_id: Option<Uuid>,
    issues: Vec<String>,
}

async fn add_sources(
    State(ctx): State<AppContext>,
    Json(req): Json<AddSourcesRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let container = ctx
        .relational
        .get_container(&req.container)
        .await?
        .ok_or(ServiceError::NotFound { code: "CONTAINER_NOT_FOUND" })?;
    let manifest = ctx.manifests.load(container.id).await?.unwrap_or_default();

    let mut outcomes = Vec::with_capacity(req.sources.len());
    for source in req.sources {
        let mut issues = Vec::new();
        if let Some(issue) = validate_source_against_manifest(&source, &manifest) {
            issues.push(issue.to_string());
            outcomes.push(SourceOutcome { uri: source.uri, job_id: None, issues });
            continue;
        }

        if req.mode == "blocking" {
            let outcome = pipeline::run_ingest(&ctx, container.id, &source).await?;
            issues.extend(outcome.issues);
            outcomes.push(SourceOutcome { uri: source.uri, job_id: None, issues });
        } else {
            let payload = IngestJobPayload { container_id: container.id, source: source.clone() };
            let job = ctx
                .relational
                .enqueue_job(container.id, JobKind::Ingest, serde_json::to_value(&payload)?)
                .await?;
            outcomes.push(SourceOutcome { uri: source.uri, job_id: Some(job.id), issues });
        }
    }

    Ok(Json(json!({
        "version": "v1",
        "request_id": Uuid::new_v4(),
        "sources": outcomes,
        "issues": Vec::<String>::new(),
    })))
}

/// Pre-enqueue manifest enforcement (§6): reject disallowed modalities or
/// oversized payloads before a job is ever created.
fn validate_source_against_manifest(source: &IngestSource, manifest: &Manifest) -> Option<&'static str> {
    let modality = Modality::detect(source.modality.as_deref(), source.mime.as_deref(), &source.uri);
    if !manifest.modalities.is_empty() && !manifest.modalities.contains(&modality) {
        return Some("BLOCKED_MODALITY");
    }

    let declared_size = source
        .meta
        .get("size_bytes")
        .and_then(|v| v.as_u64())
        .or_else(|| source.meta.get("text").and_then(|v| v.as_str()).map(|s| s.len() as u64))
        .or_else(|| source.meta.get("base64").and_then(|v| v.as_str()).map(|s| (s.len() as u64 * 3) / 4));
    if let Some(size) = declared_size {
        if size > manifest.limits.max_size_bytes {
            return Some("PAYLOAD_TOO_LARGE");
        }
    }
    None
}

// ============ /search ============

async fn run_search(State(ctx): State<AppContext>, Json(req): Json<SearchRequest>) -> Result<Json<serde_json::Value>, AppError> {
    if req.query.as_deref().map(str::trim).unwrap_or("").is_empty() && req.image_base64.is_none() {
        return Err(ServiceError::Validation { code: "EMPTY_QUERY", message: "query or image_base64 required".to_string() }.into());
    }
    if matches!(req.mode, SearchMode::Graph | SearchMode::HybridGraph) && req.image_base64.is_some() {
        return Err(ServiceError::Validation { code: "GRAPH_MODE_REJECTS_IMAGE", message: "graph modes require a text query".to_string() }.into());
    }

    let response = search::run_search(&ctx, req).await?;
    Ok(Json(json!({
        "version": response.version,
        "request_id": Uuid::new_v4(),
        "results": response.results,
        "diagnostics": response.diagnostics,
        "timings_ms": response.diagnostics.timings_ms,
        "issues": response.diagnostics.issues,
        "partial": response.partial,
        "graph_context": response.graph_context,
    })))
}

// ============ /jobs/status ============

#[derive(Deserialize)]
struct JobsStatusRequest {
    job_ids: Vec<Uuid>,
}

async fn jobs_status(
    State(ctx): State<AppContext>,
    Json(req): Json<JobsStatusRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let mut statuses = serde_json::Map::new();
    for job_id in req.job_ids {
        let value = match ctx.relational.get_job(job_id).await? {
            Some(job) => json!(job),
            None => json!({ "status": "not_found" }),
        };
        statuses.insert(job_id.to_string(), value);
    }

    Ok(Json(json!({
        "version": "v1",
        "request_id": Uuid::new_v4(),
        "jobs": statuses,
        "issues": Vec::<String>::new(),
    })))
}

// ============ /containers/graph_upsert ============

#[derive(Deserialize)]
struct GraphUpsertRequest {
    container: String,
    #[serde(default)]
    nodes: Vec<GraphNode>,
    #[serde(default)]
    edges: Vec<GraphEdge>,
}

async fn graph_upsert(
    State(ctx): State<AppContext>,
    Json(req): Json<GraphUpsertRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let container = ctx
        .relational
        .get_container(&req.container)
        .await?
        .ok_or(ServiceError::NotFound { code: "CONTAINER_NOT_FOUND" })?;

    let mut issues = Vec::new();
    for mut node in req.nodes {
        node.container_id = container.id;
        if let Err(err) = ctx.graph.upsert_node(node).await {
            issues.push(format!("GRAPH_UPSERT_FAILED:{err}"));
        }
    }
    for mut edge in req.edges {
        edge.container_id = container.id;
        if let Err(err) = ctx.graph.upsert_edge(edge).await {
            issues.push(format!("GRAPH_UPSERT_FAILED:{err}"));
        }
    }

    Ok(Json(json!({
        "version": "v1",
        "request_id": Uuid::new_v4(),
        "issues": issues,
    })))
}

// ============ /containers/graph_search ============

#[derive(Deserialize)]
struct GraphSearchRequest {
    container: String,
    query: String,
    #[serde(default)]
    principal: Option<String>,
    #[serde(default = "default_graph_max_hops")]
    max_hops: u32,
    #[serde(default = "default_graph_k")]
    k: i64,
}

fn default_graph_max_hops() -> u32 {
    2
}
fn default_graph_k() -> i64 {
    20
}

async fn graph_search_endpoint(
    State(ctx): State<AppContext>,
    Json(req): Json<GraphSearchRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let search_request = SearchRequest {
        containers: vec![req.container],
        query: Some(req.query),
        image_base64: None,
        mode: SearchMode::Graph,
        k: Some(req.k),
        principal: req.principal.unwrap_or_else(|| "anonymous".to_string()),
        rerank: None,
        max_hops: req.max_hops,
        neighbor_k: 0,
    };
    let result = graph_search::run_graph_only(&ctx, &search_request).await?;
    Ok(Json(json!({
        "version": "v1",
        "request_id": Uuid::new_v4(),
        "graph_context": result,
    })))
}

// ============ /containers/graph_schema ============

#[derive(Deserialize)]
struct GraphSchemaQuery {
    container: String,
}

async fn graph_schema(
    State(ctx): State<AppContext>,
    Query(query): Query<GraphSchemaQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let container = ctx
        .relational
        .get_container(&query.container)
        .await?
        .ok_or(ServiceError::NotFound { code: "CONTAINER_NOT_FOUND" })?;
    let schema = ctx.graph.schema(container.id).await?;
    Ok(Json(json!({
        "version": "v1",
        "request_id": Uuid::new_v4(),
        "schema": schema,
        "issues": Vec::<String>::new(),
    })))
}

// ============ /system/status ============

async fn system_status(State(ctx): State<AppContext>) -> Response {
    let postgres_ok = ctx.relational.list_containers(None, None, 1, 0).await.is_ok();
    let objectstore_ok = ctx.object.get("__healthcheck__").await.is_ok();
    let graphstore_ok = ctx.graph.schema(Uuid::nil()).await.is_ok();
    let vectorstore_ok = ctx.vector.ensure_collection(Uuid::nil(), Modality::Text, 1).await.is_ok();

    let mut issues = Vec::new();
    if !postgres_ok {
        issues.push("POSTGRES_DOWN".to_string());
    }
    if !objectstore_ok {
        issues.push("OBJECTSTORE_DOWN".to_string());
    }
    if !graphstore_ok {
        issues.push("GRAPHSTORE_DOWN".to_string());
    }
    if !vectorstore_ok {
        issues.push("VECTORSTORE_DOWN".to_string());
    }

    let required_ok = postgres_ok;
    let status_code = if required_ok { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    let body = json!({
        "status": if required_ok { "ok" } else { "degraded" },
        "checks": {
            "postgres": postgres_ok,
            "vectorstore": vectorstore_ok,
            "objectstore": objectstore_ok,
            "graphstore": graphstore_ok,
        },
        "migrations": "unmanaged",
        "issues": issues,
    });
    (status_code, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_pattern_rejects_uppercase_and_spaces() {
        assert!(SLUG_PATTERN.is_match("demo-container_1"));
        assert!(!SLUG_PATTERN.is_match("Demo Container"));
    }

    #[test]
    fn manifest_enforcement_blocks_disallowed_modality() {
        let manifest = Manifest { modalities: vec![Modality::Text], ..Default::default() };
        let source = IngestSource {
            uri: "inline:x.png".to_string(),
            mime: Some("image/png".to_string()),
            modality: None,
            title: None,
            meta: serde_json::json!({}),
        };
        assert_eq!(validate_source_against_manifest(&source, &manifest), Some("BLOCKED_MODALITY"));
    }

    #[test]
    fn manifest_enforcement_blocks_oversized_inline_text() {
        let mut manifest = Manifest::default();
        manifest.limits.max_size_bytes = 4;
        let source = IngestSource {
            uri: "inline:x".to_string(),
            mime: None,
            modality: Some("text".to_string()),
            title: None,
            meta: serde_json::json!({ "text": "way more than four bytes" }),
        };
        assert_eq!(validate_source_against_manifest(&source, &manifest), Some("PAYLOAD_TOO_LARGE"));
    }

    #[test]
    fn anyhow_wrapped_service_error_keeps_its_status() {
        let err: anyhow::Error = ServiceError::Validation { code: "INVALID_K", message: "k out of range".into() }.into();
        let app_err: AppError = err.into();
        assert_eq!(app_err.0.http_status(), 400);
    }
}
