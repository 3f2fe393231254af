//! Storage abstractions (C3, C4, C5, C6).
//!
//! Four traits, one per backing store, mirroring the component table in
//! §2. Concrete adapters (Postgres, an HTTP vector service, an S3-style
//! object store, an HTTP-queryable property graph) live in
//! `container-service`; in-memory fakes for tests live in [`crate::memory`].
//! All are `async-trait` and `Send + Sync` so they can be shared behind an
//! `Arc<dyn Trait>` application context (§9 Design Notes: no global
//! singletons, an explicit context passed into services).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::manifest::Manifest;
use crate::models::{
    Chunk, Container, Document, EmbeddingCacheEntry, GraphEdge, GraphNode, Job, JobEvent,
    JobKind, JobStatus, Modality,
};

/// A candidate chunk returned from a lexical or vector search stage,
/// before fusion. Carries enough to normalize and merge without further
/// round-trips to the relational store.
#[derive(Debug, Clone)]
pub struct ChunkCandidate {
    pub chunk_id: Uuid,
    pub document_id: Uuid,
    pub container_id: Uuid,
    pub raw_score: f64,
    pub snippet: String,
    pub modality: Modality,
}

/// Abstract relational store (C5): containers, documents, chunks, jobs,
/// job events, the embedding cache, and diagnostics.
#[async_trait]
pub trait RelationalStore: Send + Sync {
    async fn get_container(&self, id_or_slug: &str) -> anyhow::Result<Option<Container>>;
    async fn list_containers(
        &self,
        state: Option<&str>,
        search: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> anyhow::Result<(Vec<Container>, i64)>;
    async fn create_container(&self, container: Container) -> anyhow::Result<Container>;
    async fn update_container_stats(
        &self,
        container_id: Uuid,
        document_count: i64,
        chunk_count: i64,
        size_bytes: i64,
        last_ingest: DateTime<Utc>,
    ) -> anyhow::Result<()>;
    async fn delete_container(&self, container_id: Uuid) -> anyhow::Result<()>;

    /// Look up a document by `(container_id, hash)`. Returns the document
    /// and whether it currently has any committed chunks, which the
    /// ingestion pipeline uses to decide no-op vs. recovery vs. insert
    /// (§4.2).
    async fn find_document_by_hash(
        &self,
        container_id: Uuid,
        hash: &str,
    ) -> anyhow::Result<Option<(Document, bool)>>;
    async fn upsert_document(&self, document: Document) -> anyhow::Result<Document>;
    async fn get_document(&self, id: Uuid) -> anyhow::Result<Option<Document>>;

    async fn replace_chunks(&self, document_id: Uuid, chunks: Vec<Chunk>) -> anyhow::Result<()>;
    async fn get_chunk(&self, chunk_id: Uuid) -> anyhow::Result<Option<Chunk>>;
    async fn get_chunks_by_document(&self, document_id: Uuid) -> anyhow::Result<Vec<Chunk>>;

    async fn keyword_search(
        &self,
        container_ids: &[Uuid],
        query: &str,
        allowed_modalities: &[Modality],
        limit: i64,
    ) -> anyhow::Result<Vec<ChunkCandidate>>;

    async fn get_embedding_cache(
        &self,
        cache_key: &str,
        ttl: chrono::Duration,
    ) -> anyhow::Result<Option<EmbeddingCacheEntry>>;
    async fn put_embedding_cache(&self, entry: EmbeddingCacheEntry) -> anyhow::Result<()>;
    async fn touch_embedding_cache(&self, cache_key: &str) -> anyhow::Result<()>;
    async fn evict_stale_embedding_cache(&self, ttl: chrono::Duration) -> anyhow::Result<u64>;

    /// Atomically claim one queued job, in insertion order, skipping rows
    /// locked by other workers (§4.3, §9 Design Notes: skip-locked claim
    /// must be preserved). Appends a `running: claimed` event.
    async fn claim_job(&self) -> anyhow::Result<Option<Job>>;
    async fn heartbeat_job(&self, job_id: Uuid) -> anyhow::Result<()>;
    async fn complete_job(&self, job_id: Uuid) -> anyhow::Result<()>;
    async fn fail_or_requeue_job(
        &self,
        job_id: Uuid,
        error: &str,
        max_retries: i32,
    ) -> anyhow::Result<JobStatus>;
    async fn reap_stale_jobs(
        &self,
        visibility_timeout: chrono::Duration,
        max_retries: i32,
    ) -> anyhow::Result<u64>;
    async fn enqueue_job(
        &self,
        container_id: Uuid,
        kind: JobKind,
        payload: serde_json::Value,
    ) -> anyhow::Result<Job>;
    async fn get_job(&self, job_id: Uuid) -> anyhow::Result<Option<Job>>;
    async fn append_job_event(&self, event: JobEvent) -> anyhow::Result<()>;

    /// Fetch the highest-`version` manifest row for a container, if one has
    /// ever been published (C1: manifests are versioned documents, not a
    /// column on `containers` itself).
    async fn get_latest_manifest(&self, container_id: Uuid) -> anyhow::Result<Option<Manifest>>;

    /// Publish a new manifest version for a container, returning the
    /// version number assigned. Versions are monotonically increasing per
    /// container; this never overwrites a prior version in place.
    async fn put_manifest(&self, container_id: Uuid, manifest: Manifest) -> anyhow::Result<i32>;

    /// Upsert the `agent_sessions` row for `agent_id`: bump `last_seen` and
    /// increment `request_count`, creating the row on first sight. Called
    /// from the throttled agent-activity sink, never directly from a
    /// request handler (§9 Design Notes: background side-effects get a
    /// narrow write-behind path, not inline hot-path writes).
    async fn record_agent_activity(&self, agent_id: &str) -> anyhow::Result<()>;
}

/// A single vector hit from [`VectorStore::search`].
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub chunk_id: Uuid,
    pub score: f32,
}

/// Abstract vector store adapter (C3): per-`(container, modality)`
/// collections with cosine distance.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Ensure the collection for `(container_id, modality)` exists with
    /// the given dimensionality. Must tolerate a "collection exists" race
    /// (§5 shared resource policy).
    async fn ensure_collection(
        &self,
        container_id: Uuid,
        modality: Modality,
        dims: usize,
    ) -> anyhow::Result<()>;

    async fn upsert(
        &self,
        container_id: Uuid,
        modality: Modality,
        chunk_id: Uuid,
        document_id: Uuid,
        vector: &[f32],
    ) -> anyhow::Result<()>;

    async fn search(
        &self,
        container_id: Uuid,
        modality: Modality,
        query_vector: &[f32],
        limit: usize,
    ) -> anyhow::Result<Vec<VectorHit>>;

    async fn delete(&self, container_id: Uuid, modality: Modality, chunk_id: Uuid) -> anyhow::Result<()>;
    async fn drop_container(&self, container_id: Uuid) -> anyhow::Result<()>;
}

/// Abstract object store adapter (C4): document blobs, raw text, image
/// originals and thumbnails.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> anyhow::Result<()>;
    async fn get(&self, path: &str) -> anyhow::Result<Option<Vec<u8>>>;
    async fn delete_prefix(&self, prefix: &str) -> anyhow::Result<()>;
}

/// Abstract property-graph adapter (C6): scoped upserts and read-only
/// query execution.
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn upsert_node(&self, node: GraphNode) -> anyhow::Result<()>;
    async fn upsert_edge(&self, edge: GraphEdge) -> anyhow::Result<()>;

    /// Execute a validated, read-only query scoped to `container_id`.
    /// Returns the raw `(nodes, rel_maps)` projection the query dialect
    /// requires (§4.5); the caller hydrates provenance snippets.
    async fn run_query(
        &self,
        container_id: Uuid,
        query: &str,
        timeout: std::time::Duration,
    ) -> anyhow::Result<GraphQueryResult>;

    async fn schema(&self, container_id: Uuid) -> anyhow::Result<GraphSchema>;
    async fn drop_container(&self, container_id: Uuid) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphQueryResult {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphSchema {
    pub node_labels: Vec<String>,
    pub edge_types: Vec<String>,
}
