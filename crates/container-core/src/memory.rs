//! In-memory fakes for the four store traits, used by unit/integration
//! tests so the ingestion pipeline and search engine can be exercised
//! without a live Postgres/vector/object/graph deployment.
//!
//! Grounded in the teacher's `InMemoryStore`
//! (`crates/context-harness-core/src/store/memory.rs`): `HashMap`/`Vec`
//! behind `std::sync::RwLock`, brute-force cosine search, no real keyword
//! index (lexical search here does a naive substring scan instead, since
//! the relational store's `tsvector`/`websearch_to_tsquery` behavior has
//! no in-memory equivalent worth faking precisely).

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::embedding::cosine_similarity;
use crate::manifest::Manifest;
use crate::models::{
    Chunk, Container, Document, EmbeddingCacheEntry, GraphEdge, GraphNode, Job, JobEvent, JobKind,
    JobStatus, Modality,
};
use crate::store::{ChunkCandidate, GraphQueryResult, GraphSchema, GraphStore, ObjectStore, RelationalStore, VectorHit, VectorStore};

#[derive(Default)]
pub struct MemoryRelationalStore {
    containers: RwLock<HashMap<Uuid, Container>>,
    documents: RwLock<HashMap<Uuid, Document>>,
    chunks: RwLock<HashMap<Uuid, Chunk>>,
    embedding_cache: RwLock<HashMap<String, EmbeddingCacheEntry>>,
    jobs: RwLock<HashMap<Uuid, Job>>,
    job_events: RwLock<Vec<JobEvent>>,
    manifests: RwLock<HashMap<Uuid, (i32, Manifest)>>,
    agent_sessions: RwLock<HashMap<String, (chrono::DateTime<Utc>, i64)>>,
}

impl MemoryRelationalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test/diagnostic helper: read back the `agent_sessions` row written
    /// by [`RelationalStore::record_agent_activity`]. Not part of the
    /// trait since production callers never need to read this back.
    pub fn agent_request_count(&self, agent_id: &str) -> Option<i64> {
        self.agent_sessions.read().unwrap().get(agent_id).map(|(_, count)| *count)
    }
}

#[async_trait]
impl RelationalStore for MemoryRelationalStore {
    async fn get_container(&self, id_or_slug: &str) -> Result<Option<Container>> {
        let containers = self.containers.read().unwrap();
        if let Ok(id) = Uuid::parse_str(id_or_slug) {
            if let Some(c) = containers.get(&id) {
                return Ok(Some(c.clone()));
            }
        }
        Ok(containers.values().find(|c| c.slug == id_or_slug).cloned())
    }

    async fn list_containers(
        &self,
        state: Option<&str>,
        search: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<Container>, i64)> {
        let containers = self.containers.read().unwrap();
        let mut matches: Vec<Container> = containers
            .values()
            .filter(|c| {
                state
                    .map(|s| format!("{:?}", c.state).to_lowercase() == s.to_lowercase())
                    .unwrap_or(true)
            })
            .filter(|c| {
                search
                    .map(|s| c.slug.contains(s))
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.slug.cmp(&b.slug));
        let total = matches.len() as i64;
        let page = matches
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect();
        Ok((page, total))
    }

    async fn create_container(&self, container: Container) -> Result<Container> {
        let mut containers = self.containers.write().unwrap();
        if containers.values().any(|c| c.slug == container.slug) {
            anyhow::bail!("container slug already exists: {}", container.slug);
        }
        containers.insert(container.id, container.clone());
        Ok(container)
    }

    async fn update_container_stats(
        &self,
        container_id: Uuid,
        document_count: i64,
        chunk_count: i64,
        size_bytes: i64,
        last_ingest: chrono::DateTime<Utc>,
    ) -> Result<()> {
        let mut containers = self.containers.write().unwrap();
        if let Some(c) = containers.get_mut(&container_id) {
            c.stats.document_count = document_count;
            c.stats.chunk_count = chunk_count;
            c.stats.size_bytes = size_bytes;
            c.stats.last_ingest = Some(last_ingest);
        }
        Ok(())
    }

    async fn delete_container(&self, container_id: Uuid) -> Result<()> {
        self.containers.write().unwrap().remove(&container_id);
        let mut docs = self.documents.write().unwrap();
        docs.retain(|_, d| d.container_id != container_id);
        let mut chunks = self.chunks.write().unwrap();
        chunks.retain(|_, c| c.container_id != container_id);
        Ok(())
    }

    async fn find_document_by_hash(
        &self,
        container_id: Uuid,
        hash: &str,
    ) -> Result<Option<(Document, bool)>> {
        let docs = self.documents.read().unwrap();
        let chunks = self.chunks.read().unwrap();
        let found = docs
            .values()
            .find(|d| d.container_id == container_id && d.hash == hash)
            .cloned();
        Ok(found.map(|d| {
            let has_chunks = chunks.values().any(|c| c.document_id == d.id);
            (d, has_chunks)
        }))
    }

    async fn upsert_document(&self, document: Document) -> Result<Document> {
        self.documents
            .write()
            .unwrap()
            .insert(document.id, document.clone());
        Ok(document)
    }

    async fn get_document(&self, id: Uuid) -> Result<Option<Document>> {
        Ok(self.documents.read().unwrap().get(&id).cloned())
    }

    async fn replace_chunks(&self, document_id: Uuid, chunks: Vec<Chunk>) -> Result<()> {
        let mut store = self.chunks.write().unwrap();
        store.retain(|_, c| c.document_id != document_id);
        for chunk in chunks {
            store.insert(chunk.id, chunk);
        }
        Ok(())
    }

    async fn get_chunk(&self, chunk_id: Uuid) -> Result<Option<Chunk>> {
        Ok(self.chunks.read().unwrap().get(&chunk_id).cloned())
    }

    async fn get_chunks_by_document(&self, document_id: Uuid) -> Result<Vec<Chunk>> {
        Ok(self
            .chunks
            .read()
            .unwrap()
            .values()
            .filter(|c| c.document_id == document_id)
            .cloned()
            .collect())
    }

    async fn keyword_search(
        &self,
        container_ids: &[Uuid],
        query: &str,
        allowed_modalities: &[Modality],
        limit: i64,
    ) -> Result<Vec<ChunkCandidate>> {
        let chunks = self.chunks.read().unwrap();
        let needle = query.to_lowercase();
        let mut hits: Vec<ChunkCandidate> = chunks
            .values()
            .filter(|c| c.dedup_of.is_none())
            .filter(|c| container_ids.is_empty() || container_ids.contains(&c.container_id))
            .filter(|c| allowed_modalities.is_empty() || allowed_modalities.contains(&c.modality))
            .filter_map(|c| {
                let text = c.text.as_deref().unwrap_or_default().to_lowercase();
                let occurrences = text.matches(&needle).count();
                if occurrences == 0 {
                    return None;
                }
                Some(ChunkCandidate {
                    chunk_id: c.id,
                    document_id: c.document_id,
                    container_id: c.container_id,
                    raw_score: occurrences as f64,
                    snippet: c.text.clone().unwrap_or_default(),
                    modality: c.modality,
                })
            })
            .collect();
        hits.sort_by(|a, b| b.raw_score.partial_cmp(&a.raw_score).unwrap());
        hits.truncate(limit.max(0) as usize);
        Ok(hits)
    }

    async fn get_embedding_cache(
        &self,
        cache_key: &str,
        ttl: chrono::Duration,
    ) -> Result<Option<EmbeddingCacheEntry>> {
        let cache = self.embedding_cache.read().unwrap();
        Ok(cache.get(cache_key).filter(|e| {
            Utc::now().signed_duration_since(e.last_used) <= ttl
        }).cloned())
    }

    async fn put_embedding_cache(&self, entry: EmbeddingCacheEntry) -> Result<()> {
        let key = format!("{}:{}:{}", entry.content_hash, entry.modality.as_str(), entry.embedder_version);
        self.embedding_cache.write().unwrap().insert(key, entry);
        Ok(())
    }

    async fn touch_embedding_cache(&self, cache_key: &str) -> Result<()> {
        if let Some(e) = self.embedding_cache.write().unwrap().get_mut(cache_key) {
            e.last_used = Utc::now();
        }
        Ok(())
    }

    async fn evict_stale_embedding_cache(&self, ttl: chrono::Duration) -> Result<u64> {
        let mut cache = self.embedding_cache.write().unwrap();
        let before = cache.len();
        cache.retain(|_, e| Utc::now().signed_duration_since(e.last_used) <= ttl);
        Ok((before - cache.len()) as u64)
    }

    async fn claim_job(&self) -> Result<Option<Job>> {
        let mut jobs = self.jobs.write().unwrap();
        let next_id = jobs
            .values()
            .filter(|j| j.status == JobStatus::Queued)
            .min_by_key(|j| j.created_at)
            .map(|j| j.id);
        if let Some(id) = next_id {
            let job = jobs.get_mut(&id).unwrap();
            job.status = JobStatus::Running;
            job.last_heartbeat = Some(Utc::now());
            job.updated_at = Utc::now();
            let claimed = job.clone();
            drop(jobs);
            self.append_job_event(JobEvent {
                job_id: id,
                status: "running".into(),
                message: Some("claimed".into()),
                timestamp: Utc::now(),
            })
            .await?;
            return Ok(Some(claimed));
        }
        Ok(None)
    }

    async fn heartbeat_job(&self, job_id: Uuid) -> Result<()> {
        if let Some(j) = self.jobs.write().unwrap().get_mut(&job_id) {
            j.last_heartbeat = Some(Utc::now());
        }
        Ok(())
    }

    async fn complete_job(&self, job_id: Uuid) -> Result<()> {
        if let Some(j) = self.jobs.write().unwrap().get_mut(&job_id) {
            j.status = JobStatus::Done;
            j.updated_at = Utc::now();
        }
        self.append_job_event(JobEvent {
            job_id,
            status: "done".into(),
            message: None,
            timestamp: Utc::now(),
        })
        .await
    }

    async fn fail_or_requeue_job(
        &self,
        job_id: Uuid,
        error: &str,
        max_retries: i32,
    ) -> Result<JobStatus> {
        let mut jobs = self.jobs.write().unwrap();
        let job = jobs.get_mut(&job_id).ok_or_else(|| anyhow::anyhow!("job not found"))?;
        job.retries += 1;
        job.error = Some(error.chars().take(500).collect());
        job.updated_at = Utc::now();
        let status = if job.retries >= max_retries {
            job.status = JobStatus::Failed;
            JobStatus::Failed
        } else {
            job.status = JobStatus::Queued;
            job.last_heartbeat = None;
            JobStatus::Queued
        };
        drop(jobs);
        let event_status = if status == JobStatus::Failed { "failed" } else { "queued" };
        self.append_job_event(JobEvent {
            job_id,
            status: event_status.into(),
            message: Some(error.to_string()),
            timestamp: Utc::now(),
        })
        .await?;
        Ok(status)
    }

    async fn reap_stale_jobs(
        &self,
        visibility_timeout: chrono::Duration,
        max_retries: i32,
    ) -> Result<u64> {
        let stale_ids: Vec<Uuid> = {
            let jobs = self.jobs.read().unwrap();
            jobs.values()
                .filter(|j| j.status == JobStatus::Running)
                .filter(|j| {
                    let marker = j.last_heartbeat.unwrap_or(j.updated_at);
                    Utc::now().signed_duration_since(marker) > visibility_timeout
                })
                .map(|j| j.id)
                .collect()
        };
        for id in &stale_ids {
            self.fail_or_requeue_job(*id, "reaped: stale heartbeat", max_retries).await?;
            self.append_job_event(JobEvent {
                job_id: *id,
                status: "reaped_stale".into(),
                message: None,
                timestamp: Utc::now(),
            })
            .await?;
        }
        Ok(stale_ids.len() as u64)
    }

    async fn enqueue_job(
        &self,
        container_id: Uuid,
        kind: JobKind,
        payload: serde_json::Value,
    ) -> Result<Job> {
        let job = Job {
            id: Uuid::new_v4(),
            kind,
            status: JobStatus::Queued,
            container_id,
            payload,
            retries: 0,
            last_heartbeat: None,
            error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        self.jobs.write().unwrap().insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>> {
        Ok(self.jobs.read().unwrap().get(&job_id).cloned())
    }

    async fn append_job_event(&self, event: JobEvent) -> Result<()> {
        self.job_events.write().unwrap().push(event);
        Ok(())
    }

    async fn get_latest_manifest(&self, container_id: Uuid) -> Result<Option<Manifest>> {
        Ok(self
            .manifests
            .read()
            .unwrap()
            .get(&container_id)
            .map(|(_, m)| m.clone()))
    }

    async fn put_manifest(&self, container_id: Uuid, manifest: Manifest) -> Result<i32> {
        let mut manifests = self.manifests.write().unwrap();
        let next_version = manifests.get(&container_id).map(|(v, _)| v + 1).unwrap_or(1);
        manifests.insert(container_id, (next_version, manifest));
        Ok(next_version)
    }

    async fn record_agent_activity(&self, agent_id: &str) -> Result<()> {
        let mut sessions = self.agent_sessions.write().unwrap();
        let entry = sessions.entry(agent_id.to_string()).or_insert((Utc::now(), 0));
        entry.0 = Utc::now();
        entry.1 += 1;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryVectorStore {
    vectors: RwLock<HashMap<(Uuid, Modality), Vec<(Uuid, Uuid, Vec<f32>)>>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn ensure_collection(&self, container_id: Uuid, modality: Modality, _dims: usize) -> Result<()> {
        self.vectors.write().unwrap().entry((container_id, modality)).or_default();
        Ok(())
    }

    async fn upsert(
        &self,
        container_id: Uuid,
        modality: Modality,
        chunk_id: Uuid,
        document_id: Uuid,
        vector: &[f32],
    ) -> Result<()> {
        let mut store = self.vectors.write().unwrap();
        let collection = store.entry((container_id, modality)).or_default();
        collection.retain(|(id, _, _)| *id != chunk_id);
        collection.push((chunk_id, document_id, vector.to_vec()));
        Ok(())
    }

    async fn search(
        &self,
        container_id: Uuid,
        modality: Modality,
        query_vector: &[f32],
        limit: usize,
    ) -> Result<Vec<VectorHit>> {
        let store = self.vectors.read().unwrap();
        let mut hits: Vec<VectorHit> = store
            .get(&(container_id, modality))
            .map(|v| {
                v.iter()
                    .map(|(id, _, vec)| VectorHit {
                        chunk_id: *id,
                        score: cosine_similarity(query_vector, vec),
                    })
                    .collect()
            })
            .unwrap_or_default();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap());
        hits.truncate(limit);
        Ok(hits)
    }

    async fn delete(&self, container_id: Uuid, modality: Modality, chunk_id: Uuid) -> Result<()> {
        if let Some(collection) = self.vectors.write().unwrap().get_mut(&(container_id, modality)) {
            collection.retain(|(id, _, _)| *id != chunk_id);
        }
        Ok(())
    }

    async fn drop_container(&self, container_id: Uuid) -> Result<()> {
        self.vectors.write().unwrap().retain(|(cid, _), _| *cid != container_id);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, path: &str, bytes: Vec<u8>, _content_type: &str) -> Result<()> {
        self.objects.write().unwrap().insert(path.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.objects.read().unwrap().get(path).cloned())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        self.objects.write().unwrap().retain(|k, _| !k.starts_with(prefix));
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryGraphStore {
    nodes: RwLock<HashMap<(Uuid, String), GraphNode>>,
    edges: RwLock<Vec<GraphEdge>>,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn upsert_node(&self, node: GraphNode) -> Result<()> {
        self.nodes
            .write()
            .unwrap()
            .insert((node.container_id, node.node_id.clone()), node);
        Ok(())
    }

    async fn upsert_edge(&self, edge: GraphEdge) -> Result<()> {
        let mut edges = self.edges.write().unwrap();
        edges.retain(|e| {
            !(e.container_id == edge.container_id
                && e.source_id == edge.source_id
                && e.target_id == edge.target_id
                && e.edge_type == edge.edge_type)
        });
        edges.push(edge);
        Ok(())
    }

    /// Ignores `query` text entirely: the in-memory fake is not a Cypher
    /// engine, it just returns the whole container subgraph up to a
    /// reasonable cap, so pipeline tests can assert on node/edge presence.
    async fn run_query(
        &self,
        container_id: Uuid,
        _query: &str,
        _timeout: std::time::Duration,
    ) -> Result<GraphQueryResult> {
        let nodes: Vec<GraphNode> = self
            .nodes
            .read()
            .unwrap()
            .values()
            .filter(|n| n.container_id == container_id)
            .cloned()
            .collect();
        let edges: Vec<GraphEdge> = self
            .edges
            .read()
            .unwrap()
            .iter()
            .filter(|e| e.container_id == container_id)
            .cloned()
            .collect();
        Ok(GraphQueryResult { nodes, edges })
    }

    async fn schema(&self, container_id: Uuid) -> Result<GraphSchema> {
        let nodes = self.nodes.read().unwrap();
        let edges = self.edges.read().unwrap();
        let mut node_labels: Vec<String> = nodes
            .values()
            .filter(|n| n.container_id == container_id)
            .map(|n| n.label.clone())
            .collect();
        node_labels.sort();
        node_labels.dedup();
        let mut edge_types: Vec<String> = edges
            .iter()
            .filter(|e| e.container_id == container_id)
            .map(|e| e.edge_type.clone())
            .collect();
        edge_types.sort();
        edge_types.dedup();
        Ok(GraphSchema { node_labels, edge_types })
    }

    async fn drop_container(&self, container_id: Uuid) -> Result<()> {
        self.nodes.write().unwrap().retain(|(cid, _), _| *cid != container_id);
        self.edges.write().unwrap().retain(|e| e.container_id != container_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContainerState, ContainerStats, DocumentState, Provenance};
    use std::collections::HashMap as Map;

    fn sample_container() -> Container {
        Container {
            id: Uuid::new_v4(),
            slug: "demo".into(),
            theme: None,
            parent_id: None,
            allowed_modalities: vec![Modality::Text],
            embedder_id: "local".into(),
            embedder_version: "v1".into(),
            embedding_dims: 4,
            acl: Map::new(),
            state: ContainerState::Active,
            stats: ContainerStats::default(),
            graph_enabled: false,
            guiding_document_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn claim_job_is_fifo_and_sets_running() {
        let store = MemoryRelationalStore::new();
        let container_id = Uuid::new_v4();
        store.enqueue_job(container_id, JobKind::Ingest, serde_json::json!({})).await.unwrap();
        let claimed = store.claim_job().await.unwrap().unwrap();
        assert_eq!(claimed.status, JobStatus::Running);
        assert!(claimed.last_heartbeat.is_some());
        // second claim finds nothing else queued
        assert!(store.claim_job().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_job_requeues_until_max_retries_then_terminal() {
        let store = MemoryRelationalStore::new();
        let container_id = Uuid::new_v4();
        let job = store.enqueue_job(container_id, JobKind::Ingest, serde_json::json!({})).await.unwrap();
        let s1 = store.fail_or_requeue_job(job.id, "boom", 2).await.unwrap();
        assert_eq!(s1, JobStatus::Queued);
        let s2 = store.fail_or_requeue_job(job.id, "boom again", 2).await.unwrap();
        assert_eq!(s2, JobStatus::Failed);
    }

    #[tokio::test]
    async fn container_hash_lookup_roundtrips() {
        let store = MemoryRelationalStore::new();
        let container = sample_container();
        store.create_container(container.clone()).await.unwrap();
        let doc = Document {
            id: Uuid::new_v4(),
            container_id: container.id,
            hash: "abc".into(),
            uri: "inline:x".into(),
            mime: None,
            title: None,
            meta: serde_json::json!({}),
            state: DocumentState::Pending,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store.upsert_document(doc.clone()).await.unwrap();
        let (found, has_chunks) = store
            .find_document_by_hash(container.id, "abc")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, doc.id);
        assert!(!has_chunks);
    }

    #[tokio::test]
    async fn vector_search_ranks_by_cosine_similarity() {
        let store = MemoryVectorStore::new();
        let container_id = Uuid::new_v4();
        store.ensure_collection(container_id, Modality::Text, 2).await.unwrap();
        let close = Uuid::new_v4();
        let far = Uuid::new_v4();
        store.upsert(container_id, Modality::Text, close, Uuid::new_v4(), &[1.0, 0.0]).await.unwrap();
        store.upsert(container_id, Modality::Text, far, Uuid::new_v4(), &[0.0, 1.0]).await.unwrap();
        let hits = store.search(container_id, Modality::Text, &[0.9, 0.1], 2).await.unwrap();
        assert_eq!(hits[0].chunk_id, close);
    }

    #[tokio::test]
    async fn dedup_chunks_are_excluded_from_keyword_search() {
        let store = MemoryRelationalStore::new();
        let container_id = Uuid::new_v4();
        let doc_id = Uuid::new_v4();
        let canonical = Chunk {
            id: Uuid::new_v4(),
            container_id,
            document_id: doc_id,
            modality: Modality::Text,
            text: Some("alpha beta gamma".into()),
            byte_start: 0,
            byte_end: 10,
            provenance: Provenance::default(),
            meta: serde_json::json!({}),
            embedding_version: "v1".into(),
            dedup_of: None,
        };
        let mut duplicate = canonical.clone();
        duplicate.id = Uuid::new_v4();
        duplicate.dedup_of = Some(canonical.id);
        store.replace_chunks(doc_id, vec![canonical.clone(), duplicate]).await.unwrap();
        let hits = store
            .keyword_search(&[container_id], "alpha", &[], 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, canonical.id);
    }
}
