//! Ingestion pipeline orchestration (C8).
//!
//! Coordinates the full ingest flow described in §4.2: modality routing,
//! content-addressed dedup-on-hash, chunking, cached embedding, semantic
//! dedup against the vector store, and a fixed commit order across the
//! relational store, object store, vector store, and graph store. Grounded
//! in the teacher's `ingest.rs` (`run_sync` / `upsert_document` /
//! `replace_chunks` shape), generalized from a single SQLite file to the
//! four independent backends behind `AppContext`.
//!
//! Unlike the teacher, re-ingest dedup here is content-addressed per
//! `(container_id, hash)` rather than `(source, source_id)`, and embedding
//! failures degrade to a zero vector instead of leaving the chunk
//! unembedded, matching §4.2's failure semantics.

use std::collections::HashSet;

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use container_core::chunk::{
    chunk_text, content_hash, content_hash_bytes, embedding_cache_key, embedding_cache_key_bytes, provenance_for,
    DEFAULT_CHUNK_SIZE, DEFAULT_OVERLAP,
};
use container_core::embedding::zero_vector;
use container_core::manifest::Manifest;
use container_core::models::{
    Chunk, Document, DocumentState, EmbeddingCacheEntry, GraphEdge, GraphNode, Modality,
    Provenance,
};
use container_core::store::VectorHit;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::context::AppContext;
use crate::embedding_client;
use crate::extract;

/// A single source to ingest, matching the job payload shape from §4.2:
/// `{uri, mime?, modality?, title?, meta{...}}`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IngestSource {
    pub uri: String,
    #[serde(default)]
    pub mime: Option<String>,
    #[serde(default)]
    pub modality: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub meta: serde_json::Value,
}

/// Payload carried by an `ingest` job (§4.2 Entry).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IngestJobPayload {
    pub container_id: Uuid,
    pub source: IngestSource,
}

/// Outcome of one ingest run, used both for job-event messages and tests.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestOutcome {
    pub document_id: Uuid,
    pub chunk_count: usize,
    pub deduped_count: usize,
    pub no_op: bool,
    pub degraded: bool,
    pub issues: Vec<String>,
}

/// Run the ingestion pipeline for one source against one container. Only
/// unrecoverable relational errors bubble up as `Err`; every other
/// collaborator failure (embedding, vector, object, graph) degrades and is
/// recorded in `IngestOutcome::issues` (§4.2, §7).
#[instrument(skip(ctx, source), fields(container_id = %container_id, uri = %source.uri))]
pub async fn run_ingest(
    ctx: &AppContext,
    container_id: Uuid,
    source: &IngestSource,
) -> Result<IngestOutcome> {
    let container = ctx
        .relational
        .get_container(&container_id.to_string())
        .await?
        .ok_or_else(|| anyhow::anyhow!("container not found: {container_id}"))?;
    let manifest = ctx
        .manifests
        .load(container_id)
        .await?
        .unwrap_or_default();

    let modality = Modality::detect(source.modality.as_deref(), source.mime.as_deref(), &source.uri);
    let mut issues = Vec::new();

    let (text, degraded) = extract_source_text(ctx, source, modality, &mut issues).await?;

    let image_bytes = if modality == Modality::Image {
        match fetch_source_bytes(ctx, source).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(error = %err, "failed to fetch image bytes");
                issues.push("IMAGE_FETCH_FAILED".to_string());
                Vec::new()
            }
        }
    } else {
        Vec::new()
    };

    let fingerprint = fingerprint_for(&text, source);
    let doc_hash = {
        let mut hasher = Sha256::new();
        hasher.update(format!("{container_id}:{fingerprint}").as_bytes());
        format!("{:x}", hasher.finalize())
    };

    let existing = ctx.relational.find_document_by_hash(container_id, &doc_hash).await?;
    let (document, skip) = match existing {
        Some((doc, has_chunks)) if has_chunks => (doc, true),
        Some((doc, _no_chunks)) => (refresh_document(doc, source, &doc_hash), false),
        None => (new_document(container_id, &doc_hash, source), false),
    };

    if skip {
        debug!("ingest is a no-op: document already has committed chunks");
        return Ok(IngestOutcome { document_id: document.id, no_op: true, ..Default::default() });
    }

    let document = ctx.relational.upsert_document(document).await?;

    let windows = if modality == Modality::Image {
        Vec::new()
    } else {
        chunk_text(&text, DEFAULT_CHUNK_SIZE, DEFAULT_OVERLAP)
    };

    let now = Utc::now();
    let total_chunks = if modality == Modality::Image { 1 } else { windows.len() as i64 };
    let pipeline_name = "ingest";

    let mut chunks: Vec<Chunk> = if modality == Modality::Image {
        vec![Chunk {
            id: Uuid::new_v4(),
            container_id,
            document_id: document.id,
            modality,
            text: None,
            byte_start: 0,
            byte_end: 0,
            provenance: Provenance {
                source_uri: source.uri.clone(),
                ingested_at: now,
                pipeline: pipeline_name.to_string(),
                chunk_index: 0,
                total_chunks: 1,
            },
            meta: serde_json::json!({}),
            embedding_version: container.embedder_version.clone(),
            dedup_of: None,
        }]
    } else {
        windows
            .iter()
            .map(|w| Chunk {
                id: Uuid::new_v4(),
                container_id,
                document_id: document.id,
                modality,
                text: Some(w.text.clone()),
                byte_start: w.byte_start,
                byte_end: w.byte_end,
                provenance: provenance_for(&source.uri, pipeline_name, w, total_chunks, now),
                meta: serde_json::json!({}),
                embedding_version: container.embedder_version.clone(),
                dedup_of: None,
            })
            .collect()
    };

    // blob to object store, best-effort (§4.2 commit order, step 1)
    if let Err(err) = store_blob(ctx, &container_id, &document, &text, modality, source, &image_bytes).await {
        warn!(error = %err, "object store write failed, continuing with relational state authoritative");
        issues.push("OBJECT_STORE_DOWN".to_string());
    }

    let deduped_count = embed_and_dedup(ctx, &manifest, &mut chunks, &image_bytes, &mut issues).await;

    // chunks inserted (step 2)
    ctx.relational.replace_chunks(document.id, chunks.clone()).await?;

    // container stats recomputed (step 3)
    recompute_stats(ctx, container_id, now).await?;

    // vectors already upserted inside embed_and_dedup (step 4, per-chunk)

    // graph upserted (step 5), best-effort
    if manifest.graph.enabled {
        if let Err(err) = upsert_graph(ctx, container_id, &document, &chunks).await {
            warn!(error = %err, "graph upsert failed, relational commit is not rolled back");
            issues.push("GRAPH_DOWN".to_string());
        }
    }

    Ok(IngestOutcome {
        document_id: document.id,
        chunk_count: chunks.len(),
        deduped_count,
        no_op: false,
        degraded,
        issues,
    })
}

fn new_document(container_id: Uuid, hash: &str, source: &IngestSource) -> Document {
    let now = Utc::now();
    Document {
        id: Uuid::new_v4(),
        container_id,
        hash: hash.to_string(),
        uri: source.uri.clone(),
        mime: source.mime.clone(),
        title: source.title.clone(),
        meta: source.meta.clone(),
        state: DocumentState::Pending,
        created_at: now,
        updated_at: now,
    }
}

fn refresh_document(mut doc: Document, source: &IngestSource, hash: &str) -> Document {
    doc.hash = hash.to_string();
    doc.uri = source.uri.clone();
    doc.mime = source.mime.clone();
    doc.title = source.title.clone();
    doc.meta = source.meta.clone();
    doc.state = DocumentState::Pending;
    doc.updated_at = Utc::now();
    doc
}

fn fingerprint_for(text: &str, source: &IngestSource) -> String {
    let cleaned = text.trim();
    if !cleaned.is_empty() {
        cleaned.to_string()
    } else {
        format!("{}:{}", source.uri, source.title.as_deref().unwrap_or(""))
    }
}

/// Extract text for the detected modality. Inline content (`meta.text` or
/// `meta.base64`) never touches the network. Anything else requires the
/// document-fetch feature flag; when it is off, fetching is refused with a
/// `FETCH_DISABLED` issue rather than synthesizing placeholder text (§9 Open
/// Questions, E6).
async fn extract_source_text(
    ctx: &AppContext,
    source: &IngestSource,
    modality: Modality,
    issues: &mut Vec<String>,
) -> Result<(String, bool)> {
    if modality == Modality::Image {
        return Ok((String::new(), false));
    }

    if let Some(inline) = source.meta.get("text").and_then(|v| v.as_str()) {
        return Ok((inline.to_string(), false));
    }

    let bytes = fetch_source_bytes(ctx, source).await?;

    match modality {
        Modality::Pdf => match extract::extract_pdf(&bytes) {
            Ok(text) if !text.trim().is_empty() => Ok((text, false)),
            Ok(_) => {
                issues.push("PDF_EXTRACTION_EMPTY".to_string());
                Ok((String::new(), true))
            }
            Err(err) => {
                warn!(error = %err, "pdf extraction failed, inserting degraded fallback chunk");
                issues.push("PDF_EXTRACTION_FAILED".to_string());
                Ok((String::new(), true))
            }
        },
        _ => Ok((String::from_utf8_lossy(&bytes).to_string(), false)),
    }
}

/// Resolve the raw bytes for a source: inline base64, then (if enabled) a
/// network fetch. Refuses with `FETCH_DISABLED` when the feature flag is
/// off and no inline content was supplied.
async fn fetch_source_bytes(ctx: &AppContext, source: &IngestSource) -> Result<Vec<u8>> {
    if let Some(b64) = source.meta.get("base64").and_then(|v| v.as_str()) {
        use base64::Engine;
        return Ok(base64::engine::general_purpose::STANDARD.decode(b64)?);
    }

    if source.uri.starts_with("inline:") {
        return Ok(Vec::new());
    }

    if !ctx.config.server.document_fetch_enabled {
        anyhow::bail!("FETCH_DISABLED: document-fetch is disabled, cannot fetch {}", source.uri);
    }

    let resp = reqwest::get(&source.uri).await?;
    let bytes = resp.bytes().await?;
    Ok(bytes.to_vec())
}

/// Persist the raw extracted content for `document`. Images reuse the
/// original bytes; text/pdf persist the extracted text under `<doc>.txt`.
async fn store_blob(
    ctx: &AppContext,
    container_id: &Uuid,
    document: &Document,
    text: &str,
    modality: Modality,
    source: &IngestSource,
    image_bytes: &[u8],
) -> Result<()> {
    if modality == Modality::Image {
        if image_bytes.is_empty() {
            return Ok(());
        }
        let filename = source.uri.rsplit('/').next().unwrap_or("original").to_string();
        let path = crate::object_store_s3::original_image_path(*container_id, document.id, &filename);
        ctx.object.put(&path, image_bytes.to_vec(), source.mime.as_deref().unwrap_or("application/octet-stream")).await?;

        let image_config = ctx.manifests.load(*container_id).await.ok().flatten().map(|m| m.image).unwrap_or_default();
        if let Ok(thumb) = extract::make_thumbnail(image_bytes, &image_config) {
            let stem = filename.rsplit('.').nth(1).unwrap_or("original");
            let thumb_path = crate::object_store_s3::thumbnail_path(*container_id, document.id, stem);
            ctx.object.put(&thumb_path, thumb.bytes, "image/jpeg").await?;
        }
        return Ok(());
    }

    if text.is_empty() {
        return Ok(());
    }
    let path = crate::object_store_s3::raw_text_path(*container_id, document.id);
    ctx.object.put(&path, text.as_bytes().to_vec(), "text/plain; charset=utf-8").await
}

/// Resolve embeddings and run semantic dedup for one ingest pass. Image
/// documents carry exactly one chunk with no text (§4.2); that chunk is
/// routed to the image embedder instead of the text batch call (§4.6
/// "Image embedding is a separate endpoint"), everything else goes through
/// the cached batched text path. Returns the count of chunks marked as
/// duplicates.
async fn embed_and_dedup(
    ctx: &AppContext,
    manifest: &Manifest,
    chunks: &mut [Chunk],
    image_bytes: &[u8],
    issues: &mut Vec<String>,
) -> usize {
    if let [chunk] = chunks {
        if chunk.text.is_none() {
            let vector = resolve_image_vector(ctx, chunk, image_bytes, issues).await;
            if vector.iter().all(|v| *v == 0.0) {
                return 0;
            }
            return dedup_and_upsert(ctx, manifest, chunk, vector, issues).await;
        }
    }
    embed_and_dedup_text(ctx, manifest, chunks, issues).await
}

/// For each text chunk: resolve its embedding (cache hit, stale recompute,
/// or a fresh batched call), then run semantic dedup against the vector
/// store. Returns the count of chunks that were marked as duplicates.
async fn embed_and_dedup_text(
    ctx: &AppContext,
    manifest: &Manifest,
    chunks: &mut [Chunk],
    issues: &mut Vec<String>,
) -> usize {
    let ttl = ChronoDuration::seconds(ctx.config.embedding.cache_ttl_secs);
    let mut to_embed: Vec<usize> = Vec::new();
    let mut vectors: Vec<Option<Vec<f32>>> = vec![None; chunks.len()];

    for (i, chunk) in chunks.iter().enumerate() {
        let text = chunk.text.as_deref().unwrap_or_default();
        let cache_key = embedding_cache_key(text, chunk.modality.as_str(), &chunk.embedding_version);
        match ctx.relational.get_embedding_cache(&cache_key, ttl).await {
            Ok(Some(entry)) => {
                let _ = ctx.relational.touch_embedding_cache(&cache_key).await;
                vectors[i] = Some(entry.vector);
            }
            Ok(None) => to_embed.push(i),
            Err(err) => {
                warn!(error = %err, "embedding cache lookup failed, will recompute");
                to_embed.push(i);
            }
        }
    }

    if !to_embed.is_empty() && ctx.config.embedding.is_enabled() {
        let batch_size = ctx.config.embedding.batch_size.max(1);
        for batch in to_embed.chunks(batch_size) {
            let texts: Vec<String> = batch
                .iter()
                .map(|&i| chunks[i].text.clone().unwrap_or_default())
                .collect();
            match embedding_client::embed_texts(&ctx.config.embedding, &texts).await {
                Ok(batch_vectors) => {
                    for (&i, vector) in batch.iter().zip(batch_vectors.into_iter()) {
                        let _ = ctx
                            .relational
                            .put_embedding_cache(EmbeddingCacheEntry {
                                content_hash: content_hash(&chunks[i].text.clone().unwrap_or_default()),
                                modality: chunks[i].modality,
                                embedder_version: chunks[i].embedding_version.clone(),
                                vector: vector.clone(),
                                dims: vector.len(),
                                last_used: Utc::now(),
                            })
                            .await;
                        vectors[i] = Some(vector);
                    }
                }
                Err(err) => {
                    warn!(error = %err, "embedding provider failed, falling back to zero vectors");
                    issues.push("VECTOR_DOWN".to_string());
                    for &i in batch {
                        vectors[i] = Some(zero_vector(ctx.config.embedding.dims.max(1)));
                    }
                }
            }
        }
    } else if !to_embed.is_empty() {
        for &i in &to_embed {
            vectors[i] = Some(zero_vector(ctx.config.embedding.dims.max(1)));
        }
    }

    let mut deduped = 0usize;
    for (i, chunk) in chunks.iter_mut().enumerate() {
        let Some(vector) = vectors[i].take() else { continue };
        if vector.iter().all(|v| *v == 0.0) {
            continue;
        }
        deduped += dedup_and_upsert(ctx, manifest, chunk, vector, issues).await;
    }

    deduped
}

/// Resolve the embedding vector for an image chunk: cache hit, stale
/// recompute, or a fresh call to the image embedder. Falls back to a zero
/// vector (never an `Err`) so a provider or decode failure only degrades
/// to `VECTOR_DOWN`, matching the text path's failure semantics (§4.2).
async fn resolve_image_vector(
    ctx: &AppContext,
    chunk: &Chunk,
    image_bytes: &[u8],
    issues: &mut Vec<String>,
) -> Vec<f32> {
    if image_bytes.is_empty() {
        issues.push("VECTOR_DOWN".to_string());
        return zero_vector(ctx.config.embedding.dims.max(1));
    }

    let ttl = ChronoDuration::seconds(ctx.config.embedding.cache_ttl_secs);
    let cache_key = embedding_cache_key_bytes(image_bytes, chunk.modality.as_str(), &chunk.embedding_version);
    match ctx.relational.get_embedding_cache(&cache_key, ttl).await {
        Ok(Some(entry)) => {
            let _ = ctx.relational.touch_embedding_cache(&cache_key).await;
            return entry.vector;
        }
        Ok(None) => {}
        Err(err) => warn!(error = %err, "embedding cache lookup failed, will recompute"),
    }

    if !ctx.config.embedding.is_enabled() {
        return zero_vector(ctx.config.embedding.dims.max(1));
    }

    match embedding_client::embed_image(&ctx.config.embedding, image_bytes).await {
        Ok(vector) => {
            let _ = ctx
                .relational
                .put_embedding_cache(EmbeddingCacheEntry {
                    content_hash: content_hash_bytes(image_bytes),
                    modality: chunk.modality,
                    embedder_version: chunk.embedding_version.clone(),
                    vector: vector.clone(),
                    dims: vector.len(),
                    last_used: Utc::now(),
                })
                .await;
            vector
        }
        Err(err) => {
            warn!(error = %err, "image embedding provider failed, falling back to zero vector");
            issues.push("VECTOR_DOWN".to_string());
            zero_vector(ctx.config.embedding.dims.max(1))
        }
    }
}

/// Semantic dedup check against the vector store, then insert or mark
/// `dedup_of` (§4.2). Shared by the text and image embedding paths.
/// Returns 1 if the chunk was marked as a duplicate, 0 otherwise.
async fn dedup_and_upsert(
    ctx: &AppContext,
    manifest: &Manifest,
    chunk: &mut Chunk,
    vector: Vec<f32>,
    issues: &mut Vec<String>,
) -> usize {
    let container_id = chunk.container_id;
    let modality = chunk.modality;
    let neighbor = ctx.vector.search(container_id, modality, &vector, 1).await;
    let neighbor: Option<VectorHit> = match neighbor {
        Ok(mut hits) => hits.pop(),
        Err(err) => {
            warn!(error = %err, "vector store search failed during dedup check, treating as no neighbor");
            issues.push("VECTOR_DOWN".to_string());
            None
        }
    };

    if let Some(hit) = neighbor {
        if hit.score >= manifest.dedup.semantic_threshold {
            chunk.dedup_of = Some(hit.chunk_id);
            return 1;
        }
    }

    if let Err(err) = ctx.vector.ensure_collection(container_id, modality, vector.len()).await {
        warn!(error = %err, "vector collection creation failed, chunk remains lexically searchable only");
        issues.push("VECTOR_DOWN".to_string());
        return 0;
    }
    if let Err(err) = ctx
        .vector
        .upsert(container_id, modality, chunk.id, chunk.document_id, &vector)
        .await
    {
        warn!(error = %err, "vector upsert failed, chunk remains lexically searchable only");
        issues.push("VECTOR_DOWN".to_string());
    }
    0
}

/// Recompute and persist container-level stats after a commit. The relational
/// adapter owns the actual aggregate query; this just bumps the document
/// count and timestamp eagerly so a concurrent `describe` call sees progress
/// without waiting on a full recount (chunk_count/size_bytes are left to the
/// store's own aggregate on the next stats refresh).
async fn recompute_stats(ctx: &AppContext, container_id: Uuid, now: chrono::DateTime<Utc>) -> Result<()> {
    let Some(container) = ctx.relational.get_container(&container_id.to_string()).await? else {
        return Ok(());
    };
    ctx.relational
        .update_container_stats(
            container_id,
            container.stats.document_count + 1,
            container.stats.chunk_count,
            container.stats.size_bytes,
            now,
        )
        .await
}

static PROPER_NOUN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[A-Z][A-Za-z]{3,}(?:\s+[A-Z][A-Za-z]{3,}){0,2}\b").unwrap());

/// Heuristic fallback graph extraction (§4.2): capitalized-span entities,
/// `MENTIONS` edges from the owning chunk, and `CO_OCCURS` edges between
/// entities found in the same sentence. The LLM-extractor path is not
/// implemented in this build (no remote extractor client is configured);
/// `manifest.graph.llm_extractor` is accepted but currently always falls
/// back to this heuristic (documented in DESIGN.md).
fn extract_entities_heuristic(text: &str) -> Vec<(String, Vec<String>)> {
    let mut per_sentence = Vec::new();
    for sentence in text.split(['.', '\n']) {
        let mut seen = HashSet::new();
        let mut ids = Vec::new();
        for mat in PROPER_NOUN.find_iter(sentence) {
            let span = mat.as_str();
            if span.len() < 4 {
                continue;
            }
            let id = span.to_ascii_lowercase().replace(' ', "_");
            if seen.insert(id.clone()) {
                ids.push(id);
            }
        }
        if !ids.is_empty() {
            per_sentence.push((sentence.to_string(), ids));
        }
    }
    per_sentence
}

async fn upsert_graph(ctx: &AppContext, container_id: Uuid, document: &Document, chunks: &[Chunk]) -> Result<()> {
    let doc_node_id = format!("doc:{}", document.id);
    ctx.graph
        .upsert_node(GraphNode {
            container_id,
            node_id: doc_node_id.clone(),
            label: "LLCNode".to_string(),
            node_type: "Document".to_string(),
            summary: document.title.clone().unwrap_or_else(|| document.uri.clone()),
            properties: serde_json::json!({"uri": document.uri}),
            source_chunk_ids: chunks.iter().map(|c| c.id).collect(),
        })
        .await?;

    for chunk in chunks {
        let chunk_node_id = format!("chunk:{}", chunk.id);
        ctx.graph
            .upsert_node(GraphNode {
                container_id,
                node_id: chunk_node_id.clone(),
                label: "LLCNode".to_string(),
                node_type: "Concept".to_string(),
                summary: chunk.text.clone().unwrap_or_default().chars().take(200).collect(),
                properties: serde_json::json!({"chunk_index": chunk.provenance.chunk_index}),
                source_chunk_ids: vec![chunk.id],
            })
            .await?;
        ctx.graph
            .upsert_edge(GraphEdge {
                container_id,
                source_id: doc_node_id.clone(),
                target_id: chunk_node_id.clone(),
                edge_type: "HAS_CHUNK".to_string(),
                properties: serde_json::json!({}),
                source_chunk_ids: vec![chunk.id],
            })
            .await?;

        let Some(text) = &chunk.text else { continue };
        for (_sentence, entity_ids) in extract_entities_heuristic(text) {
            for entity_id in &entity_ids {
                let node_id = format!("entity:{entity_id}");
                ctx.graph
                    .upsert_node(GraphNode {
                        container_id,
                        node_id: node_id.clone(),
                        label: "LLCNode".to_string(),
                        node_type: container_core::models::normalize_entity_type("Concept").to_string(),
                        summary: entity_id.replace('_', " "),
                        properties: serde_json::json!({}),
                        source_chunk_ids: vec![chunk.id],
                    })
                    .await?;
                ctx.graph
                    .upsert_edge(GraphEdge {
                        container_id,
                        source_id: chunk_node_id.clone(),
                        target_id: node_id.clone(),
                        edge_type: container_core::models::normalize_relation_type("MENTIONS").to_string(),
                        properties: serde_json::json!({}),
                        source_chunk_ids: vec![chunk.id],
                    })
                    .await?;
            }
            for pair in entity_ids.windows(2) {
                let (a, b) = (format!("entity:{}", pair[0]), format!("entity:{}", pair[1]));
                ctx.graph
                    .upsert_edge(GraphEdge {
                        container_id,
                        source_id: a,
                        target_id: b,
                        edge_type: container_core::models::normalize_relation_type("CO_OCCURS").to_string(),
                        properties: serde_json::json!({}),
                        source_chunk_ids: vec![chunk.id],
                    })
                    .await?;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use container_core::memory::{MemoryGraphStore, MemoryObjectStore, MemoryRelationalStore, MemoryVectorStore};
    use container_core::models::{Container, ContainerStats, ContainerState};
    use std::collections::HashMap;
    use std::sync::Arc;

    use crate::agent_activity::AgentActivitySink;
    use crate::config::{Config, EmbeddingConfig, JobQueueConfig, ObjectConfig, RelationalConfig, RerankConfig, RetrievalDefaults, ServerConfig};
    use crate::manifest_loader::ManifestLoader;

    fn test_config() -> Config {
        Config {
            relational: RelationalConfig { dsn: "postgres://test".into(), pool_size: 1, auto_migrate: false },
            vector: Default::default(),
            object: ObjectConfig::default(),
            graph: crate::config::GraphConfig::default(),
            embedding: EmbeddingConfig::default(),
            rerank: RerankConfig::default(),
            nl2cypher: Default::default(),
            server: ServerConfig {
                bind: "127.0.0.1:0".into(),
                bearer_token: "test".into(),
                bearer_token_file: None,
                document_fetch_enabled: false,
                admin_fastpath: false,
            },
            job_queue: JobQueueConfig::default(),
            retrieval: RetrievalDefaults::default(),
        }
    }

    async fn test_ctx() -> (AppContext, Uuid) {
        let relational = Arc::new(MemoryRelationalStore::new());
        let vector = Arc::new(MemoryVectorStore::new());
        let object = Arc::new(MemoryObjectStore::new());
        let graph = Arc::new(MemoryGraphStore::new());

        let container = Container {
            id: Uuid::new_v4(),
            slug: "demo".into(),
            theme: None,
            parent_id: None,
            allowed_modalities: vec![Modality::Text],
            embedder_id: "local".into(),
            embedder_version: "v1".into(),
            embedding_dims: 4,
            acl: HashMap::new(),
            state: ContainerState::Active,
            stats: ContainerStats::default(),
            graph_enabled: false,
            guiding_document_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        relational.create_container(container.clone()).await.unwrap();

        let manifests = Arc::new(ManifestLoader::new(relational.clone()));
        let agent_activity = Arc::new(AgentActivitySink::new(relational.clone()));
        let ctx = AppContext {
            config: Arc::new(test_config()),
            relational,
            vector,
            object,
            graph,
            manifests,
            agent_activity,
        };
        (ctx, container.id)
    }

    #[tokio::test]
    async fn ingest_inline_text_produces_one_chunk() {
        let (ctx, container_id) = test_ctx().await;
        let source = IngestSource {
            uri: "inline:x".into(),
            mime: None,
            modality: Some("text".into()),
            title: None,
            meta: serde_json::json!({"text": "alpha beta gamma"}),
        };
        let outcome = run_ingest(&ctx, container_id, &source).await.unwrap();
        assert!(!outcome.no_op);
        assert_eq!(outcome.chunk_count, 1);
    }

    #[tokio::test]
    async fn ingest_twice_is_idempotent() {
        let (ctx, container_id) = test_ctx().await;
        let source = IngestSource {
            uri: "inline:x".into(),
            mime: None,
            modality: Some("text".into()),
            title: None,
            meta: serde_json::json!({"text": "alpha beta gamma"}),
        };
        let first = run_ingest(&ctx, container_id, &source).await.unwrap();
        let second = run_ingest(&ctx, container_id, &source).await.unwrap();
        assert!(!first.no_op);
        assert!(second.no_op);
        assert_eq!(first.document_id, second.document_id);
    }

    #[tokio::test]
    async fn fetch_disabled_refuses_non_inline_uri() {
        let (ctx, container_id) = test_ctx().await;
        let source = IngestSource {
            uri: "https://example.com/doc.txt".into(),
            mime: Some("text/plain".into()),
            modality: Some("text".into()),
            title: None,
            meta: serde_json::Value::Null,
        };
        let result = run_ingest(&ctx, container_id, &source).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("FETCH_DISABLED"));
    }

    #[tokio::test]
    async fn image_ingest_produces_one_textless_chunk_and_skips_embedding_when_disabled() {
        use base64::Engine;

        let (ctx, container_id) = test_ctx().await;
        let b64 = base64::engine::general_purpose::STANDARD.encode(b"not-a-real-image-but-non-empty");
        let source = IngestSource {
            uri: "inline:photo.jpg".into(),
            mime: Some("image/jpeg".into()),
            modality: Some("image".into()),
            title: None,
            meta: serde_json::json!({ "base64": b64 }),
        };
        let outcome = run_ingest(&ctx, container_id, &source).await.unwrap();
        assert!(!outcome.no_op);
        assert_eq!(outcome.chunk_count, 1);
        // embedding provider is "disabled" in test_config, so this degrades
        // to a zero vector rather than calling the image embedder, and the
        // zero vector is never upserted (§4.2 failure semantics).
        let hits = ctx.vector.search(container_id, Modality::Image, &[0.0; 4], 1).await.unwrap();
        assert!(hits.is_empty());
    }
}
