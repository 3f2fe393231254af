//! Core data models shared by the ingestion pipeline and the retrieval engine.
//!
//! These types mirror the relational schema (§3 of the design spec) but stay
//! storage-agnostic: no `sqlx::FromRow`, no SQLite/Postgres-specific types.
//! Adapters in `container-service` map these to and from their backing store.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Allowed content modalities for a container or a single chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Text,
    Pdf,
    Image,
    Web,
}

impl Modality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Text => "text",
            Modality::Pdf => "pdf",
            Modality::Image => "image",
            Modality::Web => "web",
        }
    }

    /// Detect modality from an explicit hint, a mime type, then a URI suffix,
    /// falling back to `text`. Mirrors the dispatch order in §4.2.
    pub fn detect(hint: Option<&str>, mime: Option<&str>, uri: &str) -> Modality {
        if let Some(h) = hint {
            if let Some(m) = Modality::parse(h) {
                return m;
            }
        }
        if let Some(mime) = mime {
            if mime.starts_with("application/pdf") {
                return Modality::Pdf;
            }
            if mime.starts_with("image/") {
                return Modality::Image;
            }
        }
        let lower = uri.to_ascii_lowercase();
        if lower.ends_with(".pdf") {
            return Modality::Pdf;
        }
        if lower.ends_with(".jpg")
            || lower.ends_with(".jpeg")
            || lower.ends_with(".png")
            || lower.ends_with(".gif")
            || lower.ends_with(".webp")
        {
            return Modality::Image;
        }
        Modality::Text
    }

    pub fn parse(s: &str) -> Option<Modality> {
        match s {
            "text" => Some(Modality::Text),
            "pdf" => Some(Modality::Pdf),
            "image" => Some(Modality::Image),
            "web" => Some(Modality::Web),
            _ => None,
        }
    }
}

/// Container lifecycle state. Transitions are monotonic except
/// `archived -> active`, which only happens via an explicit API call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Active,
    Paused,
    Archived,
}

/// Aggregate, periodically-recomputed container statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerStats {
    pub document_count: i64,
    pub chunk_count: i64,
    pub size_bytes: i64,
    pub last_ingest: Option<DateTime<Utc>>,
}

/// A principal's role within a container's ACL. Roles are intentionally
/// coarse (reader/writer/admin); finer policy lives in the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Reader,
    Writer,
    Admin,
}

/// Isolated, versioned knowledge collection.
///
/// Invariants (enforced by callers that mutate a `Container`, not by this
/// type alone): name unique; `embedding_dims > 0`; `allowed_modalities`
/// non-empty; `parent_id` forms a DAG rooted at `None`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Container {
    pub id: Uuid,
    pub slug: String,
    pub theme: Option<String>,
    pub parent_id: Option<Uuid>,
    pub allowed_modalities: Vec<Modality>,
    pub embedder_id: String,
    pub embedder_version: String,
    pub embedding_dims: usize,
    pub acl: HashMap<String, Role>,
    pub state: ContainerState,
    pub stats: ContainerStats,
    pub graph_enabled: bool,
    pub guiding_document_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Container {
    /// A principal may act on this container if their ACL role is present,
    /// or if the ACL is empty (open container — matches the reference's
    /// default-allow-local-agent behavior).
    pub fn permits(&self, principal: &str) -> bool {
        self.acl.is_empty() || self.acl.contains_key(principal)
    }
}

/// Lifecycle state of a [`Document`]. `Pending` covers the brief window
/// between row insert and the first successful chunk commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentState {
    Pending,
    Indexed,
    Degraded,
}

/// A normalized document, keyed by `(container_id, hash)`.
///
/// `hash` is SHA-256 over `"{container_id}:{fingerprint}"` where
/// `fingerprint` is the cleaned content, falling back to `uri + title`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub container_id: Uuid,
    pub hash: String,
    pub uri: String,
    pub mime: Option<String>,
    pub title: Option<String>,
    pub meta: serde_json::Value,
    pub state: DocumentState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Provenance metadata attached to every chunk, used for snippet rendering
/// and freshness decay.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Provenance {
    pub source_uri: String,
    pub ingested_at: DateTime<Utc>,
    pub pipeline: String,
    pub chunk_index: i64,
    pub total_chunks: i64,
}

/// A unit of retrievable content.
///
/// `dedup_of`, when set, marks this chunk as a semantic duplicate of an
/// earlier canonical chunk: it must not have a live vector and must not
/// appear in default search results (§3, §8 invariants).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: Uuid,
    pub container_id: Uuid,
    pub document_id: Uuid,
    pub modality: Modality,
    pub text: Option<String>,
    pub byte_start: i64,
    pub byte_end: i64,
    pub provenance: Provenance,
    pub meta: serde_json::Value,
    pub embedding_version: String,
    pub dedup_of: Option<Uuid>,
}

impl Chunk {
    pub fn is_canonical(&self) -> bool {
        self.dedup_of.is_none()
    }
}

/// Cached embedding entry, keyed by `(content_hash, modality, embedder_version)`.
#[derive(Debug, Clone)]
pub struct EmbeddingCacheEntry {
    pub content_hash: String,
    pub modality: Modality,
    pub embedder_version: String,
    pub vector: Vec<f32>,
    pub dims: usize,
    pub last_used: DateTime<Utc>,
}

/// Kind of background work a [`Job`] performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Ingest,
    Refresh,
    Export,
}

/// Job status. `Done` and `Failed` are terminal; `Failed` only leaves the
/// terminal state via an explicit manual requeue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Failed,
}

/// At-least-once unit of work dispatched by the job queue (C7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub kind: JobKind,
    pub status: JobStatus,
    pub container_id: Uuid,
    pub payload: serde_json::Value,
    pub retries: i32,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only event row in a job's journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: Uuid,
    pub status: String,
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// `(container_id, node_id)`-keyed property-graph node. `LLCNode` label in
/// the underlying graph store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    pub container_id: Uuid,
    pub node_id: String,
    pub label: String,
    pub node_type: String,
    pub summary: String,
    pub properties: serde_json::Value,
    pub source_chunk_ids: Vec<Uuid>,
}

/// Container-scoped edge between two [`GraphNode`]s. `LLCEdge` label with
/// a `type` property in the underlying graph store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEdge {
    pub container_id: Uuid,
    pub source_id: String,
    pub target_id: String,
    pub edge_type: String,
    pub properties: serde_json::Value,
    pub source_chunk_ids: Vec<Uuid>,
}

/// Fixed entity-type vocabulary for graph extraction (§4.2). Unknown types
/// collapse to `Concept`.
pub const ENTITY_TYPES: &[&str] = &[
    "Person",
    "Organization",
    "Project",
    "Document",
    "Decision",
    "Product",
    "Team",
    "Risk",
    "Concept",
    "Other",
];

/// Fixed relation-type vocabulary for graph extraction (§4.2). Unknown
/// relations collapse to `RELATED_TO`.
pub const RELATION_TYPES: &[&str] = &[
    "WORKS_ON",
    "OWNS",
    "MANAGES",
    "AUTHORED_BY",
    "MENTIONS",
    "USES",
    "DEPENDS_ON",
    "HAS_DECISION",
    "AFFECTS",
    "PART_OF",
    "IMPLEMENTS",
    "RELATED_TO",
    "CO_OCCURS",
    "HAS_CHUNK",
];

pub fn normalize_entity_type(t: &str) -> &'static str {
    ENTITY_TYPES
        .iter()
        .copied()
        .find(|known| known.eq_ignore_ascii_case(t))
        .unwrap_or("Concept")
}

pub fn normalize_relation_type(t: &str) -> &'static str {
    RELATION_TYPES
        .iter()
        .copied()
        .find(|known| known.eq_ignore_ascii_case(t))
        .unwrap_or("RELATED_TO")
}

/// Per-request diagnostics envelope attached to search/graph responses (§3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Diagnostics {
    pub timings_ms: HashMap<String, i64>,
    pub hit_counts: HashMap<String, i64>,
    pub applied_policies: Vec<String>,
    pub over_budget_ms: Option<i64>,
    pub rerank_applied: bool,
    pub rerank_provider: Option<String>,
    pub graph: Option<serde_json::Value>,
    pub issues: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modality_detect_prefers_hint() {
        assert_eq!(
            Modality::detect(Some("image"), Some("application/pdf"), "doc.pdf"),
            Modality::Image
        );
    }

    #[test]
    fn modality_detect_falls_back_to_mime_then_suffix_then_text() {
        assert_eq!(Modality::detect(None, Some("image/png"), "x"), Modality::Image);
        assert_eq!(Modality::detect(None, None, "report.PDF"), Modality::Pdf);
        assert_eq!(Modality::detect(None, None, "inline:notes"), Modality::Text);
    }

    #[test]
    fn unknown_entity_and_relation_types_collapse() {
        assert_eq!(normalize_entity_type("Spaceship"), "Concept");
        assert_eq!(normalize_relation_type("ORBITS"), "RELATED_TO");
        assert_eq!(normalize_entity_type("person"), "Person");
    }

    #[test]
    fn container_permits_open_acl() {
        let c = Container {
            id: Uuid::nil(),
            slug: "demo".into(),
            theme: None,
            parent_id: None,
            allowed_modalities: vec![Modality::Text],
            embedder_id: "e".into(),
            embedder_version: "v1".into(),
            embedding_dims: 768,
            acl: HashMap::new(),
            state: ContainerState::Active,
            stats: ContainerStats::default(),
            graph_enabled: false,
            guiding_document_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(c.permits("agent:anyone"));
    }
}
