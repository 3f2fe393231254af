//! Graph Search Orchestrator (C11).
//!
//! Bridges C10's translation/validation logic to a live [`GraphStore`]: for
//! `graph` mode this runs a full NL→query→execute round trip against a
//! single container; for `hybrid_graph` mode it expands a one-hop-per-level
//! neighborhood seeded by the text search's top chunk ids instead of a
//! natural-language question. Both paths share the same hydration step
//! (§4.5 Execution): integer/opaque node ids from the store are coerced to
//! strings, and every node/edge's `source_chunk_ids` are resolved to a
//! provenance snippet (title, uri, 320-char preview) via the relational
//! store.
//!
//! Grounded in the teacher's pattern of keeping one orchestration module per
//! "ask a remote system, validate locally, degrade gracefully" seam (the
//! same shape as `rerank_client.rs` and `nl2cypher_client.rs`), rather than
//! folding this into `search.rs` directly.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use container_core::models::{Container, GraphEdge, GraphNode};
use container_core::nl2cypher::{build_fallback_query, validate_query};
use container_core::store::GraphQueryResult;
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use crate::context::AppContext;
use crate::nl2cypher_client;
use crate::search::SearchRequest;

const SNIPPET_PREVIEW_CHARS: usize = 320;

/// Run the `graph` (graph-only) search mode: translate `request.query`
/// against each resolved container's schema, execute the resulting query,
/// and hydrate the result into the `{nodes, edges, snippets, issues,
/// fallback}` shape the response's `graph_context` carries.
pub async fn run_graph_only(ctx: &AppContext, request: &SearchRequest) -> Result<serde_json::Value> {
    let query_text = request.query.clone().unwrap_or_default();
    let k = request.k.unwrap_or(ctx.config.retrieval.default_k).clamp(1, ctx.config.retrieval.max_k) as usize;

    let mut issues: Vec<String> = Vec::new();
    let mut used_fallback = false;
    let mut all_nodes: Vec<GraphNode> = Vec::new();
    let mut all_edges: Vec<GraphEdge> = Vec::new();

    let containers = resolve_containers(ctx, &request.containers, &request.principal, &mut issues).await?;
    if containers.is_empty() {
        return Ok(json!({
            "nodes": [],
            "edges": [],
            "snippets": {},
            "issues": issues,
            "fallback": { "used": false },
        }));
    }

    for container in &containers {
        let schema = match ctx.graph.schema(container.id).await {
            Ok(schema) => schema,
            Err(err) => {
                warn!(container_id = %container.id, error = %err, "graph schema lookup failed");
                issues.push("GRAPH_DOWN".to_string());
                continue;
            }
        };

        let translation =
            nl2cypher_client::translate(&ctx.config.nl2cypher, &query_text, &schema, request.max_hops, k, container.id)
                .await;
        used_fallback = used_fallback || translation.used_fallback;

        let timeout = Duration::from_millis(ctx.config.nl2cypher.timeout_ms);
        let mut result = ctx.graph.run_query(container.id, &translation.query, timeout).await;

        if result.is_err() && !translation.used_fallback {
            // NL path failed at execution time: the translator's query
            // validated statically but the store rejected it (unknown
            // function, timeout, etc). Retry once with the deterministic
            // fallback before giving up (§4.5 Fallback).
            let fallback_query = build_fallback_query(request.max_hops, k, Some(&query_text));
            let fallback_validation = validate_query(&fallback_query, &schema, request.max_hops);
            if fallback_validation.valid {
                used_fallback = true;
                result = ctx.graph.run_query(container.id, &fallback_query, timeout).await;
            }
        }

        match result {
            Ok(GraphQueryResult { nodes, edges }) => {
                all_nodes.extend(nodes);
                all_edges.extend(edges);
            }
            Err(err) => {
                warn!(container_id = %container.id, error = %err, "graph query execution failed");
                issues.push("GRAPH_QUERY_INVALID".to_string());
            }
        }
    }

    let snippets = hydrate_snippets(ctx, &all_nodes, &all_edges).await;

    Ok(json!({
        "nodes": all_nodes,
        "edges": all_edges,
        "snippets": snippets,
        "issues": issues,
        "fallback": { "used": used_fallback },
    }))
}

/// Expand a 1..max_hops neighborhood around `seed_chunk_ids` for the
/// `hybrid_graph` mode's post-fusion graph context (§4.4 "Graph context").
/// Unlike [`run_graph_only`] this is never NL-driven: the seed is a set of
/// chunk ids already surfaced by the text search, so the query is built
/// directly rather than translated from a question.
pub async fn expand_neighborhood(
    ctx: &AppContext,
    containers: &[Container],
    seed_chunk_ids: &[Uuid],
    max_hops: u32,
) -> Result<serde_json::Value> {
    if seed_chunk_ids.is_empty() || containers.is_empty() {
        return Ok(json!({ "nodes": [], "edges": [], "snippets": {} }));
    }

    let mut all_nodes: Vec<GraphNode> = Vec::new();
    let mut all_edges: Vec<GraphEdge> = Vec::new();
    let mut issues: Vec<String> = Vec::new();

    for container in containers {
        let schema = ctx.graph.schema(container.id).await.unwrap_or_default();
        let query = build_neighborhood_query(seed_chunk_ids, max_hops);
        let validation = validate_query(&query, &schema, max_hops);
        if !validation.valid {
            issues.push("GRAPH_QUERY_INVALID".to_string());
            continue;
        }

        let timeout = Duration::from_millis(ctx.config.graph.timeout_ms);
        match ctx.graph.run_query(container.id, &query, timeout).await {
            Ok(GraphQueryResult { nodes, edges }) => {
                all_nodes.extend(nodes);
                all_edges.extend(edges);
            }
            Err(err) => {
                warn!(container_id = %container.id, error = %err, "neighborhood expansion query failed");
                issues.push("GRAPH_CONTEXT_FAILED".to_string());
            }
        }
    }

    let snippets = hydrate_snippets(ctx, &all_nodes, &all_edges).await;
    Ok(json!({ "nodes": all_nodes, "edges": all_edges, "snippets": snippets, "issues": issues }))
}

/// Resolve identifiers to non-archived containers the principal may see,
/// mirroring `search::resolve_containers`'s ACL rule without re-deriving
/// the latency-budget/rerank-policy bookkeeping that mode doesn't need.
async fn resolve_containers(
    ctx: &AppContext,
    identifiers: &[String],
    principal: &str,
    issues: &mut Vec<String>,
) -> Result<Vec<Container>> {
    let mut resolved = Vec::new();
    for identifier in identifiers {
        let Some(container) = ctx.relational.get_container(identifier).await? else {
            issues.push(format!("CONTAINER_NOT_FOUND:{identifier}"));
            continue;
        };
        if matches!(container.state, container_core::models::ContainerState::Archived) {
            continue;
        }
        if !container.permits(principal) {
            continue;
        }
        resolved.push(container);
    }
    Ok(resolved)
}

/// Find up to `k`-ish `LLCNode`s referencing any of `seed_chunk_ids` in
/// their `source_chunk_ids`, then expand one hop per level up to
/// `max_hops`, projecting the required `nodes`/`rel_maps` shape.
fn build_neighborhood_query(seed_chunk_ids: &[Uuid], max_hops: u32) -> String {
    let ids_literal = seed_chunk_ids
        .iter()
        .map(|id| format!("\"{id}\""))
        .collect::<Vec<_>>()
        .join(", ");
    let hops = max_hops.max(1);

    format!(
        "MATCH (n:LLCNode {{container_id: $cid}})\n\
         WHERE ANY(cid IN n.source_chunk_ids WHERE cid IN [{ids}])\n\
         WITH collect(n) AS seed_nodes\n\
         OPTIONAL MATCH (seed)-[r:LLCEdge*1..{hops}]-(neighbor:LLCNode {{container_id: $cid}})\n\
         WHERE seed IN seed_nodes\n\
         WITH seed_nodes + collect(DISTINCT neighbor) AS all_nodes, collect(DISTINCT r) AS rels\n\
         UNWIND all_nodes AS node\n\
         WITH collect(DISTINCT node) AS nodes, rels\n\
         RETURN nodes AS nodes, rels AS rel_maps\n\
         LIMIT {limit}",
        ids = ids_literal,
        hops = hops,
        limit = (seed_chunk_ids.len() * 20).max(50),
    )
}

/// Resolve every node/edge's `source_chunk_ids` into a provenance snippet
/// (title, source uri, 320-char text preview), keyed by chunk id string so
/// the JSON response can cross-reference nodes/edges back to the text they
/// were extracted from (§4.5 Execution).
async fn hydrate_snippets(
    ctx: &AppContext,
    nodes: &[GraphNode],
    edges: &[GraphEdge],
) -> HashMap<String, serde_json::Value> {
    let mut chunk_ids: Vec<Uuid> = nodes.iter().flat_map(|n| n.source_chunk_ids.iter().copied()).collect();
    chunk_ids.extend(edges.iter().flat_map(|e| e.source_chunk_ids.iter().copied()));
    chunk_ids.sort();
    chunk_ids.dedup();

    let mut snippets = HashMap::new();
    for chunk_id in chunk_ids {
        let Ok(Some(chunk)) = ctx.relational.get_chunk(chunk_id).await else { continue };
        let Ok(Some(document)) = ctx.relational.get_document(chunk.document_id).await else { continue };
        let text = chunk.text.unwrap_or_default();
        let preview: String = text.chars().take(SNIPPET_PREVIEW_CHARS).collect();
        snippets.insert(
            chunk_id.to_string(),
            json!({
                "title": document.title,
                "source_uri": chunk.provenance.source_uri,
                "preview": preview,
            }),
        );
    }
    snippets
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neighborhood_query_contains_cid_and_limit() {
        let ids = vec![Uuid::new_v4(), Uuid::new_v4()];
        let query = build_neighborhood_query(&ids, 2);
        assert!(query.contains("$cid"));
        assert!(query.to_lowercase().contains("limit"));
        assert!(query.contains(&ids[0].to_string()));
    }

    #[test]
    fn neighborhood_query_validates_against_empty_schema() {
        let ids = vec![Uuid::new_v4()];
        let query = build_neighborhood_query(&ids, 3);
        let schema = container_core::store::GraphSchema::default();
        let outcome = validate_query(&query, &schema, 3);
        assert!(outcome.valid, "neighborhood query must validate: {:?}", outcome.issues);
    }

    #[test]
    fn neighborhood_query_respects_max_hops_bound() {
        let ids = vec![Uuid::new_v4()];
        let query = build_neighborhood_query(&ids, 2);
        let schema = container_core::store::GraphSchema::default();
        assert!(validate_query(&query, &schema, 2).valid);
        // a tighter cap than what the query was built for must fail the hop check
        assert!(!validate_query(&query, &schema, 1).valid);
    }
}
