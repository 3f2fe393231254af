//! Hybrid search engine (C9).
//!
//! Grounded in the teacher's `search.rs` (`search_documents`: mode
//! validation, candidate fetch, min-max normalize, alpha blend, group-by-
//! document, sort-and-truncate) but generalized in three ways the teacher
//! never needed: multi-container fan-out with per-container ACL/policy,
//! reciprocal rank fusion in place of a single weighted alpha blend, and a
//! latency budget tracked across named stages with graceful partial
//! results instead of an all-or-nothing call.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use anyhow::Result;
use base64::Engine;
use chrono::Utc;
use container_core::error::ServiceError;
use container_core::fusion::{freshness_weight, keyword_overlap, pseudo_rerank_blend, reciprocal_rank_fusion};
use container_core::models::{Container, ContainerState, Diagnostics, Modality};
use container_core::store::ChunkCandidate;
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::context::AppContext;
use crate::embedding_client;
use crate::rerank_client::{self, RerankItem};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Semantic,
    Bm25,
    Hybrid,
    Crossmodal,
    Graph,
    HybridGraph,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchRequest {
    pub containers: Vec<String>,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub image_base64: Option<String>,
    #[serde(default = "default_mode")]
    pub mode: SearchMode,
    #[serde(default)]
    pub k: Option<i64>,
    pub principal: String,
    #[serde(default)]
    pub rerank: Option<bool>,
    #[serde(default = "default_max_hops")]
    pub max_hops: u32,
    #[serde(default = "default_neighbor_k")]
    pub neighbor_k: usize,
}

fn default_mode() -> SearchMode {
    SearchMode::Hybrid
}
fn default_max_hops() -> u32 {
    2
}
fn default_neighbor_k() -> usize {
    5
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResultItem {
    pub chunk_id: Uuid,
    pub document_id: Uuid,
    pub container_id: Uuid,
    pub score: f64,
    pub vector_score: f64,
    pub bm25_score: f64,
    pub snippet: String,
    pub modality: Modality,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub version: &'static str,
    pub results: Vec<SearchResultItem>,
    pub diagnostics: Diagnostics,
    pub partial: bool,
    pub graph_context: Option<serde_json::Value>,
}

const STOPWORDS: &[&str] = &["the", "a", "an", "of", "to", "in", "on", "for", "and", "or", "is", "are"];
const SYNONYMS: &[(&str, &str)] = &[("doc", "document"), ("img", "image"), ("repo", "repository")];

/// Run a search request to completion. Never returns `Err` for collaborator
/// failures (embedding/vector/graph down, rerank down) — those degrade into
/// `diagnostics.issues` per §7; only a genuinely malformed request or a
/// relational-store failure propagates as `Err`.
#[instrument(skip(ctx, request))]
pub async fn run_search(ctx: &AppContext, request: SearchRequest) -> Result<SearchResponse> {
    let start = Instant::now();
    let mut diagnostics = Diagnostics::default();
    let mut timings: HashMap<String, i64> = HashMap::new();

    let k = validate_k(request.k, ctx.config.retrieval.default_k, ctx.config.retrieval.max_k)?;

    if matches!(request.mode, SearchMode::Graph) {
        let result = crate::graph_search::run_graph_only(ctx, &request).await?;
        diagnostics.timings_ms = timings;
        diagnostics.graph = Some(result.clone());
        return Ok(SearchResponse {
            version: "v1",
            results: Vec::new(),
            diagnostics,
            partial: false,
            graph_context: Some(result),
        });
    }

    let (containers, budget_ms, rerank_policy) = resolve_containers(ctx, &request, &mut diagnostics).await?;
    if containers.is_empty() {
        diagnostics.issues.push("CONTAINER_NOT_FOUND".to_string());
        return Ok(SearchResponse {
            version: "v1",
            results: Vec::new(),
            diagnostics,
            partial: false,
            graph_context: None,
        });
    }
    let budget = Duration::from_millis(budget_ms.max(0) as u64);

    let query_text = request.query.clone().unwrap_or_default();
    let variants = expand_query(&query_text);

    let container_ids: Vec<Uuid> = containers.iter().map(|c| c.id).collect();
    let allowed_modalities: Vec<Modality> = containers
        .iter()
        .flat_map(|c| c.allowed_modalities.clone())
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();

    let mut lexical_candidates: Vec<ChunkCandidate> = Vec::new();
    let mut vector_candidates: Vec<ChunkCandidate> = Vec::new();

    if !matches!(request.mode, SearchMode::Semantic) {
        let stage_start = Instant::now();
        for variant in &variants {
            match ctx
                .relational
                .keyword_search(&container_ids, variant, &allowed_modalities, (2 * k) as i64)
                .await
            {
                Ok(hits) => lexical_candidates.extend(hits),
                Err(err) => warn!(error = %err, "keyword search failed"),
            }
        }
        timings.insert("bm25_ms".to_string(), stage_start.elapsed().as_millis() as i64);
    }

    if !matches!(request.mode, SearchMode::Bm25) && ctx.config.embedding.is_enabled() {
        let stage_start = Instant::now();

        if matches!(request.mode, SearchMode::Crossmodal) {
            if let Some(b64) = request.image_base64.as_deref() {
                match base64::engine::general_purpose::STANDARD.decode(b64) {
                    Ok(bytes) => match embedding_client::embed_image(&ctx.config.embedding, &bytes).await {
                        Ok(vector) => {
                            fan_out_vector_search(
                                ctx,
                                &container_ids,
                                &allowed_modalities,
                                &vector,
                                k,
                                &mut vector_candidates,
                                &mut diagnostics,
                            )
                            .await;
                        }
                        Err(err) => {
                            warn!(error = %err, "image embedding failed");
                            diagnostics.issues.push("VECTOR_DOWN".to_string());
                        }
                    },
                    Err(err) => {
                        warn!(error = %err, "image_base64 did not decode");
                        diagnostics.issues.push("INVALID_IMAGE".to_string());
                    }
                }
            }
        }

        if !query_text.trim().is_empty() {
            for variant in &variants {
                match embedding_client::embed_query(&ctx.config.embedding, variant).await {
                    Ok(vector) => {
                        fan_out_vector_search(
                            ctx,
                            &container_ids,
                            &allowed_modalities,
                            &vector,
                            k,
                            &mut vector_candidates,
                            &mut diagnostics,
                        )
                        .await;
                    }
                    Err(err) => {
                        warn!(error = %err, "query embedding failed");
                        diagnostics.issues.push("VECTOR_DOWN".to_string());
                    }
                }
            }
        }

        timings.insert("vector_ms".to_string(), stage_start.elapsed().as_millis() as i64);
    }

    let fusion_start = Instant::now();
    let fused = fuse_candidates(&request.mode, &lexical_candidates, &vector_candidates);
    timings.insert("fusion_ms".to_string(), fusion_start.elapsed().as_millis() as i64);

    let mut results = apply_freshness_and_blend(ctx, fused, &query_text).await;
    results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    results.truncate(k);

    if results.is_empty() {
        diagnostics.issues.push("NO_HITS".to_string());
    }

    let rerank_enabled = request.rerank.unwrap_or(ctx.config.rerank.enabled);
    if rerank_enabled {
        let rerank_start = Instant::now();
        results = apply_rerank(ctx, &query_text, results, start.elapsed(), budget, &mut diagnostics).await;
        timings.insert("rerank_ms".to_string(), rerank_start.elapsed().as_millis() as i64);
    }

    let mut graph_context = None;
    if matches!(request.mode, SearchMode::HybridGraph) {
        let graph_start = Instant::now();
        let neighbor_ids: Vec<Uuid> = results.iter().take(request.neighbor_k).map(|r| r.chunk_id).collect();
        match crate::graph_search::expand_neighborhood(ctx, &containers, &neighbor_ids, request.max_hops).await {
            Ok(context) => graph_context = Some(context),
            Err(err) => {
                warn!(error = %err, "graph neighborhood expansion failed");
                diagnostics.issues.push("GRAPH_CONTEXT_FAILED".to_string());
            }
        }
        timings.insert("graph_ms".to_string(), graph_start.elapsed().as_millis() as i64);
    }

    let total_ms = start.elapsed().as_millis() as i64;
    timings.insert("total_ms".to_string(), total_ms);
    let partial = total_ms > budget_ms;
    if partial {
        diagnostics.issues.push("LATENCY_BUDGET_EXCEEDED".to_string());
        diagnostics.over_budget_ms = Some(total_ms - budget_ms);
    }
    diagnostics.timings_ms = timings;
    diagnostics.hit_counts.insert("results".to_string(), results.len() as i64);

    Ok(SearchResponse { version: "v1", results, diagnostics, partial, graph_context })
}

/// Search every (container, modality) pair for `vector`'s nearest chunks and
/// append the resolved candidates to `vector_candidates`. Shared by the text
/// and crossmodal-image embedding paths in the vector stage.
async fn fan_out_vector_search(
    ctx: &AppContext,
    container_ids: &[Uuid],
    allowed_modalities: &[Modality],
    vector: &[f32],
    k: usize,
    vector_candidates: &mut Vec<ChunkCandidate>,
    diagnostics: &mut Diagnostics,
) {
    for &container_id in container_ids {
        for modality in allowed_modalities {
            match ctx.vector.search(container_id, *modality, vector, k).await {
                Ok(hits) => {
                    for hit in hits {
                        if let Ok(Some(chunk)) = ctx.relational.get_chunk(hit.chunk_id).await {
                            vector_candidates.push(ChunkCandidate {
                                chunk_id: chunk.id,
                                document_id: chunk.document_id,
                                container_id: chunk.container_id,
                                raw_score: hit.score as f64,
                                snippet: chunk.text.clone().unwrap_or_default(),
                                modality: chunk.modality,
                            });
                        }
                    }
                }
                Err(err) => {
                    warn!(error = %err, "vector search failed");
                    diagnostics.issues.push("VECTOR_DOWN".to_string());
                }
            }
        }
    }
}

/// Validate the requested result count against `[1, max_k]` (§8: `k=0` and
/// `k>max_k` are rejected, not clamped).
pub(crate) fn validate_k(requested: Option<i64>, default_k: i64, max_k: i64) -> Result<usize> {
    let k = requested.unwrap_or(default_k);
    if k < 1 || k > max_k {
        return Err(ServiceError::Validation {
            code: "INVALID_K",
            message: format!("k must be between 1 and {max_k}, got {k}"),
        }
        .into());
    }
    Ok(k as usize)
}

/// Resolve container identifiers to non-archived containers the requester's
/// principal is permitted to see, and compute the effective latency budget
/// as the minimum across every resolved container's manifest override and
/// the global default (§4.4 step 3).
async fn resolve_containers(
    ctx: &AppContext,
    request: &SearchRequest,
    diagnostics: &mut Diagnostics,
) -> Result<(Vec<Container>, i64, Option<container_core::manifest::RerankConfig>)> {
    let mut resolved = Vec::new();
    let mut budget_ms = ctx.config.retrieval.global_latency_budget_ms;
    let mut rerank_policy = None;

    for identifier in &request.containers {
        let Some(container) = ctx.relational.get_container(identifier).await? else {
            diagnostics.issues.push(format!("CONTAINER_NOT_FOUND:{identifier}"));
            continue;
        };
        if matches!(container.state, ContainerState::Archived) {
            continue;
        }
        if !container.permits(&request.principal) {
            continue;
        }
        let manifest = ctx.manifests.load(container.id).await?.unwrap_or_default();
        budget_ms = budget_ms.min(manifest.effective_latency_budget_ms(ctx.config.retrieval.global_latency_budget_ms));
        if rerank_policy.is_none() && manifest.retrieval.rerank.enabled {
            rerank_policy = Some(manifest.retrieval.rerank.clone());
        }
        resolved.push(container);
    }

    Ok((resolved, budget_ms, rerank_policy))
}

/// Strip punctuation/stopwords, drop tokens ≤2 chars, apply the synonym
/// map, and return up to two variants: the original query and a cleaned
/// keyword-only form (§4.4 Query expansion).
fn expand_query(query: &str) -> Vec<String> {
    if query.trim().is_empty() {
        return vec![String::new()];
    }
    let cleaned: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
        .map(|w| w.to_ascii_lowercase())
        .filter(|w| !STOPWORDS.contains(&w.as_str()))
        .map(|w| {
            SYNONYMS
                .iter()
                .find(|(from, _)| *from == w)
                .map(|(_, to)| to.to_string())
                .unwrap_or(w)
        })
        .collect();

    let keyword_form = cleaned.join(" ");
    if keyword_form.is_empty() || keyword_form == query.to_ascii_lowercase() {
        vec![query.to_string()]
    } else {
        vec![query.to_string(), keyword_form]
    }
}

struct FusedCandidate {
    chunk_id: Uuid,
    document_id: Uuid,
    container_id: Uuid,
    modality: Modality,
    snippet: String,
    vector_score: f64,
    bm25_score: f64,
    fused_score: f64,
}

/// Combine lexical and vector candidate lists. Hybrid/crossmodal/hybrid_graph
/// modes fuse both lists via RRF; single-mode runs (bm25-only, semantic-only)
/// keep the native normalized score (§4.4 Fusion).
fn fuse_candidates(
    mode: &SearchMode,
    lexical: &[ChunkCandidate],
    vector: &[ChunkCandidate],
) -> Vec<FusedCandidate> {
    let mut by_chunk: HashMap<Uuid, FusedCandidate> = HashMap::new();

    let lexical_ranking: Vec<String> = ranked_ids(lexical);
    let vector_ranking: Vec<String> = ranked_ids(vector);

    let use_fusion = matches!(mode, SearchMode::Hybrid | SearchMode::Crossmodal | SearchMode::HybridGraph);
    let rrf_scores = if use_fusion {
        reciprocal_rank_fusion([lexical_ranking.as_slice(), vector_ranking.as_slice()])
    } else {
        HashMap::new()
    };

    for candidate in lexical {
        let entry = by_chunk.entry(candidate.chunk_id).or_insert_with(|| FusedCandidate {
            chunk_id: candidate.chunk_id,
            document_id: candidate.document_id,
            container_id: candidate.container_id,
            modality: candidate.modality,
            snippet: candidate.snippet.clone(),
            vector_score: 0.0,
            bm25_score: 0.0,
            fused_score: 0.0,
        });
        entry.bm25_score = entry.bm25_score.max(candidate.raw_score);
    }
    for candidate in vector {
        let entry = by_chunk.entry(candidate.chunk_id).or_insert_with(|| FusedCandidate {
            chunk_id: candidate.chunk_id,
            document_id: candidate.document_id,
            container_id: candidate.container_id,
            modality: candidate.modality,
            snippet: candidate.snippet.clone(),
            vector_score: 0.0,
            bm25_score: 0.0,
            fused_score: 0.0,
        });
        entry.vector_score = entry.vector_score.max(candidate.raw_score);
    }

    for entry in by_chunk.values_mut() {
        entry.fused_score = if use_fusion {
            rrf_scores.get(&entry.chunk_id.to_string()).copied().unwrap_or(0.0)
        } else if matches!(mode, SearchMode::Bm25) {
            entry.bm25_score
        } else {
            entry.vector_score
        };
    }

    by_chunk.into_values().collect()
}

fn ranked_ids(candidates: &[ChunkCandidate]) -> Vec<String> {
    let mut sorted: Vec<&ChunkCandidate> = candidates.iter().collect();
    sorted.sort_by(|a, b| b.raw_score.partial_cmp(&a.raw_score).unwrap_or(std::cmp::Ordering::Equal));
    sorted.into_iter().map(|c| c.chunk_id.to_string()).collect()
}

/// Apply freshness decay and the pseudo-rerank blend to every fused
/// candidate, looking up each chunk's provenance timestamp from the
/// relational store (§4.4 Freshness, Pseudo-rerank blend).
async fn apply_freshness_and_blend(
    ctx: &AppContext,
    fused: Vec<FusedCandidate>,
    query: &str,
) -> Vec<SearchResultItem> {
    let mut results = Vec::with_capacity(fused.len());
    for candidate in fused {
        let chunk = ctx.relational.get_chunk(candidate.chunk_id).await.ok().flatten();
        if let Some(chunk) = &chunk {
            if chunk.dedup_of.is_some() {
                continue;
            }
        }

        let manifest = ctx.manifests.load(candidate.container_id).await.ok().flatten().unwrap_or_default();
        let age_days = chunk
            .as_ref()
            .map(|c| (Utc::now() - c.provenance.ingested_at).num_seconds() as f64 / 86_400.0)
            .unwrap_or(0.0);
        let freshness = if manifest.retrieval.freshness.enabled {
            freshness_weight(age_days, manifest.retrieval.freshness.decay_lambda)
        } else {
            1.0
        };

        let keyword_score = keyword_overlap(query, &candidate.snippet);
        let blended = pseudo_rerank_blend(candidate.vector_score, candidate.bm25_score, keyword_score);
        let score = (candidate.fused_score.max(blended)) * freshness;

        results.push(SearchResultItem {
            chunk_id: candidate.chunk_id,
            document_id: candidate.document_id,
            container_id: candidate.container_id,
            score,
            vector_score: candidate.vector_score,
            bm25_score: candidate.bm25_score,
            snippet: candidate.snippet,
            modality: candidate.modality,
        });
    }
    results
}

/// Rerank the current result page via the remote reranker, respecting the
/// remaining latency budget. Non-fatal on any failure (§4.4 Rerank).
async fn apply_rerank(
    ctx: &AppContext,
    query: &str,
    results: Vec<SearchResultItem>,
    elapsed: Duration,
    budget: Duration,
    diagnostics: &mut Diagnostics,
) -> Vec<SearchResultItem> {
    if query.trim().is_empty() {
        diagnostics.issues.push("RERANK_SKIPPED_NO_TEXT".to_string());
        return results;
    }
    let remaining = budget.saturating_sub(elapsed);
    let top_k_in = ctx.config.rerank.url.is_some().then(|| results.len()).unwrap_or(0).min(50).max(results.len().min(50));
    let items: Vec<RerankItem> = results
        .iter()
        .take(top_k_in)
        .map(|r| RerankItem { chunk_id: r.chunk_id, text: r.snippet.clone() })
        .collect();

    let (order, issue) = rerank_client::rerank(&ctx.config.rerank, query, &items, results.len(), remaining).await;
    if let Some(issue) = issue {
        diagnostics.issues.push(issue.code().to_string());
        diagnostics.rerank_applied = false;
        return results;
    }

    diagnostics.rerank_applied = true;
    diagnostics.rerank_provider = ctx.config.rerank.url.clone();
    let by_id: HashMap<Uuid, SearchResultItem> = results.into_iter().map(|r| (r.chunk_id, r)).collect();
    order.into_iter().filter_map(|id| by_id.get(&id).cloned()).collect()
}

impl Clone for SearchResultItem {
    fn clone(&self) -> Self {
        Self {
            chunk_id: self.chunk_id,
            document_id: self.document_id,
            container_id: self.container_id,
            score: self.score,
            vector_score: self.vector_score,
            bm25_score: self.bm25_score,
            snippet: self.snippet.clone(),
            modality: self.modality,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_query_drops_stopwords_and_short_tokens() {
        let variants = expand_query("the cat and a dog of war");
        assert!(variants.len() <= 2);
        assert!(!variants.iter().any(|v| v == "the cat and a dog of war"));
    }

    #[test]
    fn expand_query_empty_input_yields_single_empty_variant() {
        let variants = expand_query("");
        assert_eq!(variants, vec!["".to_string()]);
    }

    #[test]
    fn fuse_candidates_bm25_only_uses_native_score() {
        let container_id = Uuid::new_v4();
        let document_id = Uuid::new_v4();
        let chunk_id = Uuid::new_v4();
        let lexical = vec![ChunkCandidate {
            chunk_id,
            document_id,
            container_id,
            raw_score: 3.0,
            snippet: "alpha".into(),
            modality: Modality::Text,
        }];
        let fused = fuse_candidates(&SearchMode::Bm25, &lexical, &[]);
        assert_eq!(fused.len(), 1);
        assert_eq!(fused[0].fused_score, 3.0);
    }

    #[test]
    fn fuse_candidates_hybrid_rewards_agreement_in_both_lists() {
        let container_id = Uuid::new_v4();
        let document_id = Uuid::new_v4();
        let agree = Uuid::new_v4();
        let lexical_only = Uuid::new_v4();
        let lexical = vec![
            ChunkCandidate { chunk_id: agree, document_id, container_id, raw_score: 5.0, snippet: "x".into(), modality: Modality::Text },
            ChunkCandidate { chunk_id: lexical_only, document_id, container_id, raw_score: 1.0, snippet: "y".into(), modality: Modality::Text },
        ];
        let vector = vec![ChunkCandidate { chunk_id: agree, document_id, container_id, raw_score: 0.9, snippet: "x".into(), modality: Modality::Text }];
        let fused = fuse_candidates(&SearchMode::Hybrid, &lexical, &vector);
        let agree_score = fused.iter().find(|c| c.chunk_id == agree).unwrap().fused_score;
        let lexical_only_score = fused.iter().find(|c| c.chunk_id == lexical_only).unwrap().fused_score;
        assert!(agree_score > lexical_only_score);
    }

    #[test]
    fn validate_k_accepts_the_boundary_values() {
        assert_eq!(validate_k(Some(1), 10, 50).unwrap(), 1);
        assert_eq!(validate_k(Some(50), 10, 50).unwrap(), 50);
        assert_eq!(validate_k(None, 10, 50).unwrap(), 10);
    }

    #[test]
    fn validate_k_rejects_zero_and_above_max() {
        assert!(validate_k(Some(0), 10, 50).is_err());
        assert!(validate_k(Some(51), 10, 50).is_err());
    }
}
