//! Remote reranker client (§4.4 Rerank stage).
//!
//! POSTs the top `top_k_in` candidates to a remote reranker, with a
//! timeout clamped to whatever latency budget remains. The provider may
//! answer with per-item scores or a bare positional ranking; either way
//! items it doesn't mention are appended at the end, preserving their
//! prior order. A small in-process cache, keyed by the exact request
//! shape, returns a cached ordering without a network round-trip. Failure
//! here is always non-fatal: callers get back the original order plus an
//! issue code, never a hard error, per §7's "dependency degradation"
//! class.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::RerankConfig;

#[derive(Debug, Clone)]
pub struct RerankItem {
    pub chunk_id: Uuid,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RerankIssue {
    Down,
    Timeout,
}

impl RerankIssue {
    pub fn code(self) -> &'static str {
        match self {
            RerankIssue::Down => "RERANK_DOWN",
            RerankIssue::Timeout => "RERANK_TIMEOUT",
        }
    }
}

struct CacheEntry {
    order: Vec<Uuid>,
    expires_at: Instant,
}

static CACHE: Lazy<Mutex<HashMap<String, CacheEntry>>> = Lazy::new(|| Mutex::new(HashMap::new()));
const CACHE_CAP: usize = 512;

fn cache_key(provider_url: &str, query: &str, top_k_in: usize, top_k_out: usize, ids: &[Uuid]) -> String {
    let ids_joined = ids.iter().map(Uuid::to_string).collect::<Vec<_>>().join(",");
    format!("{provider_url}|{query}|{top_k_in}|{top_k_out}|{ids_joined}")
}

fn cache_get(key: &str) -> Option<Vec<Uuid>> {
    let mut cache = CACHE.lock().unwrap();
    match cache.get(key) {
        Some(entry) if entry.expires_at > Instant::now() => Some(entry.order.clone()),
        Some(_) => {
            cache.remove(key);
            None
        }
        None => None,
    }
}

fn cache_put(key: String, order: Vec<Uuid>, ttl: Duration) {
    let mut cache = CACHE.lock().unwrap();
    if cache.len() >= CACHE_CAP {
        // evict an arbitrary stale-ish entry rather than maintaining full LRU
        // order tracking for a cache this small.
        if let Some(k) = cache.keys().next().cloned() {
            cache.remove(&k);
        }
    }
    cache.insert(key, CacheEntry { order, expires_at: Instant::now() + ttl });
}

#[derive(Serialize)]
struct RerankRequest<'a> {
    query: &'a str,
    documents: Vec<RerankDoc<'a>>,
    top_k: usize,
}

#[derive(Serialize)]
struct RerankDoc<'a> {
    id: String,
    text: &'a str,
}

#[derive(Deserialize)]
struct RerankResponse {
    #[serde(default)]
    results: Vec<RerankResultItem>,
}

#[derive(Deserialize)]
struct RerankResultItem {
    id: String,
    #[serde(default)]
    score: Option<f64>,
}

/// Rerank `items` (already truncated to `top_k_in` by the caller), returning
/// the reordered chunk ids truncated to `top_k_out`. On any failure or
/// timeout, returns `items`' original order (also truncated) and the issue
/// that occurred.
pub async fn rerank(
    config: &RerankConfig,
    query: &str,
    items: &[RerankItem],
    top_k_out: usize,
    remaining_budget: Duration,
) -> (Vec<Uuid>, Option<RerankIssue>) {
    let original_order: Vec<Uuid> = items.iter().map(|i| i.chunk_id).collect();
    let fallback = || original_order.iter().take(top_k_out).cloned().collect::<Vec<_>>();

    let Some(url) = config.url.as_deref() else {
        return (fallback(), Some(RerankIssue::Down));
    };
    if items.is_empty() || remaining_budget.is_zero() {
        return (fallback(), None);
    }

    let key = cache_key(url, query, items.len(), top_k_out, &original_order);
    if let Some(cached) = cache_get(&key) {
        return (cached, None);
    }

    let timeout = remaining_budget.min(Duration::from_millis(config.timeout_ms));
    let request_body = RerankRequest {
        query,
        documents: items
            .iter()
            .map(|i| RerankDoc { id: i.chunk_id.to_string(), text: &i.text })
            .collect(),
        top_k: top_k_out,
    };

    let client = match reqwest::Client::builder().timeout(timeout).build() {
        Ok(c) => c,
        Err(_) => return (fallback(), Some(RerankIssue::Down)),
    };

    let mut request = client.post(url).json(&request_body);
    if let Some(key) = &config.api_key {
        request = request.bearer_auth(key);
    }

    let response = match request.send().await {
        Ok(r) => r,
        Err(err) if err.is_timeout() => return (fallback(), Some(RerankIssue::Timeout)),
        Err(_) => return (fallback(), Some(RerankIssue::Down)),
    };

    if !response.status().is_success() {
        return (fallback(), Some(RerankIssue::Down));
    }

    let parsed: RerankResponse = match response.json().await {
        Ok(p) => p,
        Err(_) => return (fallback(), Some(RerankIssue::Down)),
    };

    let order = merge_rerank_order(&original_order, &parsed.results, top_k_out);
    cache_put(key, order.clone(), Duration::from_secs(config.cache_ttl_secs.max(0) as u64));
    (order, None)
}

/// Merge the provider's response into a full ordering: known ids are placed
/// by descending score (or response order, if no scores were given),
/// unmentioned ids are appended afterward preserving their original order.
fn merge_rerank_order(original_order: &[Uuid], results: &[RerankResultItem], top_k_out: usize) -> Vec<Uuid> {
    let mut ranked: Vec<(Uuid, f64, usize)> = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for (position, item) in results.iter().enumerate() {
        let Ok(id) = Uuid::parse_str(&item.id) else { continue };
        if !original_order.contains(&id) {
            continue;
        }
        let score = item.score.unwrap_or(-(position as f64));
        ranked.push((id, score, position));
        seen.insert(id);
    }
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut order: Vec<Uuid> = ranked.into_iter().map(|(id, _, _)| id).collect();
    for id in original_order {
        if !seen.contains(id) {
            order.push(*id);
        }
    }
    order.truncate(top_k_out);
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_appends_unmentioned_ids_preserving_order() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        let original = vec![a, b, c];
        let results = vec![RerankResultItem { id: b.to_string(), score: Some(0.9) }];
        let merged = merge_rerank_order(&original, &results, 10);
        assert_eq!(merged, vec![b, a, c]);
    }

    #[test]
    fn merge_truncates_to_top_k_out() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let original = vec![a, b];
        let merged = merge_rerank_order(&original, &[], 1);
        assert_eq!(merged.len(), 1);
    }
}
