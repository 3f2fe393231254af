//! Remote NL→graph-query translation client (C10 execution).
//!
//! Calls a chat-completion-style endpoint with the prompt assembled by
//! [`container_core::nl2cypher::build_prompt`], then runs the response
//! through the same sanitation pipeline the teacher applies to any
//! LLM-authored text before trusting it: strip code fences, pull the first
//! statement, strip banned function calls, clamp the result limit, then
//! validate against the container's schema. A bad or unreachable model
//! never surfaces as a hard error; translation falls back to
//! [`container_core::nl2cypher::build_fallback_query`] and the caller
//! records `diagnostics.fallback.used = true`.

use std::time::Duration;

use anyhow::{anyhow, Result};
use container_core::nl2cypher::{
    build_fallback_query, build_prompt, ensure_limit, extract_first_query, strip_banned_functions,
    strip_code_fences, validate_query, ValidationOutcome,
};
use container_core::store::GraphSchema;
use serde_json::json;

use crate::config::Nl2CypherConfig;

pub struct TranslationResult {
    pub query: String,
    pub validation: ValidationOutcome,
    pub used_fallback: bool,
}

/// Translate `query` into a validated graph query, scoped to `schema` and
/// `max_hops`, returning at most `k` results. Always returns a query: if
/// the remote model is disabled, unreachable, or produces something that
/// fails validation, the deterministic fallback builder takes over.
pub async fn translate(
    config: &Nl2CypherConfig,
    query: &str,
    schema: &GraphSchema,
    max_hops: u32,
    k: usize,
    container_id: uuid::Uuid,
) -> TranslationResult {
    if config.enabled {
        match call_model_and_validate(config, query, schema, max_hops, k, container_id).await {
            Ok(result) if result.validation.valid => return result,
            _ => {}
        }
    }
    let fallback = build_fallback_query(max_hops, k, Some(query));
    let validation = validate_query(&fallback, schema, max_hops);
    TranslationResult { query: fallback, validation, used_fallback: true }
}

async fn call_model_and_validate(
    config: &Nl2CypherConfig,
    query: &str,
    schema: &GraphSchema,
    max_hops: u32,
    k: usize,
    container_id: uuid::Uuid,
) -> Result<TranslationResult> {
    let url = config.url.as_deref().ok_or_else(|| anyhow!("nl2cypher.url not configured"))?;
    let container_id_str = container_id.to_string();
    let messages = build_prompt(query, schema, max_hops, k, &container_id_str);

    let client = reqwest::Client::builder().timeout(Duration::from_millis(config.timeout_ms)).build()?;
    let mut request = client.post(url).json(&json!({
        "model": config.model,
        "messages": messages,
    }));
    if let Some(key) = &config.api_key {
        request = request.header("Authorization", format!("Bearer {key}"));
    }
    let resp = request.send().await?;
    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        return Err(anyhow!("nl2cypher model call failed ({status}): {body}"));
    }
    let body: serde_json::Value = resp.json().await?;
    let raw = body
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first())
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .ok_or_else(|| anyhow!("nl2cypher model response missing message content"))?;

    let stripped = strip_code_fences(raw);
    let candidate = extract_first_query(&stripped);
    if candidate.trim().is_empty() {
        return Err(anyhow!("no query statement found in model output"));
    }
    let candidate = strip_banned_functions(&candidate);
    let (candidate, _clamped) = ensure_limit(&candidate, k);

    let validation = validate_query(&candidate, schema, max_hops);
    Ok(TranslationResult { query: candidate, validation, used_fallback: false })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_config_always_falls_back() {
        let config = Nl2CypherConfig::default();
        let schema = GraphSchema::default();
        let result = translate(&config, "find people near alice", &schema, 2, 10, uuid::Uuid::nil()).await;
        assert!(result.used_fallback);
        assert!(result.validation.valid);
    }
}
