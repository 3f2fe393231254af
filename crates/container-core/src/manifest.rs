//! Per-container manifest types (C1 — Manifest Loader).
//!
//! A manifest is the declarative configuration document described in §4.1:
//! allowed modalities, size/page limits, retrieval tuning, dedup threshold,
//! ACL roles, graph toggles, and image processing knobs. The loader in
//! `container-service` reads these from disk/DB and merges them with
//! relational-store defaults; this module only defines the shape and the
//! merge rule, so it can be unit tested without any I/O.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::models::{Modality, Role};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_size_bytes")]
    pub max_size_bytes: u64,
    #[serde(default = "default_max_pdf_pages")]
    pub max_pdf_pages: u32,
}

fn default_max_size_bytes() -> u64 {
    25 * 1024 * 1024
}
fn default_max_pdf_pages() -> u32 {
    200
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: default_max_size_bytes(),
            max_pdf_pages: default_max_pdf_pages(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_top_k_in")]
    pub top_k_in: usize,
    #[serde(default = "default_top_k_out")]
    pub top_k_out: usize,
    #[serde(default = "default_rerank_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_top_k_in() -> usize {
    50
}
fn default_top_k_out() -> usize {
    10
}
fn default_rerank_timeout_ms() -> u64 {
    800
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            top_k_in: default_top_k_in(),
            top_k_out: default_top_k_out(),
            timeout_ms: default_rerank_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreshnessConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_decay_lambda")]
    pub decay_lambda: f64,
}

fn default_decay_lambda() -> f64 {
    0.0
}

impl Default for FreshnessConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            decay_lambda: default_decay_lambda(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_latency_budget_ms")]
    pub latency_budget_ms: i64,
    #[serde(default)]
    pub rerank: RerankConfig,
    #[serde(default)]
    pub freshness: FreshnessConfig,
}

fn default_latency_budget_ms() -> i64 {
    1500
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            latency_budget_ms: default_latency_budget_ms(),
            rerank: RerankConfig::default(),
            freshness: FreshnessConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    #[serde(default = "default_semantic_threshold")]
    pub semantic_threshold: f32,
}

fn default_semantic_threshold() -> f32 {
    0.96
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            semantic_threshold: default_semantic_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GraphConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub llm_extractor: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default = "default_thumbnail_max_edge")]
    pub thumbnail_max_edge: u32,
    #[serde(default = "default_compress_quality")]
    pub compress_quality: u8,
}

fn default_thumbnail_max_edge() -> u32 {
    2048
}
fn default_compress_quality() -> u8 {
    85
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            thumbnail_max_edge: default_thumbnail_max_edge(),
            compress_quality: default_compress_quality(),
        }
    }
}

/// Declarative per-container configuration (§4.1). Manifest values win
/// over relational-store defaults wherever both are present.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Manifest {
    #[serde(default)]
    pub modalities: Vec<Modality>,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub acl: HashMap<String, Role>,
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default)]
    pub image: ImageConfig,
}

impl Manifest {
    /// Merge a manifest over a container's relational-store defaults.
    /// Manifest fields take priority; absent manifest fields fall back to
    /// the defaults passed in.
    pub fn merge_over(
        manifest: Option<&Manifest>,
        default_modalities: &[Modality],
        default_acl: &HashMap<String, Role>,
    ) -> Manifest {
        let mut merged = manifest.cloned().unwrap_or_default();
        if merged.modalities.is_empty() {
            merged.modalities = default_modalities.to_vec();
        }
        if merged.acl.is_empty() {
            merged.acl = default_acl.clone();
        }
        merged
    }

    pub fn effective_latency_budget_ms(&self, global_budget_ms: i64) -> i64 {
        self.retrieval.latency_budget_ms.min(global_budget_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_prefers_manifest_modalities_over_defaults() {
        let manifest = Manifest {
            modalities: vec![Modality::Image],
            ..Default::default()
        };
        let merged = Manifest::merge_over(Some(&manifest), &[Modality::Text], &HashMap::new());
        assert_eq!(merged.modalities, vec![Modality::Image]);
    }

    #[test]
    fn merge_falls_back_to_defaults_when_manifest_absent() {
        let merged = Manifest::merge_over(None, &[Modality::Text, Modality::Pdf], &HashMap::new());
        assert_eq!(merged.modalities, vec![Modality::Text, Modality::Pdf]);
    }

    #[test]
    fn effective_budget_is_the_minimum() {
        let m = Manifest {
            retrieval: RetrievalConfig {
                latency_budget_ms: 2000,
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(m.effective_latency_budget_ms(500), 500);
        assert_eq!(m.effective_latency_budget_ms(5000), 2000);
    }
}
