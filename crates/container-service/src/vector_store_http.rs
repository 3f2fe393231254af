//! HTTP vector store adapter (C3), targeting a Qdrant-style collection API.
//!
//! Collections are named `<container_id>__<modality>` so a container's
//! per-modality vectors live in isolated collections that can be dropped
//! independently (§5 shared resource policy: per-container isolation, no
//! cross-container search).
//!
//! Grounded on the teacher's `reqwest::Client` usage in
//! `embedding/mod.rs`/`connector_s3.rs`: a shared client built once,
//! `Duration`-based timeout, explicit status-code branching rather than
//! `error_for_status()` so response bodies can be surfaced in errors.

use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use container_core::models::Modality;
use container_core::store::{VectorHit, VectorStore};
use serde_json::json;
use uuid::Uuid;

pub struct HttpVectorStore {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpVectorStore {
    pub fn new(base_url: String, api_key: Option<String>, timeout_ms: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()?;
        Ok(Self { client, base_url, api_key })
    }

    fn collection_name(container_id: Uuid, modality: Modality) -> String {
        format!("{}__{}", container_id, modality.as_str())
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.client.request(method, url);
        if let Some(key) = &self.api_key {
            req = req.header("api-key", key);
        }
        req
    }
}

#[async_trait]
impl VectorStore for HttpVectorStore {
    async fn ensure_collection(
        &self,
        container_id: Uuid,
        modality: Modality,
        dims: usize,
    ) -> Result<()> {
        let name = Self::collection_name(container_id, modality);
        let resp = self
            .request(reqwest::Method::PUT, &format!("/collections/{name}"))
            .json(&json!({
                "vectors": { "size": dims, "distance": "Cosine" }
            }))
            .send()
            .await?;
        let status = resp.status();
        // A 409 here means the collection already exists, which is the
        // expected outcome of a benign race between two ingest workers
        // (§5): treat it as success, not an error.
        if status.is_success() || status.as_u16() == 409 {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(anyhow!("vector store ensure_collection failed ({status}): {body}"))
    }

    async fn upsert(
        &self,
        container_id: Uuid,
        modality: Modality,
        chunk_id: Uuid,
        document_id: Uuid,
        vector: &[f32],
    ) -> Result<()> {
        let name = Self::collection_name(container_id, modality);
        let resp = self
            .request(reqwest::Method::PUT, &format!("/collections/{name}/points"))
            .json(&json!({
                "points": [{
                    "id": chunk_id.to_string(),
                    "vector": vector,
                    "payload": {
                        "chunk_id": chunk_id.to_string(),
                        "doc_id": document_id.to_string(),
                        "container_id": container_id.to_string(),
                        "modality": modality.as_str(),
                    }
                }]
            }))
            .send()
            .await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(anyhow!("vector store upsert failed ({status}): {body}"))
    }

    async fn search(
        &self,
        container_id: Uuid,
        modality: Modality,
        query_vector: &[f32],
        limit: usize,
    ) -> Result<Vec<VectorHit>> {
        let name = Self::collection_name(container_id, modality);
        let resp = self
            .request(reqwest::Method::POST, &format!("/collections/{name}/points/search"))
            .json(&json!({
                "vector": query_vector,
                "limit": limit,
                "with_payload": false,
            }))
            .send()
            .await?;
        let status = resp.status();
        // A missing collection means the container has never been
        // embedded in this modality yet; that is an empty result, not a
        // failure.
        if status.as_u16() == 404 {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("vector store search failed ({status}): {body}"));
        }
        let json: serde_json::Value = resp.json().await?;
        let results = json
            .get("result")
            .and_then(|r| r.as_array())
            .ok_or_else(|| anyhow!("vector store search response missing result array"))?;
        results
            .iter()
            .map(|hit| -> Result<VectorHit> {
                let id_str = hit
                    .get("id")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| anyhow!("vector hit missing id"))?;
                Ok(VectorHit {
                    chunk_id: Uuid::parse_str(id_str)?,
                    score: hit.get("score").and_then(|v| v.as_f64()).unwrap_or(0.0) as f32,
                })
            })
            .collect()
    }

    async fn delete(&self, container_id: Uuid, modality: Modality, chunk_id: Uuid) -> Result<()> {
        let name = Self::collection_name(container_id, modality);
        let resp = self
            .request(reqwest::Method::POST, &format!("/collections/{name}/points/delete"))
            .json(&json!({ "points": [chunk_id.to_string()] }))
            .send()
            .await?;
        let status = resp.status();
        if status.is_success() || status.as_u16() == 404 {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(anyhow!("vector store delete failed ({status}): {body}"))
    }

    async fn drop_container(&self, container_id: Uuid) -> Result<()> {
        for modality in [Modality::Text, Modality::Pdf, Modality::Image, Modality::Web] {
            let name = Self::collection_name(container_id, modality);
            let resp = self
                .request(reqwest::Method::DELETE, &format!("/collections/{name}"))
                .send()
                .await?;
            let status = resp.status();
            if !status.is_success() && status.as_u16() != 404 {
                let body = resp.text().await.unwrap_or_default();
                return Err(anyhow!("vector store drop_container failed ({status}): {body}"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collection_name_is_scoped_per_container_and_modality() {
        let id = Uuid::nil();
        assert_eq!(
            HttpVectorStore::collection_name(id, Modality::Text),
            format!("{id}__text")
        );
        assert_ne!(
            HttpVectorStore::collection_name(id, Modality::Text),
            HttpVectorStore::collection_name(id, Modality::Pdf)
        );
    }
}
