//! HTTP graph store adapter (C6): a Neo4j-style graph store modeled as an
//! HTTP-queryable endpoint rather than the Bolt binary protocol, matching
//! the teacher's preference for plain `reqwest` JSON clients over bespoke
//! binary wire protocols everywhere else in the store layer.
//!
//! Nodes and edges are kept per-container by always scoping writes and
//! queries with `container_id` in the request body; the server behind this
//! adapter is expected to enforce that scoping (§5 per-container isolation).

use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use container_core::models::{GraphEdge, GraphNode};
use container_core::store::{GraphQueryResult, GraphSchema, GraphStore};
use serde_json::json;
use uuid::Uuid;

use crate::config::GraphConfig;

pub struct HttpGraphStore {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpGraphStore {
    pub fn new(config: &GraphConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self.client.request(method, format!("{}{}", self.base_url, path));
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {key}"));
        }
        req
    }
}

#[async_trait]
impl GraphStore for HttpGraphStore {
    async fn upsert_node(&self, node: GraphNode) -> Result<()> {
        let resp = self
            .request(reqwest::Method::POST, "/nodes")
            .json(&json!({
                "container_id": node.container_id,
                "node_id": node.node_id,
                "label": node.label,
                "node_type": node.node_type,
                "summary": node.summary,
                "properties": node.properties,
                "source_chunk_ids": node.source_chunk_ids,
            }))
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("graph store upsert_node failed ({status}): {body}"));
        }
        Ok(())
    }

    async fn upsert_edge(&self, edge: GraphEdge) -> Result<()> {
        let resp = self
            .request(reqwest::Method::POST, "/edges")
            .json(&json!({
                "container_id": edge.container_id,
                "source_id": edge.source_id,
                "target_id": edge.target_id,
                "edge_type": edge.edge_type,
                "properties": edge.properties,
                "source_chunk_ids": edge.source_chunk_ids,
            }))
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("graph store upsert_edge failed ({status}): {body}"));
        }
        Ok(())
    }

    async fn run_query(
        &self,
        container_id: Uuid,
        query: &str,
        timeout: Duration,
    ) -> Result<GraphQueryResult> {
        let resp = self
            .client
            .request(reqwest::Method::POST, format!("{}/query", self.base_url))
            .timeout(timeout)
            .json(&json!({ "container_id": container_id, "query": query }))
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("graph store query failed ({status}): {body}"));
        }
        let result: GraphQueryResult = resp.json().await?;
        Ok(result)
    }

    async fn schema(&self, container_id: Uuid) -> Result<GraphSchema> {
        let resp = self
            .request(reqwest::Method::GET, &format!("/containers/{container_id}/schema"))
            .send()
            .await?;
        if resp.status().as_u16() == 404 {
            return Ok(GraphSchema::default());
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("graph store schema failed ({status}): {body}"));
        }
        let schema: GraphSchema = resp.json().await?;
        Ok(schema)
    }

    async fn drop_container(&self, container_id: Uuid) -> Result<()> {
        let resp = self
            .request(reqwest::Method::DELETE, &format!("/containers/{container_id}"))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() && status.as_u16() != 404 {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("graph store drop_container failed ({status}): {body}"));
        }
        Ok(())
    }
}
