//! Manifest loader and cache (C1).
//!
//! A manifest is a declarative per-container document: allowed modalities,
//! size limits, retrieval defaults (latency budget, rerank, freshness),
//! dedup threshold, ACL, graph extraction policy, and image handling. It is
//! persisted as a JSONB column on `container_versions`, versioned per
//! container — never a column on `containers` itself, since a container
//! must keep serving its previous manifest while a new one is being
//! authored (§4.1).
//!
//! The effective manifest a caller sees is the latest published version
//! merged over the container's own baseline fields (`allowed_modalities`,
//! `acl`) via [`Manifest::merge_over`], so a container with no manifest ever
//! published still behaves sensibly. Results are cached in memory, keyed by
//! container id, and invalidated explicitly whenever a new manifest is
//! published — there is no TTL, since staleness here would mean serving an
//! ACL or modality policy the operator just changed.

use std::collections::HashMap;
use std::sync::Arc;

use container_core::manifest::Manifest;
use container_core::store::RelationalStore;
use tokio::sync::RwLock;
use uuid::Uuid;

pub struct ManifestLoader {
    relational: Arc<dyn RelationalStore>,
    cache: RwLock<HashMap<Uuid, Manifest>>,
}

impl ManifestLoader {
    pub fn new(relational: Arc<dyn RelationalStore>) -> Self {
        Self { relational, cache: RwLock::new(HashMap::new()) }
    }

    /// Resolve the effective manifest for a container, consulting the cache
    /// first. Returns `None` only if the container itself does not exist.
    pub async fn load(&self, container_id: Uuid) -> anyhow::Result<Option<Manifest>> {
        if let Some(manifest) = self.cache.read().await.get(&container_id) {
            return Ok(Some(manifest.clone()));
        }

        let Some(container) = self.relational.get_container(&container_id.to_string()).await? else {
            return Ok(None);
        };
        let published = self.relational.get_latest_manifest(container_id).await?;
        let effective = Manifest::merge_over(published.as_ref(), &container.allowed_modalities, &container.acl);

        self.cache.write().await.insert(container_id, effective.clone());
        Ok(Some(effective))
    }

    /// Publish a new manifest version and refresh the cache so the next
    /// `load` sees it without a race against the write.
    pub async fn publish(&self, container_id: Uuid, manifest: Manifest) -> anyhow::Result<i32> {
        let version = self.relational.put_manifest(container_id, manifest).await?;
        self.invalidate(container_id).await;
        Ok(version)
    }

    /// Explicitly drop a container's cached manifest, forcing the next
    /// `load` to go back to the relational store.
    pub async fn invalidate(&self, container_id: Uuid) {
        self.cache.write().await.remove(&container_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use container_core::manifest::RetrievalConfig;
    use container_core::memory::MemoryRelationalStore;
    use container_core::models::{Container, ContainerStats, Modality};
    use std::collections::HashMap as Map;

    fn sample_container(id: Uuid) -> Container {
        Container {
            id,
            slug: "demo".into(),
            theme: None,
            parent_id: None,
            allowed_modalities: vec![Modality::Text],
            embedder_id: "local".into(),
            embedder_version: "v1".into(),
            embedding_dims: 4,
            acl: Map::new(),
            state: container_core::models::ContainerState::Active,
            stats: ContainerStats::default(),
            graph_enabled: false,
            guiding_document_id: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn missing_container_returns_none() {
        let store = Arc::new(MemoryRelationalStore::new());
        let loader = ManifestLoader::new(store);
        assert!(loader.load(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unpublished_manifest_falls_back_to_container_defaults() {
        let store = Arc::new(MemoryRelationalStore::new());
        let container = sample_container(Uuid::new_v4());
        store.create_container(container.clone()).await.unwrap();
        let loader = ManifestLoader::new(store);
        let manifest = loader.load(container.id).await.unwrap().unwrap();
        assert_eq!(manifest.modalities, vec![Modality::Text]);
    }

    #[tokio::test]
    async fn publish_invalidates_cache_so_next_load_sees_new_version() {
        let store = Arc::new(MemoryRelationalStore::new());
        let container = sample_container(Uuid::new_v4());
        store.create_container(container.clone()).await.unwrap();
        let loader = ManifestLoader::new(store);

        let first = loader.load(container.id).await.unwrap().unwrap();
        assert_eq!(first.retrieval.latency_budget_ms, 1500);

        let mut updated = first.clone();
        updated.retrieval = RetrievalConfig { latency_budget_ms: 50, ..updated.retrieval };
        loader.publish(container.id, updated).await.unwrap();

        let second = loader.load(container.id).await.unwrap().unwrap();
        assert_eq!(second.retrieval.latency_budget_ms, 50);
    }
}
