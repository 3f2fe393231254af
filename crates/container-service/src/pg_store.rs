//! Postgres implementation of `container_core::store::RelationalStore`.
//!
//! Grounded in the teacher's `migrate.rs`/`db.rs` pairing, generalized from
//! SQLite to Postgres so the lexical search stage can use
//! `websearch_to_tsquery`/`ts_rank_cd` over the GIN-indexed `tsv` column,
//! and job claims can use `FOR UPDATE SKIP LOCKED` (§4.3, §9 Design Notes).

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use container_core::manifest::Manifest;
use container_core::models::{
    Chunk, Container, ContainerStats, Document, EmbeddingCacheEntry, Job, JobEvent, JobKind,
    JobStatus, Modality, Provenance,
};
use container_core::store::{ChunkCandidate, RelationalStore};
use sqlx::Row;
use uuid::Uuid;

use crate::db::PgPool;

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn modality_str(m: Modality) -> &'static str {
    m.as_str()
}

fn state_str<T: std::fmt::Debug>(s: &T) -> String {
    format!("{:?}", s).to_lowercase()
}

fn row_to_container(row: &sqlx::postgres::PgRow) -> Result<Container> {
    let modalities_json: serde_json::Value = row.try_get("allowed_modalities")?;
    let allowed_modalities: Vec<Modality> = serde_json::from_value(modalities_json)?;
    let acl_json: serde_json::Value = row.try_get("acl")?;
    let acl = serde_json::from_value(acl_json)?;
    let state_raw: String = row.try_get("state")?;
    let state = match state_raw.as_str() {
        "paused" => container_core::models::ContainerState::Paused,
        "archived" => container_core::models::ContainerState::Archived,
        _ => container_core::models::ContainerState::Active,
    };
    Ok(Container {
        id: row.try_get("id")?,
        slug: row.try_get("slug")?,
        theme: row.try_get("theme")?,
        parent_id: row.try_get("parent_id")?,
        allowed_modalities,
        embedder_id: row.try_get("embedder_id")?,
        embedder_version: row.try_get("embedder_version")?,
        embedding_dims: row.try_get::<i32, _>("embedding_dims")? as usize,
        acl,
        state,
        stats: ContainerStats {
            document_count: row.try_get("document_count")?,
            chunk_count: row.try_get("chunk_count")?,
            size_bytes: row.try_get("size_bytes")?,
            last_ingest: row.try_get("last_ingest")?,
        },
        graph_enabled: row.try_get("graph_enabled")?,
        guiding_document_id: row.try_get("guiding_document_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_document(row: &sqlx::postgres::PgRow) -> Result<Document> {
    let state_raw: String = row.try_get("state")?;
    let state = match state_raw.as_str() {
        "indexed" => container_core::models::DocumentState::Indexed,
        "degraded" => container_core::models::DocumentState::Degraded,
        _ => container_core::models::DocumentState::Pending,
    };
    Ok(Document {
        id: row.try_get("id")?,
        container_id: row.try_get("container_id")?,
        hash: row.try_get("hash")?,
        uri: row.try_get("uri")?,
        mime: row.try_get("mime")?,
        title: row.try_get("title")?,
        meta: row.try_get("meta")?,
        state,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_chunk(row: &sqlx::postgres::PgRow) -> Result<Chunk> {
    let modality_raw: String = row.try_get("modality")?;
    let modality = Modality::parse(&modality_raw).unwrap_or(Modality::Text);
    let provenance_json: serde_json::Value = row.try_get("provenance")?;
    let provenance: Provenance = serde_json::from_value(provenance_json)?;
    Ok(Chunk {
        id: row.try_get("id")?,
        container_id: row.try_get("container_id")?,
        document_id: row.try_get("document_id")?,
        modality,
        text: row.try_get("text")?,
        byte_start: row.try_get("byte_start")?,
        byte_end: row.try_get("byte_end")?,
        provenance,
        meta: row.try_get("meta")?,
        embedding_version: row.try_get("embedding_version")?,
        dedup_of: row.try_get("dedup_of")?,
    })
}

fn row_to_job(row: &sqlx::postgres::PgRow) -> Result<Job> {
    let kind_raw: String = row.try_get("kind")?;
    let kind = match kind_raw.as_str() {
        "refresh" => JobKind::Refresh,
        "export" => JobKind::Export,
        _ => JobKind::Ingest,
    };
    let status_raw: String = row.try_get("status")?;
    let status = match status_raw.as_str() {
        "running" => JobStatus::Running,
        "done" => JobStatus::Done,
        "failed" => JobStatus::Failed,
        _ => JobStatus::Queued,
    };
    Ok(Job {
        id: row.try_get("id")?,
        kind,
        status,
        container_id: row.try_get("container_id")?,
        payload: row.try_get("payload")?,
        retries: row.try_get("retries")?,
        last_heartbeat: row.try_get("last_heartbeat")?,
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl RelationalStore for PostgresStore {
    async fn get_container(&self, id_or_slug: &str) -> Result<Option<Container>> {
        let row = if let Ok(id) = Uuid::parse_str(id_or_slug) {
            sqlx::query("SELECT * FROM containers WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
        } else {
            sqlx::query("SELECT * FROM containers WHERE slug = $1")
                .bind(id_or_slug)
                .fetch_optional(&self.pool)
                .await?
        };
        row.map(|r| row_to_container(&r)).transpose()
    }

    async fn list_containers(
        &self,
        state: Option<&str>,
        search: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<Container>, i64)> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM containers
            WHERE ($1::text IS NULL OR state = $1)
              AND ($2::text IS NULL OR slug ILIKE '%' || $2 || '%')
            ORDER BY slug
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(state)
        .bind(search)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let total: i64 = sqlx::query(
            r#"
            SELECT COUNT(*) AS c FROM containers
            WHERE ($1::text IS NULL OR state = $1)
              AND ($2::text IS NULL OR slug ILIKE '%' || $2 || '%')
            "#,
        )
        .bind(state)
        .bind(search)
        .fetch_one(&self.pool)
        .await?
        .try_get("c")?;

        let containers = rows.iter().map(row_to_container).collect::<Result<Vec<_>>>()?;
        Ok((containers, total))
    }

    async fn create_container(&self, container: Container) -> Result<Container> {
        let modalities_json = serde_json::to_value(&container.allowed_modalities)?;
        let acl_json = serde_json::to_value(&container.acl)?;
        sqlx::query(
            r#"
            INSERT INTO containers (
                id, slug, theme, parent_id, allowed_modalities, embedder_id,
                embedder_version, embedding_dims, acl, state, graph_enabled,
                guiding_document_id, created_at, updated_at
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14)
            "#,
        )
        .bind(container.id)
        .bind(&container.slug)
        .bind(&container.theme)
        .bind(container.parent_id)
        .bind(modalities_json)
        .bind(&container.embedder_id)
        .bind(&container.embedder_version)
        .bind(container.embedding_dims as i32)
        .bind(acl_json)
        .bind(state_str(&container.state))
        .bind(container.graph_enabled)
        .bind(container.guiding_document_id)
        .bind(container.created_at)
        .bind(container.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(container)
    }

    async fn update_container_stats(
        &self,
        container_id: Uuid,
        document_count: i64,
        chunk_count: i64,
        size_bytes: i64,
        last_ingest: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE containers
            SET document_count = $2, chunk_count = $3, size_bytes = $4,
                last_ingest = $5, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(container_id)
        .bind(document_count)
        .bind(chunk_count)
        .bind(size_bytes)
        .bind(last_ingest)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_container(&self, container_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM containers WHERE id = $1")
            .bind(container_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_document_by_hash(
        &self,
        container_id: Uuid,
        hash: &str,
    ) -> Result<Option<(Document, bool)>> {
        let row = sqlx::query("SELECT * FROM documents WHERE container_id = $1 AND hash = $2")
            .bind(container_id)
            .bind(hash)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else { return Ok(None) };
        let document = row_to_document(&row)?;
        let has_chunks: bool = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM chunks WHERE document_id = $1) AS e",
        )
        .bind(document.id)
        .fetch_one(&self.pool)
        .await?
        .try_get("e")?;
        Ok(Some((document, has_chunks)))
    }

    async fn upsert_document(&self, document: Document) -> Result<Document> {
        sqlx::query(
            r#"
            INSERT INTO documents (id, container_id, hash, uri, mime, title, meta, state, created_at, updated_at)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)
            ON CONFLICT (container_id, hash) DO UPDATE SET
                uri = EXCLUDED.uri,
                mime = EXCLUDED.mime,
                title = EXCLUDED.title,
                meta = EXCLUDED.meta,
                state = EXCLUDED.state,
                updated_at = now()
            "#,
        )
        .bind(document.id)
        .bind(document.container_id)
        .bind(&document.hash)
        .bind(&document.uri)
        .bind(&document.mime)
        .bind(&document.title)
        .bind(&document.meta)
        .bind(state_str(&document.state))
        .bind(document.created_at)
        .bind(document.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(document)
    }

    async fn get_document(&self, id: Uuid) -> Result<Option<Document>> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_document(&r)).transpose()
    }

    async fn replace_chunks(&self, document_id: Uuid, chunks: Vec<Chunk>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks WHERE document_id = $1")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        for chunk in chunks {
            let provenance_json = serde_json::to_value(&chunk.provenance)?;
            sqlx::query(
                r#"
                INSERT INTO chunks (
                    id, container_id, document_id, modality, text, byte_start,
                    byte_end, provenance, meta, embedding_version, dedup_of
                ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11)
                "#,
            )
            .bind(chunk.id)
            .bind(chunk.container_id)
            .bind(chunk.document_id)
            .bind(modality_str(chunk.modality))
            .bind(&chunk.text)
            .bind(chunk.byte_start)
            .bind(chunk.byte_end)
            .bind(provenance_json)
            .bind(&chunk.meta)
            .bind(&chunk.embedding_version)
            .bind(chunk.dedup_of)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_chunk(&self, chunk_id: Uuid) -> Result<Option<Chunk>> {
        let row = sqlx::query("SELECT * FROM chunks WHERE id = $1")
            .bind(chunk_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_chunk(&r)).transpose()
    }

    async fn get_chunks_by_document(&self, document_id: Uuid) -> Result<Vec<Chunk>> {
        let rows = sqlx::query("SELECT * FROM chunks WHERE document_id = $1 ORDER BY (provenance->>'chunk_index')::int")
            .bind(document_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_chunk).collect()
    }

    async fn keyword_search(
        &self,
        container_ids: &[Uuid],
        query: &str,
        allowed_modalities: &[Modality],
        limit: i64,
    ) -> Result<Vec<ChunkCandidate>> {
        let modality_strs: Vec<&'static str> = allowed_modalities.iter().map(|m| m.as_str()).collect();
        let rows = sqlx::query(
            r#"
            SELECT c.id, c.document_id, c.container_id, c.text, c.modality,
                   ts_rank_cd(c.tsv, websearch_to_tsquery('english', $2)) AS rank
            FROM chunks c
            WHERE c.dedup_of IS NULL
              AND ($1::uuid[] IS NULL OR cardinality($1::uuid[]) = 0 OR c.container_id = ANY($1))
              AND ($3::text[] IS NULL OR cardinality($3::text[]) = 0 OR c.modality = ANY($3))
              AND c.tsv @@ websearch_to_tsquery('english', $2)
            ORDER BY rank DESC
            LIMIT $4
            "#,
        )
        .bind(container_ids)
        .bind(query)
        .bind(&modality_strs)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<ChunkCandidate> {
                let modality_raw: String = row.try_get("modality")?;
                Ok(ChunkCandidate {
                    chunk_id: row.try_get("id")?,
                    document_id: row.try_get("document_id")?,
                    container_id: row.try_get("container_id")?,
                    raw_score: row.try_get::<f32, _>("rank")? as f64,
                    snippet: row.try_get::<Option<String>, _>("text")?.unwrap_or_default(),
                    modality: Modality::parse(&modality_raw).unwrap_or(Modality::Text),
                })
            })
            .collect()
    }

    async fn get_embedding_cache(
        &self,
        cache_key: &str,
        ttl: chrono::Duration,
    ) -> Result<Option<EmbeddingCacheEntry>> {
        let parts: Vec<&str> = cache_key.splitn(3, ':').collect();
        let [content_hash, modality, embedder_version] = parts[..] else {
            return Ok(None);
        };
        let row = sqlx::query(
            r#"
            SELECT * FROM embedding_cache
            WHERE content_hash = $1 AND modality = $2 AND embedder_version = $3
              AND last_used >= now() - $4::interval
            "#,
        )
        .bind(content_hash)
        .bind(modality)
        .bind(embedder_version)
        .bind(format!("{} seconds", ttl.num_seconds()))
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };
        let vector_bytes: Vec<u8> = row.try_get("vector")?;
        Ok(Some(EmbeddingCacheEntry {
            content_hash: row.try_get("content_hash")?,
            modality: Modality::parse(&row.try_get::<String, _>("modality")?).unwrap_or(Modality::Text),
            embedder_version: row.try_get("embedder_version")?,
            vector: container_core::embedding::blob_to_vec(&vector_bytes),
            dims: row.try_get::<i32, _>("dims")? as usize,
            last_used: row.try_get("last_used")?,
        }))
    }

    async fn put_embedding_cache(&self, entry: EmbeddingCacheEntry) -> Result<()> {
        let blob = container_core::embedding::vec_to_blob(&entry.vector);
        sqlx::query(
            r#"
            INSERT INTO embedding_cache (content_hash, modality, embedder_version, vector, dims, last_used)
            VALUES ($1,$2,$3,$4,$5,$6)
            ON CONFLICT (content_hash, modality, embedder_version) DO UPDATE SET
                vector = EXCLUDED.vector, dims = EXCLUDED.dims, last_used = EXCLUDED.last_used
            "#,
        )
        .bind(&entry.content_hash)
        .bind(entry.modality.as_str())
        .bind(&entry.embedder_version)
        .bind(blob)
        .bind(entry.dims as i32)
        .bind(entry.last_used)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn touch_embedding_cache(&self, cache_key: &str) -> Result<()> {
        let parts: Vec<&str> = cache_key.splitn(3, ':').collect();
        let [content_hash, modality, embedder_version] = parts[..] else {
            return Ok(());
        };
        sqlx::query(
            r#"
            UPDATE embedding_cache SET last_used = now()
            WHERE content_hash = $1 AND modality = $2 AND embedder_version = $3
            "#,
        )
        .bind(content_hash)
        .bind(modality)
        .bind(embedder_version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn evict_stale_embedding_cache(&self, ttl: chrono::Duration) -> Result<u64> {
        let result = sqlx::query("DELETE FROM embedding_cache WHERE last_used < now() - $1::interval")
            .bind(format!("{} seconds", ttl.num_seconds()))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn claim_job(&self) -> Result<Option<Job>> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            r#"
            SELECT * FROM jobs
            WHERE status = 'queued'
            ORDER BY created_at
            FOR UPDATE SKIP LOCKED
            LIMIT 1
            "#,
        )
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };
        let job_id: Uuid = row.try_get("id")?;
        sqlx::query(
            "UPDATE jobs SET status = 'running', last_heartbeat = now(), updated_at = now() WHERE id = $1",
        )
        .bind(job_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO job_events (job_id, status, message) VALUES ($1, 'running', 'claimed')",
        )
        .bind(job_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        let job_row = sqlx::query("SELECT * FROM jobs WHERE id = $1")
            .bind(job_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(Some(row_to_job(&job_row)?))
    }

    async fn heartbeat_job(&self, job_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE jobs SET last_heartbeat = now() WHERE id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn complete_job(&self, job_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE jobs SET status = 'done', updated_at = now() WHERE id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        sqlx::query("INSERT INTO job_events (job_id, status) VALUES ($1, 'done')")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fail_or_requeue_job(
        &self,
        job_id: Uuid,
        error: &str,
        max_retries: i32,
    ) -> Result<JobStatus> {
        let truncated: String = error.chars().take(500).collect();
        let row = sqlx::query(
            r#"
            UPDATE jobs SET retries = retries + 1, error = $2, updated_at = now()
            WHERE id = $1
            RETURNING retries
            "#,
        )
        .bind(job_id)
        .bind(&truncated)
        .fetch_one(&self.pool)
        .await?;
        let retries: i32 = row.try_get("retries")?;

        let status = if retries >= max_retries {
            sqlx::query("UPDATE jobs SET status = 'failed' WHERE id = $1")
                .bind(job_id)
                .execute(&self.pool)
                .await?;
            JobStatus::Failed
        } else {
            sqlx::query("UPDATE jobs SET status = 'queued', last_heartbeat = NULL WHERE id = $1")
                .bind(job_id)
                .execute(&self.pool)
                .await?;
            JobStatus::Queued
        };

        let event_status = if status == JobStatus::Failed { "failed" } else { "queued" };
        sqlx::query("INSERT INTO job_events (job_id, status, message) VALUES ($1, $2, $3)")
            .bind(job_id)
            .bind(event_status)
            .bind(&truncated)
            .execute(&self.pool)
            .await?;
        Ok(status)
    }

    async fn reap_stale_jobs(
        &self,
        visibility_timeout: chrono::Duration,
        max_retries: i32,
    ) -> Result<u64> {
        let rows = sqlx::query(
            r#"
            SELECT id FROM jobs
            WHERE status = 'running'
              AND COALESCE(last_heartbeat, updated_at, created_at) < now() - $1::interval
            "#,
        )
        .bind(format!("{} seconds", visibility_timeout.num_seconds()))
        .fetch_all(&self.pool)
        .await?;

        for row in &rows {
            let job_id: Uuid = row.try_get("id")?;
            self.fail_or_requeue_job(job_id, "reaped: stale heartbeat", max_retries)
                .await?;
            sqlx::query("INSERT INTO job_events (job_id, status) VALUES ($1, 'reaped_stale')")
                .bind(job_id)
                .execute(&self.pool)
                .await?;
        }
        Ok(rows.len() as u64)
    }

    async fn enqueue_job(
        &self,
        container_id: Uuid,
        kind: JobKind,
        payload: serde_json::Value,
    ) -> Result<Job> {
        let id = Uuid::new_v4();
        let kind_str = match kind {
            JobKind::Ingest => "ingest",
            JobKind::Refresh => "refresh",
            JobKind::Export => "export",
        };
        let row = sqlx::query(
            r#"
            INSERT INTO jobs (id, kind, status, container_id, payload)
            VALUES ($1, $2, 'queued', $3, $4)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(kind_str)
        .bind(container_id)
        .bind(payload)
        .fetch_one(&self.pool)
        .await?;
        row_to_job(&row)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_job(&r)).transpose()
    }

    async fn append_job_event(&self, event: JobEvent) -> Result<()> {
        sqlx::query("INSERT INTO job_events (job_id, status, message, timestamp) VALUES ($1,$2,$3,$4)")
            .bind(event.job_id)
            .bind(&event.status)
            .bind(&event.message)
            .bind(event.timestamp)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_latest_manifest(&self, container_id: Uuid) -> Result<Option<Manifest>> {
        let row = sqlx::query(
            r#"
            SELECT manifest FROM container_versions
            WHERE container_id = $1
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(container_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else { return Ok(None) };
        let manifest_json: serde_json::Value = row.try_get("manifest")?;
        Ok(Some(serde_json::from_value(manifest_json)?))
    }

    async fn put_manifest(&self, container_id: Uuid, manifest: Manifest) -> Result<i32> {
        let manifest_json = serde_json::to_value(&manifest)?;
        let row = sqlx::query(
            r#"
            INSERT INTO container_versions (container_id, version, manifest)
            VALUES (
                $1,
                COALESCE((SELECT MAX(version) FROM container_versions WHERE container_id = $1), 0) + 1,
                $2
            )
            RETURNING version
            "#,
        )
        .bind(container_id)
        .bind(manifest_json)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("version")?)
    }

    async fn record_agent_activity(&self, agent_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO agent_sessions (agent_id, last_seen, request_count)
            VALUES ($1, now(), 1)
            ON CONFLICT (agent_id) DO UPDATE SET
                last_seen = now(),
                request_count = agent_sessions.request_count + 1
            "#,
        )
        .bind(agent_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
