//! Relational schema migrations.
//!
//! Follows the teacher's `migrate::run_migrations` idiom — a flat sequence
//! of idempotent `CREATE TABLE IF NOT EXISTS` / `CREATE INDEX IF NOT
//! EXISTS` statements run once at `fleetd init`, not a full Alembic-style
//! versioned migration runner (that stays a Non-goal). Wrapped in a
//! Postgres advisory lock (§5: "Schema migrations serialize via a named
//! advisory lock held across the upgrade") so concurrent `init` calls
//! don't race on `CREATE TABLE`.
//!
//! `container_links` and `container_subscriptions` are schema-only: their
//! row shapes are declared because a complete deployment's HTTP layer
//! would manage them, but no code in this crate reads or writes them
//! (§1 Out of scope: container-link/subscription CRUD).

use anyhow::Result;
use tracing::info;

use crate::db::PgPool;

/// Arbitrary fixed advisory lock key for the schema-migration critical
/// section. Any two `fleetd init` processes contend on this same key.
const MIGRATION_LOCK_KEY: i64 = 0x436f_6e74_4675;

#[tracing::instrument(skip(pool))]
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::query("SELECT pg_advisory_lock($1)")
        .bind(MIGRATION_LOCK_KEY)
        .execute(pool)
        .await?;

    let result = run_migrations_locked(pool).await;

    sqlx::query("SELECT pg_advisory_unlock($1)")
        .bind(MIGRATION_LOCK_KEY)
        .execute(pool)
        .await?;

    result
}

async fn run_migrations_locked(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS containers (
            id UUID PRIMARY KEY,
            slug TEXT NOT NULL UNIQUE,
            theme TEXT,
            parent_id UUID REFERENCES containers(id) ON DELETE CASCADE,
            allowed_modalities JSONB NOT NULL DEFAULT '[]',
            embedder_id TEXT NOT NULL,
            embedder_version TEXT NOT NULL,
            embedding_dims INTEGER NOT NULL,
            acl JSONB NOT NULL DEFAULT '{}',
            state TEXT NOT NULL DEFAULT 'active',
            document_count BIGINT NOT NULL DEFAULT 0,
            chunk_count BIGINT NOT NULL DEFAULT 0,
            size_bytes BIGINT NOT NULL DEFAULT 0,
            last_ingest TIMESTAMPTZ,
            graph_enabled BOOLEAN NOT NULL DEFAULT FALSE,
            guiding_document_id UUID,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS container_versions (
            container_id UUID NOT NULL REFERENCES containers(id) ON DELETE CASCADE,
            version INTEGER NOT NULL,
            manifest JSONB NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            PRIMARY KEY (container_id, version)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id UUID PRIMARY KEY,
            container_id UUID NOT NULL REFERENCES containers(id) ON DELETE CASCADE,
            hash TEXT NOT NULL,
            uri TEXT NOT NULL,
            mime TEXT,
            title TEXT,
            meta JSONB NOT NULL DEFAULT '{}',
            state TEXT NOT NULL DEFAULT 'pending',
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            UNIQUE (container_id, hash)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // tsvector column maintained by a trigger, not computed at query time,
    // so `websearch_to_tsquery`/`ts_rank_cd` hit the GIN index (§4.4).
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id UUID PRIMARY KEY,
            container_id UUID NOT NULL REFERENCES containers(id) ON DELETE CASCADE,
            document_id UUID NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
            modality TEXT NOT NULL,
            text TEXT,
            byte_start BIGINT NOT NULL,
            byte_end BIGINT NOT NULL,
            provenance JSONB NOT NULL,
            meta JSONB NOT NULL DEFAULT '{}',
            embedding_version TEXT NOT NULL,
            dedup_of UUID REFERENCES chunks(id),
            tsv TSVECTOR,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE OR REPLACE FUNCTION chunks_tsv_update() RETURNS trigger AS $$
        BEGIN
            NEW.tsv := to_tsvector('english', coalesce(NEW.text, ''));
            RETURN NEW;
        END
        $$ LANGUAGE plpgsql
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("DROP TRIGGER IF EXISTS chunks_tsv_trigger ON chunks")
        .execute(pool)
        .await?;
    sqlx::query(
        r#"
        CREATE TRIGGER chunks_tsv_trigger
        BEFORE INSERT OR UPDATE ON chunks
        FOR EACH ROW EXECUTE FUNCTION chunks_tsv_update()
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_tsv ON chunks USING GIN (tsv)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_document_id ON chunks(document_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_container_id ON chunks(container_id)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id UUID PRIMARY KEY,
            kind TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'queued',
            container_id UUID NOT NULL REFERENCES containers(id) ON DELETE CASCADE,
            payload JSONB NOT NULL DEFAULT '{}',
            retries INTEGER NOT NULL DEFAULT 0,
            last_heartbeat TIMESTAMPTZ,
            error TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_status_created ON jobs(status, created_at)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS job_events (
            job_id UUID NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
            status TEXT NOT NULL,
            message TEXT,
            timestamp TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS embedding_cache (
            content_hash TEXT NOT NULL,
            modality TEXT NOT NULL,
            embedder_version TEXT NOT NULL,
            vector BYTEA NOT NULL,
            dims INTEGER NOT NULL,
            last_used TIMESTAMPTZ NOT NULL DEFAULT now(),
            PRIMARY KEY (content_hash, modality, embedder_version)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS diagnostics (
            request_id UUID PRIMARY KEY,
            kind TEXT NOT NULL,
            payload JSONB NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS agent_sessions (
            agent_id TEXT PRIMARY KEY,
            last_seen TIMESTAMPTZ NOT NULL DEFAULT now(),
            request_count BIGINT NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Schema-only: declared for deployment completeness, never read or
    // written by this crate (container-link/subscription CRUD is out of
    // scope per §1).
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS container_links (
            source_container_id UUID NOT NULL REFERENCES containers(id) ON DELETE CASCADE,
            target_container_id UUID NOT NULL REFERENCES containers(id) ON DELETE CASCADE,
            relation TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            PRIMARY KEY (source_container_id, target_container_id, relation)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS container_subscriptions (
            container_id UUID NOT NULL REFERENCES containers(id) ON DELETE CASCADE,
            subscriber_agent_id TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            PRIMARY KEY (container_id, subscriber_agent_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    info!("schema migrations applied");
    Ok(())
}
