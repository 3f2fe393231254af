//! Postgres connection pool management. Mirrors `db::connect` in the
//! teacher, swapped from `SqlitePool`/WAL to `PgPool` with a configurable
//! pool size, as the relational store now targets Postgres (§3: tsvector +
//! GIN index, `websearch_to_tsquery`, skip-locked job claims — none of
//! which SQLite expresses).

use anyhow::Result;
use sqlx::postgres::{PgPoolOptions, Postgres};
use sqlx::Pool;

use crate::config::Config;

pub type PgPool = Pool<Postgres>;

pub async fn connect(config: &Config) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.relational.pool_size)
        .connect(&config.relational.dsn)
        .await?;
    Ok(pool)
}
