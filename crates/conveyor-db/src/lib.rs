//! conveyor-db
//!
//! Postgres-backed catalog for transfer-request reconciliation:
//! [`PgCatalog`] implements the engine's `Catalog` and the daemon's
//! `WorkQueue`; [`PgMessageOutbox`] enqueues notifications inside the same
//! transaction. Bootstrap helpers follow below.

use anyhow::{Context, Result};
use sqlx::{postgres::PgPoolOptions, PgPool, Postgres};

pub mod admin;
mod catalog;
mod outbox;

pub use catalog::PgCatalog;
pub use outbox::PgMessageOutbox;

pub const ENV_DB_URL: &str = "CONVEYOR_DATABASE_URL";

/// Transaction handle threaded through every catalog call.
pub type PgTx = sqlx::Transaction<'static, Postgres>;

/// Connect to Postgres at `url`.
pub async fn connect(url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await
        .context("failed to connect to Postgres")?;
    Ok(pool)
}

/// Connect to Postgres using CONVEYOR_DATABASE_URL.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL)
        .with_context(|| format!("missing env var {ENV_DB_URL}"))?;
    connect(&url, 10).await
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}
