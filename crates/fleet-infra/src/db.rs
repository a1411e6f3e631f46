//! Postgres pool construction and readiness probe.

use crate::config::DatabaseConfig;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

/// Build a pool honouring the configured min/max connections.
pub async fn create_pool(cfg: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .min_connections(cfg.pool_min)
        .max_connections(cfg.pool_max)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&cfg.url())
        .await
}

/// Cheap liveness probe used by the readiness endpoint and breaker
/// half-open checks.
pub async fn ping(pool: &PgPool) -> bool {
    sqlx::query("SELECT 1").execute(pool).await.is_ok()
}
