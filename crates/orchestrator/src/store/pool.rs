//! Database connection pool management.

use sqlx::PgPool;

use crate::config::DatabaseConfig;
use crate::error::OrchestratorResult;

/// Type alias for the PostgreSQL connection pool.
pub type DbPool = PgPool;

/// Create a new database connection pool.
pub async fn create_pool(config: &DatabaseConfig) -> OrchestratorResult<DbPool> {
    let pool = config
        .pool_options()
        .connect_with(config.connect_options()?)
        .await?;

    tracing::info!(
        host = %config.host,
        port = config.port,
        database = %config.database,
        pool_max = config.pool_max,
        "Database connection pool created"
    );

    Ok(pool)
}

/// Check if the database connection is healthy.
pub async fn health_check(pool: &DbPool) -> bool {
    sqlx::query("SELECT 1").execute(pool).await.is_ok()
}
