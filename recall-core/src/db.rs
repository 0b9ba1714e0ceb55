use std::time::Duration;

use sqlx::{postgres::PgPoolOptions, PgPool};

use crate::config::StoreConfig;
use crate::error::{RecallError, RecallResult};

pub async fn create_pool(config: &StoreConfig) -> RecallResult<PgPool> {
    if config.url.is_empty() {
        return Err(RecallError::configuration(
            "[store] url is required for the pgvector backend",
        ));
    }
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(config.timeout_seconds))
        .connect(&config.url)
        .await?;
    Ok(pool)
}

pub async fn health_check(pool: &PgPool) -> Result<String, sqlx::Error> {
    let row: (String,) = sqlx::query_as("SELECT version()").fetch_one(pool).await?;
    Ok(row.0)
}

pub async fn check_pgvector(pool: &PgPool) -> Result<String, sqlx::Error> {
    let row: (String,) =
        sqlx::query_as("SELECT extversion FROM pg_extension WHERE extname = 'vector'")
            .fetch_one(pool)
            .await?;
    Ok(row.0)
}
