//! Postgres connection pool.

use sqlx::PgPool;
use tracing::info;

use crate::repository::postgres::map_sqlx_error;
use crate::repository::StoreError;

/// Open a pool against `database_url`.
pub async fn connect(database_url: &str) -> Result<PgPool, StoreError> {
    let pool = PgPool::connect(database_url)
        .await
        .map_err(|e| map_sqlx_error("connect", e))?;
    info!("connected to postgres");
    Ok(pool)
}
