//! Connection pool construction from the environment.

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

const DEFAULT_DATABASE_URL: &str = "postgres://localhost/crosswalk_dev";
const DEFAULT_MAX_CONNECTIONS: u32 = 8;

/// Build a Postgres pool from `DATABASE_URL` / `DATABASE_MAX_CONNECTIONS`.
///
/// Falls back to a local development database when `DATABASE_URL` is unset.
pub async fn connect_from_env() -> Result<PgPool, sqlx::Error> {
    let url = std::env::var("DATABASE_URL").unwrap_or_else(|_| {
        tracing::warn!("DATABASE_URL not set; using local dev default");
        DEFAULT_DATABASE_URL.to_string()
    });
    let max_connections = std::env::var("DATABASE_MAX_CONNECTIONS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_MAX_CONNECTIONS);

    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(&url)
        .await
}
