use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// How long an acquire may wait on a saturated pool. Keeps a storage outage
/// from stalling workers longer than a redelivery would.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Create the PostgreSQL connection pool backing notification storage.
///
/// `max_connections` comes from `AppConfig::db_max_connections` (default 20);
/// the pool is shared by the consumer workers and the health probe.
pub async fn create_pool(database_url: &str, max_connections: u32) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect(database_url)
        .await?;

    tracing::info!(max_connections, "Connected to PostgreSQL");
    Ok(pool)
}

/// Apply the workspace migrations (the notifications table).
pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    tracing::info!("Database migrations applied");
    Ok(())
}
