#![forbid(unsafe_code)]

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;

/// Connects to `database_url` and applies migrations. `None` means persistence is off.
pub async fn connect(database_url: Option<&str>) -> anyhow::Result<Option<PgPool>> {
    let Some(url) = database_url else {
        info!("DATABASE_URL not set, room snapshots will not be persisted");
        return Ok(None);
    };

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(3))
        .connect(url)
        .await?;

    info!("Connected to PostgreSQL");

    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("Database migrations applied");

    Ok(Some(pool))
}
