#![forbid(unsafe_code)]

use super::{KeyValueStore, StoreResult};
use crate::time::unix_millis;
use async_trait::async_trait;
use sqlx::PgPool;
use std::time::Duration;
use tracing::warn;

/// `kv_entries` table backed store. Expired rows are filtered on read and
/// purged opportunistically on `list`.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn expiry(ttl: Duration) -> i64 {
        unix_millis() + ttl.as_millis() as i64
    }
}

#[async_trait]
impl KeyValueStore for PgStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let row = sqlx::query_as::<_, (String,)>(
            "SELECT value FROM kv_entries WHERE key = $1 AND expires_at > $2",
        )
        .bind(key)
        .bind(unix_millis())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(value,)| value))
    }

    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO kv_entries (key, value, expires_at) VALUES ($1, $2, $3) \
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at",
        )
        .bind(key)
        .bind(value)
        .bind(Self::expiry(ttl))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM kv_entries WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let now = unix_millis();
        if let Err(e) = sqlx::query("DELETE FROM kv_entries WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await
        {
            warn!("Failed to purge expired kv entries: {}", e);
        }

        // starts_with avoids LIKE escaping of '_' and '%' in the prefix
        let rows = sqlx::query_as::<_, (String,)>(
            "SELECT key FROM kv_entries WHERE starts_with(key, $1) AND expires_at > $2 ORDER BY key",
        )
        .bind(prefix)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(key,)| key).collect())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE kv_entries SET expires_at = $1 WHERE key = $2 AND expires_at > $3",
        )
        .bind(Self::expiry(ttl))
        .bind(key)
        .bind(unix_millis())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn is_available(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}
