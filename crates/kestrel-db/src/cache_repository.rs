use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Pool, Postgres};

use kestrel_core::error::AppError;
use kestrel_core::traits::{CacheBackend, CachedValue};

/// Distributed cache tier stored in the `scrape_cache` table.
///
/// Rows carry their own expiry. An expired row found by [`get`] is deleted
/// on the spot; [`purge_expired`](Self::purge_expired) sweeps the rest.
///
/// [`get`]: CacheBackend::get
#[derive(Clone)]
pub struct PgCacheBackend {
    pool: Pool<Postgres>,
}

impl PgCacheBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Delete every expired row. Returns the number removed.
    pub async fn purge_expired(&self) -> Result<u64, AppError> {
        let result = sqlx::query(r#"DELETE FROM scrape_cache WHERE expires_at <= NOW()"#)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::CacheError(e.to_string()))?;

        if result.rows_affected() > 0 {
            tracing::debug!(purged = result.rows_affected(), "Purged expired cache rows");
        }
        Ok(result.rows_affected())
    }

    async fn delete(&self, key: &str) -> Result<(), AppError> {
        sqlx::query(r#"DELETE FROM scrape_cache WHERE key = $1 AND expires_at <= NOW()"#)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::CacheError(e.to_string()))?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct CacheRow {
    value: String,
    expires_at: DateTime<Utc>,
}

impl CacheBackend for PgCacheBackend {
    async fn get(&self, key: &str) -> Result<Option<CachedValue>, AppError> {
        let row = sqlx::query_as::<_, CacheRow>(
            r#"SELECT value, expires_at FROM scrape_cache WHERE key = $1"#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::CacheError(e.to_string()))?;

        let Some(row) = row else {
            return Ok(None);
        };

        match (row.expires_at - Utc::now()).to_std() {
            Ok(remaining) if !remaining.is_zero() => Ok(Some(CachedValue {
                value: row.value,
                ttl_remaining: remaining,
            })),
            _ => {
                self.delete(key).await?;
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), AppError> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| AppError::CacheError(format!("TTL out of range: {e}")))?;
        let expires_at = Utc::now() + ttl;

        sqlx::query(
            r#"
            INSERT INTO scrape_cache (key, value, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (key) DO UPDATE
            SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at, updated_at = NOW()
            "#,
        )
        .bind(key)
        .bind(&value)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::CacheError(e.to_string()))?;

        Ok(())
    }
}
