use kestrel_core::AppError;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::cache_repository::PgCacheBackend;
use crate::config::DatabaseConfig;
use crate::job_repository::ChunkJobRepository;

/// Owns the connection pool, runs migrations and vends repositories.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, AppError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to connect: {e}")))?;

        tracing::info!(max_connections = config.max_connections, "Connected to database");
        Ok(Self { pool })
    }

    /// Wrap an existing pool (tests).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<(), AppError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Migration failed: {e}")))?;
        Ok(())
    }

    pub fn cache_backend(&self) -> PgCacheBackend {
        PgCacheBackend::new(self.pool.clone())
    }

    pub fn job_repo(&self) -> ChunkJobRepository {
        ChunkJobRepository::new(self.pool.clone())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
