use chrono::{DateTime, Utc};
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

use kestrel_core::error::AppError;
use kestrel_core::job::{ChunkJob, CreateChunkJobRequest, JobStatus};
use kestrel_core::job_queue::ChunkJobStore;
use kestrel_core::models::ScrapeMode;

/// PostgreSQL-backed [`ChunkJobStore`] over the `chunk_jobs` table.
#[derive(Clone)]
pub struct ChunkJobRepository {
    pool: Pool<Postgres>,
}

impl ChunkJobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Most recent chunk jobs, optionally filtered by status.
    pub async fn list_recent(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<ChunkJob>, AppError> {
        let rows = sqlx::query_as::<_, ChunkJobRow>(
            r#"
            SELECT * FROM chunk_jobs
            WHERE $1::varchar IS NULL OR status = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(status.map(|s| s.as_str()))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn execute(&self, query: Query<'_, Postgres, PgArguments>) -> Result<(), AppError> {
        let result = query
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;
        if result.rows_affected() == 0 {
            tracing::debug!("Chunk job update matched no rows");
        }
        Ok(())
    }
}

// -- Internal row type for sqlx deserialization --

#[derive(sqlx::FromRow)]
struct ChunkJobRow {
    id: Uuid,
    batch_id: Uuid,
    chunk_index: i32,
    urls: Vec<String>,
    mode: String,
    status: String,
    succeeded: i32,
    failed: i32,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<ChunkJobRow> for ChunkJob {
    type Error = AppError;

    fn try_from(row: ChunkJobRow) -> Result<Self, AppError> {
        let mode: ScrapeMode = row.mode.parse().map_err(AppError::DatabaseError)?;
        let status: JobStatus = row.status.parse().map_err(AppError::DatabaseError)?;
        Ok(ChunkJob {
            id: row.id,
            batch_id: row.batch_id,
            chunk_index: row.chunk_index as usize,
            urls: row.urls,
            mode,
            status,
            succeeded: row.succeeded as usize,
            failed: row.failed as usize,
            error_message: row.error_message,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

impl ChunkJobStore for ChunkJobRepository {
    async fn create_job(&self, request: CreateChunkJobRequest) -> Result<ChunkJob, AppError> {
        let row = sqlx::query_as::<_, ChunkJobRow>(
            r#"
            INSERT INTO chunk_jobs (batch_id, chunk_index, urls, mode)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(request.batch_id)
        .bind(request.chunk_index as i32)
        .bind(&request.urls)
        .bind(request.mode.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        row.try_into()
    }

    async fn mark_running(&self, job_id: Uuid) -> Result<(), AppError> {
        self.execute(
            sqlx::query(
                r#"
                UPDATE chunk_jobs
                SET status = 'running', started_at = NOW(), updated_at = NOW()
                WHERE id = $1 AND status = 'pending'
                "#,
            )
            .bind(job_id),
        )
        .await
    }

    async fn complete_job(
        &self,
        job_id: Uuid,
        status: JobStatus,
        succeeded: usize,
        failed: usize,
    ) -> Result<(), AppError> {
        self.execute(
            sqlx::query(
                r#"
                UPDATE chunk_jobs
                SET status = $2, succeeded = $3, failed = $4,
                    completed_at = NOW(), updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(job_id)
            .bind(status.as_str())
            .bind(succeeded as i32)
            .bind(failed as i32),
        )
        .await
    }

    async fn fail_job(&self, job_id: Uuid, error: &str) -> Result<(), AppError> {
        self.execute(
            sqlx::query(
                r#"
                UPDATE chunk_jobs
                SET status = 'failed', error_message = $2,
                    completed_at = NOW(), updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(job_id)
            .bind(error),
        )
        .await
    }

    async fn cancel_job(&self, job_id: Uuid) -> Result<(), AppError> {
        self.execute(
            sqlx::query(
                r#"
                UPDATE chunk_jobs
                SET status = 'cancelled', completed_at = NOW(), updated_at = NOW()
                WHERE id = $1 AND status IN ('pending', 'running')
                "#,
            )
            .bind(job_id),
        )
        .await
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<ChunkJob>, AppError> {
        let row = sqlx::query_as::<_, ChunkJobRow>(r#"SELECT * FROM chunk_jobs WHERE id = $1"#)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        row.map(TryInto::try_into).transpose()
    }

    async fn get_job_status(&self, job_id: Uuid) -> Result<Option<JobStatus>, AppError> {
        let status: Option<(String,)> =
            sqlx::query_as(r#"SELECT status FROM chunk_jobs WHERE id = $1"#)
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        status
            .map(|(s,)| s.parse().map_err(AppError::DatabaseError))
            .transpose()
    }

    async fn list_batch(&self, batch_id: Uuid) -> Result<Vec<ChunkJob>, AppError> {
        let rows = sqlx::query_as::<_, ChunkJobRow>(
            r#"SELECT * FROM chunk_jobs WHERE batch_id = $1 ORDER BY chunk_index"#,
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        rows.into_iter().map(TryInto::try_into).collect()
    }
}
