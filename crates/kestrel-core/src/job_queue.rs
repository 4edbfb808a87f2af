use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use uuid::Uuid;

use crate::error::AppError;
use crate::job::{ChunkJob, CreateChunkJobRequest, JobStatus};

/// Persistent store for batch chunk jobs.
pub trait ChunkJobStore: Send + Sync {
    fn create_job(
        &self,
        request: CreateChunkJobRequest,
    ) -> impl Future<Output = Result<ChunkJob, AppError>> + Send;

    fn mark_running(&self, job_id: Uuid) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Record the outcome of a processed chunk. `status` is `Done` or
    /// `PartialFailure`.
    fn complete_job(
        &self,
        job_id: Uuid,
        status: JobStatus,
        succeeded: usize,
        failed: usize,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    fn fail_job(
        &self,
        job_id: Uuid,
        error: &str,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    fn cancel_job(&self, job_id: Uuid) -> impl Future<Output = Result<(), AppError>> + Send;

    fn get_job(
        &self,
        job_id: Uuid,
    ) -> impl Future<Output = Result<Option<ChunkJob>, AppError>> + Send;

    fn get_job_status(
        &self,
        job_id: Uuid,
    ) -> impl Future<Output = Result<Option<JobStatus>, AppError>> + Send;

    /// Every chunk of a batch, ordered by chunk index.
    fn list_batch(
        &self,
        batch_id: Uuid,
    ) -> impl Future<Output = Result<Vec<ChunkJob>, AppError>> + Send;
}

/// In-process [`ChunkJobStore`], used when no database is configured.
#[derive(Debug, Clone, Default)]
pub struct MemoryJobStore {
    jobs: Arc<Mutex<HashMap<Uuid, ChunkJob>>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock_jobs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_jobs(&self) -> MutexGuard<'_, HashMap<Uuid, ChunkJob>> {
        self.jobs.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned job store mutex");
            poisoned.into_inner()
        })
    }

    fn update<U>(&self, job_id: Uuid, apply: U) -> Result<(), AppError>
    where
        U: FnOnce(&mut ChunkJob),
    {
        let mut jobs = self.lock_jobs();
        let job = jobs
            .get_mut(&job_id)
            .ok_or_else(|| AppError::Generic(format!("Job {job_id} not found")))?;
        apply(job);
        Ok(())
    }
}

impl ChunkJobStore for MemoryJobStore {
    async fn create_job(&self, request: CreateChunkJobRequest) -> Result<ChunkJob, AppError> {
        let job = ChunkJob::from_request(request);
        self.lock_jobs().insert(job.id, job.clone());
        Ok(job)
    }

    async fn mark_running(&self, job_id: Uuid) -> Result<(), AppError> {
        self.update(job_id, |job| {
            job.status = JobStatus::Running;
            job.started_at = Some(Utc::now());
        })
    }

    async fn complete_job(
        &self,
        job_id: Uuid,
        status: JobStatus,
        succeeded: usize,
        failed: usize,
    ) -> Result<(), AppError> {
        self.update(job_id, |job| {
            job.status = status;
            job.succeeded = succeeded;
            job.failed = failed;
            job.completed_at = Some(Utc::now());
        })
    }

    async fn fail_job(&self, job_id: Uuid, error: &str) -> Result<(), AppError> {
        self.update(job_id, |job| {
            job.status = JobStatus::Failed;
            job.error_message = Some(error.to_string());
            job.completed_at = Some(Utc::now());
        })
    }

    async fn cancel_job(&self, job_id: Uuid) -> Result<(), AppError> {
        self.update(job_id, |job| {
            if !job.status.is_terminal() {
                job.status = JobStatus::Cancelled;
                job.completed_at = Some(Utc::now());
            }
        })
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<ChunkJob>, AppError> {
        Ok(self.lock_jobs().get(&job_id).cloned())
    }

    async fn get_job_status(&self, job_id: Uuid) -> Result<Option<JobStatus>, AppError> {
        Ok(self.lock_jobs().get(&job_id).map(|job| job.status))
    }

    async fn list_batch(&self, batch_id: Uuid) -> Result<Vec<ChunkJob>, AppError> {
        let mut jobs: Vec<_> = self
            .lock_jobs()
            .values()
            .filter(|job| job.batch_id == batch_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.chunk_index);
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ScrapeMode;

    fn request(batch_id: Uuid, index: usize) -> CreateChunkJobRequest {
        CreateChunkJobRequest::new(
            batch_id,
            index,
            vec![format!("https://example.com/{index}")],
            ScrapeMode::Simple,
        )
    }

    #[tokio::test]
    async fn test_job_lifecycle() {
        let store = MemoryJobStore::new();
        let job = store.create_job(request(Uuid::new_v4(), 0)).await.unwrap();
        assert_eq!(
            store.get_job_status(job.id).await.unwrap(),
            Some(JobStatus::Pending)
        );

        store.mark_running(job.id).await.unwrap();
        store
            .complete_job(job.id, JobStatus::PartialFailure, 19, 1)
            .await
            .unwrap();

        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::PartialFailure);
        assert_eq!((stored.succeeded, stored.failed), (19, 1));
        assert!(stored.started_at.is_some());
        assert!(stored.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_cancel_does_not_override_terminal_state() {
        let store = MemoryJobStore::new();
        let job = store.create_job(request(Uuid::new_v4(), 0)).await.unwrap();
        store.complete_job(job.id, JobStatus::Done, 1, 0).await.unwrap();
        store.cancel_job(job.id).await.unwrap();
        assert_eq!(
            store.get_job_status(job.id).await.unwrap(),
            Some(JobStatus::Done)
        );
    }

    #[tokio::test]
    async fn test_fail_job_records_message() {
        let store = MemoryJobStore::new();
        let job = store.create_job(request(Uuid::new_v4(), 0)).await.unwrap();
        store.fail_job(job.id, "boom").await.unwrap();
        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.error_message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let store = MemoryJobStore::new();
        assert!(store.get_job(Uuid::new_v4()).await.unwrap().is_none());
        assert!(store.mark_running(Uuid::new_v4()).await.is_err());
    }

    #[tokio::test]
    async fn test_list_batch_is_ordered_and_scoped() {
        let store = MemoryJobStore::new();
        let batch = Uuid::new_v4();
        for index in [2, 0, 1] {
            store.create_job(request(batch, index)).await.unwrap();
        }
        store.create_job(request(Uuid::new_v4(), 0)).await.unwrap();

        let jobs = store.list_batch(batch).await.unwrap();
        let indexes: Vec<_> = jobs.iter().map(|j| j.chunk_index).collect();
        assert_eq!(indexes, vec![0, 1, 2]);
        assert_eq!(store.len(), 4);
    }
}
