use kestrel_core::job::{CreateChunkJobRequest, JobStatus};
use kestrel_core::job_queue::ChunkJobStore;
use kestrel_core::models::ScrapeMode;
use kestrel_db::ChunkJobRepository;
use uuid::Uuid;

use crate::integration::common::setup_test_db;

fn request(batch_id: Uuid, index: usize) -> CreateChunkJobRequest {
    CreateChunkJobRequest::new(
        batch_id,
        index,
        vec![
            format!("https://example.com/{index}/a"),
            format!("https://example.com/{index}/b"),
        ],
        ScrapeMode::Full,
    )
}

#[tokio::test]
async fn create_job_and_verify_fields() {
    let (pool, _container) = setup_test_db().await;
    let repo = ChunkJobRepository::new(pool);
    let batch_id = Uuid::new_v4();

    let job = repo.create_job(request(batch_id, 4)).await.unwrap();

    assert_eq!(job.batch_id, batch_id);
    assert_eq!(job.chunk_index, 4);
    assert_eq!(job.urls.len(), 2);
    assert_eq!(job.mode, ScrapeMode::Full);
    assert_eq!(job.status, JobStatus::Pending);
    assert!(job.started_at.is_none());
}

#[tokio::test]
async fn lifecycle_records_counts() {
    let (pool, _container) = setup_test_db().await;
    let repo = ChunkJobRepository::new(pool);

    let job = repo.create_job(request(Uuid::new_v4(), 0)).await.unwrap();
    repo.mark_running(job.id).await.unwrap();
    assert_eq!(
        repo.get_job_status(job.id).await.unwrap(),
        Some(JobStatus::Running)
    );

    repo.complete_job(job.id, JobStatus::PartialFailure, 1, 1)
        .await
        .unwrap();

    let done = repo.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(done.status, JobStatus::PartialFailure);
    assert_eq!(done.succeeded, 1);
    assert_eq!(done.failed, 1);
    assert!(done.started_at.is_some());
    assert!(done.completed_at.is_some());
}

#[tokio::test]
async fn fail_job_records_message() {
    let (pool, _container) = setup_test_db().await;
    let repo = ChunkJobRepository::new(pool);

    let job = repo.create_job(request(Uuid::new_v4(), 0)).await.unwrap();
    repo.fail_job(job.id, "dispatch failed").await.unwrap();

    let failed = repo.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.error_message.as_deref(), Some("dispatch failed"));
}

#[tokio::test]
async fn cancel_does_not_override_terminal_status() {
    let (pool, _container) = setup_test_db().await;
    let repo = ChunkJobRepository::new(pool);

    let done = repo.create_job(request(Uuid::new_v4(), 0)).await.unwrap();
    repo.complete_job(done.id, JobStatus::Done, 2, 0).await.unwrap();
    repo.cancel_job(done.id).await.unwrap();
    assert_eq!(repo.get_job_status(done.id).await.unwrap(), Some(JobStatus::Done));

    let pending = repo.create_job(request(Uuid::new_v4(), 0)).await.unwrap();
    repo.cancel_job(pending.id).await.unwrap();
    assert_eq!(
        repo.get_job_status(pending.id).await.unwrap(),
        Some(JobStatus::Cancelled)
    );
}

#[tokio::test]
async fn list_batch_is_ordered_and_scoped() {
    let (pool, _container) = setup_test_db().await;
    let repo = ChunkJobRepository::new(pool);
    let batch_id = Uuid::new_v4();

    for index in [2, 0, 1] {
        repo.create_job(request(batch_id, index)).await.unwrap();
    }
    repo.create_job(request(Uuid::new_v4(), 0)).await.unwrap();

    let jobs = repo.list_batch(batch_id).await.unwrap();
    let indices: Vec<_> = jobs.iter().map(|j| j.chunk_index).collect();
    assert_eq!(indices, vec![0, 1, 2]);
}

#[tokio::test]
async fn list_recent_filters_by_status() {
    let (pool, _container) = setup_test_db().await;
    let repo = ChunkJobRepository::new(pool);
    let batch_id = Uuid::new_v4();

    let a = repo.create_job(request(batch_id, 0)).await.unwrap();
    repo.create_job(request(batch_id, 1)).await.unwrap();
    repo.complete_job(a.id, JobStatus::Done, 2, 0).await.unwrap();

    let done = repo.list_recent(Some(JobStatus::Done), 10).await.unwrap();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].id, a.id);
    assert_eq!(repo.list_recent(None, 10).await.unwrap().len(), 2);
}

#[tokio::test]
async fn unknown_job_is_none() {
    let (pool, _container) = setup_test_db().await;
    let repo = ChunkJobRepository::new(pool);

    assert!(repo.get_job(Uuid::new_v4()).await.unwrap().is_none());
    assert!(repo.get_job_status(Uuid::new_v4()).await.unwrap().is_none());
}
