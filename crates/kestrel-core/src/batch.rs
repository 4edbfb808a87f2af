//! Large-batch processing.
//!
//! A batch is split into fixed-size chunks, each tracked as a job in a
//! [`ChunkJobStore`]. A set of workers pulls chunks and drives them through
//! [`TaskEngine::stream_metadata`]; only as many workers as the scaler
//! currently allows are active at once, never fewer than the batch minimum.
//! URLs of chunks that have not started yet count towards the mode's queue.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use futures::StreamExt;
use futures::future::join_all;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::engine::TaskEngine;
use crate::error::AppError;
use crate::job::{CreateChunkJobRequest, JobStatus};
use crate::job_queue::ChunkJobStore;
use crate::models::{ScrapeMode, ScrapeResult};
use crate::queue::Backlog;
use crate::traits::{CacheBackend, Extractor, Fetcher, SessionFactory};

/// Chunk and worker bounds for batches.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub min_chunk_size: usize,
    pub max_chunk_size: usize,
    pub default_chunk_size: usize,
    pub min_workers: usize,
    pub max_workers: usize,
    pub default_workers: usize,
    /// How often a worker parked by the scaler checks whether it may run.
    pub gate_poll_interval: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            min_chunk_size: 20,
            max_chunk_size: 50,
            default_chunk_size: 25,
            min_workers: 4,
            max_workers: 10,
            default_workers: 8,
            gate_poll_interval: Duration::from_millis(100),
        }
    }
}

impl BatchConfig {
    pub fn with_chunk_bounds(mut self, min: usize, max: usize) -> Self {
        self.min_chunk_size = min;
        self.max_chunk_size = max;
        self
    }

    pub fn with_worker_bounds(mut self, min: usize, max: usize) -> Self {
        self.min_workers = min;
        self.max_workers = max;
        self
    }

    pub fn with_gate_poll_interval(mut self, interval: Duration) -> Self {
        self.gate_poll_interval = interval;
        self
    }

    /// Requested chunk size clamped to the configured bounds.
    pub fn chunk_size(&self, requested: Option<usize>) -> usize {
        let max = self.max_chunk_size.max(1);
        requested
            .unwrap_or(self.default_chunk_size)
            .clamp(self.min_chunk_size.min(max), max)
            .max(1)
    }

    /// Requested worker count clamped to the configured bounds.
    pub fn workers(&self, requested: Option<usize>) -> usize {
        let max = self.max_workers.max(1);
        requested
            .unwrap_or(self.default_workers)
            .clamp(self.min_workers.min(max), max)
    }
}

/// Events emitted while a batch runs.
#[derive(Debug, Clone)]
pub enum BatchEvent<'a> {
    Started {
        batch_id: Uuid,
        mode: ScrapeMode,
        total_urls: usize,
        chunks: usize,
        chunk_size: usize,
        workers: usize,
    },
    ChunkStarted {
        job_id: Uuid,
        index: usize,
        urls: usize,
    },
    ChunkCompleted {
        job_id: Uuid,
        index: usize,
        status: JobStatus,
        succeeded: usize,
        failed: usize,
    },
    ChunkFailed {
        index: usize,
        error: &'a str,
    },
    ChunkCancelled {
        job_id: Uuid,
        index: usize,
    },
    Finished {
        report: &'a BatchReport,
    },
}

/// Receives batch progress events.
pub trait BatchReporter: Send + Sync {
    fn report(&self, event: BatchEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingBatchReporter;

impl BatchReporter for TracingBatchReporter {
    fn report(&self, event: BatchEvent<'_>) {
        match event {
            BatchEvent::Started {
                batch_id,
                mode,
                total_urls,
                chunks,
                chunk_size,
                workers,
            } => {
                tracing::info!(
                    %batch_id, %mode, total_urls, chunks, chunk_size, workers,
                    "Batch started"
                );
            }
            BatchEvent::ChunkStarted { job_id, index, urls } => {
                tracing::debug!(%job_id, index, urls, "Chunk started");
            }
            BatchEvent::ChunkCompleted {
                job_id,
                index,
                status,
                succeeded,
                failed,
            } => {
                tracing::info!(%job_id, index, %status, succeeded, failed, "Chunk completed");
            }
            BatchEvent::ChunkFailed { index, error } => {
                tracing::warn!(index, %error, "Chunk could not be dispatched");
            }
            BatchEvent::ChunkCancelled { job_id, index } => {
                tracing::info!(%job_id, index, "Chunk cancelled");
            }
            BatchEvent::Finished { report } => {
                tracing::info!(
                    batch_id = %report.batch_id,
                    status = %report.status,
                    succeeded = report.succeeded,
                    failed = report.failed,
                    elapsed_ms = report.elapsed_ms,
                    urls_per_second = report.urls_per_second,
                    "Batch finished"
                );
            }
        }
    }
}

/// Outcome of one chunk.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkReport {
    pub index: usize,
    /// `None` when the job could not be created.
    pub job_id: Option<Uuid>,
    pub status: JobStatus,
    pub urls: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub error: Option<String>,
    pub results: Vec<ScrapeResult>,
}

/// Outcome of a whole batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub batch_id: Uuid,
    pub mode: ScrapeMode,
    pub status: JobStatus,
    pub total_urls: usize,
    pub chunk_size: usize,
    /// Upper bound on concurrently running chunks. The scaler may run
    /// fewer, but never below [`BatchConfig::min_workers`].
    pub workers: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// URLs in chunks that were never started.
    pub skipped: usize,
    pub elapsed_ms: u64,
    pub urls_per_second: f64,
    pub chunks: Vec<ChunkReport>,
}

impl BatchReport {
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn count_with_status(&self, status: JobStatus) -> usize {
        self.chunks.iter().filter(|c| c.status == status).count()
    }

    /// Every per-URL result, in chunk order.
    pub fn results(&self) -> impl Iterator<Item = &ScrapeResult> {
        self.chunks.iter().flat_map(|c| c.results.iter())
    }
}

struct PendingChunk {
    index: usize,
    job_id: Uuid,
    urls: Vec<String>,
}

/// State shared by the workers of one batch.
struct BatchRun<'a> {
    pending: &'a [PendingChunk],
    next: AtomicUsize,
    /// URLs of chunks not yet handed to a worker.
    queued: Backlog<'a>,
    mode: ScrapeMode,
    requested_workers: usize,
    cancel_token: &'a CancellationToken,
}

pub struct BatchProcessor<S, F, E, B, J, R = TracingBatchReporter>
where
    S: SessionFactory,
    F: Fetcher<S::Session>,
    E: Extractor,
    B: CacheBackend,
    J: ChunkJobStore,
    R: BatchReporter,
{
    engine: Arc<TaskEngine<S, F, E, B>>,
    store: J,
    reporter: R,
    config: BatchConfig,
}

impl<S, F, E, B, J> BatchProcessor<S, F, E, B, J, TracingBatchReporter>
where
    S: SessionFactory,
    F: Fetcher<S::Session>,
    E: Extractor,
    B: CacheBackend,
    J: ChunkJobStore,
{
    /// Processor using the engine's batch configuration and tracing output.
    pub fn new(engine: Arc<TaskEngine<S, F, E, B>>, store: J) -> Self {
        let config = engine.config().batch.clone();
        Self {
            engine,
            store,
            reporter: TracingBatchReporter,
            config,
        }
    }
}

impl<S, F, E, B, J, R> BatchProcessor<S, F, E, B, J, R>
where
    S: SessionFactory,
    F: Fetcher<S::Session>,
    E: Extractor,
    B: CacheBackend,
    J: ChunkJobStore,
    R: BatchReporter,
{
    pub fn with_reporter<R2: BatchReporter>(self, reporter: R2) -> BatchProcessor<S, F, E, B, J, R2> {
        BatchProcessor {
            engine: self.engine,
            store: self.store,
            reporter,
            config: self.config,
        }
    }

    pub fn with_config(mut self, config: BatchConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(&self) -> &J {
        &self.store
    }

    pub fn engine(&self) -> &Arc<TaskEngine<S, F, E, B>> {
        &self.engine
    }

    /// Scrape a large batch of URLs in chunks.
    ///
    /// `chunk_size` and `worker_count` default from [`BatchConfig`] and are
    /// clamped to its bounds. A chunk whose job cannot be created is
    /// reported `Failed`; the rest of the batch still runs. Cancelling
    /// `cancel_token` stops new chunks from starting while running chunks
    /// finish.
    pub async fn process_large_batch(
        &self,
        urls: Vec<String>,
        mode: ScrapeMode,
        chunk_size: Option<usize>,
        worker_count: Option<usize>,
        cancel_token: &CancellationToken,
    ) -> Result<BatchReport, AppError> {
        let urls = unique_urls(urls);
        if urls.is_empty() {
            return Err(AppError::ValidationError("batch contains no URLs".into()));
        }

        let started = Instant::now();
        let batch_id = Uuid::new_v4();
        let chunk_size = self.config.chunk_size(chunk_size);
        let workers = self.config.workers(worker_count);
        let total_urls = urls.len();
        let chunk_total = total_urls.div_ceil(chunk_size);

        self.reporter.report(BatchEvent::Started {
            batch_id,
            mode,
            total_urls,
            chunks: chunk_total,
            chunk_size,
            workers,
        });

        let mut reports = Vec::with_capacity(chunk_total);
        let mut pending = Vec::with_capacity(chunk_total);
        for (index, chunk) in urls.chunks(chunk_size).enumerate() {
            let request = CreateChunkJobRequest::new(batch_id, index, chunk.to_vec(), mode);
            match self.store.create_job(request).await {
                Ok(job) => pending.push(PendingChunk {
                    index,
                    job_id: job.id,
                    urls: job.urls,
                }),
                Err(e) => {
                    let error = e.to_string();
                    self.reporter.report(BatchEvent::ChunkFailed {
                        index,
                        error: &error,
                    });
                    reports.push(ChunkReport {
                        index,
                        job_id: None,
                        status: JobStatus::Failed,
                        urls: chunk.len(),
                        succeeded: 0,
                        failed: 0,
                        error: Some(error),
                        results: Vec::new(),
                    });
                }
            }
        }

        let queued = self
            .engine
            .backlog(mode, pending.iter().map(|c| c.urls.len()).sum());
        let run = BatchRun {
            pending: &pending,
            next: AtomicUsize::new(0),
            queued,
            mode,
            requested_workers: workers,
            cancel_token,
        };
        let worker_runs = (0..workers).map(|slot| self.run_worker(slot, &run));
        for worker_reports in join_all(worker_runs).await {
            reports.extend(worker_reports);
        }
        let dispatched = run.next.load(Ordering::SeqCst).min(pending.len());
        drop(run);

        for chunk in &pending[dispatched..] {
            if let Err(e) = self.store.cancel_job(chunk.job_id).await {
                tracing::warn!(job_id = %chunk.job_id, error = %e, "Could not mark chunk cancelled");
            }
            self.reporter.report(BatchEvent::ChunkCancelled {
                job_id: chunk.job_id,
                index: chunk.index,
            });
            reports.push(ChunkReport {
                index: chunk.index,
                job_id: Some(chunk.job_id),
                status: JobStatus::Cancelled,
                urls: chunk.urls.len(),
                succeeded: 0,
                failed: 0,
                error: None,
                results: Vec::new(),
            });
        }

        reports.sort_by_key(|r| r.index);
        let report = summarize(
            batch_id,
            mode,
            total_urls,
            chunk_size,
            workers,
            started.elapsed(),
            reports,
        );
        self.reporter.report(BatchEvent::Finished { report: &report });
        Ok(report)
    }

    /// Workers allowed to run right now: the scaler's count, floored at the
    /// batch minimum and capped at what the batch asked for.
    fn active_workers(&self, requested: usize) -> usize {
        self.engine
            .scaler()
            .worker_count()
            .max(self.config.min_workers)
            .min(requested)
    }

    async fn run_worker(&self, slot: usize, run: &BatchRun<'_>) -> Vec<ChunkReport> {
        let mut reports = Vec::new();

        loop {
            // Park while the scaler keeps this slot inactive.
            while slot >= self.active_workers(run.requested_workers) {
                if run.cancel_token.is_cancelled()
                    || run.next.load(Ordering::SeqCst) >= run.pending.len()
                {
                    return reports;
                }
                tokio::select! {
                    _ = run.cancel_token.cancelled() => {}
                    _ = tokio::time::sleep(self.config.gate_poll_interval) => {}
                }
            }

            if run.cancel_token.is_cancelled() {
                break;
            }
            let index = run.next.fetch_add(1, Ordering::SeqCst);
            let Some(chunk) = run.pending.get(index) else {
                break;
            };

            reports.push(self.run_chunk(chunk, &run.queued, run.mode).await);
        }

        reports
    }

    async fn run_chunk(
        &self,
        chunk: &PendingChunk,
        queued: &Backlog<'_>,
        mode: ScrapeMode,
    ) -> ChunkReport {
        if let Err(e) = self.store.mark_running(chunk.job_id).await {
            tracing::warn!(job_id = %chunk.job_id, error = %e, "Could not mark chunk running");
        }
        self.reporter.report(BatchEvent::ChunkStarted {
            job_id: chunk.job_id,
            index: chunk.index,
            urls: chunk.urls.len(),
        });

        let stream = self
            .engine
            .stream_metadata(chunk.urls.clone(), mode, chunk.urls.len());
        // The chunk's stream now counts these URLs.
        queued.release(chunk.urls.len());
        let results: Vec<ScrapeResult> = stream.collect().await;

        let succeeded = results.iter().filter(|r| r.is_success()).count();
        let failed = results.len() - succeeded;
        let status = if failed > 0 {
            JobStatus::PartialFailure
        } else {
            JobStatus::Done
        };

        if let Err(e) = self
            .store
            .complete_job(chunk.job_id, status, succeeded, failed)
            .await
        {
            tracing::warn!(job_id = %chunk.job_id, error = %e, "Could not record chunk result");
        }
        self.reporter.report(BatchEvent::ChunkCompleted {
            job_id: chunk.job_id,
            index: chunk.index,
            status,
            succeeded,
            failed,
        });

        ChunkReport {
            index: chunk.index,
            job_id: Some(chunk.job_id),
            status,
            urls: chunk.urls.len(),
            succeeded,
            failed,
            error: None,
            results,
        }
    }
}

fn unique_urls(urls: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    urls.into_iter()
        .map(|url| url.trim().to_string())
        .filter(|url| !url.is_empty() && seen.insert(url.clone()))
        .collect()
}

fn summarize(
    batch_id: Uuid,
    mode: ScrapeMode,
    total_urls: usize,
    chunk_size: usize,
    workers: usize,
    elapsed: Duration,
    chunks: Vec<ChunkReport>,
) -> BatchReport {
    let succeeded = chunks.iter().map(|c| c.succeeded).sum::<usize>();
    let failed = chunks.iter().map(|c| c.failed).sum::<usize>();
    let skipped = chunks
        .iter()
        .filter(|c| matches!(c.status, JobStatus::Cancelled | JobStatus::Failed))
        .map(|c| c.urls)
        .sum::<usize>();
    let secs = elapsed.as_secs_f64();
    let urls_per_second = if secs > 0.0 {
        (succeeded + failed) as f64 / secs
    } else {
        0.0
    };

    BatchReport {
        batch_id,
        mode,
        status: JobStatus::aggregate(chunks.iter().map(|c| c.status)),
        total_urls,
        chunk_size,
        workers,
        succeeded,
        failed,
        skipped,
        elapsed_ms: elapsed.as_millis() as u64,
        urls_per_second,
        chunks,
    }
}
