//! Test utilities: mock implementations of the collaborator traits.
//!
//! Handwritten mocks for dependency injection in unit tests. Shared state
//! sits behind `Arc` so clones handed to the engine can be inspected from
//! the test afterwards.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use uuid::Uuid;

use crate::batch::{BatchConfig, BatchEvent, BatchReporter};
use crate::cache::MemoryCacheBackend;
use crate::config::EngineConfig;
use crate::engine::TaskEngine;
use crate::error::AppError;
use crate::filter::ResourceFilter;
use crate::job::{ChunkJob, CreateChunkJobRequest, JobStatus};
use crate::job_queue::{ChunkJobStore, MemoryJobStore};
use crate::models::ScrapeMode;
use crate::pool::PoolConfig;
use crate::rate_limiter::RateLimiterConfig;
use crate::scaler::ScalerConfig;
use crate::throttle::ThrottleConfig;
use crate::traits::{CacheBackend, CachedValue, Extractor, Fetcher, SessionFactory};

/// Rebuild an error for replay; `AppError` is not `Clone`.
fn replay(err: &AppError) -> AppError {
    match err {
        AppError::FetchError(m) => AppError::FetchError(m.clone()),
        AppError::FetchTimeout(s) => AppError::FetchTimeout(*s),
        AppError::UpstreamRateLimited(m) => AppError::UpstreamRateLimited(m.clone()),
        AppError::ExtractionError(m) => AppError::ExtractionError(m.clone()),
        AppError::ValidationError(m) => AppError::ValidationError(m.clone()),
        other => AppError::Generic(other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// MockSessionFactory
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct MockSession {
    pub serial: u64,
}

/// Session factory counting lifecycle calls, with injectable failures.
#[derive(Clone, Default)]
pub struct MockSessionFactory {
    serial: Arc<AtomicU64>,
    created: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
    resets: Arc<AtomicUsize>,
    filters_installed: Arc<AtomicUsize>,
    create_failures: Arc<AtomicUsize>,
    reset_failures: Arc<AtomicUsize>,
    memory_mb: Option<f64>,
}

impl MockSessionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` calls to `create` fail.
    pub fn failing_creates(self, n: usize) -> Self {
        self.create_failures.store(n, Ordering::SeqCst);
        self
    }

    /// The next `n` calls to `reset` fail.
    pub fn failing_resets(self, n: usize) -> Self {
        self.reset_failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn with_memory_mb(mut self, mb: f64) -> Self {
        self.memory_mb = Some(mb);
        self
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    pub fn filters_installed(&self) -> usize {
        self.filters_installed.load(Ordering::SeqCst)
    }
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl SessionFactory for MockSessionFactory {
    type Session = MockSession;

    async fn create(&self) -> Result<MockSession, AppError> {
        if take_failure(&self.create_failures) {
            return Err(AppError::Generic("browser failed to launch".into()));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(MockSession {
            serial: self.serial.fetch_add(1, Ordering::SeqCst),
        })
    }

    async fn install_filter(
        &self,
        _session: &mut MockSession,
        _filter: &ResourceFilter,
    ) -> Result<(), AppError> {
        self.filters_installed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reset(&self, _session: &mut MockSession) -> Result<(), AppError> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.reset_failures) {
            return Err(AppError::Generic("page crashed".into()));
        }
        Ok(())
    }

    async fn close(&self, _session: MockSession) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }

    async fn memory_usage_mb(&self, _session: &mut MockSession) -> Option<f64> {
        self.memory_mb
    }
}

// ---------------------------------------------------------------------------
// MockFetcher
// ---------------------------------------------------------------------------

enum Scripted {
    Error(AppError),
    Hang,
}

/// Fetcher returning a small HTML page per URL, with scripted failures.
#[derive(Clone, Default)]
pub struct MockFetcher {
    scripted: Arc<Mutex<HashMap<String, Scripted>>>,
    delay: Option<Duration>,
    calls: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every fetch of `url` fails with `err`.
    pub fn fail(self, url: &str, err: AppError) -> Self {
        self.scripted
            .lock()
            .unwrap()
            .insert(url.to_string(), Scripted::Error(err));
        self
    }

    /// Fetches of `url` never complete.
    pub fn hang(self, url: &str) -> Self {
        self.scripted
            .lock()
            .unwrap()
            .insert(url.to_string(), Scripted::Hang);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of fetches observed running at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<S: Send> Fetcher<S> for MockFetcher {
    async fn fetch(&self, _session: &mut S, url: &str, _timeout: Duration) -> Result<String, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(Arc::clone(&self.in_flight));

        let scripted = match self.scripted.lock().unwrap().get(url) {
            Some(Scripted::Error(e)) => Some(Err(replay(e))),
            Some(Scripted::Hang) => Some(Ok(())),
            None => None,
        };
        match scripted {
            Some(Err(e)) => return Err(e),
            Some(Ok(())) => std::future::pending::<()>().await,
            None => {}
        }

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(format!(
            "<html><head><title>{url}</title></head><body></body></html>"
        ))
    }
}

// ---------------------------------------------------------------------------
// MockExtractor
// ---------------------------------------------------------------------------

/// Extractor echoing the URL and mode, or always failing.
#[derive(Clone, Default)]
pub struct MockExtractor {
    fail: bool,
}

impl MockExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self { fail: true }
    }
}

impl Extractor for MockExtractor {
    fn extract(
        &self,
        raw: &str,
        url: &str,
        mode: ScrapeMode,
    ) -> Result<serde_json::Value, AppError> {
        if self.fail {
            return Err(AppError::ExtractionError("no metadata found".into()));
        }
        Ok(serde_json::json!({
            "url": url,
            "mode": mode.as_str(),
            "length": raw.len(),
        }))
    }
}

// ---------------------------------------------------------------------------
// FailingCacheBackend
// ---------------------------------------------------------------------------

/// Distributed cache whose every call fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailingCacheBackend;

impl CacheBackend for FailingCacheBackend {
    async fn get(&self, _key: &str) -> Result<Option<CachedValue>, AppError> {
        Err(AppError::CacheError("connection refused".into()))
    }

    async fn set(&self, _key: &str, _value: String, _ttl: Duration) -> Result<(), AppError> {
        Err(AppError::CacheError("connection refused".into()))
    }
}

// ---------------------------------------------------------------------------
// FailingJobStore
// ---------------------------------------------------------------------------

/// In-memory job store that refuses to create one chunk's job.
#[derive(Clone)]
pub struct FailingJobStore {
    inner: MemoryJobStore,
    fail_index: usize,
}

impl FailingJobStore {
    pub fn failing_chunk(index: usize) -> Self {
        Self {
            inner: MemoryJobStore::new(),
            fail_index: index,
        }
    }
}

impl ChunkJobStore for FailingJobStore {
    async fn create_job(&self, request: CreateChunkJobRequest) -> Result<ChunkJob, AppError> {
        if request.chunk_index == self.fail_index {
            return Err(AppError::DatabaseError("insert failed".into()));
        }
        self.inner.create_job(request).await
    }

    async fn mark_running(&self, job_id: Uuid) -> Result<(), AppError> {
        self.inner.mark_running(job_id).await
    }

    async fn complete_job(
        &self,
        job_id: Uuid,
        status: JobStatus,
        succeeded: usize,
        failed: usize,
    ) -> Result<(), AppError> {
        self.inner.complete_job(job_id, status, succeeded, failed).await
    }

    async fn fail_job(&self, job_id: Uuid, error: &str) -> Result<(), AppError> {
        self.inner.fail_job(job_id, error).await
    }

    async fn cancel_job(&self, job_id: Uuid) -> Result<(), AppError> {
        self.inner.cancel_job(job_id).await
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<ChunkJob>, AppError> {
        self.inner.get_job(job_id).await
    }

    async fn get_job_status(&self, job_id: Uuid) -> Result<Option<JobStatus>, AppError> {
        self.inner.get_job_status(job_id).await
    }

    async fn list_batch(&self, batch_id: Uuid) -> Result<Vec<ChunkJob>, AppError> {
        self.inner.list_batch(batch_id).await
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Batch reporter that records event names.
#[derive(Default)]
pub struct MockReporter {
    pub events: Arc<Mutex<Vec<String>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BatchReporter for MockReporter {
    fn report(&self, event: BatchEvent<'_>) {
        let label = match &event {
            BatchEvent::Started { .. } => "Started",
            BatchEvent::ChunkStarted { .. } => "ChunkStarted",
            BatchEvent::ChunkCompleted { .. } => "ChunkCompleted",
            BatchEvent::ChunkFailed { .. } => "ChunkFailed",
            BatchEvent::ChunkCancelled { .. } => "ChunkCancelled",
            BatchEvent::Finished { .. } => "Finished",
        };
        self.events.lock().unwrap().push(label.to_string());
    }
}

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

pub type TestEngine = TaskEngine<MockSessionFactory, MockFetcher, MockExtractor, MemoryCacheBackend>;

/// Engine configuration with short delays and timeouts.
pub fn fast_config() -> EngineConfig {
    EngineConfig::default()
        .with_pool(
            PoolConfig::default()
                .with_initial_size(0)
                .with_max_size(8)
                .with_acquire_timeout(Duration::from_secs(5)),
        )
        .with_rate_limiter(
            RateLimiterConfig::default()
                .with_capacity(8)
                .with_acquire_timeout(Duration::from_secs(5)),
        )
        .with_throttle(
            ThrottleConfig::default()
                .with_base_delay(Duration::from_millis(1))
                .with_max_delay(Duration::from_millis(10)),
        )
        .with_scaler(ScalerConfig::default().with_tick_interval(Duration::from_millis(10)))
        .with_batch(BatchConfig::default().with_gate_poll_interval(Duration::from_millis(10)))
}

pub fn make_test_engine(fetcher: MockFetcher) -> TestEngine {
    TaskEngine::new(
        fast_config(),
        MockSessionFactory::new(),
        fetcher,
        MockExtractor::new(),
        MemoryCacheBackend::default(),
    )
}
