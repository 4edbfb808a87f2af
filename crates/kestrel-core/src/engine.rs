//! Request orchestration.
//!
//! [`TaskEngine`] owns every adaptive component and drives a single URL
//! through cache lookup, throttling, rate limiting, the resource pool,
//! fetch and extraction. [`TaskEngine::stream_metadata`] fans that out over
//! many URLs with bounded concurrency.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, Stream, StreamExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::anomaly::{AnomalyDetector, AnomalySummary};
use crate::cache::TwoTierCache;
use crate::config::{EngineConfig, ModeProfile};
use crate::error::AppError;
use crate::feedback::FeedbackLoop;
use crate::metrics::{MetricsRegistry, MetricsSnapshot};
use crate::models::{CacheKey, ScrapeMode, ScrapeRequest, ScrapeResult};
use crate::pool::{PoolLease, PoolStats, ResourcePool};
use crate::queue::{Backlog, ModeQueues};
use crate::rate_limiter::RateLimiter;
use crate::scaler::{ScaleDecision, Scaler, ScalerStatus};
use crate::throttle::Throttler;
use crate::traits::{CacheBackend, Extractor, Fetcher, SessionFactory};

/// Default number of URLs in flight per stream.
pub const DEFAULT_STREAM_BATCH_SIZE: usize = 25;

pub struct TaskEngine<S, F, E, B>
where
    S: SessionFactory,
    F: Fetcher<S::Session>,
    E: Extractor,
    B: CacheBackend,
{
    config: EngineConfig,
    pool: ResourcePool<S>,
    limiter: RateLimiter,
    cache: TwoTierCache<B>,
    feedback: FeedbackLoop,
    queues: ModeQueues,
    scaler: Arc<Scaler>,
    metrics: Arc<MetricsRegistry>,
    fetcher: F,
    extractor: E,
}

impl<S, F, E, B> TaskEngine<S, F, E, B>
where
    S: SessionFactory,
    F: Fetcher<S::Session>,
    E: Extractor,
    B: CacheBackend,
{
    pub fn new(config: EngineConfig, factory: S, fetcher: F, extractor: E, backend: B) -> Self {
        let metrics = Arc::new(MetricsRegistry::new());
        let scaler = Arc::new(Scaler::new(config.scaler.clone(), Arc::clone(&metrics)));
        let feedback = FeedbackLoop::new(
            Throttler::new(config.throttle.clone(), &config.modes),
            AnomalyDetector::new(config.anomaly.clone()),
            Arc::clone(&scaler),
            Arc::clone(&metrics),
        );

        Self {
            pool: ResourcePool::new(factory, config.pool.clone(), Arc::clone(&metrics)),
            limiter: RateLimiter::new(config.rate_limiter.clone()),
            cache: TwoTierCache::new(backend, config.cache.clone(), Arc::clone(&metrics)),
            feedback,
            queues: ModeQueues::new(),
            scaler,
            metrics,
            fetcher,
            extractor,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn metrics_registry(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn anomaly_summary(&self) -> AnomalySummary {
        self.feedback.detector().summary()
    }

    pub fn scaling_status(&self) -> ScalerStatus {
        self.scaler.status()
    }

    pub fn scaler(&self) -> &Arc<Scaler> {
        &self.scaler
    }

    pub fn feedback(&self) -> &FeedbackLoop {
        &self.feedback
    }

    pub fn queue_depth(&self, mode: ScrapeMode) -> usize {
        self.queues.depth(mode)
    }

    /// Pre-warm the resource pool. Returns the number of sessions created.
    pub async fn initialize(&self) -> Result<usize, AppError> {
        self.pool.initialize(self.config.pool.initial_size).await
    }

    /// Close every idle session. In-flight requests finish on their own.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
        tracing::info!("Task engine shut down");
    }

    /// Fetch and extract metadata for one URL.
    ///
    /// Cached successes are returned with `from_cache` set. Validation, pool
    /// and rate-limiter failures propagate as errors; every acquired permit
    /// and session is released first.
    pub async fn get_metadata(&self, url: &str, mode: ScrapeMode) -> Result<ScrapeResult, AppError> {
        ScrapeRequest::new(url, mode).validate()?;
        self.metrics.record_request(mode);

        let key = CacheKey::new(url, mode);
        if let Some(mut cached) = self.cache.get(&key).await {
            self.feedback.observe_cache(true, mode);
            self.metrics.record_success(mode);
            cached.from_cache = true;
            tracing::debug!(%url, %mode, "Cache hit");
            return Ok(cached);
        }
        self.feedback.observe_cache(false, mode);

        match self.fetch_uncached(url, mode, &key).await {
            Ok(result) => {
                self.metrics.record_success(mode);
                Ok(result)
            }
            Err(e) => {
                self.metrics.record_failure(mode);
                match &e {
                    AppError::FetchTimeout(_) => self.metrics.record_fetch_timeout(mode),
                    AppError::UpstreamRateLimited(_) => self.feedback.observe_rate_limit(mode),
                    _ => {}
                }
                tracing::warn!(%url, %mode, error = %e, "Scrape failed");
                Err(e)
            }
        }
    }

    async fn fetch_uncached(
        &self,
        url: &str,
        mode: ScrapeMode,
        key: &CacheKey,
    ) -> Result<ScrapeResult, AppError> {
        let profile = self.config.modes.get(mode);

        let delay = self.feedback.current_delay(mode);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let permit = self.limiter.acquire().await?;
        let mut lease = self.pool.acquire().await?;

        let outcome = self.scrape_with(&mut lease, url, mode, profile).await;
        if let Ok(result) = &outcome {
            self.cache.set(key, result).await;
        }

        self.pool.release(lease).await;
        permit.release();
        self.forget_retired();
        outcome
    }

    /// Drop detector state for every session the pool has retired.
    fn forget_retired(&self) {
        for resource_id in self.pool.take_retired() {
            self.feedback.detector().forget_resource(resource_id);
        }
    }

    async fn scrape_with(
        &self,
        lease: &mut PoolLease<S::Session>,
        url: &str,
        mode: ScrapeMode,
        profile: ModeProfile,
    ) -> Result<ScrapeResult, AppError> {
        let session = lease
            .session_mut()
            .ok_or_else(|| AppError::ResourceExhausted("lease holds no session".into()))?;

        let started = Instant::now();
        let fetched = tokio::time::timeout(
            profile.fetch_timeout,
            self.fetcher.fetch(session, url, profile.fetch_timeout),
        )
        .await;
        let navigation = started.elapsed();

        let raw = match fetched {
            Ok(result) => {
                let raw = result?;
                self.metrics.record_navigation(mode, navigation);
                self.feedback.observe_navigation(navigation, mode);
                raw
            }
            Err(_) => {
                self.feedback.observe_navigation(navigation, mode);
                return Err(AppError::FetchTimeout(profile.fetch_timeout.as_millis() as u64));
            }
        };

        if let Some(memory_mb) = self.pool.memory_usage_mb(lease).await {
            self.feedback.observe_memory(memory_mb, lease.id());
        }

        let started = Instant::now();
        let payload = self.extractor.extract(&raw, url, mode)?;
        self.metrics.record_extraction(mode, started.elapsed());

        tracing::debug!(
            %url,
            %mode,
            resource_id = lease.id(),
            navigation_ms = navigation.as_millis() as u64,
            "Scrape succeeded"
        );
        Ok(ScrapeResult::success(url, mode, payload))
    }

    /// Scrape many URLs, yielding results in completion order.
    ///
    /// URLs are trimmed and de-duplicated. At most `batch_size` (capped by
    /// the mode's sub-batch size) run at once. Per-URL errors become
    /// failure results; the stream itself never fails.
    pub fn stream_metadata<'a>(
        &'a self,
        urls: Vec<String>,
        mode: ScrapeMode,
        batch_size: usize,
    ) -> impl Stream<Item = ScrapeResult> + 'a {
        let profile = self.config.modes.get(mode);
        let in_flight = batch_size.clamp(1, profile.sub_batch_size.max(1));
        let urls = dedupe(urls);
        let backlog = Arc::new(self.backlog(mode, urls.len()));

        stream::iter(urls)
            .map(move |url| {
                let backlog = Arc::clone(&backlog);
                backlog.dequeue();
                async move {
                    let outcome = self.get_metadata(&url, mode).await;
                    backlog.complete();
                    outcome.unwrap_or_else(|e| ScrapeResult::failure(url, mode, &e))
                }
            })
            .buffer_unordered(in_flight)
    }

    /// Count `count` URLs as queued for `mode` until the backlog releases
    /// them or is dropped.
    pub fn backlog(&self, mode: ScrapeMode, count: usize) -> Backlog<'_> {
        Backlog::enqueue(&self.queues, &self.feedback, mode, count)
    }

    /// Run the scaler until `cancel_token` fires, applying restart
    /// decisions to the pool.
    pub async fn run_autoscaler(&self, cancel_token: CancellationToken) {
        self.scaler
            .run(cancel_token, |decision| {
                if let ScaleDecision::Restart { resource_id } = decision {
                    self.pool.mark_for_retirement(resource_id);
                }
            })
            .await;
    }
}

impl<S, F, E, B> TaskEngine<S, F, E, B>
where
    S: SessionFactory,
    F: Fetcher<S::Session> + 'static,
    E: Extractor + 'static,
    B: CacheBackend + 'static,
{
    /// Spawn [`run_autoscaler`](Self::run_autoscaler) on the runtime.
    pub fn spawn_autoscaler(self: &Arc<Self>, cancel_token: CancellationToken) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.run_autoscaler(cancel_token).await })
    }
}

fn dedupe(urls: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    urls.into_iter()
        .map(|url| url.trim().to_string())
        .filter(|url| !url.is_empty() && seen.insert(url.clone()))
        .collect()
}
