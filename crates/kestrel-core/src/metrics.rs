//! Engine-wide counters, gauges and timings.
//!
//! A single [`MetricsRegistry`] is created by whoever builds the engine and
//! shared by `Arc` with every component that records into it. All updates
//! are lock-free atomics so recording never blocks a request.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::models::ScrapeMode;

/// Which cache tier answered a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheTier {
    Local,
    Distributed,
}

#[derive(Debug, Default)]
struct Timing {
    count: AtomicU64,
    total_micros: AtomicU64,
    max_micros: AtomicU64,
}

impl Timing {
    fn record(&self, d: Duration) {
        let micros = d.as_micros().min(u64::MAX as u128) as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_micros.fetch_add(micros, Ordering::Relaxed);
        self.max_micros.fetch_max(micros, Ordering::Relaxed);
    }

    fn snapshot(&self) -> TimingSnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let total = self.total_micros.load(Ordering::Relaxed);
        let mean_ms = if count > 0 {
            total as f64 / count as f64 / 1000.0
        } else {
            0.0
        };
        TimingSnapshot {
            count,
            mean_ms,
            max_ms: self.max_micros.load(Ordering::Relaxed) as f64 / 1000.0,
        }
    }
}

#[derive(Debug, Default)]
struct ModeCounters {
    requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    local_hits: AtomicU64,
    distributed_hits: AtomicU64,
    misses: AtomicU64,
    rate_limited: AtomicU64,
    fetch_timeouts: AtomicU64,
    queue_depth: AtomicUsize,
    navigation: Timing,
    extraction: Timing,
    queue_wait: Timing,
}

/// Shared metrics sink for every engine component.
#[derive(Debug)]
pub struct MetricsRegistry {
    modes: [ModeCounters; 3],
    resources_created: AtomicU64,
    resources_retired: AtomicU64,
    resource_creation_failures: AtomicU64,
    cache_errors: AtomicU64,
    anomalies: AtomicU64,
    worker_count: AtomicUsize,
    started_at: Instant,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            modes: Default::default(),
            resources_created: AtomicU64::new(0),
            resources_retired: AtomicU64::new(0),
            resource_creation_failures: AtomicU64::new(0),
            cache_errors: AtomicU64::new(0),
            anomalies: AtomicU64::new(0),
            worker_count: AtomicUsize::new(0),
            started_at: Instant::now(),
        }
    }

    fn mode(&self, mode: ScrapeMode) -> &ModeCounters {
        &self.modes[mode.index()]
    }

    pub fn record_request(&self, mode: ScrapeMode) {
        self.mode(mode).requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self, mode: ScrapeMode) {
        self.mode(mode).successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self, mode: ScrapeMode) {
        self.mode(mode).failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fetch_timeout(&self, mode: ScrapeMode) {
        self.mode(mode).fetch_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limited(&self, mode: ScrapeMode) {
        self.mode(mode).rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self, mode: ScrapeMode, tier: CacheTier) {
        let counters = self.mode(mode);
        match tier {
            CacheTier::Local => counters.local_hits.fetch_add(1, Ordering::Relaxed),
            CacheTier::Distributed => counters.distributed_hits.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn record_cache_miss(&self, mode: ScrapeMode) {
        self.mode(mode).misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_error(&self) {
        self.cache_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_navigation(&self, mode: ScrapeMode, d: Duration) {
        self.mode(mode).navigation.record(d);
    }

    pub fn record_extraction(&self, mode: ScrapeMode, d: Duration) {
        self.mode(mode).extraction.record(d);
    }

    pub fn record_queue_wait(&self, mode: ScrapeMode, d: Duration) {
        self.mode(mode).queue_wait.record(d);
    }

    pub fn set_queue_depth(&self, mode: ScrapeMode, depth: usize) {
        self.mode(mode).queue_depth.store(depth, Ordering::Relaxed);
    }

    pub fn record_resource_created(&self) {
        self.resources_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Resource churn: a resource closed because of its reuse cap, a failed
    /// reset, or a restart request.
    pub fn record_resource_retired(&self) {
        self.resources_retired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resource_creation_failure(&self) {
        self.resource_creation_failures
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_anomaly(&self) {
        self.anomalies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_worker_count(&self, count: usize) {
        self.worker_count.store(count, Ordering::Relaxed);
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let modes = ScrapeMode::ALL
            .iter()
            .map(|&mode| {
                let c = self.mode(mode);
                let local_hits = c.local_hits.load(Ordering::Relaxed);
                let distributed_hits = c.distributed_hits.load(Ordering::Relaxed);
                let misses = c.misses.load(Ordering::Relaxed);
                let lookups = local_hits + distributed_hits + misses;
                ModeMetricsSnapshot {
                    mode,
                    requests: c.requests.load(Ordering::Relaxed),
                    successes: c.successes.load(Ordering::Relaxed),
                    failures: c.failures.load(Ordering::Relaxed),
                    fetch_timeouts: c.fetch_timeouts.load(Ordering::Relaxed),
                    rate_limited: c.rate_limited.load(Ordering::Relaxed),
                    local_hits,
                    distributed_hits,
                    misses,
                    hit_ratio: if lookups > 0 {
                        (local_hits + distributed_hits) as f64 / lookups as f64
                    } else {
                        0.0
                    },
                    queue_depth: c.queue_depth.load(Ordering::Relaxed),
                    navigation: c.navigation.snapshot(),
                    extraction: c.extraction.snapshot(),
                    queue_wait: c.queue_wait.snapshot(),
                }
            })
            .collect();

        MetricsSnapshot {
            uptime_secs: self.started_at.elapsed().as_secs_f64(),
            modes,
            resources_created: self.resources_created.load(Ordering::Relaxed),
            resources_retired: self.resources_retired.load(Ordering::Relaxed),
            resource_creation_failures: self.resource_creation_failures.load(Ordering::Relaxed),
            cache_errors: self.cache_errors.load(Ordering::Relaxed),
            anomalies: self.anomalies.load(Ordering::Relaxed),
            worker_count: self.worker_count(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TimingSnapshot {
    pub count: u64,
    pub mean_ms: f64,
    pub max_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModeMetricsSnapshot {
    pub mode: ScrapeMode,
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub fetch_timeouts: u64,
    pub rate_limited: u64,
    pub local_hits: u64,
    pub distributed_hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
    pub queue_depth: usize,
    pub navigation: TimingSnapshot,
    pub extraction: TimingSnapshot,
    pub queue_wait: TimingSnapshot,
}

/// Point-in-time copy of every metric, suitable for JSON export.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: f64,
    pub modes: Vec<ModeMetricsSnapshot>,
    pub resources_created: u64,
    pub resources_retired: u64,
    pub resource_creation_failures: u64,
    pub cache_errors: u64,
    pub anomalies: u64,
    pub worker_count: usize,
}

impl MetricsSnapshot {
    pub fn mode(&self, mode: ScrapeMode) -> &ModeMetricsSnapshot {
        &self.modes[mode.index()]
    }
}
