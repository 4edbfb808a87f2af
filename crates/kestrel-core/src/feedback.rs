//! Wiring between observations on the request path and the adaptive
//! components.
//!
//! The engine reports what it sees here; the loop forwards each signal to
//! the [`Throttler`], the [`AnomalyDetector`] and the [`Scaler`], and turns
//! detected anomalies into throttle escalations and restart requests.

use std::sync::Arc;
use std::time::Duration;

use crate::anomaly::{AnomalyDetector, AnomalyEvent, AnomalyKind};
use crate::metrics::MetricsRegistry;
use crate::models::ScrapeMode;
use crate::scaler::Scaler;
use crate::throttle::Throttler;

pub struct FeedbackLoop {
    throttler: Throttler,
    detector: AnomalyDetector,
    scaler: Arc<Scaler>,
    metrics: Arc<MetricsRegistry>,
}

impl FeedbackLoop {
    pub fn new(
        throttler: Throttler,
        detector: AnomalyDetector,
        scaler: Arc<Scaler>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            throttler,
            detector,
            scaler,
            metrics,
        }
    }

    pub fn throttler(&self) -> &Throttler {
        &self.throttler
    }

    pub fn detector(&self) -> &AnomalyDetector {
        &self.detector
    }

    pub fn scaler(&self) -> &Arc<Scaler> {
        &self.scaler
    }

    /// Delay to apply before the next fetch in `mode`.
    pub fn current_delay(&self, mode: ScrapeMode) -> Duration {
        self.throttler.current_delay(mode)
    }

    pub fn observe_navigation(&self, duration: Duration, mode: ScrapeMode) {
        self.throttler.update_navigation_time(duration, mode);
        if let Some(event) = self.detector.add_navigation_time(duration, mode) {
            self.dispatch(event);
        }
    }

    pub fn observe_cache(&self, hit: bool, mode: ScrapeMode) {
        self.throttler.update_cache_stats(hit, mode);
    }

    /// The upstream answered with a rate-limit signal.
    pub fn observe_rate_limit(&self, mode: ScrapeMode) {
        self.metrics.record_rate_limited(mode);
        self.throttler.record_rate_limit_event(mode);
        if let Some(event) = self.detector.add_rate_limit_event(mode) {
            self.dispatch(event);
        }
    }

    pub fn observe_memory(&self, value_mb: f64, resource_id: u64) {
        if let Some(event) = self.detector.add_memory_usage(value_mb, resource_id) {
            self.dispatch(event);
        }
    }

    pub fn observe_queue_wait(&self, wait: Duration, mode: ScrapeMode) {
        self.metrics.record_queue_wait(mode, wait);
        self.scaler.add_queue_wait_time(wait, mode);
    }

    pub fn observe_queue_length(&self, length: usize, mode: ScrapeMode) {
        self.metrics.set_queue_depth(mode, length);
        self.scaler.update_queue_length(length, mode);
    }

    fn dispatch(&self, event: AnomalyEvent) {
        self.metrics.record_anomaly();
        tracing::warn!(
            kind = %event.kind,
            mode = ?event.mode,
            resource_id = ?event.resource_id,
            score = event.score,
            "Anomaly detected"
        );

        self.throttler.record_anomaly(&event);
        if event.kind == AnomalyKind::MemoryHigh
            && let Some(resource_id) = event.resource_id
        {
            self.scaler.request_restart(resource_id);
        }
    }
}
