//! Statistical detection of latency spikes, rate-limit bursts and memory
//! pressure.
//!
//! Latency is tracked per mode with an exponentially weighted mean and
//! variance; a sample whose Z-score against the baseline *before* it is
//! folded in exceeds the threshold is a spike. Rate-limit events are counted
//! in a sliding time window. Memory is tracked per pooled resource.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::ScrapeMode;

/// Configuration for the anomaly detector.
#[derive(Debug, Clone)]
pub struct AnomalyConfig {
    /// EWMA smoothing factor in (0, 1].
    pub ewma_alpha: f64,
    pub z_threshold: f64,
    /// Latency samples required before Z-scores are computed.
    pub min_samples: u32,
    pub rate_limit_window: Duration,
    /// More events than this inside the window is a burst.
    pub rate_limit_burst_threshold: usize,
    pub memory_threshold_mb: f64,
    /// Memory above this multiple of the resource's baseline counts as high.
    pub memory_baseline_ratio: f64,
    /// Consecutive high samples before `MemoryHigh` fires.
    pub memory_sustained_samples: u32,
    /// How long an event keeps `is_anomalous` true.
    pub decay_window: Duration,
    /// Events retained for `recent_events` and `summary`.
    pub max_events: usize,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            ewma_alpha: 0.3,
            z_threshold: 3.0,
            min_samples: 10,
            rate_limit_window: Duration::from_secs(60),
            rate_limit_burst_threshold: 10,
            memory_threshold_mb: 1024.0,
            memory_baseline_ratio: 1.5,
            memory_sustained_samples: 3,
            decay_window: Duration::from_secs(30),
            max_events: 100,
        }
    }
}

impl AnomalyConfig {
    pub fn with_z_threshold(mut self, z: f64) -> Self {
        self.z_threshold = z;
        self
    }

    pub fn with_memory_threshold_mb(mut self, mb: f64) -> Self {
        self.memory_threshold_mb = mb;
        self
    }

    pub fn with_decay_window(mut self, window: Duration) -> Self {
        self.decay_window = window;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    LatencySpike,
    RateLimitBurst,
    MemoryHigh,
}

impl fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AnomalyKind::LatencySpike => "latency_spike",
            AnomalyKind::RateLimitBurst => "rate_limit_burst",
            AnomalyKind::MemoryHigh => "memory_high",
        };
        f.write_str(s)
    }
}

/// A detected anomaly. Transient: consumed by the throttler and scaler.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnomalyEvent {
    pub kind: AnomalyKind,
    /// Set for latency and rate-limit events.
    pub mode: Option<ScrapeMode>,
    /// Set for memory events.
    pub resource_id: Option<u64>,
    /// Z-score, event count, or megabytes depending on `kind`.
    pub score: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Ewma {
    mean: f64,
    variance: f64,
    samples: u32,
}

impl Ewma {
    fn update(&mut self, x: f64, alpha: f64) {
        if self.samples == 0 {
            self.mean = x;
            self.variance = 0.0;
        } else {
            let diff = x - self.mean;
            let incr = alpha * diff;
            self.mean += incr;
            self.variance = (1.0 - alpha) * (self.variance + diff * incr);
        }
        self.samples = self.samples.saturating_add(1);
    }

    /// Standard deviation with a 1ms floor so a perfectly flat baseline does
    /// not turn every wobble into an infinite score.
    fn std_dev(&self) -> f64 {
        self.variance.sqrt().max(0.001)
    }
}

#[derive(Debug, Default)]
struct MemoryTrack {
    baseline: Ewma,
    consecutive_high: u32,
}

#[derive(Debug, Default)]
struct DetectorState {
    latency: [Ewma; 3],
    rate_limits: [VecDeque<Instant>; 3],
    memory: HashMap<u64, MemoryTrack>,
    events: VecDeque<(Instant, AnomalyEvent)>,
}

/// Counts of recent anomalies, for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct AnomalySummary {
    pub window_secs: u64,
    pub latency_spikes: usize,
    pub rate_limit_bursts: usize,
    pub memory_high: usize,
    pub total: usize,
    pub anomalous_modes: Vec<ScrapeMode>,
    pub latest: Option<AnomalyEvent>,
}

pub struct AnomalyDetector {
    config: AnomalyConfig,
    state: Mutex<DetectorState>,
}

impl AnomalyDetector {
    pub fn new(config: AnomalyConfig) -> Self {
        Self {
            config,
            state: Mutex::new(DetectorState::default()),
        }
    }

    pub fn config(&self) -> &AnomalyConfig {
        &self.config
    }

    fn lock_state(&self) -> MutexGuard<'_, DetectorState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned anomaly detector mutex");
            poisoned.into_inner()
        })
    }

    pub fn add_navigation_time(&self, duration: Duration, mode: ScrapeMode) -> Option<AnomalyEvent> {
        self.add_navigation_time_at(duration, mode, Instant::now())
    }

    pub fn add_rate_limit_event(&self, mode: ScrapeMode) -> Option<AnomalyEvent> {
        self.add_rate_limit_event_at(mode, Instant::now())
    }

    pub fn add_memory_usage(&self, value_mb: f64, resource_id: u64) -> Option<AnomalyEvent> {
        self.add_memory_usage_at(value_mb, resource_id, Instant::now())
    }

    /// True while an event affecting `mode` is younger than the decay window.
    pub fn is_anomalous(&self, mode: ScrapeMode) -> bool {
        self.is_anomalous_at(mode, Instant::now())
    }

    /// Stop tracking a resource that has been retired.
    pub fn forget_resource(&self, resource_id: u64) {
        self.lock_state().memory.remove(&resource_id);
    }

    /// Number of resources with memory state held.
    pub fn tracked_resources(&self) -> usize {
        self.lock_state().memory.len()
    }

    /// Current latency baseline `(mean_secs, std_dev_secs, samples)` for a mode.
    pub fn latency_baseline(&self, mode: ScrapeMode) -> (f64, f64, u32) {
        let state = self.lock_state();
        let ewma = state.latency[mode.index()];
        (ewma.mean, ewma.variance.sqrt(), ewma.samples)
    }

    /// Events newer than `window`, oldest first.
    pub fn recent_events(&self, window: Duration) -> Vec<AnomalyEvent> {
        let now = Instant::now();
        self.lock_state()
            .events
            .iter()
            .filter(|(at, _)| now.saturating_duration_since(*at) <= window)
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Anomaly counts over the last five minutes.
    pub fn summary(&self) -> AnomalySummary {
        let window = Duration::from_secs(300);
        let events = self.recent_events(window);
        let count = |kind| events.iter().filter(|e| e.kind == kind).count();
        AnomalySummary {
            window_secs: window.as_secs(),
            latency_spikes: count(AnomalyKind::LatencySpike),
            rate_limit_bursts: count(AnomalyKind::RateLimitBurst),
            memory_high: count(AnomalyKind::MemoryHigh),
            total: events.len(),
            anomalous_modes: ScrapeMode::ALL
                .into_iter()
                .filter(|&m| self.is_anomalous(m))
                .collect(),
            latest: events.last().cloned(),
        }
    }

    pub(crate) fn add_navigation_time_at(
        &self,
        duration: Duration,
        mode: ScrapeMode,
        now: Instant,
    ) -> Option<AnomalyEvent> {
        let x = duration.as_secs_f64();
        let mut state = self.lock_state();
        let ewma = &mut state.latency[mode.index()];

        let z = (ewma.samples >= self.config.min_samples)
            .then(|| (x - ewma.mean) / ewma.std_dev());
        ewma.update(x, self.config.ewma_alpha);

        let z = z.filter(|z| *z > self.config.z_threshold)?;
        tracing::warn!(%mode, latency_secs = x, z_score = z, "Latency spike detected");
        Some(self.push_event(
            &mut state,
            now,
            AnomalyKind::LatencySpike,
            Some(mode),
            None,
            z,
        ))
    }

    pub(crate) fn add_rate_limit_event_at(&self, mode: ScrapeMode, now: Instant) -> Option<AnomalyEvent> {
        let window = self.config.rate_limit_window;
        let mut state = self.lock_state();
        let events = &mut state.rate_limits[mode.index()];
        events.push_back(now);
        while events
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) > window)
        {
            events.pop_front();
        }

        let count = events.len();
        if count <= self.config.rate_limit_burst_threshold {
            return None;
        }
        tracing::warn!(%mode, events = count, "Rate limit burst detected");
        Some(self.push_event(
            &mut state,
            now,
            AnomalyKind::RateLimitBurst,
            Some(mode),
            None,
            count as f64,
        ))
    }

    pub(crate) fn add_memory_usage_at(
        &self,
        value_mb: f64,
        resource_id: u64,
        now: Instant,
    ) -> Option<AnomalyEvent> {
        let mut state = self.lock_state();
        let track = state.memory.entry(resource_id).or_default();

        let above_baseline = track.baseline.samples >= self.config.memory_sustained_samples
            && value_mb > track.baseline.mean * self.config.memory_baseline_ratio;
        let high = value_mb > self.config.memory_threshold_mb || above_baseline;

        if high {
            track.consecutive_high += 1;
        } else {
            track.consecutive_high = 0;
            track.baseline.update(value_mb, self.config.ewma_alpha);
        }

        if track.consecutive_high < self.config.memory_sustained_samples.max(1) {
            return None;
        }
        track.consecutive_high = 0;
        tracing::warn!(resource_id, memory_mb = value_mb, "Sustained high memory detected");
        Some(self.push_event(
            &mut state,
            now,
            AnomalyKind::MemoryHigh,
            None,
            Some(resource_id),
            value_mb,
        ))
    }

    pub(crate) fn is_anomalous_at(&self, mode: ScrapeMode, now: Instant) -> bool {
        let decay = self.config.decay_window;
        self.lock_state().events.iter().rev().any(|(at, e)| {
            now.saturating_duration_since(*at) <= decay && e.mode.is_none_or(|m| m == mode)
        })
    }

    fn push_event(
        &self,
        state: &mut DetectorState,
        now: Instant,
        kind: AnomalyKind,
        mode: Option<ScrapeMode>,
        resource_id: Option<u64>,
        score: f64,
    ) -> AnomalyEvent {
        let event = AnomalyEvent {
            kind,
            mode,
            resource_id,
            score,
            timestamp: Utc::now(),
        };
        state.events.push_back((now, event.clone()));
        while state.events.len() > self.config.max_events {
            state.events.pop_front();
        }
        event
    }
}
