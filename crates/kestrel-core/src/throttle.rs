//! Adaptive pre-request delay, tracked per scrape mode.
//!
//! The delay rises when recent navigation latency or cache-miss ratio
//! crosses its threshold, jumps straight to the maximum on an upstream
//! rate-limit signal, and decays multiplicatively back towards the base once
//! a hold period has passed without stress. It is always clamped to
//! `[base_delay, max_delay]`.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use kestrel_core::config::ModeProfiles;
//! use kestrel_core::models::ScrapeMode;
//! use kestrel_core::throttle::{ThrottleConfig, Throttler};
//!
//! let throttler = Throttler::new(
//!     ThrottleConfig::default().with_max_delay(Duration::from_secs(2)),
//!     &ModeProfiles::default(),
//! );
//! throttler.update_navigation_time(Duration::from_secs(5), ScrapeMode::Simple);
//! assert!(throttler.current_delay(ScrapeMode::Simple) > Duration::from_millis(50));
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::anomaly::{AnomalyEvent, AnomalyKind};
use crate::config::ModeProfiles;
use crate::models::ScrapeMode;

/// Configuration for the adaptive throttler.
#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Navigation latencies kept per mode.
    pub latency_window: usize,
    /// Cache hit/miss flags kept per mode.
    pub cache_window: usize,
    /// Rate-limit timestamps kept per mode.
    pub rate_limit_window: usize,
    /// Cache flags required before the miss ratio is trusted.
    pub cache_min_samples: usize,
    pub cache_miss_threshold: f64,
    /// Lower bound on the multiplier applied when escalating.
    pub escalation_factor: f64,
    /// Multiplier applied per stress-free observation once the hold expires.
    pub decay_factor: f64,
    /// After escalating, decay is suppressed for this many times the new delay.
    pub hold_multiplier: u32,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(3),
            latency_window: 15,
            cache_window: 20,
            rate_limit_window: 20,
            cache_min_samples: 5,
            cache_miss_threshold: 0.6,
            escalation_factor: 1.5,
            decay_factor: 0.95,
            hold_multiplier: 3,
        }
    }
}

impl ThrottleConfig {
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_latency_window(mut self, size: usize) -> Self {
        self.latency_window = size.max(1);
        self
    }

    pub fn with_cache_window(mut self, size: usize) -> Self {
        self.cache_window = size.max(1);
        self
    }

    pub fn with_cache_miss_threshold(mut self, threshold: f64) -> Self {
        self.cache_miss_threshold = threshold;
        self
    }

    fn clamp(&self, delay: Duration) -> Duration {
        delay.clamp(self.base_delay, self.max_delay.max(self.base_delay))
    }
}

/// Why the delay was last raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleReason {
    None,
    NavigationLatency,
    CacheMissRate,
    RateLimit,
    LatencySpike,
    MemoryHigh,
}

impl fmt::Display for ThrottleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ThrottleReason::None => "none",
            ThrottleReason::NavigationLatency => "navigation_latency",
            ThrottleReason::CacheMissRate => "cache_miss_rate",
            ThrottleReason::RateLimit => "rate_limit",
            ThrottleReason::LatencySpike => "latency_spike",
            ThrottleReason::MemoryHigh => "memory_high",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
struct ThrottleState {
    latencies: VecDeque<Duration>,
    cache_flags: VecDeque<bool>,
    rate_limits: VecDeque<Instant>,
    delay: Duration,
    hold_until: Option<Instant>,
    reason: ThrottleReason,
}

impl ThrottleState {
    fn new(delay: Duration) -> Self {
        Self {
            latencies: VecDeque::new(),
            cache_flags: VecDeque::new(),
            rate_limits: VecDeque::new(),
            delay,
            hold_until: None,
            reason: ThrottleReason::None,
        }
    }

    fn mean_latency(&self) -> Option<Duration> {
        if self.latencies.is_empty() {
            return None;
        }
        let total: Duration = self.latencies.iter().sum();
        Some(total / self.latencies.len() as u32)
    }

    fn miss_ratio(&self, min_samples: usize) -> Option<f64> {
        if self.cache_flags.len() < min_samples.max(1) {
            return None;
        }
        let misses = self.cache_flags.iter().filter(|hit| !**hit).count();
        Some(misses as f64 / self.cache_flags.len() as f64)
    }
}

fn push_bounded<T>(window: &mut VecDeque<T>, value: T, capacity: usize) {
    window.push_back(value);
    while window.len() > capacity {
        window.pop_front();
    }
}

/// Snapshot of one mode's throttle state.
#[derive(Debug, Clone)]
pub struct ThrottleStatus {
    pub mode: ScrapeMode,
    pub delay: Duration,
    pub reason: ThrottleReason,
    pub mean_latency: Option<Duration>,
    pub miss_ratio: Option<f64>,
    pub rate_limit_events: usize,
}

/// Per-mode adaptive delay calculator.
pub struct Throttler {
    config: ThrottleConfig,
    latency_thresholds: [Duration; 3],
    states: [Mutex<ThrottleState>; 3],
}

impl Throttler {
    pub fn new(config: ThrottleConfig, profiles: &ModeProfiles) -> Self {
        let base = config.base_delay;
        Self {
            latency_thresholds: ScrapeMode::ALL.map(|m| profiles.get(m).latency_threshold),
            states: std::array::from_fn(|_| Mutex::new(ThrottleState::new(base))),
            config,
        }
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    fn lock_state(&self, mode: ScrapeMode) -> MutexGuard<'_, ThrottleState> {
        self.states[mode.index()].lock().unwrap_or_else(|poisoned| {
            tracing::warn!(%mode, "Recovered from poisoned throttle mutex");
            poisoned.into_inner()
        })
    }

    /// Delay to apply before the next request in `mode`.
    pub fn current_delay(&self, mode: ScrapeMode) -> Duration {
        self.lock_state(mode).delay
    }

    pub fn status(&self, mode: ScrapeMode) -> ThrottleStatus {
        let state = self.lock_state(mode);
        ThrottleStatus {
            mode,
            delay: state.delay,
            reason: state.reason,
            mean_latency: state.mean_latency(),
            miss_ratio: state.miss_ratio(self.config.cache_min_samples),
            rate_limit_events: state.rate_limits.len(),
        }
    }

    pub fn update_navigation_time(&self, duration: Duration, mode: ScrapeMode) -> Duration {
        self.update_navigation_time_at(duration, mode, Instant::now())
    }

    pub fn update_cache_stats(&self, hit: bool, mode: ScrapeMode) -> Duration {
        self.update_cache_stats_at(hit, mode, Instant::now())
    }

    pub fn record_rate_limit_event(&self, mode: ScrapeMode) -> Duration {
        self.record_rate_limit_event_at(mode, Instant::now())
    }

    /// Apply an anomaly raised by the detector.
    ///
    /// Memory pressure is per resource, not per mode, so it slows every mode.
    pub fn record_anomaly(&self, event: &AnomalyEvent) {
        let now = Instant::now();
        match (event.kind, event.mode) {
            (AnomalyKind::RateLimitBurst, Some(mode)) => {
                let mut state = self.lock_state(mode);
                self.pin_to_max(&mut state, mode, ThrottleReason::RateLimit, now);
            }
            (AnomalyKind::LatencySpike, Some(mode)) => {
                let factor = self.config.escalation_factor;
                let mut state = self.lock_state(mode);
                self.escalate(&mut state, mode, factor, ThrottleReason::LatencySpike, now);
            }
            (AnomalyKind::MemoryHigh, _) | (_, None) => {
                for mode in ScrapeMode::ALL {
                    let mut state = self.lock_state(mode);
                    self.escalate(&mut state, mode, 2.0, ThrottleReason::MemoryHigh, now);
                }
            }
        }
    }

    pub(crate) fn update_navigation_time_at(
        &self,
        duration: Duration,
        mode: ScrapeMode,
        now: Instant,
    ) -> Duration {
        let threshold = self.latency_thresholds[mode.index()];
        let mut state = self.lock_state(mode);
        push_bounded(&mut state.latencies, duration, self.config.latency_window);

        match state.mean_latency() {
            Some(mean) if mean > threshold && !threshold.is_zero() => {
                let ratio = mean.as_secs_f64() / threshold.as_secs_f64();
                let factor = (1.0 + ratio.ln()).max(self.config.escalation_factor);
                self.escalate(
                    &mut state,
                    mode,
                    factor,
                    ThrottleReason::NavigationLatency,
                    now,
                );
            }
            _ => self.maybe_decay(&mut state, mode, now),
        }
        state.delay
    }

    pub(crate) fn update_cache_stats_at(&self, hit: bool, mode: ScrapeMode, now: Instant) -> Duration {
        let mut state = self.lock_state(mode);
        push_bounded(&mut state.cache_flags, hit, self.config.cache_window);

        match self.cache_target(&state) {
            Some(target) if !hit && target > state.delay => {
                self.raise_to(&mut state, mode, target, ThrottleReason::CacheMissRate, now);
            }
            _ => self.maybe_decay(&mut state, mode, now),
        }
        state.delay
    }

    /// Delay implied by the miss ratio alone, anchored at the base delay.
    /// It never compounds on the current delay.
    fn cache_target(&self, state: &ThrottleState) -> Option<Duration> {
        let threshold = self.config.cache_miss_threshold;
        let ratio = state.miss_ratio(self.config.cache_min_samples)?;
        if ratio <= threshold || threshold <= 0.0 {
            return None;
        }
        let factor = 1.0 + (ratio / threshold).ln();
        Some(self.config.clamp(self.config.base_delay.mul_f64(factor)))
    }

    pub(crate) fn record_rate_limit_event_at(&self, mode: ScrapeMode, now: Instant) -> Duration {
        let mut state = self.lock_state(mode);
        push_bounded(&mut state.rate_limits, now, self.config.rate_limit_window);
        self.pin_to_max(&mut state, mode, ThrottleReason::RateLimit, now);
        state.delay
    }

    fn pin_to_max(
        &self,
        state: &mut ThrottleState,
        mode: ScrapeMode,
        reason: ThrottleReason,
        now: Instant,
    ) {
        state.delay = self.config.clamp(self.config.max_delay);
        state.reason = reason;
        state.hold_until = Some(now + state.delay * self.config.hold_multiplier);
        tracing::warn!(
            %mode,
            %reason,
            delay_ms = state.delay.as_millis() as u64,
            "Throttling to maximum delay"
        );
    }

    fn raise_to(
        &self,
        state: &mut ThrottleState,
        mode: ScrapeMode,
        target: Duration,
        reason: ThrottleReason,
        now: Instant,
    ) {
        let previous = state.delay;
        state.delay = self.config.clamp(target.max(previous));
        state.reason = reason;
        state.hold_until = Some(now + state.delay * self.config.hold_multiplier);
        tracing::debug!(
            %mode,
            %reason,
            from_ms = previous.as_millis() as u64,
            to_ms = state.delay.as_millis() as u64,
            "Throttle delay raised"
        );
    }

    fn escalate(
        &self,
        state: &mut ThrottleState,
        mode: ScrapeMode,
        factor: f64,
        reason: ThrottleReason,
        now: Instant,
    ) {
        let previous = state.delay;
        let raised = previous.mul_f64(factor.max(1.0));
        state.delay = self.config.clamp(raised);
        state.reason = reason;
        state.hold_until = Some(now + state.delay * self.config.hold_multiplier);
        if state.delay != previous {
            tracing::debug!(
                %mode,
                %reason,
                from_ms = previous.as_millis() as u64,
                to_ms = state.delay.as_millis() as u64,
                "Throttle delay raised"
            );
        }
    }

    /// Move towards base when no window currently signals stress.
    fn maybe_decay(&self, state: &mut ThrottleState, mode: ScrapeMode, now: Instant) {
        if state.delay <= self.config.base_delay {
            return;
        }
        if state.hold_until.is_some_and(|until| now < until) {
            return;
        }
        let threshold = self.latency_thresholds[mode.index()];
        if state.mean_latency().is_some_and(|mean| mean > threshold) {
            return;
        }
        let floor = self.cache_target(state).unwrap_or(self.config.base_delay);
        if state.delay <= floor {
            return;
        }

        let decayed = state.delay.mul_f64(self.config.decay_factor.clamp(0.0, 1.0));
        state.delay = self.config.clamp(decayed.max(floor));
        if state.delay == self.config.base_delay {
            state.reason = ThrottleReason::None;
        }
    }
}
