//! Worker-count autoscaling from per-mode queue metrics.
//!
//! The scaler only reads queue metrics and writes its own
//! [`WorkerPoolState`]; it never touches the request path. Decisions are
//! made on a periodic [`tick`](Scaler::tick):
//!
//! 1. a pending restart request (a resource under memory pressure) is served
//!    first, without changing the worker count;
//! 2. otherwise scale up when any mode's queue is long or its P90 wait is high;
//! 3. otherwise scale down when every mode's queue is short and waits are low.
//!
//! Net scaling actions are separated by at least the cooldown, and the
//! count is always kept within `[min_workers, max_workers]`.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::metrics::MetricsRegistry;
use crate::models::ScrapeMode;

/// Configuration for the scaler.
#[derive(Debug, Clone)]
pub struct ScalerConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub initial_workers: usize,
    pub scale_up_increment: usize,
    pub scale_down_decrement: usize,
    /// Any mode's queue longer than this triggers a scale-up.
    pub upscale_queue_threshold: usize,
    /// Every mode's queue must be shorter than this to scale down.
    pub downscale_queue_threshold: usize,
    /// P90 queue wait above this triggers a scale-up.
    pub upscale_wait_p90: Duration,
    /// P90 queue wait must be below this to scale down.
    pub downscale_wait_p90: Duration,
    /// Wait samples kept per mode.
    pub wait_window: usize,
    /// Samples required before P90 is trusted.
    pub min_wait_samples: usize,
    /// Wait samples older than this are ignored.
    pub wait_sample_ttl: Duration,
    pub cooldown: Duration,
    pub restart_cooldown: Duration,
    pub tick_interval: Duration,
}

impl Default for ScalerConfig {
    fn default() -> Self {
        Self {
            min_workers: 2,
            max_workers: 10,
            initial_workers: 4,
            scale_up_increment: 2,
            scale_down_decrement: 1,
            upscale_queue_threshold: 5,
            downscale_queue_threshold: 2,
            upscale_wait_p90: Duration::from_secs(1),
            downscale_wait_p90: Duration::from_millis(200),
            wait_window: 50,
            min_wait_samples: 10,
            wait_sample_ttl: Duration::from_secs(120),
            cooldown: Duration::from_secs(20),
            restart_cooldown: Duration::from_secs(300),
            tick_interval: Duration::from_secs(5),
        }
    }
}

impl ScalerConfig {
    pub fn with_bounds(mut self, min: usize, max: usize) -> Self {
        self.min_workers = min.max(1);
        self.max_workers = max.max(self.min_workers);
        self
    }

    pub fn with_initial_workers(mut self, count: usize) -> Self {
        self.initial_workers = count;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_restart_cooldown(mut self, cooldown: Duration) -> Self {
        self.restart_cooldown = cooldown;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_increments(mut self, up: usize, down: usize) -> Self {
        self.scale_up_increment = up.max(1);
        self.scale_down_decrement = down.max(1);
        self
    }
}

/// Current worker count and its bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerPoolState {
    pub count: usize,
    pub min: usize,
    pub max: usize,
    pub last_scale_at: Option<Instant>,
}

/// Outcome of one scaler tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    ScaleUp { from: usize, to: usize },
    ScaleDown { from: usize, to: usize },
    /// Retire and replace one resource; worker count unchanged.
    Restart { resource_id: u64 },
    Hold,
}

impl fmt::Display for ScaleDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScaleDecision::ScaleUp { from, to } => write!(f, "scale_up({from}->{to})"),
            ScaleDecision::ScaleDown { from, to } => write!(f, "scale_down({from}->{to})"),
            ScaleDecision::Restart { resource_id } => write!(f, "restart({resource_id})"),
            ScaleDecision::Hold => write!(f, "hold"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleAction {
    ScaleUp,
    ScaleDown,
    Restart,
}

/// Record of a decision that changed something.
#[derive(Debug, Clone, Serialize)]
pub struct ScalingEvent {
    pub timestamp: DateTime<Utc>,
    pub action: ScaleAction,
    pub from_workers: usize,
    pub to_workers: usize,
    pub reason: String,
    pub queue_lengths: [usize; 3],
}

/// Per-mode queue metric feeding the scaler.
#[derive(Debug, Default)]
struct QueueMetric {
    length: usize,
    waits: VecDeque<(Instant, Duration)>,
}

#[derive(Debug)]
struct ScalerInner {
    pool: WorkerPoolState,
    queues: [QueueMetric; 3],
    pending_restarts: VecDeque<u64>,
    last_restart_at: Option<Instant>,
    history: VecDeque<ScalingEvent>,
}

/// Serializable status snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ScalerStatus {
    pub worker_count: usize,
    pub min_workers: usize,
    pub max_workers: usize,
    pub queue_lengths: [usize; 3],
    pub p90_wait_ms: [Option<u64>; 3],
    pub pending_restarts: usize,
    pub secs_since_last_scale: Option<u64>,
    pub recent_events: Vec<ScalingEvent>,
}

const HISTORY_LIMIT: usize = 100;

/// Linear-interpolated percentile of unsorted samples, `pct` in [0, 100].
pub fn percentile(samples: &[Duration], pct: f64) -> Option<Duration> {
    if samples.is_empty() {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_unstable();
    let rank = (pct.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        return Some(sorted[lower]);
    }
    let weight = rank - lower as f64;
    let lo = sorted[lower].as_secs_f64();
    let hi = sorted[upper].as_secs_f64();
    Some(Duration::from_secs_f64(lo + (hi - lo) * weight))
}

pub struct Scaler {
    config: ScalerConfig,
    inner: Mutex<ScalerInner>,
    metrics: Arc<MetricsRegistry>,
}

impl Scaler {
    pub fn new(config: ScalerConfig, metrics: Arc<MetricsRegistry>) -> Self {
        let min = config.min_workers.max(1);
        let max = config.max_workers.max(min);
        let count = config.initial_workers.clamp(min, max);
        metrics.set_worker_count(count);
        Self {
            inner: Mutex::new(ScalerInner {
                pool: WorkerPoolState {
                    count,
                    min,
                    max,
                    last_scale_at: None,
                },
                queues: Default::default(),
                pending_restarts: VecDeque::new(),
                last_restart_at: None,
                history: VecDeque::new(),
            }),
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &ScalerConfig {
        &self.config
    }

    fn lock_inner(&self) -> MutexGuard<'_, ScalerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned scaler mutex");
            poisoned.into_inner()
        })
    }

    pub fn worker_count(&self) -> usize {
        self.lock_inner().pool.count
    }

    pub fn state(&self) -> WorkerPoolState {
        self.lock_inner().pool
    }

    pub fn add_queue_wait_time(&self, wait: Duration, mode: ScrapeMode) {
        self.add_queue_wait_time_at(wait, mode, Instant::now());
    }

    pub fn update_queue_length(&self, length: usize, mode: ScrapeMode) {
        self.lock_inner().queues[mode.index()].length = length;
    }

    pub fn queue_length(&self, mode: ScrapeMode) -> usize {
        self.lock_inner().queues[mode.index()].length
    }

    /// P90 of the recent queue waits for a mode.
    pub fn p90_wait(&self, mode: ScrapeMode) -> Option<Duration> {
        let inner = self.lock_inner();
        let samples = self.live_waits(&inner.queues[mode.index()], Instant::now());
        percentile(&samples, 90.0)
    }

    /// Ask for a resource to be retired and replaced on a coming tick.
    pub fn request_restart(&self, resource_id: u64) {
        let mut inner = self.lock_inner();
        if !inner.pending_restarts.contains(&resource_id) {
            inner.pending_restarts.push_back(resource_id);
            tracing::info!(resource_id, "Restart requested");
        }
    }

    pub fn history(&self) -> Vec<ScalingEvent> {
        self.lock_inner().history.iter().cloned().collect()
    }

    pub fn status(&self) -> ScalerStatus {
        let now = Instant::now();
        let inner = self.lock_inner();
        let p90 = ScrapeMode::ALL.map(|m| {
            let samples = self.live_waits(&inner.queues[m.index()], now);
            percentile(&samples, 90.0).map(|d| d.as_millis() as u64)
        });
        ScalerStatus {
            worker_count: inner.pool.count,
            min_workers: inner.pool.min,
            max_workers: inner.pool.max,
            queue_lengths: ScrapeMode::ALL.map(|m| inner.queues[m.index()].length),
            p90_wait_ms: p90,
            pending_restarts: inner.pending_restarts.len(),
            secs_since_last_scale: inner
                .pool
                .last_scale_at
                .map(|t| now.saturating_duration_since(t).as_secs()),
            recent_events: inner.history.iter().rev().take(10).cloned().collect(),
        }
    }

    /// Evaluate the scaling rules once.
    pub fn tick(&self) -> ScaleDecision {
        self.tick_at(Instant::now())
    }

    /// Run [`tick`](Self::tick) every `tick_interval` until cancelled,
    /// passing every non-`Hold` decision to `on_decision`.
    pub async fn run<D>(&self, cancel_token: CancellationToken, mut on_decision: D)
    where
        D: FnMut(ScaleDecision) + Send,
    {
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            interval_ms = self.config.tick_interval.as_millis() as u64,
            "Scaler started"
        );

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => break,
                _ = interval.tick() => {
                    let decision = self.tick();
                    if decision != ScaleDecision::Hold {
                        on_decision(decision);
                    }
                }
            }
        }

        tracing::info!("Scaler stopped");
    }

    pub(crate) fn add_queue_wait_time_at(&self, wait: Duration, mode: ScrapeMode, now: Instant) {
        let mut inner = self.lock_inner();
        let waits = &mut inner.queues[mode.index()].waits;
        waits.push_back((now, wait));
        while waits.len() > self.config.wait_window {
            waits.pop_front();
        }
    }

    pub(crate) fn tick_at(&self, now: Instant) -> ScaleDecision {
        let mut inner = self.lock_inner();

        if let Some(decision) = self.try_restart(&mut inner, now) {
            return decision;
        }

        let cooled_down = inner
            .pool
            .last_scale_at
            .is_none_or(|t| now.saturating_duration_since(t) >= self.config.cooldown);
        if !cooled_down {
            return ScaleDecision::Hold;
        }

        let lengths = ScrapeMode::ALL.map(|m| inner.queues[m.index()].length);
        let p90s = ScrapeMode::ALL.map(|m| {
            let samples = self.live_waits(&inner.queues[m.index()], now);
            if samples.len() >= self.config.min_wait_samples {
                percentile(&samples, 90.0)
            } else {
                None
            }
        });

        let long_queue = lengths
            .iter()
            .any(|&len| len > self.config.upscale_queue_threshold);
        let slow_queue = p90s
            .iter()
            .flatten()
            .any(|&p90| p90 > self.config.upscale_wait_p90);

        let count = inner.pool.count;
        if (long_queue || slow_queue) && count < inner.pool.max {
            let to = (count + self.config.scale_up_increment).min(inner.pool.max);
            let reason = if long_queue {
                "queue_length"
            } else {
                "queue_wait_p90"
            };
            return self.apply(&mut inner, now, ScaleAction::ScaleUp, to, reason, lengths);
        }

        let all_short = lengths
            .iter()
            .all(|&len| len < self.config.downscale_queue_threshold);
        let waits_low = p90s
            .iter()
            .flatten()
            .all(|&p90| p90 < self.config.downscale_wait_p90);

        if all_short && waits_low && !long_queue && !slow_queue && count > inner.pool.min {
            let to = count
                .saturating_sub(self.config.scale_down_decrement)
                .max(inner.pool.min);
            return self.apply(
                &mut inner,
                now,
                ScaleAction::ScaleDown,
                to,
                "queues_idle",
                lengths,
            );
        }

        ScaleDecision::Hold
    }

    fn try_restart(&self, inner: &mut ScalerInner, now: Instant) -> Option<ScaleDecision> {
        if inner.pending_restarts.is_empty() {
            return None;
        }
        let ready = inner
            .last_restart_at
            .is_none_or(|t| now.saturating_duration_since(t) >= self.config.restart_cooldown);
        if !ready {
            return None;
        }

        let resource_id = inner.pending_restarts.pop_front()?;
        inner.last_restart_at = Some(now);
        let count = inner.pool.count;
        let lengths = ScrapeMode::ALL.map(|m| inner.queues[m.index()].length);
        self.push_history(
            inner,
            ScaleAction::Restart,
            count,
            count,
            format!("memory_high(resource {resource_id})"),
            lengths,
        );
        tracing::info!(resource_id, "Scaler requesting resource restart");
        Some(ScaleDecision::Restart { resource_id })
    }

    fn apply(
        &self,
        inner: &mut ScalerInner,
        now: Instant,
        action: ScaleAction,
        to: usize,
        reason: &str,
        lengths: [usize; 3],
    ) -> ScaleDecision {
        let from = inner.pool.count;
        let to = to.clamp(inner.pool.min, inner.pool.max);
        inner.pool.count = to;
        inner.pool.last_scale_at = Some(now);
        self.metrics.set_worker_count(to);
        self.push_history(inner, action, from, to, reason.to_string(), lengths);

        tracing::info!(from, to, %reason, ?lengths, "Worker pool rescaled");
        match action {
            ScaleAction::ScaleUp => ScaleDecision::ScaleUp { from, to },
            ScaleAction::ScaleDown => ScaleDecision::ScaleDown { from, to },
            ScaleAction::Restart => ScaleDecision::Hold,
        }
    }

    fn push_history(
        &self,
        inner: &mut ScalerInner,
        action: ScaleAction,
        from: usize,
        to: usize,
        reason: String,
        lengths: [usize; 3],
    ) {
        inner.history.push_back(ScalingEvent {
            timestamp: Utc::now(),
            action,
            from_workers: from,
            to_workers: to,
            reason,
            queue_lengths: lengths,
        });
        while inner.history.len() > HISTORY_LIMIT {
            inner.history.pop_front();
        }
    }

    fn live_waits(&self, metric: &QueueMetric, now: Instant) -> Vec<Duration> {
        metric
            .waits
            .iter()
            .filter(|(at, _)| now.saturating_duration_since(*at) <= self.config.wait_sample_ttl)
            .map(|(_, w)| *w)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn scaler(config: ScalerConfig) -> Scaler {
        Scaler::new(config, Arc::new(MetricsRegistry::new()))
    }

    #[test]
    fn percentile_interpolates() {
        let samples: Vec<Duration> = (1..=10).map(Duration::from_secs).collect();
        let p90 = percentile(&samples, 90.0).unwrap();
        assert!((p90.as_secs_f64() - 9.1).abs() < 1e-6);
        assert_eq!(percentile(&samples, 0.0), Some(Duration::from_secs(1)));
        assert_eq!(percentile(&samples, 100.0), Some(Duration::from_secs(10)));
        assert_eq!(percentile(&[], 90.0), None);
    }

    #[test]
    fn initial_count_is_clamped() {
        let s = scaler(ScalerConfig::default().with_bounds(2, 6).with_initial_workers(20));
        assert_eq!(s.worker_count(), 6);
        let s = scaler(ScalerConfig::default().with_bounds(3, 6).with_initial_workers(0));
        assert_eq!(s.worker_count(), 3);
    }

    #[test]
    fn long_queue_scales_up_then_respects_cooldown() {
        let s = scaler(ScalerConfig::default());
        let start = Instant::now();
        assert_eq!(s.worker_count(), 4);

        s.update_queue_length(6, ScrapeMode::Simple);
        assert_eq!(
            s.tick_at(start),
            ScaleDecision::ScaleUp { from: 4, to: 6 }
        );

        // Queue still long, but we're inside the cooldown window.
        assert_eq!(s.tick_at(start + Duration::from_secs(5)), ScaleDecision::Hold);
        assert_eq!(s.tick_at(start + Duration::from_secs(19)), ScaleDecision::Hold);
        assert_eq!(s.worker_count(), 6);

        assert_eq!(
            s.tick_at(start + Duration::from_secs(20)),
            ScaleDecision::ScaleUp { from: 6, to: 8 }
        );
    }

    #[test]
    fn queue_at_threshold_does_not_scale() {
        let s = scaler(ScalerConfig::default());
        s.update_queue_length(5, ScrapeMode::Full);
        assert_eq!(s.tick_at(Instant::now()), ScaleDecision::Hold);
    }

    #[test]
    fn never_exceeds_max() {
        let s = scaler(ScalerConfig::default().with_bounds(2, 5).with_cooldown(Duration::ZERO));
        s.update_queue_length(50, ScrapeMode::Super);
        let now = Instant::now();
        assert_eq!(s.tick_at(now), ScaleDecision::ScaleUp { from: 4, to: 5 });
        assert_eq!(s.tick_at(now), ScaleDecision::Hold);
        assert_eq!(s.worker_count(), 5);
    }

    #[test]
    fn high_p90_wait_scales_up() {
        let s = scaler(ScalerConfig::default());
        let now = Instant::now();
        for _ in 0..10 {
            s.add_queue_wait_time_at(Duration::from_secs(3), ScrapeMode::Full, now);
        }
        assert_eq!(s.tick_at(now), ScaleDecision::ScaleUp { from: 4, to: 6 });
    }

    #[test]
    fn too_few_wait_samples_are_ignored() {
        let s = scaler(ScalerConfig::default());
        let now = Instant::now();
        s.update_queue_length(3, ScrapeMode::Full);
        for _ in 0..5 {
            s.add_queue_wait_time_at(Duration::from_secs(3), ScrapeMode::Full, now);
        }
        assert_eq!(s.tick_at(now), ScaleDecision::Hold);
    }

    #[test]
    fn idle_queues_scale_down_to_min() {
        let s = scaler(ScalerConfig::default().with_cooldown(Duration::from_secs(1)));
        let mut now = Instant::now();
        assert_eq!(s.tick_at(now), ScaleDecision::ScaleDown { from: 4, to: 3 });
        now += Duration::from_secs(1);
        assert_eq!(s.tick_at(now), ScaleDecision::ScaleDown { from: 3, to: 2 });
        now += Duration::from_secs(1);
        assert_eq!(s.tick_at(now), ScaleDecision::Hold);
        assert_eq!(s.worker_count(), 2);
    }

    #[test]
    fn slow_waits_block_scale_down() {
        let s = scaler(ScalerConfig::default());
        let now = Instant::now();
        for _ in 0..10 {
            s.add_queue_wait_time_at(Duration::from_millis(500), ScrapeMode::Simple, now);
        }
        // 500ms is neither high enough to scale up nor low enough to scale down.
        assert_eq!(s.tick_at(now), ScaleDecision::Hold);
    }

    #[test]
    fn stale_wait_samples_expire() {
        let s = scaler(ScalerConfig::default());
        let now = Instant::now();
        for _ in 0..10 {
            s.add_queue_wait_time_at(Duration::from_secs(5), ScrapeMode::Simple, now);
        }
        let later = now + Duration::from_secs(121);
        assert_eq!(s.tick_at(later), ScaleDecision::ScaleDown { from: 4, to: 3 });
    }

    #[test]
    fn restart_preferred_and_rate_limited() {
        let s = scaler(ScalerConfig::default());
        let now = Instant::now();
        s.update_queue_length(10, ScrapeMode::Simple);
        s.request_restart(7);
        s.request_restart(7);
        s.request_restart(8);

        assert_eq!(s.tick_at(now), ScaleDecision::Restart { resource_id: 7 });
        assert_eq!(s.worker_count(), 4);
        // second restart waits for its own cooldown; scaling proceeds meanwhile
        assert_eq!(s.tick_at(now), ScaleDecision::ScaleUp { from: 4, to: 6 });
        assert_eq!(
            s.tick_at(now + Duration::from_secs(300)),
            ScaleDecision::Restart { resource_id: 8 }
        );
        assert_eq!(s.status().pending_restarts, 0);
        assert_eq!(s.history().len(), 3);
    }

    #[test]
    fn status_reports_queue_state() {
        let s = scaler(ScalerConfig::default());
        s.update_queue_length(3, ScrapeMode::Super);
        s.add_queue_wait_time(Duration::from_millis(100), ScrapeMode::Super);
        let status = s.status();
        assert_eq!(status.queue_lengths, [0, 0, 3]);
        assert_eq!(status.p90_wait_ms[2], Some(100));
        assert_eq!(status.p90_wait_ms[0], None);
    }

    #[tokio::test]
    async fn run_loop_reports_decisions_until_cancelled() {
        let s = Arc::new(scaler(
            ScalerConfig::default().with_tick_interval(Duration::from_millis(10)),
        ));
        s.update_queue_length(9, ScrapeMode::Simple);
        let cancel = CancellationToken::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let handle = {
            let s = Arc::clone(&s);
            let cancel = cancel.clone();
            let seen = Arc::clone(&seen);
            tokio::spawn(async move {
                s.run(cancel, move |d| seen.lock().unwrap().push(d)).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.as_slice(), &[ScaleDecision::ScaleUp { from: 4, to: 6 }]);
    }

    #[derive(Debug, Clone)]
    enum Step {
        Length(usize, usize),
        Wait(usize, u64),
        Advance(u64),
        Tick,
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            (0usize..3, 0usize..15).prop_map(|(m, l)| Step::Length(m, l)),
            (0usize..3, 0u64..5_000).prop_map(|(m, w)| Step::Wait(m, w)),
            (0u64..30_000).prop_map(Step::Advance),
            Just(Step::Tick),
        ]
    }

    proptest! {
        #[test]
        fn count_bounded_and_actions_spaced(steps in prop::collection::vec(step(), 1..150)) {
            let config = ScalerConfig::default().with_bounds(2, 8);
            let cooldown = config.cooldown;
            let s = scaler(config);
            let mut now = Instant::now();
            let mut last_action: Option<Instant> = None;

            for st in steps {
                match st {
                    Step::Length(m, l) => s.update_queue_length(l, ScrapeMode::ALL[m]),
                    Step::Wait(m, w) => {
                        s.add_queue_wait_time_at(Duration::from_millis(w), ScrapeMode::ALL[m], now)
                    }
                    Step::Advance(ms) => now += Duration::from_millis(ms),
                    Step::Tick => match s.tick_at(now) {
                        ScaleDecision::ScaleUp { .. } | ScaleDecision::ScaleDown { .. } => {
                            if let Some(prev) = last_action {
                                prop_assert!(now.duration_since(prev) >= cooldown);
                            }
                            last_action = Some(now);
                        }
                        _ => {}
                    },
                }
                let count = s.worker_count();
                prop_assert!((2..=8).contains(&count));
            }
        }
    }
}
