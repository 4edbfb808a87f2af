//! Bounded pool of reusable, expensive sessions (browser pages, HTTP clients).
//!
//! # Lifecycle
//!
//! ```text
//! create --> Idle --[acquire]--> Leased --[release: reset ok, reuse < cap]--> Idle
//!                                  |
//!                                  +--[reuse cap | reset failed | restart]--> Retiring --> closed
//!                                                                              (replacement created)
//! ```
//!
//! A semaphore sized by `max_size` bounds the number of leased sessions. New
//! sessions are only created when no idle one exists, so idle + leased never
//! exceeds `max_size` either.
//!
//! Sessions whose lease is dropped without release travel back over a
//! channel and are closed the next time the pool is used. Ids of every
//! retired session are kept until [`ResourcePool::take_retired`] drains them.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::AppError;
use crate::filter::ResourceFilter;
use crate::metrics::MetricsRegistry;
use crate::traits::SessionFactory;

/// Configuration for the resource pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Sessions created up front by [`ResourcePool::initialize`].
    pub initial_size: usize,
    /// Soft cap on live sessions (idle + leased).
    pub max_size: usize,
    /// Leases a session serves before it is retired and replaced.
    pub reuse_cap: u32,
    /// How long `acquire` waits for a free slot.
    pub acquire_timeout: Duration,
    /// Let pages load images. Media, fonts and trackers are blocked regardless.
    pub enable_images: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            initial_size: 4,
            max_size: 10,
            reuse_cap: 250,
            acquire_timeout: Duration::from_secs(30),
            enable_images: false,
        }
    }
}

impl PoolConfig {
    pub fn with_initial_size(mut self, size: usize) -> Self {
        self.initial_size = size;
        self
    }

    pub fn with_max_size(mut self, size: usize) -> Self {
        self.max_size = size.max(1);
        self
    }

    pub fn with_reuse_cap(mut self, cap: u32) -> Self {
        self.reuse_cap = cap.max(1);
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_images(mut self, enable: bool) -> Self {
        self.enable_images = enable;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceState {
    Idle,
    Leased,
    Retiring,
}

/// A pooled session plus its bookkeeping.
#[derive(Debug)]
pub struct PoolResource<S> {
    id: u64,
    reuse_count: u32,
    state: ResourceState,
    session: S,
}

impl<S> PoolResource<S> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Number of completed leases.
    pub fn reuse_count(&self) -> u32 {
        self.reuse_count
    }

    pub fn state(&self) -> ResourceState {
        self.state
    }
}

#[derive(Debug, Default)]
struct PoolCounters {
    leased: AtomicUsize,
    created: AtomicU64,
    retired: AtomicU64,
}

/// Exclusive use of one pooled session.
///
/// Hand it back with [`ResourcePool::release`]. A lease dropped without
/// release (e.g. the owning task was cancelled) frees the slot at once and
/// sends its session back to the pool to be closed.
#[derive(Debug)]
pub struct PoolLease<S> {
    resource: Option<PoolResource<S>>,
    counters: Arc<PoolCounters>,
    discard: UnboundedSender<PoolResource<S>>,
    _permit: OwnedSemaphorePermit,
}

impl<S> PoolLease<S> {
    pub fn id(&self) -> u64 {
        self.resource.as_ref().map(|r| r.id).unwrap_or_default()
    }

    pub fn reuse_count(&self) -> u32 {
        self.resource
            .as_ref()
            .map(|r| r.reuse_count)
            .unwrap_or_default()
    }

    /// Mutable access to the leased session.
    ///
    /// Returns `None` only after the lease has been handed back.
    pub fn session_mut(&mut self) -> Option<&mut S> {
        self.resource.as_mut().map(|r| &mut r.session)
    }
}

impl<S> Drop for PoolLease<S> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            self.counters.leased.fetch_sub(1, Ordering::Relaxed);
            tracing::warn!(
                resource_id = resource.id,
                "Lease dropped without release, discarding session"
            );
            // Fails only once the pool itself is gone.
            let _ = self.discard.send(resource);
        }
    }
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub idle: usize,
    pub leased: usize,
    pub available_slots: usize,
    pub max_size: usize,
    pub created: u64,
    pub retired: u64,
}

/// Thread-safe pool of sessions produced by a [`SessionFactory`].
pub struct ResourcePool<F: SessionFactory> {
    factory: F,
    config: PoolConfig,
    filter: ResourceFilter,
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<PoolResource<F::Session>>>,
    retire_requests: Mutex<HashSet<u64>>,
    retired_ids: Mutex<Vec<u64>>,
    discard_tx: UnboundedSender<PoolResource<F::Session>>,
    discarded: Mutex<UnboundedReceiver<PoolResource<F::Session>>>,
    next_id: AtomicU64,
    counters: Arc<PoolCounters>,
    metrics: Arc<MetricsRegistry>,
}

impl<F: SessionFactory> ResourcePool<F> {
    pub fn new(factory: F, config: PoolConfig, metrics: Arc<MetricsRegistry>) -> Self {
        let max_size = config.max_size.max(1);
        let (discard_tx, discarded) = mpsc::unbounded_channel();
        Self {
            factory,
            filter: ResourceFilter::new(config.enable_images),
            config,
            permits: Arc::new(Semaphore::new(max_size)),
            idle: Mutex::new(VecDeque::new()),
            retire_requests: Mutex::new(HashSet::new()),
            retired_ids: Mutex::new(Vec::new()),
            discard_tx,
            discarded: Mutex::new(discarded),
            next_id: AtomicU64::new(1),
            counters: Arc::new(PoolCounters::default()),
            metrics,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    fn lock_idle(&self) -> MutexGuard<'_, VecDeque<PoolResource<F::Session>>> {
        lock(&self.idle)
    }

    fn lock_retire_requests(&self) -> MutexGuard<'_, HashSet<u64>> {
        lock(&self.retire_requests)
    }

    /// Pre-warm the idle queue with up to `size` sessions.
    ///
    /// Returns the number of sessions created.
    pub async fn initialize(&self, size: usize) -> Result<usize, AppError> {
        let live = self.lock_idle().len() + self.counters.leased.load(Ordering::Relaxed);
        let target = size.min(self.config.max_size.saturating_sub(live));

        for _ in 0..target {
            let mut resource = self.create_resource().await?;
            resource.state = ResourceState::Idle;
            self.lock_idle().push_back(resource);
        }

        tracing::info!(
            created = target,
            max_size = self.config.max_size,
            "Resource pool initialized"
        );
        Ok(target)
    }

    /// Lease a session, creating one if none is idle.
    ///
    /// Waits up to `acquire_timeout` for a free slot, then fails with
    /// [`AppError::ResourceExhausted`]. A failed creation is retried once.
    pub async fn acquire(&self) -> Result<PoolLease<F::Session>, AppError> {
        self.reap_discarded().await;
        let timeout = self.config.acquire_timeout;
        let permit = tokio::time::timeout(timeout, self.permits.clone().acquire_owned())
            .await
            .map_err(|_| {
                AppError::ResourceExhausted(format!(
                    "no session available within {}ms",
                    timeout.as_millis()
                ))
            })?
            .map_err(|_| AppError::ResourceExhausted("resource pool is shut down".into()))?;

        let mut resource = match self.pop_idle().await {
            Some(resource) => resource,
            None => self.create_resource().await?,
        };
        resource.state = ResourceState::Leased;
        self.counters.leased.fetch_add(1, Ordering::Relaxed);

        tracing::trace!(
            resource_id = resource.id,
            reuse_count = resource.reuse_count,
            "Session leased"
        );

        Ok(PoolLease {
            resource: Some(resource),
            counters: Arc::clone(&self.counters),
            discard: self.discard_tx.clone(),
            _permit: permit,
        })
    }

    /// Return a leased session.
    ///
    /// The session is reset and goes back to the idle queue, unless it has
    /// hit the reuse cap, its reset failed, or a restart was requested; then
    /// it is closed and a replacement is created.
    pub async fn release(&self, mut lease: PoolLease<F::Session>) {
        let Some(mut resource) = lease.resource.take() else {
            return;
        };
        self.counters.leased.fetch_sub(1, Ordering::Relaxed);
        resource.reuse_count += 1;

        let retire_reason = if self.take_retire_request(resource.id) {
            Some("restart requested")
        } else if resource.reuse_count >= self.config.reuse_cap {
            Some("reuse cap reached")
        } else if let Err(e) = self.factory.reset(&mut resource.session).await {
            tracing::warn!(resource_id = resource.id, error = %e, "Session reset failed");
            Some("reset failed")
        } else {
            None
        };

        match retire_reason {
            None => {
                resource.state = ResourceState::Idle;
                self.lock_idle().push_back(resource);
            }
            Some(reason) => {
                self.retire(resource, reason).await;
                self.replenish().await;
            }
        }

        // The permit is freed only after the session is back in the queue.
        drop(lease);
        self.reap_discarded().await;
    }

    /// Flag a session to be retired on its next release (or the next time
    /// it is popped from the idle queue).
    pub fn mark_for_retirement(&self, resource_id: u64) {
        self.lock_retire_requests().insert(resource_id);
        tracing::info!(resource_id, "Session marked for retirement");
    }

    /// Sample the memory held by a leased session.
    pub async fn memory_usage_mb(&self, lease: &mut PoolLease<F::Session>) -> Option<f64> {
        let session = lease.session_mut()?;
        self.factory.memory_usage_mb(session).await
    }

    /// Ids of sessions retired since the last call.
    pub fn take_retired(&self) -> Vec<u64> {
        std::mem::take(&mut *lock(&self.retired_ids))
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            idle: self.lock_idle().len(),
            leased: self.counters.leased.load(Ordering::Relaxed),
            available_slots: self.permits.available_permits(),
            max_size: self.config.max_size,
            created: self.counters.created.load(Ordering::Relaxed),
            retired: self.counters.retired.load(Ordering::Relaxed),
        }
    }

    /// Stop handing out leases and close every idle session.
    ///
    /// Sessions still leased are discarded when their leases are dropped.
    pub async fn shutdown(&self) {
        self.permits.close();
        self.reap_discarded().await;
        let drained: Vec<_> = self.lock_idle().drain(..).collect();
        let count = drained.len();
        for resource in drained {
            self.factory.close(resource.session).await;
        }
        tracing::info!(closed = count, "Resource pool shut down");
    }

    /// Close sessions whose leases were dropped without release.
    async fn reap_discarded(&self) {
        let discarded: Vec<_> = {
            let mut rx = lock(&self.discarded);
            std::iter::from_fn(|| rx.try_recv().ok()).collect()
        };
        for resource in discarded {
            self.retire(resource, "lease dropped").await;
        }
    }

    fn take_retire_request(&self, resource_id: u64) -> bool {
        self.lock_retire_requests().remove(&resource_id)
    }

    async fn pop_idle(&self) -> Option<PoolResource<F::Session>> {
        loop {
            let resource = self.lock_idle().pop_back()?;
            if self.take_retire_request(resource.id) {
                self.retire(resource, "restart requested").await;
                continue;
            }
            return Some(resource);
        }
    }

    async fn retire(&self, mut resource: PoolResource<F::Session>, reason: &str) {
        resource.state = ResourceState::Retiring;
        tracing::debug!(
            resource_id = resource.id,
            reuse_count = resource.reuse_count,
            %reason,
            "Retiring session"
        );
        let id = resource.id;
        self.factory.close(resource.session).await;
        self.counters.retired.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_resource_retired();
        lock(&self.retired_ids).push(id);
    }

    async fn replenish(&self) {
        if self.permits.is_closed() {
            return;
        }
        match self.create_resource().await {
            Ok(mut resource) => {
                resource.state = ResourceState::Idle;
                self.lock_idle().push_back(resource);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Could not replace retired session, will create on demand");
            }
        }
    }

    /// Create and filter a new session, retrying once on failure.
    async fn create_resource(&self) -> Result<PoolResource<F::Session>, AppError> {
        let mut last_error = String::new();
        for attempt in 1..=2u32 {
            match self.try_create().await {
                Ok(resource) => return Ok(resource),
                Err(e) => {
                    self.metrics.record_resource_creation_failure();
                    tracing::warn!(attempt, error = %e, "Failed to create session");
                    last_error = e.to_string();
                }
            }
        }
        Err(AppError::ResourceExhausted(format!(
            "session creation failed: {last_error}"
        )))
    }

    async fn try_create(&self) -> Result<PoolResource<F::Session>, AppError> {
        let mut session = self.factory.create().await?;
        if let Err(e) = self.factory.install_filter(&mut session, &self.filter).await {
            self.factory.close(session).await;
            return Err(e);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_resource_created();
        tracing::debug!(resource_id = id, "Session created");

        Ok(PoolResource {
            id,
            reuse_count: 0,
            state: ResourceState::Idle,
            session,
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("Recovered from poisoned pool mutex");
        poisoned.into_inner()
    })
}
