//! Global cap on in-flight fetches.
//!
//! A counting semaphore: callers wait in FIFO order for a permit, and the
//! permit frees its slot when released or dropped.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::AppError;

/// Configuration for the rate limiter.
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Maximum concurrent permits.
    pub capacity: usize,
    /// How long `acquire` waits before giving up.
    pub acquire_timeout: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            capacity: 6,
            acquire_timeout: Duration::from_secs(60),
        }
    }
}

impl RateLimiterConfig {
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }
}

/// A held slot. Dropping it releases the slot.
#[derive(Debug)]
pub struct RateLimitPermit {
    _permit: OwnedSemaphorePermit,
}

impl RateLimitPermit {
    /// Release the slot explicitly.
    pub fn release(self) {}
}

#[derive(Debug, Clone)]
pub struct RateLimiter {
    semaphore: Arc<Semaphore>,
    config: RateLimiterConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        let capacity = config.capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            config: RateLimiterConfig { capacity, ..config },
        }
    }

    /// Wait for a permit using the configured timeout.
    pub async fn acquire(&self) -> Result<RateLimitPermit, AppError> {
        self.acquire_timeout(self.config.acquire_timeout).await
    }

    /// Wait up to `timeout` for a permit.
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<RateLimitPermit, AppError> {
        let permit = tokio::time::timeout(timeout, self.semaphore.clone().acquire_owned())
            .await
            .map_err(|_| AppError::RateLimitTimeout(timeout.as_millis() as u64))?
            .map_err(|_| AppError::Generic("rate limiter closed".into()))?;
        Ok(RateLimitPermit { _permit: permit })
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn in_flight(&self) -> usize {
        self.capacity() - self.available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn limiter(capacity: usize) -> RateLimiter {
        RateLimiter::new(RateLimiterConfig::default().with_capacity(capacity))
    }

    #[tokio::test]
    async fn third_caller_waits_until_release() {
        let limiter = limiter(2);
        let a = limiter.acquire().await.unwrap();
        let _b = limiter.acquire().await.unwrap();
        assert_eq!(limiter.in_flight(), 2);

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                let _c = limiter.acquire().await.unwrap();
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        a.release();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should proceed after release")
            .unwrap();
    }

    #[tokio::test]
    async fn times_out_when_saturated() {
        let limiter = limiter(1);
        let _held = limiter.acquire().await.unwrap();
        let err = limiter
            .acquire_timeout(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::RateLimitTimeout(20)));
    }

    #[tokio::test]
    async fn drop_releases_slot() {
        let limiter = limiter(1);
        {
            let _permit = limiter.acquire().await.unwrap();
            assert_eq!(limiter.available(), 0);
        }
        assert_eq!(limiter.available(), 1);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            capacity: 0,
            acquire_timeout: Duration::from_secs(1),
        });
        assert_eq!(limiter.capacity(), 1);
    }

    #[tokio::test]
    async fn in_flight_never_exceeds_capacity() {
        let limiter = limiter(3);
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let limiter = limiter.clone();
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let permit = limiter.acquire().await.unwrap();
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                permit.release();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(limiter.in_flight(), 0);
    }
}
