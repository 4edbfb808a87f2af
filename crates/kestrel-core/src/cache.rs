//! Two-tier result cache.
//!
//! The distributed tier (any [`CacheBackend`]) is authoritative and
//! long-lived. The local tier is an in-process moka cache used as a
//! short-lived accelerator: an entry promoted from the distributed tier
//! never lives locally past the distributed entry's remaining TTL.
//! Distributed-tier failures degrade to a miss and never fail a request.

use std::sync::Arc;
use std::time::{Duration, Instant};

use moka::Expiry;
use moka::future::Cache;

use crate::error::AppError;
use crate::metrics::{CacheTier, MetricsRegistry};
use crate::models::{CacheKey, ScrapeResult};
use crate::traits::{CacheBackend, CachedValue};

/// Configuration for the two-tier cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub local_ttl: Duration,
    pub distributed_ttl: Duration,
    pub local_capacity: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            local_ttl: Duration::from_secs(300),
            distributed_ttl: Duration::from_secs(600),
            local_capacity: 1000,
        }
    }
}

impl CacheConfig {
    pub fn with_local_ttl(mut self, ttl: Duration) -> Self {
        self.local_ttl = ttl;
        self
    }

    pub fn with_distributed_ttl(mut self, ttl: Duration) -> Self {
        self.distributed_ttl = ttl;
        self
    }

    pub fn with_local_capacity(mut self, capacity: u64) -> Self {
        self.local_capacity = capacity;
        self
    }
}

/// Per-entry time-to-live carried alongside a cached value.
trait Timed {
    fn ttl(&self) -> Duration;
}

struct PerEntryTtl;

impl<V: Timed> Expiry<String, V> for PerEntryTtl {
    fn expire_after_create(&self, _key: &String, value: &V, _created_at: Instant) -> Option<Duration> {
        Some(value.ttl())
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &V,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl())
    }
}

#[derive(Debug, Clone)]
struct LocalEntry {
    result: ScrapeResult,
    ttl: Duration,
}

impl Timed for LocalEntry {
    fn ttl(&self) -> Duration {
        self.ttl
    }
}

pub struct TwoTierCache<B> {
    local: Cache<String, LocalEntry>,
    backend: B,
    config: CacheConfig,
    metrics: Arc<MetricsRegistry>,
}

impl<B: CacheBackend> TwoTierCache<B> {
    pub fn new(backend: B, config: CacheConfig, metrics: Arc<MetricsRegistry>) -> Self {
        let config = CacheConfig {
            local_ttl: config.local_ttl.min(config.distributed_ttl),
            ..config
        };
        let local = Cache::builder()
            .max_capacity(config.local_capacity)
            .expire_after(PerEntryTtl)
            .build();
        Self {
            local,
            backend,
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Look up a result: local tier first, then the distributed tier.
    ///
    /// A distributed hit is promoted into the local tier.
    pub async fn get(&self, key: &CacheKey) -> Option<ScrapeResult> {
        let storage_key = key.storage_key();

        if let Some(entry) = self.local.get(&storage_key).await {
            self.metrics.record_cache_hit(key.mode, CacheTier::Local);
            return Some(entry.result);
        }

        let found = match self.backend.get(&storage_key).await {
            Ok(Some(cached)) => self.decode(&storage_key, cached),
            Ok(None) => None,
            Err(e) => {
                self.metrics.record_cache_error();
                tracing::warn!(key = %storage_key, error = %e, "Distributed cache read failed");
                None
            }
        };

        match found {
            Some((result, ttl_remaining)) => {
                let ttl = self.config.local_ttl.min(ttl_remaining);
                if !ttl.is_zero() {
                    self.local
                        .insert(
                            storage_key,
                            LocalEntry {
                                result: result.clone(),
                                ttl,
                            },
                        )
                        .await;
                }
                self.metrics
                    .record_cache_hit(key.mode, CacheTier::Distributed);
                Some(result)
            }
            None => {
                self.metrics.record_cache_miss(key.mode);
                None
            }
        }
    }

    /// Write a successful result through to both tiers.
    ///
    /// Failures are never cached. A distributed write failure is logged and
    /// swallowed; the local copy still serves this process.
    pub async fn set(&self, key: &CacheKey, result: &ScrapeResult) {
        if !result.is_success() {
            return;
        }
        let storage_key = key.storage_key();

        self.local
            .insert(
                storage_key.clone(),
                LocalEntry {
                    result: result.clone(),
                    ttl: self.config.local_ttl,
                },
            )
            .await;

        let outcome = match serde_json::to_string(result) {
            Ok(json) => {
                self.backend
                    .set(&storage_key, json, self.config.distributed_ttl)
                    .await
            }
            Err(e) => Err(AppError::from(e)),
        };
        if let Err(e) = outcome {
            self.metrics.record_cache_error();
            tracing::warn!(key = %storage_key, error = %e, "Distributed cache write failed");
        }
    }

    /// Drop the local copy of a key.
    pub async fn invalidate_local(&self, key: &CacheKey) {
        self.local.invalidate(&key.storage_key()).await;
    }

    pub fn local_entry_count(&self) -> u64 {
        self.local.entry_count()
    }

    fn decode(&self, storage_key: &str, cached: CachedValue) -> Option<(ScrapeResult, Duration)> {
        match serde_json::from_str::<ScrapeResult>(&cached.value) {
            Ok(result) => Some((result, cached.ttl_remaining)),
            Err(e) => {
                self.metrics.record_cache_error();
                tracing::warn!(key = %storage_key, error = %e, "Discarding undecodable cache entry");
                None
            }
        }
    }
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    ttl: Duration,
    stored_at: Instant,
}

impl Timed for StoredValue {
    fn ttl(&self) -> Duration {
        self.ttl
    }
}

/// In-process [`CacheBackend`] with per-entry expiry.
///
/// Stands in for the distributed tier when no shared store is configured.
#[derive(Clone)]
pub struct MemoryCacheBackend {
    entries: Cache<String, StoredValue>,
}

impl MemoryCacheBackend {
    pub fn new(capacity: u64) -> Self {
        Self {
            entries: Cache::builder()
                .max_capacity(capacity)
                .expire_after(PerEntryTtl)
                .build(),
        }
    }
}

impl Default for MemoryCacheBackend {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl CacheBackend for MemoryCacheBackend {
    async fn get(&self, key: &str) -> Result<Option<CachedValue>, AppError> {
        Ok(self.entries.get(key).await.and_then(|stored| {
            let remaining = stored.ttl.saturating_sub(stored.stored_at.elapsed());
            (!remaining.is_zero()).then_some(CachedValue {
                value: stored.value,
                ttl_remaining: remaining,
            })
        }))
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), AppError> {
        self.entries
            .insert(
                key.to_string(),
                StoredValue {
                    value,
                    ttl,
                    stored_at: Instant::now(),
                },
            )
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ScrapeMode;
    use crate::testutil::FailingCacheBackend;

    fn sample(url: &str) -> ScrapeResult {
        ScrapeResult::success(url, ScrapeMode::Simple, serde_json::json!({"title": "t"}))
    }

    fn cache<B: CacheBackend>(backend: B, config: CacheConfig) -> TwoTierCache<B> {
        TwoTierCache::new(backend, config, Arc::new(MetricsRegistry::new()))
    }

    #[tokio::test]
    async fn miss_then_hit_from_local() {
        let c = cache(MemoryCacheBackend::default(), CacheConfig::default());
        let key = CacheKey::new("https://a.test", ScrapeMode::Simple);

        assert!(c.get(&key).await.is_none());
        c.set(&key, &sample("https://a.test")).await;

        let hit = c.get(&key).await.unwrap();
        assert_eq!(hit.url, "https://a.test");

        let snap = c.metrics.snapshot();
        assert_eq!(snap.mode(ScrapeMode::Simple).misses, 1);
        assert_eq!(snap.mode(ScrapeMode::Simple).local_hits, 1);
    }

    #[tokio::test]
    async fn distributed_hit_is_promoted() {
        let backend = MemoryCacheBackend::default();
        let writer = cache(backend.clone(), CacheConfig::default());
        let reader = cache(backend, CacheConfig::default());
        let key = CacheKey::new("https://b.test", ScrapeMode::Full);

        writer.set(&key, &sample("https://b.test")).await;

        assert!(reader.get(&key).await.is_some());
        assert!(reader.get(&key).await.is_some());
        let snap = reader.metrics.snapshot();
        assert_eq!(snap.mode(ScrapeMode::Full).distributed_hits, 1);
        assert_eq!(snap.mode(ScrapeMode::Full).local_hits, 1);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let c = cache(MemoryCacheBackend::default(), CacheConfig::default());
        let key = CacheKey::new("https://c.test", ScrapeMode::Simple);
        let failed = ScrapeResult::failure(
            "https://c.test",
            ScrapeMode::Simple,
            &AppError::FetchTimeout(12_000),
        );
        c.set(&key, &failed).await;
        assert!(c.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let config = CacheConfig::default()
            .with_local_ttl(Duration::from_millis(50))
            .with_distributed_ttl(Duration::from_millis(80));
        let c = cache(MemoryCacheBackend::default(), config);
        let key = CacheKey::new("https://d.test", ScrapeMode::Simple);

        c.set(&key, &sample("https://d.test")).await;
        assert!(c.get(&key).await.is_some());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(c.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn local_ttl_is_bounded_by_distributed() {
        let config = CacheConfig::default()
            .with_local_ttl(Duration::from_secs(600))
            .with_distributed_ttl(Duration::from_secs(60));
        let c = cache(MemoryCacheBackend::default(), config);
        assert_eq!(c.config().local_ttl, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn promoted_entry_does_not_outlive_distributed() {
        let backend = MemoryCacheBackend::default();
        let key = CacheKey::new("https://e.test", ScrapeMode::Super);
        let json = serde_json::to_string(&sample("https://e.test")).unwrap();
        backend
            .set(&key.storage_key(), json, Duration::from_millis(60))
            .await
            .unwrap();

        let c = cache(backend, CacheConfig::default());
        assert!(c.get(&key).await.is_some());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(c.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn backend_errors_degrade_to_miss() {
        let c = cache(FailingCacheBackend, CacheConfig::default());
        let key = CacheKey::new("https://f.test", ScrapeMode::Simple);

        assert!(c.get(&key).await.is_none());
        c.set(&key, &sample("https://f.test")).await;
        // local tier still serves the write
        assert!(c.get(&key).await.is_some());
        assert_eq!(c.metrics.snapshot().cache_errors, 2);
    }

    #[tokio::test]
    async fn undecodable_entry_is_a_miss() {
        let backend = MemoryCacheBackend::default();
        let key = CacheKey::new("https://g.test", ScrapeMode::Simple);
        backend
            .set(&key.storage_key(), "{not json".into(), Duration::from_secs(60))
            .await
            .unwrap();
        let c = cache(backend, CacheConfig::default());
        assert!(c.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn modes_are_cached_separately() {
        let c = cache(MemoryCacheBackend::default(), CacheConfig::default());
        let simple = CacheKey::new("https://h.test", ScrapeMode::Simple);
        let full = CacheKey::new("https://h.test", ScrapeMode::Full);
        c.set(&simple, &sample("https://h.test")).await;
        assert!(c.get(&simple).await.is_some());
        assert!(c.get(&full).await.is_none());
    }
}
