use std::future::Future;
use std::time::Duration;

use crate::error::AppError;
use crate::filter::ResourceFilter;
use crate::models::ScrapeMode;

/// Creates and maintains the expensive sessions held by the resource pool
/// (a browser page, an HTTP client).
///
/// The pool owns session lifecycle: it calls `create` and `install_filter`
/// once, `reset` between leases, and `close` when the session is retired.
pub trait SessionFactory: Send + Sync + 'static {
    type Session: Send + 'static;

    fn create(&self) -> impl Future<Output = Result<Self::Session, AppError>> + Send;

    /// Install the sub-request filter. Called once per created session.
    fn install_filter(
        &self,
        session: &mut Self::Session,
        filter: &ResourceFilter,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Return the session to a blank state before it goes back to the pool.
    fn reset(&self, session: &mut Self::Session)
    -> impl Future<Output = Result<(), AppError>> + Send;

    fn close(&self, session: Self::Session) -> impl Future<Output = ()> + Send;

    /// Memory held by the session, in megabytes, if the backend can tell.
    fn memory_usage_mb(
        &self,
        session: &mut Self::Session,
    ) -> impl Future<Output = Option<f64>> + Send {
        let _ = session;
        async { None }
    }
}

/// Fetches raw page content using a leased session.
pub trait Fetcher<S>: Send + Sync {
    /// `timeout` is the mode's navigation budget; the engine enforces it too.
    fn fetch(
        &self,
        session: &mut S,
        url: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<String, AppError>> + Send;
}

/// Turns raw page content into the structured payload for a mode.
pub trait Extractor: Send + Sync {
    fn extract(
        &self,
        raw: &str,
        url: &str,
        mode: ScrapeMode,
    ) -> Result<serde_json::Value, AppError>;
}

/// A value read back from the distributed cache together with its
/// remaining lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedValue {
    pub value: String,
    pub ttl_remaining: Duration,
}

/// Distributed key-value store with per-entry expiry.
pub trait CacheBackend: Send + Sync {
    /// Returns `None` for missing or expired keys.
    fn get(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<Option<CachedValue>, AppError>> + Send;

    fn set(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Backend that stores nothing. Every lookup misses.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullCacheBackend;

impl CacheBackend for NullCacheBackend {
    async fn get(&self, _key: &str) -> Result<Option<CachedValue>, AppError> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: String, _ttl: Duration) -> Result<(), AppError> {
        Ok(())
    }
}
