use std::str::FromStr;
use std::time::Duration;

use crate::anomaly::AnomalyConfig;
use crate::batch::BatchConfig;
use crate::cache::CacheConfig;
use crate::error::AppError;
use crate::models::ScrapeMode;
use crate::pool::PoolConfig;
use crate::rate_limiter::RateLimiterConfig;
use crate::scaler::ScalerConfig;
use crate::throttle::ThrottleConfig;

/// Per-mode tuning resolved once at request entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeProfile {
    pub fetch_timeout: Duration,
    /// Maximum in-flight URLs when streaming this mode.
    pub sub_batch_size: usize,
    /// Mean navigation time above which the throttler escalates.
    pub latency_threshold: Duration,
}

/// Table of [`ModeProfile`]s, one per [`ScrapeMode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeProfiles {
    profiles: [ModeProfile; 3],
}

impl Default for ModeProfiles {
    fn default() -> Self {
        Self {
            profiles: [
                ModeProfile {
                    fetch_timeout: Duration::from_secs(12),
                    sub_batch_size: 25,
                    latency_threshold: Duration::from_secs(2),
                },
                ModeProfile {
                    fetch_timeout: Duration::from_secs(20),
                    sub_batch_size: 20,
                    latency_threshold: Duration::from_secs(3),
                },
                ModeProfile {
                    fetch_timeout: Duration::from_secs(30),
                    sub_batch_size: 15,
                    latency_threshold: Duration::from_secs(4),
                },
            ],
        }
    }
}

impl ModeProfiles {
    pub fn get(&self, mode: ScrapeMode) -> ModeProfile {
        self.profiles[mode.index()]
    }

    pub fn with_profile(mut self, mode: ScrapeMode, profile: ModeProfile) -> Self {
        self.profiles[mode.index()] = profile;
        self
    }

    /// Override the fetch timeout of every mode.
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        for profile in &mut self.profiles {
            profile.fetch_timeout = timeout;
        }
        self
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub pool: PoolConfig,
    pub rate_limiter: RateLimiterConfig,
    pub cache: CacheConfig,
    pub throttle: ThrottleConfig,
    pub anomaly: AnomalyConfig,
    pub scaler: ScalerConfig,
    pub batch: BatchConfig,
    pub modes: ModeProfiles,
}

impl EngineConfig {
    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_rate_limiter(mut self, rate_limiter: RateLimiterConfig) -> Self {
        self.rate_limiter = rate_limiter;
        self
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_throttle(mut self, throttle: ThrottleConfig) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn with_anomaly(mut self, anomaly: AnomalyConfig) -> Self {
        self.anomaly = anomaly;
        self
    }

    pub fn with_scaler(mut self, scaler: ScalerConfig) -> Self {
        self.scaler = scaler;
        self
    }

    pub fn with_batch(mut self, batch: BatchConfig) -> Self {
        self.batch = batch;
        self
    }

    pub fn with_modes(mut self, modes: ModeProfiles) -> Self {
        self.modes = modes;
        self
    }

    /// Read overrides from `KESTREL_*` environment variables on top of the
    /// defaults. Unset variables keep their default.
    ///
    /// - `KESTREL_POOL_SIZE`, `KESTREL_POOL_MAX_SIZE`, `KESTREL_POOL_REUSE_CAP`,
    ///   `KESTREL_POOL_ACQUIRE_TIMEOUT_SECS`, `KESTREL_ENABLE_IMAGES`
    /// - `KESTREL_RATE_LIMIT`, `KESTREL_RATE_LIMIT_TIMEOUT_SECS`
    /// - `KESTREL_CACHE_TTL_SECS`, `KESTREL_LOCAL_CACHE_TTL_SECS`,
    ///   `KESTREL_LOCAL_CACHE_CAPACITY`
    /// - `KESTREL_THROTTLE_BASE_MS`, `KESTREL_THROTTLE_MAX_MS`
    /// - `KESTREL_MIN_WORKERS`, `KESTREL_MAX_WORKERS`, `KESTREL_SCALER_COOLDOWN_SECS`
    /// - `KESTREL_MIN_CHUNK_SIZE`, `KESTREL_MAX_CHUNK_SIZE`
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<L>(lookup: L) -> Result<Self, AppError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup };
        let mut config = Self::default();

        if let Some(v) = env.parse::<usize>("KESTREL_POOL_SIZE")? {
            config.pool.initial_size = v;
        }
        if let Some(v) = env.positive::<usize>("KESTREL_POOL_MAX_SIZE")? {
            config.pool.max_size = v;
        }
        if let Some(v) = env.positive::<u32>("KESTREL_POOL_REUSE_CAP")? {
            config.pool.reuse_cap = v;
        }
        if let Some(v) = env.positive::<u64>("KESTREL_POOL_ACQUIRE_TIMEOUT_SECS")? {
            config.pool.acquire_timeout = Duration::from_secs(v);
        }
        if let Some(v) = env.parse::<bool>("KESTREL_ENABLE_IMAGES")? {
            config.pool.enable_images = v;
        }

        if let Some(v) = env.positive::<usize>("KESTREL_RATE_LIMIT")? {
            config.rate_limiter.capacity = v;
        }
        if let Some(v) = env.positive::<u64>("KESTREL_RATE_LIMIT_TIMEOUT_SECS")? {
            config.rate_limiter.acquire_timeout = Duration::from_secs(v);
        }

        if let Some(v) = env.positive::<u64>("KESTREL_CACHE_TTL_SECS")? {
            config.cache.distributed_ttl = Duration::from_secs(v);
        }
        if let Some(v) = env.positive::<u64>("KESTREL_LOCAL_CACHE_TTL_SECS")? {
            config.cache.local_ttl = Duration::from_secs(v);
        }
        if let Some(v) = env.positive::<u64>("KESTREL_LOCAL_CACHE_CAPACITY")? {
            config.cache.local_capacity = v;
        }

        if let Some(v) = env.parse::<u64>("KESTREL_THROTTLE_BASE_MS")? {
            config.throttle.base_delay = Duration::from_millis(v);
        }
        if let Some(v) = env.positive::<u64>("KESTREL_THROTTLE_MAX_MS")? {
            config.throttle.max_delay = Duration::from_millis(v);
        }

        if let Some(v) = env.positive::<usize>("KESTREL_MIN_WORKERS")? {
            config.scaler.min_workers = v;
        }
        if let Some(v) = env.positive::<usize>("KESTREL_MAX_WORKERS")? {
            config.scaler.max_workers = v;
        }
        if let Some(v) = env.parse::<u64>("KESTREL_SCALER_COOLDOWN_SECS")? {
            config.scaler.cooldown = Duration::from_secs(v);
        }

        if let Some(v) = env.positive::<usize>("KESTREL_MIN_CHUNK_SIZE")? {
            config.batch.min_chunk_size = v;
        }
        if let Some(v) = env.positive::<usize>("KESTREL_MAX_CHUNK_SIZE")? {
            config.batch.max_chunk_size = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations that would break component invariants.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.pool.initial_size > self.pool.max_size {
            return Err(AppError::ConfigError(format!(
                "pool initial size {} exceeds max size {}",
                self.pool.initial_size, self.pool.max_size
            )));
        }
        if self.throttle.base_delay > self.throttle.max_delay {
            return Err(AppError::ConfigError(
                "throttle base delay exceeds max delay".into(),
            ));
        }
        if self.scaler.min_workers > self.scaler.max_workers {
            return Err(AppError::ConfigError(format!(
                "scaler min workers {} exceeds max workers {}",
                self.scaler.min_workers, self.scaler.max_workers
            )));
        }
        if self.batch.min_chunk_size > self.batch.max_chunk_size {
            return Err(AppError::ConfigError(format!(
                "min chunk size {} exceeds max chunk size {}",
                self.batch.min_chunk_size, self.batch.max_chunk_size
            )));
        }
        Ok(())
    }
}

struct EnvReader<L> {
    lookup: L,
}

impl<L: Fn(&str) -> Option<String>> EnvReader<L> {
    fn parse<T: FromStr>(&self, name: &str) -> Result<Option<T>, AppError> {
        match (self.lookup)(name) {
            None => Ok(None),
            Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
                AppError::ConfigError(format!("Invalid {name} '{raw}'"))
            }),
        }
    }

    fn positive<T: FromStr + Default + PartialEq>(&self, name: &str) -> Result<Option<T>, AppError> {
        match self.parse::<T>(name)? {
            Some(v) if v == T::default() => Err(AppError::ConfigError(format!(
                "{name} must be greater than zero"
            ))),
            other => Ok(other),
        }
    }
}
