pub mod anomaly;
pub mod batch;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod feedback;
pub mod filter;
pub mod job;
pub mod job_queue;
pub mod metrics;
pub mod models;
pub mod pool;
pub mod queue;
pub mod rate_limiter;
pub mod scaler;
pub mod throttle;
pub mod traits;
pub mod util;

#[cfg(test)]
pub(crate) mod testutil;

pub use anomaly::{AnomalyConfig, AnomalyDetector, AnomalyEvent, AnomalyKind, AnomalySummary};
pub use batch::{
    BatchConfig, BatchEvent, BatchProcessor, BatchReport, BatchReporter, ChunkReport,
    TracingBatchReporter,
};
pub use cache::{CacheConfig, MemoryCacheBackend, TwoTierCache};
pub use config::{EngineConfig, ModeProfile, ModeProfiles};
pub use engine::{DEFAULT_STREAM_BATCH_SIZE, TaskEngine};
pub use error::{AppError, FailureKind};
pub use filter::{ResourceFilter, ResourceKind};
pub use job::{ChunkJob, CreateChunkJobRequest, JobStatus};
pub use job_queue::{ChunkJobStore, MemoryJobStore};
pub use metrics::{MetricsRegistry, MetricsSnapshot};
pub use models::{CacheKey, ScrapeMode, ScrapeOutcome, ScrapeRequest, ScrapeResult, compute_hash};
pub use pool::{PoolConfig, PoolStats, ResourcePool};
pub use rate_limiter::{RateLimiter, RateLimiterConfig};
pub use scaler::{ScaleDecision, Scaler, ScalerConfig, ScalerStatus};
pub use throttle::{ThrottleConfig, Throttler};
pub use traits::{CacheBackend, CachedValue, Extractor, Fetcher, NullCacheBackend, SessionFactory};
