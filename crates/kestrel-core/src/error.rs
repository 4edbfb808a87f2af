use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application-wide error types for Kestrel.
#[derive(Error, Debug)]
pub enum AppError {
    /// The request itself is malformed (bad URL, unsupported scheme).
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Page fetch exceeded the mode's timeout.
    #[error("Fetch timed out after {0} ms")]
    FetchTimeout(u64),

    /// Page fetch failed (navigation, network, HTTP status).
    #[error("Fetch error: {0}")]
    FetchError(String),

    /// The target signalled rate limiting (HTTP 429 or equivalent).
    #[error("Upstream rate limited: {0}")]
    UpstreamRateLimited(String),

    /// Structured extraction from the fetched content failed.
    #[error("Extraction error: {0}")]
    ExtractionError(String),

    /// No pooled resource became available within the acquire timeout.
    #[error("Resource pool exhausted: {0}")]
    ResourceExhausted(String),

    /// No rate-limit permit became available within the timeout.
    #[error("Rate limiter timed out after {0} ms")]
    RateLimitTimeout(u64),

    /// Distributed cache backend failure.
    #[error("Cache error: {0}")]
    CacheError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Database operation failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Invalid configuration value.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Returns true if the upstream told us to slow down.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, AppError::UpstreamRateLimited(_))
    }

    /// Returns true if this error is transient and worth retrying by a caller.
    ///
    /// The engine itself never retries fetches.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::FetchTimeout(_)
            | AppError::UpstreamRateLimited(_)
            | AppError::ResourceExhausted(_)
            | AppError::RateLimitTimeout(_) => true,
            AppError::FetchError(msg) => {
                msg.contains("timeout") || msg.contains("connect") || msg.contains("reset")
            }
            _ => false,
        }
    }

    /// Classifies the error for the failure slot of a per-URL result.
    pub fn kind(&self) -> FailureKind {
        match self {
            AppError::ValidationError(_) => FailureKind::Validation,
            AppError::FetchTimeout(_) => FailureKind::Timeout,
            AppError::FetchError(_) => FailureKind::Fetch,
            AppError::UpstreamRateLimited(_) => FailureKind::RateLimited,
            AppError::ExtractionError(_) => FailureKind::Extraction,
            AppError::ResourceExhausted(_) | AppError::RateLimitTimeout(_) => {
                FailureKind::Capacity
            }
            _ => FailureKind::Internal,
        }
    }
}

/// Coarse failure category recorded alongside a failed URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Validation,
    Timeout,
    Fetch,
    RateLimited,
    Extraction,
    Capacity,
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Validation => "validation",
            FailureKind::Timeout => "timeout",
            FailureKind::Fetch => "fetch",
            FailureKind::RateLimited => "rate_limited",
            FailureKind::Extraction => "extraction",
            FailureKind::Capacity => "capacity",
            FailureKind::Internal => "internal",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
