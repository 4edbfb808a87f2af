use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::{AppError, FailureKind};

/// Extraction depth requested by the caller.
///
/// Each mode resolves to a [`ModeProfile`](crate::config::ModeProfile) that
/// fixes its fetch timeout, sub-batch size and latency threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrapeMode {
    Simple,
    Full,
    Super,
}

impl ScrapeMode {
    pub const ALL: [ScrapeMode; 3] = [ScrapeMode::Simple, ScrapeMode::Full, ScrapeMode::Super];

    pub fn as_str(&self) -> &'static str {
        match self {
            ScrapeMode::Simple => "simple",
            ScrapeMode::Full => "full",
            ScrapeMode::Super => "super",
        }
    }

    /// Stable index for per-mode arrays.
    pub fn index(&self) -> usize {
        match self {
            ScrapeMode::Simple => 0,
            ScrapeMode::Full => 1,
            ScrapeMode::Super => 2,
        }
    }
}

impl fmt::Display for ScrapeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ScrapeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "simple" => Ok(ScrapeMode::Simple),
            "full" => Ok(ScrapeMode::Full),
            "super" => Ok(ScrapeMode::Super),
            _ => Err(format!("Unknown scrape mode: {}", s)),
        }
    }
}

/// A single scrape request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeRequest {
    pub url: String,
    pub mode: ScrapeMode,
}

impl ScrapeRequest {
    pub fn new(url: impl Into<String>, mode: ScrapeMode) -> Self {
        Self {
            url: url.into(),
            mode,
        }
    }

    /// Rejects URLs that cannot be fetched: unparsable, non-http(s), or hostless.
    pub fn validate(&self) -> Result<(), AppError> {
        let parsed = Url::parse(&self.url)
            .map_err(|e| AppError::ValidationError(format!("Invalid URL '{}': {e}", self.url)))?;

        match parsed.scheme() {
            "http" | "https" => {}
            other => {
                return Err(AppError::ValidationError(format!(
                    "Unsupported URL scheme '{other}'"
                )));
            }
        }

        if parsed.host_str().is_none_or(str::is_empty) {
            return Err(AppError::ValidationError(format!(
                "URL '{}' has no host",
                self.url
            )));
        }

        Ok(())
    }
}

/// Why a URL produced no payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl From<&AppError> for ScrapeFailure {
    fn from(err: &AppError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Payload or failure of one URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ScrapeOutcome {
    Success { payload: serde_json::Value },
    Failure(ScrapeFailure),
}

/// Result of scraping one URL in one mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeResult {
    pub url: String,
    pub mode: ScrapeMode,
    #[serde(flatten)]
    pub outcome: ScrapeOutcome,
    pub fetched_at: DateTime<Utc>,
    #[serde(default)]
    pub from_cache: bool,
}

impl ScrapeResult {
    pub fn success(url: impl Into<String>, mode: ScrapeMode, payload: serde_json::Value) -> Self {
        Self {
            url: url.into(),
            mode,
            outcome: ScrapeOutcome::Success { payload },
            fetched_at: Utc::now(),
            from_cache: false,
        }
    }

    pub fn failure(url: impl Into<String>, mode: ScrapeMode, err: &AppError) -> Self {
        Self {
            url: url.into(),
            mode,
            outcome: ScrapeOutcome::Failure(ScrapeFailure::from(err)),
            fetched_at: Utc::now(),
            from_cache: false,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ScrapeOutcome::Success { .. })
    }

    pub fn payload(&self) -> Option<&serde_json::Value> {
        match &self.outcome {
            ScrapeOutcome::Success { payload } => Some(payload),
            ScrapeOutcome::Failure(_) => None,
        }
    }

    pub fn failure_info(&self) -> Option<&ScrapeFailure> {
        match &self.outcome {
            ScrapeOutcome::Success { .. } => None,
            ScrapeOutcome::Failure(f) => Some(f),
        }
    }
}

/// Cache identity of a result: the same URL in different modes caches separately.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub url: String,
    pub mode: ScrapeMode,
}

impl CacheKey {
    pub fn new(url: impl Into<String>, mode: ScrapeMode) -> Self {
        Self {
            url: url.into(),
            mode,
        }
    }

    /// Storage key used by both tiers: `scrape:{mode}:{sha256(url)}`.
    pub fn storage_key(&self) -> String {
        format!("scrape:{}:{}", self.mode, compute_hash(&self.url))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_key())
    }
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_hash_consistency() {
        let h1 = compute_hash("hello world");
        let h2 = compute_hash("hello world");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
    }

    #[test]
    fn test_mode_roundtrip() {
        for mode in ScrapeMode::ALL {
            assert_eq!(mode.as_str().parse::<ScrapeMode>().unwrap(), mode);
        }
        assert_eq!("FULL".parse::<ScrapeMode>().unwrap(), ScrapeMode::Full);
        assert!("deep".parse::<ScrapeMode>().is_err());
    }

    #[test]
    fn test_mode_indices_are_distinct() {
        let idx: Vec<usize> = ScrapeMode::ALL.iter().map(|m| m.index()).collect();
        assert_eq!(idx, vec![0, 1, 2]);
    }

    #[test]
    fn test_validate_accepts_http_and_https() {
        assert!(ScrapeRequest::new("https://example.com/a", ScrapeMode::Simple)
            .validate()
            .is_ok());
        assert!(ScrapeRequest::new("http://example.com", ScrapeMode::Full)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_urls() {
        for url in ["not a url", "ftp://example.com/file", "file:///etc/passwd", ""] {
            let err = ScrapeRequest::new(url, ScrapeMode::Simple)
                .validate()
                .unwrap_err();
            assert!(matches!(err, AppError::ValidationError(_)), "{url}");
        }
    }

    #[test]
    fn test_cache_key_differs_per_mode() {
        let simple = CacheKey::new("https://example.com", ScrapeMode::Simple);
        let full = CacheKey::new("https://example.com", ScrapeMode::Full);
        assert_ne!(simple.storage_key(), full.storage_key());
        assert!(simple.storage_key().starts_with("scrape:simple:"));
    }

    #[test]
    fn test_result_serializes_with_status_tag() {
        let ok = ScrapeResult::success(
            "https://example.com",
            ScrapeMode::Simple,
            serde_json::json!({"title": "Example"}),
        );
        let value = serde_json::to_value(&ok).unwrap();
        assert_eq!(value["status"], "success");
        assert_eq!(value["payload"]["title"], "Example");

        let failed = ScrapeResult::failure(
            "https://example.com",
            ScrapeMode::Super,
            &AppError::FetchTimeout(30_000),
        );
        let value = serde_json::to_value(&failed).unwrap();
        assert_eq!(value["status"], "failure");
        assert_eq!(value["kind"], "timeout");

        let back: ScrapeResult = serde_json::from_value(value).unwrap();
        assert_eq!(back.failure_info().unwrap().kind, FailureKind::Timeout);
    }
}
