use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::ScrapeMode;

/// Status of a batch chunk job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    /// Processed, but at least one URL failed.
    PartialFailure,
    /// Could not be dispatched at all.
    Failed,
    /// Never started because the batch was cancelled.
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::PartialFailure => "partial_failure",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Pending | JobStatus::Running)
    }

    /// Combine chunk statuses into a batch status.
    ///
    /// `Failed` wins over `PartialFailure`, which wins over `Cancelled`,
    /// which wins over `Done`. An empty batch is `Done`.
    pub fn aggregate<I>(statuses: I) -> JobStatus
    where
        I: IntoIterator<Item = JobStatus>,
    {
        statuses
            .into_iter()
            .fold(JobStatus::Done, |acc, s| if s.rank() > acc.rank() { s } else { acc })
    }

    fn rank(&self) -> u8 {
        match self {
            JobStatus::Done => 0,
            JobStatus::Pending | JobStatus::Running | JobStatus::Cancelled => 1,
            JobStatus::PartialFailure => 2,
            JobStatus::Failed => 3,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "done" => Ok(JobStatus::Done),
            "partial_failure" => Ok(JobStatus::PartialFailure),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            _ => Err(format!("Unknown job status: {}", s)),
        }
    }
}

/// One chunk of a large batch, tracked as a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkJob {
    pub id: Uuid,
    pub batch_id: Uuid,
    pub chunk_index: usize,
    pub urls: Vec<String>,
    pub mode: ScrapeMode,
    pub status: JobStatus,
    pub succeeded: usize,
    pub failed: usize,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ChunkJob {
    /// Build a pending job from a creation request.
    pub fn from_request(request: CreateChunkJobRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            batch_id: request.batch_id,
            chunk_index: request.chunk_index,
            urls: request.urls,
            mode: request.mode,
            status: JobStatus::Pending,
            succeeded: 0,
            failed: 0,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

/// Request to create a chunk job.
#[derive(Debug, Clone)]
pub struct CreateChunkJobRequest {
    pub batch_id: Uuid,
    pub chunk_index: usize,
    pub urls: Vec<String>,
    pub mode: ScrapeMode,
}

impl CreateChunkJobRequest {
    pub fn new(batch_id: Uuid, chunk_index: usize, urls: Vec<String>, mode: ScrapeMode) -> Self {
        Self {
            batch_id,
            chunk_index,
            urls,
            mode,
        }
    }
}
