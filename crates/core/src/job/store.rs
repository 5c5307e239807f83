//! Job storage trait and types.

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::types::{Job, Stage, StageStatus};

/// Error type for job storage.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("job not found: {0}")]
    NotFound(String),

    #[error("job already exists: {0}")]
    AlreadyExists(String),

    #[error("cannot {operation} job {job_id}: {reason}")]
    InvalidState {
        job_id: String,
        operation: String,
        reason: String,
    },

    #[error("database error: {0}")]
    Database(String),
}

impl From<rusqlite::Error> for JobError {
    fn from(e: rusqlite::Error) -> Self {
        JobError::Database(e.to_string())
    }
}

/// Filter for querying jobs.
#[derive(Debug, Clone)]
pub struct JobFilter {
    pub stage: Option<Stage>,
    pub status: Option<StageStatus>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl JobFilter {
    pub fn new() -> Self {
        Self {
            stage: None,
            status: None,
            limit: 100,
            offset: 0,
        }
    }

    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn with_status(mut self, status: StageStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }
}

/// Durable job state.
///
/// Only the orchestrator writes; readers (status, listing, the HTTP API) may
/// call the read methods concurrently.
pub trait JobStore: Send + Sync {
    /// Insert a new job.
    fn create(&self, job: &Job) -> Result<(), JobError>;

    fn get(&self, id: &str) -> Result<Option<Job>, JobError>;

    /// List jobs matching the filter, newest first.
    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobError>;

    fn count(&self, filter: &JobFilter) -> Result<i64, JobError>;

    /// Overwrite an existing job.
    fn save(&self, job: &Job) -> Result<(), JobError>;

    /// Jobs that are Pending, or AwaitingRetry with an elapsed deadline,
    /// ordered by priority (highest first), age (oldest first) and id.
    ///
    /// `after` resumes the listing past a job returned by an earlier page.
    fn list_due(
        &self,
        now: DateTime<Utc>,
        after: Option<&Job>,
        limit: i64,
    ) -> Result<Vec<Job>, JobError>;

    /// Permanently delete a job. Returns the deleted job.
    fn delete(&self, id: &str) -> Result<Job, JobError>;
}
