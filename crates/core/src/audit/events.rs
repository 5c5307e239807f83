use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{ErrorKind, Stage};
use crate::worker::{Liveness, WorkerClass, WorkerPreference};

/// Audit event types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    // System events
    ServiceStarted {
        version: String,
        config_hash: String,
    },
    ServiceStopped {
        reason: String,
    },

    // Job lifecycle
    JobEnqueued {
        job_id: String,
        source_ref: String,
        priority: i32,
        preference: WorkerPreference,
    },
    JobCompleted {
        job_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        placed_path: Option<String>,
    },
    JobFailed {
        job_id: String,
        stage: Stage,
        error_kind: ErrorKind,
        message: String,
    },
    JobCancelled {
        job_id: String,
        stage: Stage,
    },
    JobRecovered {
        job_id: String,
        stage: Stage,
    },

    // Stage execution
    StageStarted {
        job_id: String,
        stage: Stage,
        attempt: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        worker_id: Option<String>,
    },
    StageSucceeded {
        job_id: String,
        stage: Stage,
        attempt: u32,
    },
    StageFailed {
        job_id: String,
        stage: Stage,
        attempt: u32,
        error_kind: ErrorKind,
        message: String,
        retryable: bool,
    },
    StageSkipped {
        job_id: String,
        stage: Stage,
    },
    RetryScheduled {
        job_id: String,
        stage: Stage,
        delay_secs: u64,
        counted: bool,
        next_attempt_at: DateTime<Utc>,
    },
    FallbackApplied {
        job_id: String,
        from: WorkerPreference,
        to: WorkerPreference,
    },

    // Workers
    WorkerRegistered {
        worker_id: String,
        class: WorkerClass,
        max_concurrent_jobs: u32,
    },
    WorkerDeregistered {
        worker_id: String,
    },
    WorkerLivenessChanged {
        worker_id: String,
        from: Liveness,
        to: Liveness,
    },
}

impl AuditEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ServiceStarted { .. } => "service_started",
            Self::ServiceStopped { .. } => "service_stopped",
            Self::JobEnqueued { .. } => "job_enqueued",
            Self::JobCompleted { .. } => "job_completed",
            Self::JobFailed { .. } => "job_failed",
            Self::JobCancelled { .. } => "job_cancelled",
            Self::JobRecovered { .. } => "job_recovered",
            Self::StageStarted { .. } => "stage_started",
            Self::StageSucceeded { .. } => "stage_succeeded",
            Self::StageFailed { .. } => "stage_failed",
            Self::StageSkipped { .. } => "stage_skipped",
            Self::RetryScheduled { .. } => "retry_scheduled",
            Self::FallbackApplied { .. } => "fallback_applied",
            Self::WorkerRegistered { .. } => "worker_registered",
            Self::WorkerDeregistered { .. } => "worker_deregistered",
            Self::WorkerLivenessChanged { .. } => "worker_liveness_changed",
        }
    }

    pub fn job_id(&self) -> Option<&str> {
        match self {
            Self::JobEnqueued { job_id, .. }
            | Self::JobCompleted { job_id, .. }
            | Self::JobFailed { job_id, .. }
            | Self::JobCancelled { job_id, .. }
            | Self::JobRecovered { job_id, .. }
            | Self::StageStarted { job_id, .. }
            | Self::StageSucceeded { job_id, .. }
            | Self::StageFailed { job_id, .. }
            | Self::StageSkipped { job_id, .. }
            | Self::RetryScheduled { job_id, .. }
            | Self::FallbackApplied { job_id, .. } => Some(job_id),
            _ => None,
        }
    }

    pub fn worker_id(&self) -> Option<&str> {
        match self {
            Self::StageStarted { worker_id, .. } => worker_id.as_deref(),
            Self::WorkerRegistered { worker_id, .. }
            | Self::WorkerDeregistered { worker_id }
            | Self::WorkerLivenessChanged { worker_id, .. } => Some(worker_id),
            _ => None,
        }
    }
}

/// Stored audit record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub job_id: Option<String>,
    pub worker_id: Option<String>,
    pub data: AuditEvent,
}
