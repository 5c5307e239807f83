//! Types for the pipeline orchestrator.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::encoder::EncodeRequest;
use crate::job::{JobError, Stage};
use crate::stage::{StageInput, StageOutcome};

/// Errors that can occur during orchestration.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Job store error, including unknown jobs and invalid transitions.
    #[error(transparent)]
    Job(#[from] JobError),

    /// The scheduling loop is not running.
    #[error("orchestrator is not running")]
    NotRunning,

    /// The scheduling loop went away while a request was pending.
    #[error("orchestrator loop stopped")]
    LoopStopped,

    /// A worker id was registered twice.
    #[error("worker already registered: {0}")]
    DuplicateWorker(String),

    #[error("worker not found: {0}")]
    WorkerNotFound(String),
}

/// One stage execution handed from the scheduler to a task.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub dispatch_id: u64,
    pub job_id: String,
    pub stage: Stage,
    /// Counted attempt number this execution would be.
    pub attempt: u32,
    pub cancel: CancellationToken,
    pub work: DispatchWork,
}

/// What a dispatch task has to do.
#[derive(Debug, Clone)]
pub enum DispatchWork {
    /// Acquire, Extract, Identify or Organize through the stage executor.
    Stage(StageInput),
    /// Encode on a reserved worker.
    Encode {
        worker_id: String,
        request: EncodeRequest,
    },
}

/// Result of a dispatch, sent back to the scheduling loop.
#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub dispatch_id: u64,
    pub job_id: String,
    pub stage: Stage,
    pub outcome: StageOutcome,
}

/// Encode progress observed by a dispatch task.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub dispatch_id: u64,
    pub job_id: String,
    pub worker_id: String,
    pub percent: f32,
    pub eta_secs: Option<u64>,
}

/// Current status of the orchestrator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorStatus {
    /// Whether the scheduling loop is running.
    pub running: bool,
    /// Stage executions in flight.
    pub in_flight: usize,
    /// In-flight executions per stage.
    pub in_flight_by_stage: BTreeMap<String, usize>,
    pub pending_count: usize,
    pub running_count: usize,
    pub awaiting_retry_count: usize,
    pub done_count: usize,
    pub failed_count: usize,
    pub workers_total: usize,
    pub workers_online: usize,
}
