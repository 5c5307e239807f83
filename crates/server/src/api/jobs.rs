//! Job API handlers.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use mediarelay_core::{
    AuditFilter, AuditRecord, Job, JobError, JobFilter, JobOptions, OrchestratorError, Stage,
    StageStatus,
};

use crate::metrics::JOBS_SUBMITTED_TOTAL;
use crate::state::AppState;

/// Maximum allowed limit for job and event queries
const MAX_LIMIT: i64 = 1000;

/// Default limit for job and event queries
const DEFAULT_LIMIT: i64 = 100;

// ============================================================================
// Request/Response Types
// ============================================================================

/// Request body for submitting a job
#[derive(Debug, Deserialize)]
pub struct CreateJobBody {
    /// Where the raw item comes from (path or URL understood by the acquirer)
    pub source_ref: String,
    #[serde(default)]
    pub options: JobOptions,
}

/// Query parameters for listing jobs
#[derive(Debug, Deserialize)]
pub struct ListJobsParams {
    /// Filter by pipeline stage
    pub stage: Option<String>,
    /// Filter by status within the stage
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Pagination for the events endpoint
#[derive(Debug, Deserialize)]
pub struct PageParams {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Response for listing jobs
#[derive(Debug, Serialize)]
pub struct ListJobsResponse {
    pub jobs: Vec<Job>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

/// Response for a job's audit trail
#[derive(Debug, Serialize)]
pub struct JobEventsResponse {
    pub job_id: String,
    pub events: Vec<AuditRecord>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct JobErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<JobErrorResponse>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(JobErrorResponse {
            error: message.into(),
        }),
    )
}

fn orchestrator_error(err: OrchestratorError) -> ApiError {
    let status = match &err {
        OrchestratorError::Job(JobError::NotFound(_)) => StatusCode::NOT_FOUND,
        OrchestratorError::Job(JobError::InvalidState { .. }) => StatusCode::CONFLICT,
        OrchestratorError::Job(JobError::AlreadyExists(_)) => StatusCode::CONFLICT,
        OrchestratorError::NotRunning | OrchestratorError::LoopStopped => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    api_error(status, err.to_string())
}

fn page(limit: Option<i64>, offset: Option<i64>) -> (i64, i64) {
    (
        limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT),
        offset.unwrap_or(0).max(0),
    )
}

// ============================================================================
// Handlers
// ============================================================================

/// Submit a new job
pub async fn create_job(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateJobBody>,
) -> Result<(StatusCode, Json<Job>), ApiError> {
    let source_ref = body.source_ref.trim();
    if source_ref.is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "source_ref cannot be empty",
        ));
    }

    let job = state
        .orchestrator()
        .enqueue(source_ref, body.options)
        .await
        .map_err(orchestrator_error)?;
    JOBS_SUBMITTED_TOTAL.inc();

    Ok((StatusCode::CREATED, Json(job)))
}

/// Get a job by ID
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    state
        .orchestrator()
        .status(&id)
        .await
        .map(Json)
        .map_err(orchestrator_error)
}

/// List jobs with optional filters
pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListJobsParams>,
) -> Result<Json<ListJobsResponse>, ApiError> {
    let (limit, offset) = page(params.limit, params.offset);

    let mut filter = JobFilter::new();
    if let Some(ref stage) = params.stage {
        let stage: Stage = stage
            .parse()
            .map_err(|e: String| api_error(StatusCode::BAD_REQUEST, e))?;
        filter = filter.with_stage(stage);
    }
    if let Some(ref status) = params.status {
        let status: StageStatus = status
            .parse()
            .map_err(|e: String| api_error(StatusCode::BAD_REQUEST, e))?;
        filter = filter.with_status(status);
    }

    let orchestrator = state.orchestrator();
    let total = orchestrator
        .count_jobs(&filter)
        .await
        .map_err(orchestrator_error)?;
    let jobs = orchestrator
        .list_jobs(&filter.with_limit(limit).with_offset(offset))
        .await
        .map_err(orchestrator_error)?;

    Ok(Json(ListJobsResponse {
        jobs,
        total,
        limit,
        offset,
    }))
}

/// Cancel a job. Terminal jobs cannot be cancelled.
pub async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    state
        .orchestrator()
        .cancel(&id)
        .await
        .map(Json)
        .map_err(orchestrator_error)
}

/// Audit trail of a single job, oldest first
pub async fn job_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<PageParams>,
) -> Result<Json<JobEventsResponse>, ApiError> {
    // 404 for unknown jobs rather than an empty trail
    state
        .orchestrator()
        .status(&id)
        .await
        .map_err(orchestrator_error)?;

    let (limit, offset) = page(params.limit, params.offset);
    let base_filter = AuditFilter::new().with_job_id(&id);
    let query_filter = base_filter.clone().with_limit(limit).with_offset(offset);

    let events = state.audit_store().query(&query_filter).map_err(|e| {
        api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to query audit events: {}", e),
        )
    })?;
    let total = state.audit_store().count(&base_filter).map_err(|e| {
        api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to count audit events: {}", e),
        )
    })?;

    Ok(Json(JobEventsResponse {
        job_id: id,
        events,
        total,
        limit,
        offset,
    }))
}
