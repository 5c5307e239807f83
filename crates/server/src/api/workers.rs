//! Encoding worker API handlers.

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::sync::Arc;
use mediarelay_core::WorkerRecord;

use crate::state::AppState;

/// A registered worker with its derived success rate
#[derive(Debug, Serialize)]
pub struct WorkerResponse {
    #[serde(flatten)]
    pub worker: WorkerRecord,
    pub success_rate: f64,
}

impl From<WorkerRecord> for WorkerResponse {
    fn from(worker: WorkerRecord) -> Self {
        Self {
            success_rate: worker.success_rate(),
            worker,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ListWorkersResponse {
    pub workers: Vec<WorkerResponse>,
}

#[derive(Debug, Serialize)]
pub struct WorkerErrorResponse {
    pub error: String,
}

/// List registered encoding workers
pub async fn list_workers(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ListWorkersResponse>, (StatusCode, Json<WorkerErrorResponse>)> {
    match state.orchestrator().workers().await {
        Ok(workers) => Ok(Json(ListWorkersResponse {
            workers: workers.into_iter().map(WorkerResponse::from).collect(),
        })),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(WorkerErrorResponse {
                error: e.to_string(),
            }),
        )),
    }
}
