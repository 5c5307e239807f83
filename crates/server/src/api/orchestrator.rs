//! Orchestrator API handlers.

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::sync::Arc;
use mediarelay_core::OrchestratorStatus;

use crate::state::AppState;

/// Error response
#[derive(Debug, Serialize)]
pub struct OrchestratorErrorResponse {
    pub error: String,
}

/// Get orchestrator status
pub async fn get_status(
    State(state): State<Arc<AppState>>,
) -> Result<Json<OrchestratorStatus>, (StatusCode, Json<OrchestratorErrorResponse>)> {
    state.orchestrator().summary().await.map(Json).map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(OrchestratorErrorResponse {
                error: e.to_string(),
            }),
        )
    })
}
