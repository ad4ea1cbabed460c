//! Operator endpoints for reports that were generated but not saved.

use axum::{
    Json,
    extract::{Path, State},
};
use serde::Serialize;

use medscribe_domain::PendingReport;
use medscribe_types::PersistedReport;

use crate::error::ServerError;
use crate::state::AppState;

/// Response for listing parked reports.
#[derive(Debug, Clone, Serialize)]
pub struct ListPendingResponse {
    pub pending: Vec<PendingReport>,
    pub total: usize,
}

/// GET /api/v1/recovery
pub async fn list_pending_handler(State(state): State<AppState>) -> Json<ListPendingResponse> {
    let pending = state.orchestrator.finalizer().recovery().list();
    Json(ListPendingResponse {
        total: pending.len(),
        pending,
    })
}

/// POST /api/v1/recovery/{id}/retry
pub async fn retry_pending_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PersistedReport>, ServerError> {
    let report = state.orchestrator.finalizer().retry(&id).await?;
    Ok(Json(report))
}
