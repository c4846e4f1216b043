use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use db::models::{ExecutionRecord, ExecutionStatus};
use engine::ExecutionView;

use super::AppState;
use crate::ApiError;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    pub step_id: String,
    pub approved: bool,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub accepted: bool,
    pub status: ExecutionStatus,
}

pub async fn get(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<ExecutionView>, ApiError> {
    Ok(Json(state.service.status(id).await?))
}

pub async fn approval(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    Json(payload): Json<ApprovalRequest>,
) -> Result<Json<ExecutionRecord>, ApiError> {
    let record = state
        .service
        .resolve_approval(id, &payload.step_id, payload.approved)
        .await?;
    Ok(Json(record))
}

pub async fn cancel(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<CancelResponse>, ApiError> {
    let (outcome, record) = state.service.cancel(id).await?;
    Ok(Json(CancelResponse { accepted: outcome.accepted(), status: record.status }))
}
