use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use uuid::Uuid;

use engine::Plan;

use super::{workflows::ExecuteRequest, Accepted, AppState};
use crate::ApiError;

pub async fn create(
    State(state): State<AppState>,
    Json(payload): Json<Plan>,
) -> Result<(StatusCode, Json<Plan>), ApiError> {
    let plan = state.service.register_plan(payload).await?;
    Ok((StatusCode::CREATED, Json(plan)))
}

pub async fn get(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<Plan>, ApiError> {
    Ok(Json(state.service.plan(id).await?))
}

pub async fn execute(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    Json(payload): Json<ExecuteRequest>,
) -> Result<Response, ApiError> {
    let options = payload.options();
    let record = state.service.start_plan(id, payload.inputs, options).await?;
    if payload.run_async {
        Ok((StatusCode::ACCEPTED, Json(Accepted::from_record(&record))).into_response())
    } else {
        let view = state.service.status(record.id).await?;
        Ok(Json(view).into_response())
    }
}
