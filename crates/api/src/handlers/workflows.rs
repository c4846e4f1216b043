use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use db::models::TriggerKind;
use engine::{TriggerOptions, Workflow};

use super::{Accepted, AppState};
use crate::ApiError;

fn default_async() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    #[serde(default)]
    pub inputs: Value,
    /// Return `202` immediately instead of waiting for the run to settle.
    #[serde(default = "default_async", rename = "async")]
    pub run_async: bool,
    /// Lets an external scheduler report `schedule` instead of `api`.
    #[serde(default)]
    pub trigger: Option<TriggerKind>,
}

impl ExecuteRequest {
    pub fn options(&self) -> TriggerOptions {
        let mut options = TriggerOptions::new(self.trigger.unwrap_or(TriggerKind::Api));
        options.wait = !self.run_async;
        options
    }
}

pub async fn list(State(state): State<AppState>) -> Result<Json<Vec<Workflow>>, ApiError> {
    Ok(Json(state.service.list_workflows().await?))
}

pub async fn get(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<Workflow>, ApiError> {
    Ok(Json(state.service.workflow(id).await?))
}

pub async fn create(
    State(state): State<AppState>,
    Json(payload): Json<Workflow>,
) -> Result<(StatusCode, Json<Workflow>), ApiError> {
    let workflow = state.service.register_workflow(payload).await?;
    Ok((StatusCode::CREATED, Json(workflow)))
}

pub async fn delete(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<StatusCode, ApiError> {
    state.service.delete_workflow(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn execute(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    Json(payload): Json<ExecuteRequest>,
) -> Result<Response, ApiError> {
    let options = payload.options();
    let record = state.service.trigger_workflow(id, payload.inputs, options).await?;
    if payload.run_async {
        Ok((StatusCode::ACCEPTED, Json(Accepted::from_record(&record))).into_response())
    } else {
        Ok(Json(record).into_response())
    }
}
