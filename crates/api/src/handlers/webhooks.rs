use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::Value;

use super::{Accepted, AppState};
use crate::ApiError;

pub async fn handle_webhook(
    Path(path): Path<String>,
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Result<(StatusCode, Json<Accepted>), ApiError> {
    let record = state.service.trigger_webhook(&path, payload).await?;
    Ok((StatusCode::ACCEPTED, Json(Accepted::from_record(&record))))
}
