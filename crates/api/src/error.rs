//! Mapping from engine errors to HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::error;

use db::DbError;
use engine::EngineError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        let Self::Engine(err) = self;
        match err {
            EngineError::Database(DbError::NotFound) | EngineError::UnknownWebhook(_) => {
                StatusCode::NOT_FOUND
            }
            EngineError::Database(
                DbError::InvalidTransition { .. }
                | DbError::NotAwaitingApproval { .. }
                | DbError::AlreadyResolved { .. }
                | DbError::StepResultConflict { .. },
            )
            | EngineError::WorkflowDisabled(_) => StatusCode::CONFLICT,
            e if e.is_structural() => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
