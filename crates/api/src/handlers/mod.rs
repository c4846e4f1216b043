//! Route handlers, one module per resource.

pub mod executions;
pub mod plans;
pub mod webhooks;
pub mod workflows;

pub(crate) use crate::AppState;

use serde::Serialize;
use uuid::Uuid;

use db::models::{ExecutionRecord, ExecutionStatus};

/// Body of a `202 Accepted` trigger response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Accepted {
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
}

impl Accepted {
    /// A freshly queued execution is reported as running.
    pub fn from_record(record: &ExecutionRecord) -> Self {
        let status = match record.status {
            ExecutionStatus::Pending => ExecutionStatus::Running,
            other => other,
        };
        Self { execution_id: record.id, status }
    }
}
