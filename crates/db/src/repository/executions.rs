//! Execution, step-result and approval repository functions.
//!
//! Mutating operations run on a connection inside a caller-owned
//! transaction and lock the execution row with `SELECT … FOR UPDATE`, so
//! concurrent drivers serialise on the row instead of overwriting each other.

use chrono::Utc;
use sqlx::PgConnection;
use uuid::Uuid;

use crate::{
    DbError,
    models::{
        ApprovalRecord, ApprovalRow, ExecutionError, ExecutionRecord, ExecutionRow,
        ExecutionTarget, StepResult, StepResultRow,
    },
};

// ---------------------------------------------------------------------------
// executions
// ---------------------------------------------------------------------------

/// Insert a freshly built `pending` execution.
pub async fn insert_execution(
    conn: &mut PgConnection,
    record: &ExecutionRecord,
) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO executions
            (id, target_kind, target_id, tenant_id, triggered_by, trigger_kind, status,
             input_data, awaiting_step, cancel_requested, error, created_at, started_at, completed_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        "#,
    )
    .bind(record.id)
    .bind(record.target.kind.to_string())
    .bind(record.target.id)
    .bind(record.tenant_id)
    .bind(&record.triggered_by)
    .bind(record.trigger_kind.to_string())
    .bind(record.status.to_string())
    .bind(&record.input_data)
    .bind(&record.awaiting_step)
    .bind(record.cancel_requested)
    .bind(error_json(&record.error)?)
    .bind(record.created_at)
    .bind(record.started_at)
    .bind(record.completed_at)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Fetch the execution row, optionally locking it for the transaction.
pub async fn fetch_execution_row(
    conn: &mut PgConnection,
    id: Uuid,
    for_update: bool,
) -> Result<ExecutionRow, DbError> {
    let sql = if for_update {
        "SELECT * FROM executions WHERE id = $1 FOR UPDATE"
    } else {
        "SELECT * FROM executions WHERE id = $1"
    };

    sqlx::query_as::<_, ExecutionRow>(sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(DbError::NotFound)
}

/// Reconstruct the full record (header, step results, approvals).
pub async fn load_execution(
    conn: &mut PgConnection,
    id: Uuid,
    for_update: bool,
) -> Result<ExecutionRecord, DbError> {
    let row = fetch_execution_row(conn, id, for_update).await?;

    let steps = sqlx::query_as::<_, StepResultRow>(
        r#"
        SELECT step_id, result, outcome, error, attempts, error_trail, started_at, completed_at
        FROM step_results
        WHERE execution_id = $1
        ORDER BY seq ASC
        "#,
    )
    .bind(id)
    .fetch_all(&mut *conn)
    .await?;

    let approvals = sqlx::query_as::<_, ApprovalRow>(
        r#"
        SELECT step_id, approved, requested_at, resolved_at
        FROM approvals
        WHERE execution_id = $1
        ORDER BY requested_at ASC
        "#,
    )
    .bind(id)
    .fetch_all(&mut *conn)
    .await?;

    into_record(row, steps, approvals)
}

/// Persist the mutable header fields of `record`.
pub async fn write_execution_header(
    conn: &mut PgConnection,
    record: &ExecutionRecord,
) -> Result<(), DbError> {
    sqlx::query(
        r#"
        UPDATE executions
        SET status = $1, awaiting_step = $2, cancel_requested = $3, error = $4,
            started_at = $5, completed_at = $6
        WHERE id = $7
        "#,
    )
    .bind(record.status.to_string())
    .bind(&record.awaiting_step)
    .bind(record.cancel_requested)
    .bind(error_json(&record.error)?)
    .bind(record.started_at)
    .bind(record.completed_at)
    .bind(record.id)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Ids of every execution in `status`, oldest first.
pub async fn list_ids_by_status(
    conn: &mut PgConnection,
    status: &str,
) -> Result<Vec<Uuid>, DbError> {
    let ids = sqlx::query_scalar::<_, Uuid>(
        "SELECT id FROM executions WHERE status = $1 ORDER BY created_at ASC",
    )
    .bind(status)
    .fetch_all(&mut *conn)
    .await?;

    Ok(ids)
}

// ---------------------------------------------------------------------------
// step_results
// ---------------------------------------------------------------------------

/// Insert a step result.  The `(execution_id, step_id)` primary key keeps
/// step ids unique; callers check for an existing row first.
pub async fn insert_step_result(
    conn: &mut PgConnection,
    execution_id: Uuid,
    result: &StepResult,
) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO step_results
            (execution_id, step_id, result, outcome, error, attempts, error_trail, started_at, completed_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(execution_id)
    .bind(&result.step_id)
    .bind(&result.result)
    .bind(&result.outcome)
    .bind(&result.error)
    .bind(result.attempts as i32)
    .bind(serde_json::to_value(&result.error_trail)?)
    .bind(result.started_at)
    .bind(result.completed_at)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

// ---------------------------------------------------------------------------
// approvals
// ---------------------------------------------------------------------------

/// Record an approval checkpoint; re-requesting an existing one is a no-op.
pub async fn insert_approval(
    conn: &mut PgConnection,
    execution_id: Uuid,
    step_id: &str,
) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO approvals (execution_id, step_id, approved, requested_at)
        VALUES ($1, $2, NULL, $3)
        ON CONFLICT (execution_id, step_id) DO NOTHING
        "#,
    )
    .bind(execution_id)
    .bind(step_id)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Mark an approval checkpoint as resolved.
pub async fn resolve_approval(
    conn: &mut PgConnection,
    execution_id: Uuid,
    step_id: &str,
    approved: bool,
) -> Result<(), DbError> {
    let result = sqlx::query(
        r#"
        UPDATE approvals
        SET approved = $1, resolved_at = $2
        WHERE execution_id = $3 AND step_id = $4 AND approved IS NULL
        "#,
    )
    .bind(approved)
    .bind(Utc::now())
    .bind(execution_id)
    .bind(step_id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::AlreadyResolved {
            execution_id,
            step_id: step_id.to_owned(),
        });
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// row conversion
// ---------------------------------------------------------------------------

fn error_json(error: &Option<ExecutionError>) -> Result<Option<serde_json::Value>, DbError> {
    error
        .as_ref()
        .map(serde_json::to_value)
        .transpose()
        .map_err(DbError::from)
}

fn into_record(
    row: ExecutionRow,
    steps: Vec<StepResultRow>,
    approvals: Vec<ApprovalRow>,
) -> Result<ExecutionRecord, DbError> {
    let step_results = steps
        .into_iter()
        .map(|s| {
            Ok(StepResult {
                step_id: s.step_id,
                result: s.result,
                outcome: s.outcome,
                error: s.error,
                attempts: s.attempts.max(0) as u32,
                error_trail: serde_json::from_value(s.error_trail)?,
                started_at: s.started_at,
                completed_at: s.completed_at,
            })
        })
        .collect::<Result<Vec<_>, DbError>>()?;

    let approvals = approvals
        .into_iter()
        .map(|a| ApprovalRecord {
            step_id: a.step_id,
            approved: a.approved,
            requested_at: a.requested_at,
            resolved_at: a.resolved_at,
        })
        .collect();

    Ok(ExecutionRecord {
        id: row.id,
        target: ExecutionTarget {
            kind: row.target_kind.parse().map_err(DbError::Corrupt)?,
            id: row.target_id,
        },
        tenant_id: row.tenant_id,
        triggered_by: row.triggered_by,
        trigger_kind: row.trigger_kind.parse().map_err(DbError::Corrupt)?,
        status: row.status.parse().map_err(DbError::Corrupt)?,
        input_data: row.input_data,
        step_results,
        approvals,
        awaiting_step: row.awaiting_step,
        cancel_requested: row.cancel_requested,
        error: row.error.map(serde_json::from_value).transpose()?,
        created_at: row.created_at,
        started_at: row.started_at,
        completed_at: row.completed_at,
    })
}
