//! Agent plan definition operations.

use sqlx::PgPool;
use uuid::Uuid;

use crate::{DbError, models::PlanRow};

/// Insert or replace a plan definition.
pub async fn upsert_plan(pool: &PgPool, row: &PlanRow) -> Result<PlanRow, DbError> {
    let row = sqlx::query_as::<_, PlanRow>(
        r#"
        INSERT INTO plans (id, tenant_id, goal, definition, created_at)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (id) DO UPDATE
            SET goal = EXCLUDED.goal, definition = EXCLUDED.definition
        RETURNING id, tenant_id, goal, definition, created_at
        "#,
    )
    .bind(row.id)
    .bind(row.tenant_id)
    .bind(&row.goal)
    .bind(&row.definition)
    .bind(row.created_at)
    .fetch_one(pool)
    .await?;

    Ok(row)
}

/// Fetch a single plan by its primary key.
pub async fn get_plan(pool: &PgPool, id: Uuid) -> Result<PlanRow, DbError> {
    let row = sqlx::query_as::<_, PlanRow>(
        r#"SELECT id, tenant_id, goal, definition, created_at FROM plans WHERE id = $1"#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or(DbError::NotFound)?;

    Ok(row)
}
