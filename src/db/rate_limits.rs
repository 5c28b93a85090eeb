use serde::Serialize;
use sqlx::{Executor, Postgres};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ExecutionRateLimit {
    pub id: Uuid,
    pub runbook_id: Uuid,
    pub max_executions: i32,
    pub window_seconds: i32,
}

pub async fn get_rate_limit<'c, E>(
    executor: E,
    runbook_id: Uuid,
) -> Result<Option<ExecutionRateLimit>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, ExecutionRateLimit>(
        "SELECT id, runbook_id, max_executions, window_seconds \
         FROM execution_rate_limits WHERE runbook_id = $1",
    )
    .bind(runbook_id)
    .fetch_optional(executor)
    .await
}

pub async fn upsert_rate_limit<'c, E>(
    executor: E,
    runbook_id: Uuid,
    max_executions: i32,
    window_seconds: i32,
) -> Result<ExecutionRateLimit, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, ExecutionRateLimit>(
        r#"
        INSERT INTO execution_rate_limits (runbook_id, max_executions, window_seconds)
        VALUES ($1, $2, $3)
        ON CONFLICT (runbook_id) DO UPDATE
        SET max_executions = EXCLUDED.max_executions,
            window_seconds = EXCLUDED.window_seconds
        RETURNING id, runbook_id, max_executions, window_seconds
        "#,
    )
    .bind(runbook_id)
    .bind(max_executions)
    .bind(window_seconds)
    .fetch_one(executor)
    .await
}

pub async fn remove_rate_limit<'c, E>(executor: E, runbook_id: Uuid) -> Result<bool, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let result = sqlx::query("DELETE FROM execution_rate_limits WHERE runbook_id = $1")
        .bind(runbook_id)
        .execute(executor)
        .await?;
    Ok(result.rows_affected() > 0)
}
