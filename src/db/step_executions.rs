use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Executor, Postgres};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct StepExecution {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub step_order: i32,
    pub step_name: String,
    pub status: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub command_executed: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub exit_code: Option<i32>,
    pub http_status_code: Option<i32>,
    pub http_response_body: Option<String>,
    pub retry_attempt: i32,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
}

const STEP_EXECUTION_COLUMNS: &str = "id, execution_id, step_order, step_name, status, \
     started_at, completed_at, duration_ms, command_executed, stdout, stderr, exit_code, \
     http_status_code, http_response_body, retry_attempt, error_type, error_message";

pub async fn start_step<'c, E>(
    executor: E,
    execution_id: Uuid,
    step_order: i32,
    step_name: &str,
) -> Result<StepExecution, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, StepExecution>(&format!(
        r#"
        INSERT INTO step_executions (execution_id, step_order, step_name, status, started_at)
        VALUES ($1, $2, $3, 'running', NOW())
        RETURNING {STEP_EXECUTION_COLUMNS}
        "#
    ))
    .bind(execution_id)
    .bind(step_order)
    .bind(step_name)
    .fetch_one(executor)
    .await
}

pub async fn skip_step<'c, E>(
    executor: E,
    step_execution_id: Uuid,
    reason: &str,
) -> Result<(), sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query(
        "UPDATE step_executions \
         SET status = 'skipped', completed_at = NOW(), error_message = $2 \
         WHERE id = $1",
    )
    .bind(step_execution_id)
    .bind(reason)
    .execute(executor)
    .await?;
    Ok(())
}

pub struct FinishStep<'a> {
    pub step_execution_id: Uuid,
    pub status: &'a str,
    pub duration_ms: Option<i64>,
    pub command_executed: Option<&'a str>,
    pub stdout: Option<&'a str>,
    pub stderr: Option<&'a str>,
    pub exit_code: Option<i32>,
    pub http_status_code: Option<i32>,
    pub http_response_body: Option<&'a str>,
    pub retry_attempt: i32,
    pub error_type: Option<&'a str>,
    pub error_message: Option<&'a str>,
}

pub async fn finish_step<'c, E>(executor: E, update: FinishStep<'_>) -> Result<(), sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query(
        r#"
        UPDATE step_executions
        SET
            status = $2,
            completed_at = NOW(),
            duration_ms = $3,
            command_executed = COALESCE($4, command_executed),
            stdout = $5,
            stderr = $6,
            exit_code = $7,
            http_status_code = $8,
            http_response_body = $9,
            retry_attempt = $10,
            error_type = $11,
            error_message = $12
        WHERE id = $1
        "#,
    )
    .bind(update.step_execution_id)
    .bind(update.status)
    .bind(update.duration_ms)
    .bind(update.command_executed)
    .bind(update.stdout)
    .bind(update.stderr)
    .bind(update.exit_code)
    .bind(update.http_status_code)
    .bind(update.http_response_body)
    .bind(update.retry_attempt)
    .bind(update.error_type)
    .bind(update.error_message)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn list_for_execution<'c, E>(
    executor: E,
    execution_id: Uuid,
) -> Result<Vec<StepExecution>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, StepExecution>(&format!(
        "SELECT {STEP_EXECUTION_COLUMNS} FROM step_executions \
         WHERE execution_id = $1 ORDER BY step_order, started_at"
    ))
    .bind(execution_id)
    .fetch_all(executor)
    .await
}
