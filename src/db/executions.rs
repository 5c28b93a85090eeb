use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::{Executor, PgPool, Postgres};
use uuid::Uuid;

// key: execution-db -> runbook execution state machine rows
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct RunbookExecution {
    pub id: Uuid,
    pub runbook_id: Uuid,
    pub runbook_version: i32,
    pub trigger_id: Option<Uuid>,
    pub alert_id: Option<Uuid>,
    pub server_id: Option<Uuid>,
    pub scheduled_job_id: Option<Uuid>,
    pub execution_mode: String,
    pub status: String,
    pub triggered_by_system: bool,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub steps_total: i32,
    pub steps_completed: i32,
    pub steps_failed: i32,
    pub dry_run: bool,
    pub variables: Value,
    pub result_summary: Option<String>,
    pub error_message: Option<String>,
    pub rollback_executed: bool,
    pub approval_required: bool,
    pub approval_token: Option<String>,
    pub approval_requested_at: Option<DateTime<Utc>>,
    pub approval_expires_at: Option<DateTime<Utc>>,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
}

const EXECUTION_COLUMNS: &str = "id, runbook_id, runbook_version, trigger_id, alert_id, \
     server_id, scheduled_job_id, execution_mode, status, triggered_by_system, queued_at, \
     started_at, completed_at, steps_total, steps_completed, steps_failed, dry_run, variables, \
     result_summary, error_message, rollback_executed, approval_required, approval_token, \
     approval_requested_at, approval_expires_at, approved_by, approved_at, rejection_reason";

pub struct NewExecution<'a> {
    pub runbook_id: Uuid,
    pub runbook_version: i32,
    pub trigger_id: Option<Uuid>,
    pub alert_id: Option<Uuid>,
    pub server_id: Option<Uuid>,
    pub scheduled_job_id: Option<Uuid>,
    pub execution_mode: &'a str,
    pub status: &'a str,
    pub triggered_by_system: bool,
    pub dry_run: bool,
    pub variables: &'a Value,
    pub approval_required: bool,
    pub approval_token: Option<&'a str>,
    pub approval_expires_at: Option<DateTime<Utc>>,
}

pub async fn insert_execution<'c, E>(
    executor: E,
    execution: NewExecution<'_>,
) -> Result<RunbookExecution, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, RunbookExecution>(&format!(
        r#"
        INSERT INTO runbook_executions (
            runbook_id, runbook_version, trigger_id, alert_id, server_id, scheduled_job_id,
            execution_mode, status, triggered_by_system, dry_run, variables,
            approval_required, approval_token, approval_requested_at, approval_expires_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                CASE WHEN $12 THEN NOW() END, $14)
        RETURNING {EXECUTION_COLUMNS}
        "#
    ))
    .bind(execution.runbook_id)
    .bind(execution.runbook_version)
    .bind(execution.trigger_id)
    .bind(execution.alert_id)
    .bind(execution.server_id)
    .bind(execution.scheduled_job_id)
    .bind(execution.execution_mode)
    .bind(execution.status)
    .bind(execution.triggered_by_system)
    .bind(execution.dry_run)
    .bind(execution.variables)
    .bind(execution.approval_required)
    .bind(execution.approval_token)
    .bind(execution.approval_expires_at)
    .fetch_one(executor)
    .await
}

pub async fn get_execution<'c, E>(
    executor: E,
    execution_id: Uuid,
) -> Result<Option<RunbookExecution>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, RunbookExecution>(&format!(
        "SELECT {EXECUTION_COLUMNS} FROM runbook_executions WHERE id = $1"
    ))
    .bind(execution_id)
    .fetch_optional(executor)
    .await
}

pub async fn get_execution_for_update(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    execution_id: Uuid,
) -> Result<Option<RunbookExecution>, sqlx::Error> {
    sqlx::query_as::<_, RunbookExecution>(&format!(
        "SELECT {EXECUTION_COLUMNS} FROM runbook_executions WHERE id = $1 FOR UPDATE"
    ))
    .bind(execution_id)
    .fetch_optional(&mut **tx)
    .await
}

/// Claim a batch of ready executions for the worker. The fetch and the
/// transition to `running` happen in one statement with `FOR UPDATE SKIP
/// LOCKED`, so concurrent workers never double-claim a row.
pub async fn claim_ready_executions<'c, E>(
    executor: E,
    limit: i64,
) -> Result<Vec<RunbookExecution>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, RunbookExecution>(&format!(
        r#"
        WITH candidate AS (
            SELECT id
            FROM runbook_executions
            WHERE status IN ('queued', 'approved')
              AND completed_at IS NULL
            ORDER BY queued_at
            FOR UPDATE SKIP LOCKED
            LIMIT $1
        )
        UPDATE runbook_executions AS executions
        SET status = 'running', started_at = NOW()
        FROM candidate
        WHERE executions.id = candidate.id
        RETURNING {EXECUTION_COLUMNS}
        "#
    ))
    .bind(limit)
    .fetch_all(executor)
    .await
}

pub async fn set_steps_total<'c, E>(
    executor: E,
    execution_id: Uuid,
    steps_total: i32,
) -> Result<(), sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query("UPDATE runbook_executions SET steps_total = $2 WHERE id = $1")
        .bind(execution_id)
        .bind(steps_total)
        .execute(executor)
        .await?;
    Ok(())
}

pub async fn update_progress<'c, E>(
    executor: E,
    execution_id: Uuid,
    steps_completed: i32,
    steps_failed: i32,
) -> Result<(), sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query(
        "UPDATE runbook_executions SET steps_completed = $2, steps_failed = $3 WHERE id = $1",
    )
    .bind(execution_id)
    .bind(steps_completed)
    .bind(steps_failed)
    .execute(executor)
    .await?;
    Ok(())
}

pub struct CompleteExecution<'a> {
    pub execution_id: Uuid,
    pub status: &'a str,
    pub result_summary: Option<&'a str>,
    pub error_message: Option<&'a str>,
    pub rollback_executed: bool,
    pub variables: Option<&'a Value>,
}

/// Terminal transition out of `running`. The guard keeps completion
/// at-most-once: a second caller sees zero rows updated.
pub async fn complete_execution<'c, E>(
    executor: E,
    update: CompleteExecution<'_>,
) -> Result<Option<RunbookExecution>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, RunbookExecution>(&format!(
        r#"
        UPDATE runbook_executions
        SET
            status = $2,
            result_summary = COALESCE($3, result_summary),
            error_message = COALESCE($4, error_message),
            rollback_executed = $5,
            variables = COALESCE($6, variables),
            completed_at = NOW()
        WHERE id = $1
          AND status = 'running'
        RETURNING {EXECUTION_COLUMNS}
        "#
    ))
    .bind(update.execution_id)
    .bind(update.status)
    .bind(update.result_summary)
    .bind(update.error_message)
    .bind(update.rollback_executed)
    .bind(update.variables)
    .fetch_optional(executor)
    .await
}

/// Fail an execution that never became runnable (missing runbook or server).
pub async fn fail_before_start<'c, E>(
    executor: E,
    execution_id: Uuid,
    error_message: &str,
) -> Result<(), sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query(
        "UPDATE runbook_executions \
         SET status = 'failed', error_message = $2, completed_at = NOW() \
         WHERE id = $1 AND completed_at IS NULL",
    )
    .bind(execution_id)
    .bind(error_message)
    .execute(executor)
    .await?;
    Ok(())
}

/// User cancel for executions that have not started running. Running
/// executions are cancelled through the engine's cancel flag instead.
pub async fn cancel_if_not_started<'c, E>(
    executor: E,
    execution_id: Uuid,
    reason: &str,
) -> Result<bool, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let result = sqlx::query(
        "UPDATE runbook_executions \
         SET status = 'cancelled', error_message = $2, completed_at = NOW() \
         WHERE id = $1 AND status IN ('queued', 'pending', 'approved')",
    )
    .bind(execution_id)
    .bind(reason)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Lapsed-approval sweep: `pending` past its expiry becomes `expired`. The
/// worker runs this every poll; approve/reject apply the same transition
/// inline when they race a lapsed window.
pub async fn expire_pending_approvals<'c, E>(executor: E) -> Result<u64, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let result = sqlx::query(
        "UPDATE runbook_executions \
         SET status = 'expired', completed_at = NOW(), \
             error_message = 'Approval expired before a decision was made' \
         WHERE status = 'pending' \
           AND approval_expires_at IS NOT NULL \
           AND approval_expires_at < NOW()",
    )
    .execute(executor)
    .await?;
    Ok(result.rows_affected())
}

pub async fn count_queued_since<'c, E>(
    executor: E,
    runbook_id: Uuid,
    since: DateTime<Utc>,
) -> Result<i64, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_scalar(
        "SELECT COUNT(*) FROM runbook_executions WHERE runbook_id = $1 AND queued_at >= $2",
    )
    .bind(runbook_id)
    .bind(since)
    .fetch_one(executor)
    .await
}

pub async fn oldest_queued_since<'c, E>(
    executor: E,
    runbook_id: Uuid,
    since: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_scalar(
        "SELECT MIN(queued_at) FROM runbook_executions \
         WHERE runbook_id = $1 AND queued_at >= $2",
    )
    .bind(runbook_id)
    .bind(since)
    .fetch_one(executor)
    .await
}

pub async fn last_queued_at<'c, E>(
    executor: E,
    runbook_id: Uuid,
) -> Result<Option<DateTime<Utc>>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_scalar(
        "SELECT MAX(queued_at) FROM runbook_executions WHERE runbook_id = $1",
    )
    .bind(runbook_id)
    .fetch_one(executor)
    .await
}

/// Statuses of the most recent non-dry-run executions, newest first. Feeds
/// the ranker's historical success score.
pub async fn recent_statuses(
    pool: &PgPool,
    runbook_id: Uuid,
    limit: i64,
) -> Result<Vec<String>, sqlx::Error> {
    sqlx::query_scalar(
        "SELECT status FROM runbook_executions \
         WHERE runbook_id = $1 AND NOT dry_run \
         ORDER BY queued_at DESC \
         LIMIT $2",
    )
    .bind(runbook_id)
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// Non-terminal executions created by one scheduled job; bounds
/// `max_instances`.
pub async fn count_active_for_job<'c, E>(
    executor: E,
    scheduled_job_id: Uuid,
) -> Result<i64, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_scalar(
        "SELECT COUNT(*) FROM runbook_executions \
         WHERE scheduled_job_id = $1 \
           AND status IN ('queued', 'pending', 'approved', 'running')",
    )
    .bind(scheduled_job_id)
    .fetch_one(executor)
    .await
}
