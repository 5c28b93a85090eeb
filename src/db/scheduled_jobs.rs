use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::{Executor, Postgres};
use uuid::Uuid;

// key: scheduler-db -> durable time-based trigger rows
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ScheduledJob {
    pub id: Uuid,
    pub runbook_id: Uuid,
    pub name: String,
    pub description: String,
    pub schedule_type: String,
    pub cron_expression: Option<String>,
    pub interval_seconds: Option<i32>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub timezone: String,
    pub target_server_id: Option<Uuid>,
    pub execution_params: Value,
    pub max_instances: i32,
    pub misfire_grace_time: i32,
    pub coalesce_runs: bool,
    pub enabled: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_run_status: Option<String>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub run_count: i32,
    pub failure_count: i32,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ScheduleExecutionHistory {
    pub id: Uuid,
    pub scheduled_job_id: Uuid,
    pub runbook_execution_id: Option<Uuid>,
    pub scheduled_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: String,
    pub error_message: Option<String>,
    pub duration_ms: Option<i64>,
}

const JOB_COLUMNS: &str = "id, runbook_id, name, description, schedule_type, cron_expression, \
     interval_seconds, start_date, end_date, timezone, target_server_id, execution_params, \
     max_instances, misfire_grace_time, coalesce_runs, enabled, last_run_at, last_run_status, \
     next_run_at, run_count, failure_count";

const HISTORY_COLUMNS: &str = "id, scheduled_job_id, runbook_execution_id, scheduled_at, \
     executed_at, completed_at, status, error_message, duration_ms";

pub struct NewScheduledJob<'a> {
    pub runbook_id: Uuid,
    pub name: &'a str,
    pub description: &'a str,
    pub schedule_type: &'a str,
    pub cron_expression: Option<&'a str>,
    pub interval_seconds: Option<i32>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub timezone: &'a str,
    pub target_server_id: Option<Uuid>,
    pub execution_params: &'a Value,
    pub max_instances: i32,
    pub misfire_grace_time: i32,
    pub coalesce_runs: bool,
    pub enabled: bool,
}

pub async fn insert_job<'c, E>(
    executor: E,
    job: NewScheduledJob<'_>,
) -> Result<ScheduledJob, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, ScheduledJob>(&format!(
        r#"
        INSERT INTO scheduled_jobs (
            runbook_id, name, description, schedule_type, cron_expression, interval_seconds,
            start_date, end_date, timezone, target_server_id, execution_params,
            max_instances, misfire_grace_time, coalesce_runs, enabled
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        RETURNING {JOB_COLUMNS}
        "#
    ))
    .bind(job.runbook_id)
    .bind(job.name)
    .bind(job.description)
    .bind(job.schedule_type)
    .bind(job.cron_expression)
    .bind(job.interval_seconds)
    .bind(job.start_date)
    .bind(job.end_date)
    .bind(job.timezone)
    .bind(job.target_server_id)
    .bind(job.execution_params)
    .bind(job.max_instances)
    .bind(job.misfire_grace_time)
    .bind(job.coalesce_runs)
    .bind(job.enabled)
    .fetch_one(executor)
    .await
}

pub async fn get_job<'c, E>(executor: E, job_id: Uuid) -> Result<Option<ScheduledJob>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, ScheduledJob>(&format!(
        "SELECT {JOB_COLUMNS} FROM scheduled_jobs WHERE id = $1"
    ))
    .bind(job_id)
    .fetch_optional(executor)
    .await
}

/// Due jobs locked for the firing transaction; `SKIP LOCKED` keeps a second
/// scheduler instance from double-firing.
pub async fn list_due_for_update(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<ScheduledJob>, sqlx::Error> {
    sqlx::query_as::<_, ScheduledJob>(&format!(
        "SELECT {JOB_COLUMNS} FROM scheduled_jobs \
         WHERE enabled AND next_run_at IS NOT NULL AND next_run_at <= $1 \
         ORDER BY next_run_at \
         FOR UPDATE SKIP LOCKED \
         LIMIT $2"
    ))
    .bind(now)
    .bind(limit)
    .fetch_all(&mut **tx)
    .await
}

/// Enabled jobs that have never been scheduled (fresh rows, or rows whose
/// one-shot date fired). The scheduler computes their first `next_run_at`.
pub async fn list_unscheduled<'c, E>(executor: E, limit: i64) -> Result<Vec<ScheduledJob>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, ScheduledJob>(&format!(
        "SELECT {JOB_COLUMNS} FROM scheduled_jobs \
         WHERE enabled AND next_run_at IS NULL \
         ORDER BY created_at \
         LIMIT $1"
    ))
    .bind(limit)
    .fetch_all(executor)
    .await
}

pub async fn set_next_run<'c, E>(
    executor: E,
    job_id: Uuid,
    next_run_at: Option<DateTime<Utc>>,
) -> Result<(), sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query(
        "UPDATE scheduled_jobs SET next_run_at = $2, updated_at = NOW() WHERE id = $1",
    )
    .bind(job_id)
    .bind(next_run_at)
    .execute(executor)
    .await?;
    Ok(())
}

/// Persist a fire outcome atomically with the new `next_run_at`.
pub async fn record_fire<'c, E>(
    executor: E,
    job_id: Uuid,
    fired_at: DateTime<Utc>,
    status: &str,
    next_run_at: Option<DateTime<Utc>>,
    failed: bool,
) -> Result<(), sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query(
        r#"
        UPDATE scheduled_jobs
        SET
            last_run_at = $2,
            last_run_status = $3,
            next_run_at = $4,
            run_count = run_count + CASE WHEN $5 THEN 0 ELSE 1 END,
            failure_count = failure_count + CASE WHEN $5 THEN 1 ELSE 0 END,
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(job_id)
    .bind(fired_at)
    .bind(status)
    .bind(next_run_at)
    .bind(failed)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn set_enabled<'c, E>(executor: E, job_id: Uuid, enabled: bool) -> Result<bool, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let result = sqlx::query(
        "UPDATE scheduled_jobs SET enabled = $2, updated_at = NOW() WHERE id = $1",
    )
    .bind(job_id)
    .bind(enabled)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn delete_job<'c, E>(executor: E, job_id: Uuid) -> Result<bool, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let result = sqlx::query("DELETE FROM scheduled_jobs WHERE id = $1")
        .bind(job_id)
        .execute(executor)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub struct NewHistoryEntry<'a> {
    pub scheduled_job_id: Uuid,
    pub runbook_execution_id: Option<Uuid>,
    pub scheduled_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: &'a str,
    pub error_message: Option<&'a str>,
    pub duration_ms: Option<i64>,
}

pub async fn insert_history<'c, E>(
    executor: E,
    entry: NewHistoryEntry<'_>,
) -> Result<(), sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO schedule_execution_history (
            scheduled_job_id, runbook_execution_id, scheduled_at, executed_at,
            completed_at, status, error_message, duration_ms
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(entry.scheduled_job_id)
    .bind(entry.runbook_execution_id)
    .bind(entry.scheduled_at)
    .bind(entry.executed_at)
    .bind(entry.completed_at)
    .bind(entry.status)
    .bind(entry.error_message)
    .bind(entry.duration_ms)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn list_history<'c, E>(
    executor: E,
    scheduled_job_id: Uuid,
    limit: i64,
) -> Result<Vec<ScheduleExecutionHistory>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, ScheduleExecutionHistory>(&format!(
        "SELECT {HISTORY_COLUMNS} FROM schedule_execution_history \
         WHERE scheduled_job_id = $1 ORDER BY scheduled_at DESC LIMIT $2"
    ))
    .bind(scheduled_job_id)
    .bind(limit)
    .fetch_all(executor)
    .await
}
