use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Executor, Postgres};
use uuid::Uuid;

// key: breaker-db -> per-runbook failure accounting
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct CircuitBreaker {
    pub id: Uuid,
    pub scope: String,
    pub scope_id: Uuid,
    pub state: String,
    pub failure_count: i32,
    pub success_count: i32,
    pub failure_threshold: i32,
    pub success_threshold: i32,
    pub open_duration_minutes: i32,
    pub opened_at: Option<DateTime<Utc>>,
    pub closes_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub manually_opened: bool,
    pub manually_opened_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

const BREAKER_COLUMNS: &str = "id, scope, scope_id, state, failure_count, success_count, \
     failure_threshold, success_threshold, open_duration_minutes, opened_at, closes_at, \
     last_failure_at, last_success_at, manually_opened, manually_opened_reason, updated_at";

pub async fn ensure_breaker<'c, E>(executor: E, runbook_id: Uuid) -> Result<(), sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query(
        "INSERT INTO circuit_breakers (scope, scope_id) VALUES ('runbook', $1) \
         ON CONFLICT (scope, scope_id) DO NOTHING",
    )
    .bind(runbook_id)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn get_breaker<'c, E>(
    executor: E,
    runbook_id: Uuid,
) -> Result<Option<CircuitBreaker>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, CircuitBreaker>(&format!(
        "SELECT {BREAKER_COLUMNS} FROM circuit_breakers \
         WHERE scope = 'runbook' AND scope_id = $1"
    ))
    .bind(runbook_id)
    .fetch_optional(executor)
    .await
}

/// Row lock for the read-modify-write transition transactions; state reads
/// that gate executions and updates that record outcomes must not interleave.
pub async fn get_breaker_for_update(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    runbook_id: Uuid,
) -> Result<Option<CircuitBreaker>, sqlx::Error> {
    sqlx::query_as::<_, CircuitBreaker>(&format!(
        "SELECT {BREAKER_COLUMNS} FROM circuit_breakers \
         WHERE scope = 'runbook' AND scope_id = $1 FOR UPDATE"
    ))
    .bind(runbook_id)
    .fetch_optional(&mut **tx)
    .await
}

pub struct BreakerUpdate<'a> {
    pub state: &'a str,
    pub failure_count: i32,
    pub success_count: i32,
    pub opened_at: Option<DateTime<Utc>>,
    pub closes_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub manually_opened: bool,
    pub manually_opened_reason: Option<&'a str>,
}

pub async fn update_breaker<'c, E>(
    executor: E,
    breaker_id: Uuid,
    update: BreakerUpdate<'_>,
) -> Result<(), sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query(
        r#"
        UPDATE circuit_breakers
        SET
            state = $2,
            failure_count = $3,
            success_count = $4,
            opened_at = $5,
            closes_at = $6,
            last_failure_at = $7,
            last_success_at = $8,
            manually_opened = $9,
            manually_opened_reason = $10,
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(breaker_id)
    .bind(update.state)
    .bind(update.failure_count)
    .bind(update.success_count)
    .bind(update.opened_at)
    .bind(update.closes_at)
    .bind(update.last_failure_at)
    .bind(update.last_success_at)
    .bind(update.manually_opened)
    .bind(update.manually_opened_reason)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn set_thresholds<'c, E>(
    executor: E,
    runbook_id: Uuid,
    failure_threshold: i32,
    success_threshold: i32,
    open_duration_minutes: i32,
) -> Result<(), sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query(
        "UPDATE circuit_breakers \
         SET failure_threshold = $2, success_threshold = $3, open_duration_minutes = $4, \
             updated_at = NOW() \
         WHERE scope = 'runbook' AND scope_id = $1",
    )
    .bind(runbook_id)
    .bind(failure_threshold)
    .bind(success_threshold)
    .bind(open_duration_minutes)
    .execute(executor)
    .await?;
    Ok(())
}
