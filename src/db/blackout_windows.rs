use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Executor, Postgres};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct BlackoutWindow {
    pub id: Uuid,
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub enabled: bool,
    pub scope: String,
    pub affected_categories: Vec<String>,
    pub affected_runbook_ids: Vec<Uuid>,
    pub reason: Option<String>,
}

const BLACKOUT_COLUMNS: &str = "id, name, start_time, end_time, enabled, scope, \
     affected_categories, affected_runbook_ids, reason";

pub async fn list_active<'c, E>(
    executor: E,
    now: DateTime<Utc>,
) -> Result<Vec<BlackoutWindow>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, BlackoutWindow>(&format!(
        "SELECT {BLACKOUT_COLUMNS} FROM blackout_windows \
         WHERE enabled AND start_time <= $1 AND end_time > $1 \
         ORDER BY end_time"
    ))
    .bind(now)
    .fetch_all(executor)
    .await
}

pub async fn list_upcoming<'c, E>(
    executor: E,
    now: DateTime<Utc>,
    until: DateTime<Utc>,
) -> Result<Vec<BlackoutWindow>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, BlackoutWindow>(&format!(
        "SELECT {BLACKOUT_COLUMNS} FROM blackout_windows \
         WHERE enabled AND start_time > $1 AND start_time <= $2 \
         ORDER BY start_time"
    ))
    .bind(now)
    .bind(until)
    .fetch_all(executor)
    .await
}

pub struct NewBlackoutWindow<'a> {
    pub name: &'a str,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub scope: &'a str,
    pub affected_categories: &'a [String],
    pub affected_runbook_ids: &'a [Uuid],
    pub reason: Option<&'a str>,
}

pub async fn insert_blackout<'c, E>(
    executor: E,
    window: NewBlackoutWindow<'_>,
) -> Result<BlackoutWindow, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, BlackoutWindow>(&format!(
        r#"
        INSERT INTO blackout_windows (
            name, start_time, end_time, scope, affected_categories,
            affected_runbook_ids, reason
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING {BLACKOUT_COLUMNS}
        "#
    ))
    .bind(window.name)
    .bind(window.start_time)
    .bind(window.end_time)
    .bind(window.scope)
    .bind(window.affected_categories)
    .bind(window.affected_runbook_ids)
    .bind(window.reason)
    .fetch_one(executor)
    .await
}

/// Lift a blackout early.
pub async fn disable_blackout<'c, E>(executor: E, blackout_id: Uuid) -> Result<bool, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let result = sqlx::query("UPDATE blackout_windows SET enabled = FALSE WHERE id = $1")
        .bind(blackout_id)
        .execute(executor)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn extend_blackout<'c, E>(
    executor: E,
    blackout_id: Uuid,
    new_end_time: DateTime<Utc>,
) -> Result<Option<BlackoutWindow>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, BlackoutWindow>(&format!(
        "UPDATE blackout_windows SET end_time = $2 WHERE id = $1 RETURNING {BLACKOUT_COLUMNS}"
    ))
    .bind(blackout_id)
    .bind(new_end_time)
    .fetch_optional(executor)
    .await
}
