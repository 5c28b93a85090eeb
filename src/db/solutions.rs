use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Executor, PgPool, Postgres, Row};
use std::collections::HashMap;
use uuid::Uuid;

// key: learning-db -> proven solutions, clicks, feedback
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SolutionOutcome {
    pub id: Uuid,
    pub problem_description: String,
    pub problem_embedding: Option<Vec<f32>>,
    pub alert_id: Option<Uuid>,
    pub server_id: Option<Uuid>,
    pub solution_type: String,
    pub solution_reference: String,
    pub solution_summary: String,
    pub success: bool,
    pub auto_detected: bool,
    pub recorded_at: DateTime<Utc>,
}

pub struct NewSolutionOutcome<'a> {
    pub problem_description: &'a str,
    pub problem_embedding: Option<&'a [f32]>,
    pub alert_id: Option<Uuid>,
    pub server_id: Option<Uuid>,
    pub solution_type: &'a str,
    pub solution_reference: &'a str,
    pub solution_summary: &'a str,
    pub success: bool,
    pub auto_detected: bool,
}

pub async fn insert_outcome<'c, E>(
    executor: E,
    outcome: NewSolutionOutcome<'_>,
) -> Result<Uuid, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_scalar(
        r#"
        INSERT INTO solution_outcomes (
            problem_description, problem_embedding, alert_id, server_id,
            solution_type, solution_reference, solution_summary, success, auto_detected
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        RETURNING id
        "#,
    )
    .bind(outcome.problem_description)
    .bind(outcome.problem_embedding)
    .bind(outcome.alert_id)
    .bind(outcome.server_id)
    .bind(outcome.solution_type)
    .bind(outcome.solution_reference)
    .bind(outcome.solution_summary)
    .bind(outcome.success)
    .bind(outcome.auto_detected)
    .fetch_one(executor)
    .await
}

pub async fn record_click<'c, E>(
    executor: E,
    runbook_id: Uuid,
    clicked_by: Option<&str>,
) -> Result<(), sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query("INSERT INTO runbook_clicks (runbook_id, clicked_by) VALUES ($1, $2)")
        .bind(runbook_id)
        .bind(clicked_by)
        .execute(executor)
        .await?;
    Ok(())
}

pub async fn record_feedback<'c, E>(
    executor: E,
    runbook_id: Uuid,
    thumbs_up: bool,
    submitted_by: Option<&str>,
) -> Result<(), sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query(
        "INSERT INTO runbook_feedback (runbook_id, thumbs_up, submitted_by) VALUES ($1, $2, $3)",
    )
    .bind(runbook_id)
    .bind(thumbs_up)
    .bind(submitted_by)
    .execute(executor)
    .await?;
    Ok(())
}

/// Click counts per runbook since a cutoff, for the popularity bonus.
pub async fn click_counts_since(
    pool: &PgPool,
    runbook_ids: &[Uuid],
    since: DateTime<Utc>,
) -> Result<HashMap<Uuid, i64>, sqlx::Error> {
    if runbook_ids.is_empty() {
        return Ok(HashMap::new());
    }
    let rows = sqlx::query(
        "SELECT runbook_id, COUNT(*) AS clicks \
         FROM runbook_clicks \
         WHERE runbook_id = ANY($1) AND clicked_at >= $2 \
         GROUP BY runbook_id",
    )
    .bind(runbook_ids)
    .bind(since)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| (row.get("runbook_id"), row.get("clicks")))
        .collect())
}

/// `(thumbs_up, thumbs_down)` totals per runbook, for the feedback bonus.
pub async fn feedback_totals(
    pool: &PgPool,
    runbook_ids: &[Uuid],
) -> Result<HashMap<Uuid, (i64, i64)>, sqlx::Error> {
    if runbook_ids.is_empty() {
        return Ok(HashMap::new());
    }
    let rows = sqlx::query(
        "SELECT runbook_id, \
                COUNT(*) FILTER (WHERE thumbs_up) AS ups, \
                COUNT(*) FILTER (WHERE NOT thumbs_up) AS downs \
         FROM runbook_feedback \
         WHERE runbook_id = ANY($1) \
         GROUP BY runbook_id",
    )
    .bind(runbook_ids)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| (row.get("runbook_id"), (row.get("ups"), row.get("downs"))))
        .collect())
}
