use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::{Executor, Postgres};
use uuid::Uuid;

// key: alert-db -> fingerprint-deduplicated fault records
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Alert {
    pub id: Uuid,
    pub fingerprint: String,
    pub alert_name: String,
    pub severity: String,
    pub status: String,
    pub instance: String,
    pub job: String,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub labels: Value,
    pub annotations: Value,
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const ALERT_COLUMNS: &str = "id, fingerprint, alert_name, severity, status, instance, job, \
     source, timestamp, labels, annotations, embedding, created_at, updated_at";

pub struct UpsertAlert<'a> {
    pub fingerprint: &'a str,
    pub alert_name: &'a str,
    pub severity: &'a str,
    pub status: &'a str,
    pub instance: &'a str,
    pub job: &'a str,
    pub source: &'a str,
    pub timestamp: DateTime<Utc>,
    pub labels: &'a Value,
    pub annotations: &'a Value,
}

/// Insert or update by fingerprint. A repeated fingerprint updates the
/// existing row; a `resolved` row stays resolved unless the incoming event
/// is a strictly newer `firing` occurrence.
pub async fn upsert_alert<'c, E>(
    executor: E,
    alert: UpsertAlert<'_>,
) -> Result<Alert, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, Alert>(&format!(
        r#"
        INSERT INTO alerts (fingerprint, alert_name, severity, status, instance, job, source, timestamp, labels, annotations)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT (fingerprint) DO UPDATE
        SET
            alert_name = EXCLUDED.alert_name,
            severity = EXCLUDED.severity,
            status = CASE
                WHEN EXCLUDED.status = 'resolved' THEN 'resolved'
                WHEN alerts.status = 'resolved' AND EXCLUDED.timestamp > alerts.timestamp THEN EXCLUDED.status
                WHEN alerts.status = 'resolved' THEN alerts.status
                ELSE EXCLUDED.status
            END,
            instance = EXCLUDED.instance,
            job = EXCLUDED.job,
            source = EXCLUDED.source,
            timestamp = GREATEST(alerts.timestamp, EXCLUDED.timestamp),
            labels = EXCLUDED.labels,
            annotations = EXCLUDED.annotations,
            updated_at = NOW()
        RETURNING {ALERT_COLUMNS}
        "#
    ))
    .bind(alert.fingerprint)
    .bind(alert.alert_name)
    .bind(alert.severity)
    .bind(alert.status)
    .bind(alert.instance)
    .bind(alert.job)
    .bind(alert.source)
    .bind(alert.timestamp)
    .bind(alert.labels)
    .bind(alert.annotations)
    .fetch_one(executor)
    .await
}

pub async fn get_alert<'c, E>(executor: E, alert_id: Uuid) -> Result<Option<Alert>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, Alert>(&format!(
        "SELECT {ALERT_COLUMNS} FROM alerts WHERE id = $1"
    ))
    .bind(alert_id)
    .fetch_optional(executor)
    .await
}

/// One-way transition used after a successful remediation.
pub async fn mark_resolved<'c, E>(executor: E, alert_id: Uuid) -> Result<bool, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let result = sqlx::query(
        "UPDATE alerts SET status = 'resolved', updated_at = NOW() \
         WHERE id = $1 AND status <> 'resolved'",
    )
    .bind(alert_id)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn set_embedding<'c, E>(
    executor: E,
    alert_id: Uuid,
    embedding: &[f32],
) -> Result<(), sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query("UPDATE alerts SET embedding = $2, updated_at = NOW() WHERE id = $1")
        .bind(alert_id)
        .bind(embedding)
        .execute(executor)
        .await?;
    Ok(())
}
