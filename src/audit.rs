use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

// key: audit-sink -> execution transition trail
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ExecutionAuditEvent {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub from_status: Option<String>,
    pub to_status: String,
    pub detail: Option<Value>,
    pub occurred_at: DateTime<Utc>,
}

/// Fire-and-forget transition record. Audit failures are logged and
/// swallowed; they never alter execution outcomes.
pub async fn record_transition(
    pool: &PgPool,
    execution_id: Uuid,
    from_status: Option<&str>,
    to_status: &str,
    detail: Option<&Value>,
) {
    let result = sqlx::query(
        "INSERT INTO execution_audit_events (execution_id, from_status, to_status, detail) \
         VALUES ($1, $2, $3, $4)",
    )
    .bind(execution_id)
    .bind(from_status)
    .bind(to_status)
    .bind(detail)
    .execute(pool)
    .await;

    if let Err(err) = result {
        warn!(?err, %execution_id, %to_status, "failed to record audit transition");
    }
}

pub async fn list_events(
    pool: &PgPool,
    execution_id: Uuid,
) -> Result<Vec<ExecutionAuditEvent>, sqlx::Error> {
    sqlx::query_as::<_, ExecutionAuditEvent>(
        "SELECT id, execution_id, from_status, to_status, detail, occurred_at \
         FROM execution_audit_events \
         WHERE execution_id = $1 \
         ORDER BY occurred_at",
    )
    .bind(execution_id)
    .fetch_all(pool)
    .await
}
