use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use tracing::{info, warn};

use crate::db::alerts::{upsert_alert, Alert, UpsertAlert};
use crate::error::AppResult;
use crate::triggers;

const SEVERITIES: &[&str] = &["critical", "warning", "info"];

/// Webhook-shaped alert batch handed over by the ingestion collaborator.
#[derive(Debug, Clone, Deserialize)]
pub struct AlertWebhookBatch {
    #[serde(default)]
    pub receiver: Option<String>,
    pub status: String,
    pub alerts: Vec<WebhookAlert>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookAlert {
    pub status: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    #[serde(rename = "startsAt", default)]
    pub starts_at: Option<DateTime<Utc>>,
    #[serde(rename = "endsAt", default)]
    pub ends_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub fingerprint: Option<String>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct IngestSummary {
    pub received: usize,
    pub upserted: usize,
    pub matched: usize,
    pub auto_queued: usize,
    pub pending_approval: usize,
    pub blocked: usize,
}

// key: alert-ingestion -> fingerprint upsert + matcher fan-in

/// Accept a batch: upsert every alert by fingerprint, then hand firing
/// alerts to the trigger matcher. Resolved alerts only update state.
pub async fn ingest_alert_batch(
    pool: &PgPool,
    batch: &AlertWebhookBatch,
) -> AppResult<IngestSummary> {
    let mut summary = IngestSummary {
        received: batch.alerts.len(),
        ..Default::default()
    };

    for incoming in &batch.alerts {
        let fingerprint = incoming
            .fingerprint
            .clone()
            .unwrap_or_else(|| label_fingerprint(&incoming.labels));
        let alert = match upsert_incoming(pool, incoming, &fingerprint).await {
            Ok(alert) => alert,
            Err(err) => {
                warn!(?err, %fingerprint, "alert upsert failed");
                continue;
            }
        };
        summary.upserted += 1;

        if alert.status == "firing" {
            let outcome = triggers::process_alert(pool, &alert).await?;
            summary.matched += outcome.matches_found;
            summary.auto_queued += outcome.auto_queued.len();
            summary.pending_approval += outcome.pending_approval.len();
            summary.blocked += outcome.blocked.len();
        }
    }

    info!(
        receiver = batch.receiver.as_deref().unwrap_or("-"),
        received = summary.received,
        upserted = summary.upserted,
        auto = summary.auto_queued,
        pending = summary.pending_approval,
        "alert batch ingested"
    );
    Ok(summary)
}

/// Stable fallback dedup key for senders that omit a fingerprint: a digest
/// over the sorted label set, the same identity Alertmanager derives.
fn label_fingerprint(labels: &HashMap<String, String>) -> String {
    let mut pairs: Vec<(&String, &String)> = labels.iter().collect();
    pairs.sort();
    let mut hasher = Sha256::new();
    for (key, value) in pairs {
        hasher.update(key.as_bytes());
        hasher.update([0u8]);
        hasher.update(value.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(&hasher.finalize()[..16])
}

async fn upsert_incoming(
    pool: &PgPool,
    incoming: &WebhookAlert,
    fingerprint: &str,
) -> AppResult<Alert> {
    let alert_name = incoming
        .labels
        .get("alertname")
        .cloned()
        .unwrap_or_else(|| "unknown".to_string());
    let severity = normalize_severity(incoming.labels.get("severity").map(String::as_str));
    let status = if incoming.status == "resolved" {
        "resolved"
    } else {
        "firing"
    };
    let timestamp = match status {
        "resolved" => incoming.ends_at.or(incoming.starts_at),
        _ => incoming.starts_at,
    }
    .unwrap_or_else(Utc::now);

    let labels = json!(incoming.labels);
    let annotations = json!(incoming.annotations);
    let alert = upsert_alert(
        pool,
        UpsertAlert {
            fingerprint,
            alert_name: &alert_name,
            severity,
            status,
            instance: incoming.labels.get("instance").map(String::as_str).unwrap_or(""),
            job: incoming.labels.get("job").map(String::as_str).unwrap_or(""),
            source: "webhook",
            timestamp,
            labels: &labels,
            annotations: &annotations,
        },
    )
    .await?;
    Ok(alert)
}

fn normalize_severity(raw: Option<&str>) -> &'static str {
    match raw {
        Some(value) => SEVERITIES
            .iter()
            .find(|known| value.eq_ignore_ascii_case(known))
            .copied()
            .unwrap_or("warning"),
        None => "warning",
    }
}
