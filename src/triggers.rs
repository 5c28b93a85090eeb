use std::collections::HashMap;

use regex::RegexBuilder;
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::PgPool;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::approvals::generate_approval_token;
use crate::db::alerts::Alert;
use crate::db::executions::{insert_execution, NewExecution, RunbookExecution};
use crate::db::runbooks::{get_runbook, list_active_triggers, Runbook, RunbookTrigger};
use crate::db::servers::find_server_by_name_or_hostname;
use crate::error::AppResult;
use crate::safety;

const DEFAULT_APPROVAL_TIMEOUT_MINUTES: i64 = 240;

/// One trigger that matched an alert, with everything needed to act on it.
#[derive(Debug, Clone, Serialize)]
pub struct TriggerMatch {
    pub trigger: RunbookTrigger,
    pub runbook: Runbook,
    pub matched_conditions: Vec<String>,
    pub extracted_variables: HashMap<String, String>,
    pub execution_mode: String,
    pub can_execute: bool,
    pub block_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MatchResult {
    pub alert_id: Uuid,
    pub matches: Vec<TriggerMatch>,
    pub auto_execute: Vec<TriggerMatch>,
    pub needs_approval: Vec<TriggerMatch>,
    pub blocked: Vec<(TriggerMatch, String)>,
}

/// Aggregate outcome of processing one alert through the matcher.
#[derive(Debug, Default, Clone, Serialize)]
pub struct ProcessOutcome {
    pub matches_found: usize,
    pub auto_queued: Vec<Uuid>,
    pub pending_approval: Vec<Uuid>,
    pub blocked: Vec<(Uuid, String)>,
    pub manual_only: Vec<Uuid>,
}

// key: trigger-matcher -> alert-to-runbook binding

/// Find all triggers matching an alert, deduplicated per runbook by lowest
/// priority number, each annotated with its execution mode and safety-gate
/// verdict.
pub async fn match_alert(pool: &PgPool, alert: &Alert) -> AppResult<MatchResult> {
    let triggers = list_active_triggers(pool).await?;
    let mut runbook_cache: HashMap<Uuid, Runbook> = HashMap::new();
    let mut matches: Vec<TriggerMatch> = Vec::new();

    for trigger in triggers {
        let Some(details) = evaluate_conditions(&trigger, alert) else {
            continue;
        };

        let runbook = match runbook_cache.get(&trigger.runbook_id) {
            Some(runbook) => runbook.clone(),
            None => match get_runbook(pool, trigger.runbook_id).await? {
                Some(runbook) => {
                    runbook_cache.insert(runbook.id, runbook.clone());
                    runbook
                }
                None => continue,
            },
        };

        let (allowed, reasons) = safety::check_can_execute(pool, &runbook).await?;

        let execution_mode = if runbook.auto_execute {
            "auto"
        } else if runbook.approval_required {
            "semi_auto"
        } else {
            "manual"
        };

        matches.push(TriggerMatch {
            trigger,
            runbook,
            matched_conditions: details.matched_conditions,
            extracted_variables: details.extracted_variables,
            execution_mode: execution_mode.to_string(),
            can_execute: allowed,
            block_reason: reasons.first().cloned(),
        });
    }

    // One winner per runbook: the trigger with the lowest priority number.
    let mut unique: HashMap<Uuid, TriggerMatch> = HashMap::new();
    for candidate in matches {
        match unique.get(&candidate.runbook.id) {
            Some(existing) if existing.trigger.priority <= candidate.trigger.priority => {}
            _ => {
                unique.insert(candidate.runbook.id, candidate);
            }
        }
    }
    let matches: Vec<TriggerMatch> = unique.into_values().collect();

    let auto_execute = matches
        .iter()
        .filter(|candidate| candidate.execution_mode == "auto" && candidate.can_execute)
        .cloned()
        .collect();
    let needs_approval = matches
        .iter()
        .filter(|candidate| candidate.execution_mode == "semi_auto" && candidate.can_execute)
        .cloned()
        .collect();
    let blocked = matches
        .iter()
        .filter(|candidate| !candidate.can_execute)
        .map(|candidate| {
            (
                candidate.clone(),
                candidate
                    .block_reason
                    .clone()
                    .unwrap_or_else(|| "Unknown reason".to_string()),
            )
        })
        .collect();

    Ok(MatchResult {
        alert_id: alert.id,
        matches,
        auto_execute,
        needs_approval,
        blocked,
    })
}

/// Full alert processing: allowed auto matches become `queued` executions,
/// allowed semi-auto matches become `pending` ones with a fresh approval
/// token; manual matches are only surfaced.
pub async fn process_alert(pool: &PgPool, alert: &Alert) -> AppResult<ProcessOutcome> {
    let result = match_alert(pool, alert).await?;
    let mut outcome = ProcessOutcome {
        matches_found: result.matches.len(),
        ..Default::default()
    };

    for matched in &result.auto_execute {
        match create_execution(pool, matched, alert, "auto").await {
            Ok(execution) => outcome.auto_queued.push(execution.id),
            Err(err) => {
                error!(?err, runbook = %matched.runbook.name, "failed to queue auto execution");
                outcome
                    .blocked
                    .push((matched.runbook.id, err.to_string()));
            }
        }
    }

    for matched in &result.needs_approval {
        match create_execution(pool, matched, alert, "semi_auto").await {
            Ok(execution) => outcome.pending_approval.push(execution.id),
            Err(err) => {
                error!(?err, runbook = %matched.runbook.name, "failed to create pending approval");
                outcome
                    .blocked
                    .push((matched.runbook.id, err.to_string()));
            }
        }
    }

    for (matched, reason) in &result.blocked {
        outcome.blocked.push((matched.runbook.id, reason.clone()));
    }

    for matched in &result.matches {
        if matched.execution_mode == "manual" && matched.can_execute {
            outcome.manual_only.push(matched.runbook.id);
        }
    }

    info!(
        alert_id = %alert.id,
        matches = outcome.matches_found,
        auto = outcome.auto_queued.len(),
        pending = outcome.pending_approval.len(),
        blocked = outcome.blocked.len(),
        "alert processed for remediation"
    );
    Ok(outcome)
}

struct MatchDetails {
    matched_conditions: Vec<String>,
    extracted_variables: HashMap<String, String>,
}

/// Evaluate a trigger's pattern predicates against an alert. Patterns use
/// `*` as an any-substring wildcard, matching case-insensitively from the
/// start of the field; every configured predicate must hold.
fn evaluate_conditions(trigger: &RunbookTrigger, alert: &Alert) -> Option<MatchDetails> {
    let mut matched_conditions = Vec::new();
    let labels = json_string_map(&alert.labels);

    let fields = [
        ("alert_name", &trigger.alert_name_pattern, alert.alert_name.as_str()),
        ("severity", &trigger.severity_pattern, alert.severity.as_str()),
        ("instance", &trigger.instance_pattern, alert.instance.as_str()),
        ("job", &trigger.job_pattern, alert.job.as_str()),
    ];

    for (field, pattern, value) in fields {
        let Some(pattern) = pattern.as_deref() else {
            continue;
        };
        if pattern == "*" || pattern.is_empty() {
            continue;
        }
        match wildcard_match(pattern, value) {
            Some(true) => matched_conditions.push(format!("{field}: {value}")),
            Some(false) => return None,
            None => {
                error!(trigger_id = %trigger.id, %field, %pattern, "invalid trigger pattern");
                return None;
            }
        }
    }

    if let Some(matchers) = trigger.label_matchers.as_object() {
        for (key, expected) in matchers {
            let Some(actual) = labels.get(key) else {
                return None;
            };
            let expected = expected.as_str().unwrap_or_default();
            if expected != "*" && actual != expected {
                return None;
            }
        }
        if !matchers.is_empty() {
            matched_conditions.push("labels matched".to_string());
        }
    }

    let mut extracted_variables = HashMap::new();
    extracted_variables.insert("alert_id".to_string(), alert.id.to_string());
    extracted_variables.insert("alert_name".to_string(), alert.alert_name.clone());
    extracted_variables.insert("alert_severity".to_string(), alert.severity.clone());
    extracted_variables.insert("alert_instance".to_string(), alert.instance.clone());
    extracted_variables.insert("alert_job".to_string(), alert.job.clone());
    extracted_variables.insert("alert_source".to_string(), alert.source.clone());
    extracted_variables.insert("alert_timestamp".to_string(), alert.timestamp.to_rfc3339());
    for (key, value) in &labels {
        extracted_variables.insert(format!("alert_label_{key}"), value.clone());
    }

    Some(MatchDetails {
        matched_conditions,
        extracted_variables,
    })
}

/// `*` translates to `.*`; matching is anchored at the start of the value
/// and case-insensitive. `None` marks an unusable pattern.
fn wildcard_match(pattern: &str, value: &str) -> Option<bool> {
    let translated = pattern.replace('*', ".*");
    let regex = RegexBuilder::new(&format!("^(?:{translated})"))
        .case_insensitive(true)
        .build()
        .ok()?;
    Some(regex.is_match(value))
}

fn json_string_map(value: &Value) -> HashMap<String, String> {
    value
        .as_object()
        .map(|map| {
            map.iter()
                .map(|(key, entry)| {
                    let rendered = match entry {
                        Value::String(text) => text.clone(),
                        other => other.to_string(),
                    };
                    (key.clone(), rendered)
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Resolve the target server: an alert label names the host when
/// `target_from_alert` is set (any `:port` suffix stripped); otherwise, and
/// when the label is absent, the runbook's default server applies.
pub async fn resolve_target_server(
    pool: &PgPool,
    runbook: &Runbook,
    alert: &Alert,
) -> AppResult<Option<Uuid>> {
    if runbook.target_from_alert {
        if let Some(label) = runbook.target_alert_label.as_deref() {
            let labels = json_string_map(&alert.labels);
            if let Some(raw) = labels.get(label) {
                let identifier = raw.split(':').next().unwrap_or(raw);
                if let Some(server) = find_server_by_name_or_hostname(pool, identifier).await? {
                    debug!(server = %server.name, %label, "resolved target server from alert label");
                    return Ok(Some(server.id));
                }
            }
        }
        debug!(runbook = %runbook.name, "alert label target missing; falling back to default server");
    }
    Ok(runbook.default_server_id)
}

async fn create_execution(
    pool: &PgPool,
    matched: &TriggerMatch,
    alert: &Alert,
    mode: &str,
) -> AppResult<RunbookExecution> {
    let server_id = resolve_target_server(pool, &matched.runbook, alert).await?;
    let variables = json!(matched.extracted_variables);

    let (status, approval_required, token, expires_at) = if mode == "semi_auto" {
        let timeout_minutes = if matched.runbook.approval_timeout_minutes > 0 {
            i64::from(matched.runbook.approval_timeout_minutes)
        } else {
            DEFAULT_APPROVAL_TIMEOUT_MINUTES
        };
        (
            "pending",
            true,
            Some(generate_approval_token()),
            Some(chrono::Utc::now() + chrono::Duration::minutes(timeout_minutes)),
        )
    } else {
        ("queued", false, None, None)
    };

    let execution = insert_execution(
        pool,
        NewExecution {
            runbook_id: matched.runbook.id,
            runbook_version: matched.runbook.version,
            trigger_id: Some(matched.trigger.id),
            alert_id: Some(alert.id),
            server_id,
            scheduled_job_id: None,
            execution_mode: mode,
            status,
            triggered_by_system: true,
            dry_run: false,
            variables: &variables,
            approval_required,
            approval_token: token.as_deref(),
            approval_expires_at: expires_at,
        },
    )
    .await?;

    info!(
        execution_id = %execution.id,
        runbook = %matched.runbook.name,
        %mode,
        "execution created from trigger match"
    );
    Ok(execution)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn alert() -> Alert {
        Alert {
            id: Uuid::new_v4(),
            fingerprint: "fp-1".into(),
            alert_name: "HighCpuLoad".into(),
            severity: "critical".into(),
            status: "firing".into(),
            instance: "web-1:9100".into(),
            job: "node".into(),
            source: "prometheus".into(),
            timestamp: Utc::now(),
            labels: json!({"team": "platform", "instance": "web-1:9100"}),
            annotations: json!({"summary": "cpu is high"}),
            embedding: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn trigger(pattern: Option<&str>, labels: Value) -> RunbookTrigger {
        RunbookTrigger {
            id: Uuid::new_v4(),
            runbook_id: Uuid::new_v4(),
            enabled: true,
            priority: 100,
            alert_name_pattern: pattern.map(str::to_string),
            severity_pattern: None,
            instance_pattern: None,
            job_pattern: None,
            label_matchers: labels,
            cooldown_minutes: 0,
        }
    }

    #[test]
    fn wildcard_patterns_match_case_insensitively() {
        assert_eq!(wildcard_match("High*", "HighCpuLoad"), Some(true));
        assert_eq!(wildcard_match("high*load", "HighCpuLoad"), Some(true));
        assert_eq!(wildcard_match("*Cpu*", "HighCpuLoad"), Some(true));
        assert_eq!(wildcard_match("Disk*", "HighCpuLoad"), Some(false));
    }

    #[test]
    fn all_configured_predicates_must_hold() {
        let mut candidate = trigger(Some("High*"), json!({}));
        candidate.severity_pattern = Some("critical".into());
        candidate.job_pattern = Some("node".into());
        assert!(evaluate_conditions(&candidate, &alert()).is_some());

        candidate.job_pattern = Some("mysql".into());
        assert!(evaluate_conditions(&candidate, &alert()).is_none());
    }

    #[test]
    fn star_and_empty_patterns_are_skipped() {
        let candidate = trigger(Some("*"), json!({}));
        assert!(evaluate_conditions(&candidate, &alert()).is_some());
        let candidate = trigger(None, json!({}));
        assert!(evaluate_conditions(&candidate, &alert()).is_some());
    }

    #[test]
    fn label_matchers_require_presence_and_equality() {
        let candidate = trigger(None, json!({"team": "platform"}));
        assert!(evaluate_conditions(&candidate, &alert()).is_some());

        let candidate = trigger(None, json!({"team": "db"}));
        assert!(evaluate_conditions(&candidate, &alert()).is_none());

        // `*` value only requires the label to exist.
        let candidate = trigger(None, json!({"team": "*"}));
        assert!(evaluate_conditions(&candidate, &alert()).is_some());

        let candidate = trigger(None, json!({"region": "*"}));
        assert!(evaluate_conditions(&candidate, &alert()).is_none());
    }

    #[test]
    fn extracted_variables_cover_fields_and_labels() {
        let candidate = trigger(Some("High*"), json!({}));
        let details = evaluate_conditions(&candidate, &alert()).unwrap();
        let vars = details.extracted_variables;
        assert_eq!(vars.get("alert_name").map(String::as_str), Some("HighCpuLoad"));
        assert_eq!(vars.get("alert_severity").map(String::as_str), Some("critical"));
        assert_eq!(
            vars.get("alert_label_team").map(String::as_str),
            Some("platform")
        );
        assert!(vars.contains_key("alert_timestamp"));
    }

    #[test]
    fn invalid_regex_pattern_never_matches() {
        assert_eq!(wildcard_match("((", "anything"), None);
        let candidate = trigger(Some("(("), json!({}));
        assert!(evaluate_conditions(&candidate, &alert()).is_none());
    }
}
