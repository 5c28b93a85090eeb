use std::collections::HashSet;

use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::PgPool;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::runbooks::{
    delete_steps_and_triggers, get_runbook_by_name, insert_runbook, insert_step, insert_trigger,
    update_runbook_definition, NewRunbook, NewRunbookStep, NewRunbookTrigger, Runbook,
};
use crate::error::{AppError, AppResult};

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("document is not valid YAML/JSON: {0}")]
    Parse(String),
    #[error("step_order {0} appears more than once")]
    DuplicateStepOrder(i32),
    #[error("step {order}: invalid {field} regex: {message}")]
    InvalidPattern {
        order: i32,
        field: &'static str,
        message: String,
    },
    #[error("step {0}: api steps require api_endpoint")]
    MissingApiEndpoint(i32),
    #[error("runbook has no steps")]
    NoSteps,
}

/// Importable runbook document: the runbook, its steps and its triggers in
/// one YAML or JSON payload.
#[derive(Debug, Clone, Deserialize)]
pub struct RunbookDocument {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub auto_execute: bool,
    #[serde(default)]
    pub approval_required: bool,
    #[serde(default)]
    pub approval_roles: Vec<String>,
    #[serde(default = "default_approval_timeout")]
    pub approval_timeout_minutes: i32,
    #[serde(default)]
    pub max_executions_per_hour: Option<i32>,
    #[serde(default)]
    pub cooldown_minutes: i32,
    #[serde(default)]
    pub default_server: Option<String>,
    #[serde(default)]
    pub target_from_alert: bool,
    #[serde(default)]
    pub target_alert_label: Option<String>,
    #[serde(default)]
    pub target_os_filter: Vec<String>,
    pub steps: Vec<StepDocument>,
    #[serde(default)]
    pub triggers: Vec<TriggerDocument>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StepDocument {
    pub step_order: i32,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_step_type")]
    pub step_type: String,
    #[serde(default = "default_target_os")]
    pub target_os: String,
    #[serde(default)]
    pub command_linux: Option<String>,
    #[serde(default)]
    pub command_windows: Option<String>,
    #[serde(default)]
    pub requires_elevation: bool,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: i32,
    #[serde(default)]
    pub expected_exit_code: Option<i32>,
    #[serde(default)]
    pub expected_output_pattern: Option<String>,
    #[serde(default)]
    pub retry_count: i32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: i32,
    #[serde(default)]
    pub continue_on_fail: bool,
    #[serde(default)]
    pub rollback_command_linux: Option<String>,
    #[serde(default)]
    pub rollback_command_windows: Option<String>,
    #[serde(default)]
    pub output_variable: Option<String>,
    #[serde(default)]
    pub output_extract_pattern: Option<String>,
    #[serde(default)]
    pub run_if_variable: Option<String>,
    #[serde(default)]
    pub run_if_value: Option<String>,
    #[serde(default)]
    pub environment: Value,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub api_method: Option<String>,
    #[serde(default)]
    pub api_endpoint: Option<String>,
    #[serde(default)]
    pub api_headers: Value,
    #[serde(default)]
    pub api_query_params: Value,
    #[serde(default)]
    pub api_body: Option<String>,
    #[serde(default = "default_body_type")]
    pub api_body_type: String,
    #[serde(default = "default_status_codes")]
    pub api_expected_status_codes: Vec<i32>,
    #[serde(default)]
    pub api_response_extract: Value,
    #[serde(default = "default_true")]
    pub api_follow_redirects: bool,
    #[serde(default)]
    pub api_credential_profile_id: Option<Uuid>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TriggerDocument {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default)]
    pub alert_name_pattern: Option<String>,
    #[serde(default)]
    pub severity_pattern: Option<String>,
    #[serde(default)]
    pub instance_pattern: Option<String>,
    #[serde(default)]
    pub job_pattern: Option<String>,
    #[serde(default)]
    pub label_matchers: Value,
    #[serde(default)]
    pub cooldown_minutes: i32,
}

fn default_category() -> String {
    "general".into()
}

fn default_true() -> bool {
    true
}

fn default_approval_timeout() -> i32 {
    240
}

fn default_step_type() -> String {
    "command".into()
}

fn default_target_os() -> String {
    "any".into()
}

fn default_timeout() -> i32 {
    60
}

fn default_retry_delay() -> i32 {
    5
}

fn default_body_type() -> String {
    "json".into()
}

fn default_priority() -> i32 {
    100
}

fn default_status_codes() -> Vec<i32> {
    vec![200, 201, 202, 204]
}

// key: runbook-import -> document parse/validate/replace

/// YAML parses JSON too, so one entrypoint covers both inbound formats.
pub fn parse_runbook_document(input: &str) -> Result<RunbookDocument, ImportError> {
    serde_yaml::from_str(input).map_err(|err| ImportError::Parse(err.to_string()))
}

pub fn validate_document(document: &RunbookDocument) -> Result<(), ImportError> {
    if document.steps.is_empty() {
        return Err(ImportError::NoSteps);
    }

    let mut seen = HashSet::new();
    for step in &document.steps {
        if !seen.insert(step.step_order) {
            return Err(ImportError::DuplicateStepOrder(step.step_order));
        }
        for (field, pattern) in [
            ("expected_output_pattern", &step.expected_output_pattern),
            ("output_extract_pattern", &step.output_extract_pattern),
        ] {
            if let Some(pattern) = pattern.as_deref() {
                Regex::new(pattern).map_err(|err| ImportError::InvalidPattern {
                    order: step.step_order,
                    field,
                    message: err.to_string(),
                })?;
            }
        }
        if step.step_type == "api" && step.api_endpoint.is_none() {
            return Err(ImportError::MissingApiEndpoint(step.step_order));
        }
    }
    Ok(())
}

/// Import a document. A new name inserts; an existing name bumps the
/// runbook version and replaces its steps and triggers in one
/// transaction. An auto-execute runbook cannot also demand approval; the
/// flag wins and the contradiction is logged.
pub async fn import_runbook(pool: &PgPool, document: &RunbookDocument) -> AppResult<Runbook> {
    validate_document(document).map_err(|err| AppError::BadRequest(err.to_string()))?;

    let approval_required = if document.auto_execute && document.approval_required {
        warn!(
            runbook = %document.name,
            "auto_execute runbook declared approval_required; approval dropped"
        );
        false
    } else {
        document.approval_required
    };

    let default_server_id = match document.default_server.as_deref() {
        Some(identifier) => {
            crate::db::servers::find_server_by_name_or_hostname(pool, identifier)
                .await?
                .map(|server| server.id)
        }
        None => None,
    };

    let definition = NewRunbook {
        name: &document.name,
        description: &document.description,
        category: &document.category,
        tags: &document.tags,
        enabled: document.enabled,
        auto_execute: document.auto_execute,
        approval_required,
        approval_roles: &document.approval_roles,
        approval_timeout_minutes: document.approval_timeout_minutes,
        max_executions_per_hour: document.max_executions_per_hour,
        cooldown_minutes: document.cooldown_minutes,
        default_server_id,
        target_from_alert: document.target_from_alert,
        target_alert_label: document.target_alert_label.as_deref(),
        target_os_filter: &document.target_os_filter,
    };

    let mut tx = pool.begin().await?;
    let existing = get_runbook_by_name(&mut *tx, &document.name).await?;
    let runbook = match existing {
        Some(existing) => {
            delete_steps_and_triggers(&mut tx, existing.id).await?;
            update_runbook_definition(&mut *tx, existing.id, definition).await?
        }
        None => insert_runbook(&mut *tx, definition).await?,
    };

    for step in &document.steps {
        let environment = normalize_object(&step.environment);
        let api_headers = normalize_object(&step.api_headers);
        let api_query_params = normalize_object(&step.api_query_params);
        let api_response_extract = normalize_object(&step.api_response_extract);
        insert_step(
            &mut *tx,
            NewRunbookStep {
                runbook_id: runbook.id,
                step_order: step.step_order,
                name: &step.name,
                description: &step.description,
                step_type: &step.step_type,
                target_os: &step.target_os,
                command_linux: step.command_linux.as_deref(),
                command_windows: step.command_windows.as_deref(),
                requires_elevation: step.requires_elevation,
                timeout_seconds: step.timeout_seconds,
                expected_exit_code: step.expected_exit_code,
                expected_output_pattern: step.expected_output_pattern.as_deref(),
                retry_count: step.retry_count,
                retry_delay_seconds: step.retry_delay_seconds,
                continue_on_fail: step.continue_on_fail,
                rollback_command_linux: step.rollback_command_linux.as_deref(),
                rollback_command_windows: step.rollback_command_windows.as_deref(),
                output_variable: step.output_variable.as_deref(),
                output_extract_pattern: step.output_extract_pattern.as_deref(),
                run_if_variable: step.run_if_variable.as_deref(),
                run_if_value: step.run_if_value.as_deref(),
                environment: &environment,
                working_directory: step.working_directory.as_deref(),
                api_method: step.api_method.as_deref(),
                api_endpoint: step.api_endpoint.as_deref(),
                api_headers: &api_headers,
                api_query_params: &api_query_params,
                api_body: step.api_body.as_deref(),
                api_body_type: &step.api_body_type,
                api_expected_status_codes: &step.api_expected_status_codes,
                api_response_extract: &api_response_extract,
                api_follow_redirects: step.api_follow_redirects,
                api_credential_profile_id: step.api_credential_profile_id,
            },
        )
        .await?;
    }

    for trigger in &document.triggers {
        let label_matchers = normalize_object(&trigger.label_matchers);
        insert_trigger(
            &mut *tx,
            NewRunbookTrigger {
                runbook_id: runbook.id,
                enabled: trigger.enabled,
                priority: trigger.priority,
                alert_name_pattern: trigger.alert_name_pattern.as_deref(),
                severity_pattern: trigger.severity_pattern.as_deref(),
                instance_pattern: trigger.instance_pattern.as_deref(),
                job_pattern: trigger.job_pattern.as_deref(),
                label_matchers: &label_matchers,
                cooldown_minutes: trigger.cooldown_minutes,
            },
        )
        .await?;
    }
    tx.commit().await?;

    info!(
        runbook = %runbook.name,
        version = runbook.version,
        steps = document.steps.len(),
        triggers = document.triggers.len(),
        "runbook imported"
    );
    Ok(runbook)
}

fn normalize_object(value: &Value) -> Value {
    if value.is_object() {
        value.clone()
    } else {
        json!({})
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_YAML: &str = r#"
name: restart-nginx
description: Restart nginx when it stops serving
category: web
tags: [nginx, web]
auto_execute: true
steps:
  - step_order: 1
    name: check status
    command_linux: systemctl is-active nginx
    output_variable: is_active
    output_extract_pattern: "^(active)$"
  - step_order: 2
    name: restart
    command_linux: systemctl restart nginx
    requires_elevation: true
    rollback_command_linux: systemctl stop nginx
triggers:
  - alert_name_pattern: "Nginx*"
    severity_pattern: critical
    priority: 10
"#;

    #[test]
    fn parses_yaml_documents() {
        let document = parse_runbook_document(SAMPLE_YAML).unwrap();
        assert_eq!(document.name, "restart-nginx");
        assert_eq!(document.steps.len(), 2);
        assert_eq!(document.triggers.len(), 1);
        assert_eq!(document.steps[0].timeout_seconds, 60);
        assert_eq!(document.triggers[0].priority, 10);
        assert!(document.enabled);
        validate_document(&document).unwrap();
    }

    #[test]
    fn parses_json_documents_too() {
        let json_doc = r#"{"name": "x", "steps": [{"step_order": 1, "name": "s", "command_linux": "true"}]}"#;
        let document = parse_runbook_document(json_doc).unwrap();
        assert_eq!(document.name, "x");
        validate_document(&document).unwrap();
    }

    #[test]
    fn duplicate_step_order_is_rejected() {
        let mut document = parse_runbook_document(SAMPLE_YAML).unwrap();
        document.steps[1].step_order = 1;
        assert!(matches!(
            validate_document(&document),
            Err(ImportError::DuplicateStepOrder(1))
        ));
    }

    #[test]
    fn invalid_patterns_are_rejected() {
        let mut document = parse_runbook_document(SAMPLE_YAML).unwrap();
        document.steps[0].output_extract_pattern = Some("((".into());
        assert!(matches!(
            validate_document(&document),
            Err(ImportError::InvalidPattern { order: 1, .. })
        ));
    }

    #[test]
    fn api_steps_require_an_endpoint() {
        let mut document = parse_runbook_document(SAMPLE_YAML).unwrap();
        document.steps[0].step_type = "api".into();
        assert!(matches!(
            validate_document(&document),
            Err(ImportError::MissingApiEndpoint(1))
        ));
    }

    #[test]
    fn empty_step_list_is_rejected() {
        let document = parse_runbook_document("name: x\nsteps: []").unwrap();
        assert!(matches!(validate_document(&document), Err(ImportError::NoSteps)));
    }
}
