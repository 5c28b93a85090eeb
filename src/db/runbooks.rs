use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::{Executor, PgPool, Postgres};
use uuid::Uuid;

// key: runbook-db -> versioned procedures, steps, triggers
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Runbook {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub category: String,
    pub tags: Vec<String>,
    pub enabled: bool,
    pub auto_execute: bool,
    pub approval_required: bool,
    pub approval_roles: Vec<String>,
    pub approval_timeout_minutes: i32,
    pub max_executions_per_hour: Option<i32>,
    pub cooldown_minutes: i32,
    pub default_server_id: Option<Uuid>,
    pub target_from_alert: bool,
    pub target_alert_label: Option<String>,
    pub target_os_filter: Vec<String>,
    pub version: i32,
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct RunbookStep {
    pub id: Uuid,
    pub runbook_id: Uuid,
    pub step_order: i32,
    pub name: String,
    pub description: String,
    pub step_type: String,
    pub target_os: String,
    pub command_linux: Option<String>,
    pub command_windows: Option<String>,
    pub requires_elevation: bool,
    pub timeout_seconds: i32,
    pub expected_exit_code: Option<i32>,
    pub expected_output_pattern: Option<String>,
    pub retry_count: i32,
    pub retry_delay_seconds: i32,
    pub continue_on_fail: bool,
    pub rollback_command_linux: Option<String>,
    pub rollback_command_windows: Option<String>,
    pub output_variable: Option<String>,
    pub output_extract_pattern: Option<String>,
    pub run_if_variable: Option<String>,
    pub run_if_value: Option<String>,
    pub environment: Value,
    pub working_directory: Option<String>,
    pub api_method: Option<String>,
    pub api_endpoint: Option<String>,
    pub api_headers: Value,
    pub api_query_params: Value,
    pub api_body: Option<String>,
    pub api_body_type: String,
    pub api_expected_status_codes: Vec<i32>,
    pub api_response_extract: Value,
    pub api_follow_redirects: bool,
    pub api_credential_profile_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct RunbookTrigger {
    pub id: Uuid,
    pub runbook_id: Uuid,
    pub enabled: bool,
    pub priority: i32,
    pub alert_name_pattern: Option<String>,
    pub severity_pattern: Option<String>,
    pub instance_pattern: Option<String>,
    pub job_pattern: Option<String>,
    pub label_matchers: Value,
    pub cooldown_minutes: i32,
}

const RUNBOOK_COLUMNS: &str = "id, name, description, category, tags, enabled, auto_execute, \
     approval_required, approval_roles, approval_timeout_minutes, max_executions_per_hour, \
     cooldown_minutes, default_server_id, target_from_alert, target_alert_label, \
     target_os_filter, version, embedding, created_at, updated_at";

const STEP_COLUMNS: &str = "id, runbook_id, step_order, name, description, step_type, target_os, \
     command_linux, command_windows, requires_elevation, timeout_seconds, expected_exit_code, \
     expected_output_pattern, retry_count, retry_delay_seconds, continue_on_fail, \
     rollback_command_linux, rollback_command_windows, output_variable, output_extract_pattern, \
     run_if_variable, run_if_value, environment, working_directory, api_method, api_endpoint, \
     api_headers, api_query_params, api_body, api_body_type, api_expected_status_codes, \
     api_response_extract, api_follow_redirects, api_credential_profile_id";

const TRIGGER_COLUMNS: &str = "id, runbook_id, enabled, priority, alert_name_pattern, \
     severity_pattern, instance_pattern, job_pattern, label_matchers, cooldown_minutes";

pub async fn get_runbook<'c, E>(
    executor: E,
    runbook_id: Uuid,
) -> Result<Option<Runbook>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, Runbook>(&format!(
        "SELECT {RUNBOOK_COLUMNS} FROM runbooks WHERE id = $1"
    ))
    .bind(runbook_id)
    .fetch_optional(executor)
    .await
}

pub async fn get_runbook_by_name<'c, E>(
    executor: E,
    name: &str,
) -> Result<Option<Runbook>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, Runbook>(&format!(
        "SELECT {RUNBOOK_COLUMNS} FROM runbooks WHERE name = $1"
    ))
    .bind(name)
    .fetch_optional(executor)
    .await
}

pub async fn list_steps<'c, E>(
    executor: E,
    runbook_id: Uuid,
) -> Result<Vec<RunbookStep>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, RunbookStep>(&format!(
        "SELECT {STEP_COLUMNS} FROM runbook_steps WHERE runbook_id = $1 ORDER BY step_order"
    ))
    .bind(runbook_id)
    .fetch_all(executor)
    .await
}

/// Enabled triggers whose runbook is also enabled, for the matcher sweep.
pub async fn list_active_triggers(pool: &PgPool) -> Result<Vec<RunbookTrigger>, sqlx::Error> {
    sqlx::query_as::<_, RunbookTrigger>(
        "SELECT t.id, t.runbook_id, t.enabled, t.priority, t.alert_name_pattern, \
         t.severity_pattern, t.instance_pattern, t.job_pattern, t.label_matchers, \
         t.cooldown_minutes \
         FROM runbook_triggers t \
         JOIN runbooks r ON r.id = t.runbook_id \
         WHERE t.enabled AND r.enabled \
         ORDER BY t.priority, t.created_at",
    )
    .fetch_all(pool)
    .await
}

/// Ranking candidates: enabled runbooks carrying an embedding.
pub async fn list_enabled_with_embedding(pool: &PgPool) -> Result<Vec<Runbook>, sqlx::Error> {
    sqlx::query_as::<_, Runbook>(&format!(
        "SELECT {RUNBOOK_COLUMNS} FROM runbooks WHERE enabled AND embedding IS NOT NULL"
    ))
    .fetch_all(pool)
    .await
}

pub struct NewRunbook<'a> {
    pub name: &'a str,
    pub description: &'a str,
    pub category: &'a str,
    pub tags: &'a [String],
    pub enabled: bool,
    pub auto_execute: bool,
    pub approval_required: bool,
    pub approval_roles: &'a [String],
    pub approval_timeout_minutes: i32,
    pub max_executions_per_hour: Option<i32>,
    pub cooldown_minutes: i32,
    pub default_server_id: Option<Uuid>,
    pub target_from_alert: bool,
    pub target_alert_label: Option<&'a str>,
    pub target_os_filter: &'a [String],
}

pub async fn insert_runbook<'c, E>(
    executor: E,
    runbook: NewRunbook<'_>,
) -> Result<Runbook, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, Runbook>(&format!(
        r#"
        INSERT INTO runbooks (
            name, description, category, tags, enabled, auto_execute, approval_required,
            approval_roles, approval_timeout_minutes, max_executions_per_hour,
            cooldown_minutes, default_server_id, target_from_alert, target_alert_label,
            target_os_filter
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        RETURNING {RUNBOOK_COLUMNS}
        "#
    ))
    .bind(runbook.name)
    .bind(runbook.description)
    .bind(runbook.category)
    .bind(runbook.tags)
    .bind(runbook.enabled)
    .bind(runbook.auto_execute)
    .bind(runbook.approval_required)
    .bind(runbook.approval_roles)
    .bind(runbook.approval_timeout_minutes)
    .bind(runbook.max_executions_per_hour)
    .bind(runbook.cooldown_minutes)
    .bind(runbook.default_server_id)
    .bind(runbook.target_from_alert)
    .bind(runbook.target_alert_label)
    .bind(runbook.target_os_filter)
    .fetch_one(executor)
    .await
}

/// Re-import path: update semantic fields in place and bump `version`.
pub async fn update_runbook_definition<'c, E>(
    executor: E,
    runbook_id: Uuid,
    runbook: NewRunbook<'_>,
) -> Result<Runbook, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, Runbook>(&format!(
        r#"
        UPDATE runbooks
        SET
            description = $2,
            category = $3,
            tags = $4,
            enabled = $5,
            auto_execute = $6,
            approval_required = $7,
            approval_roles = $8,
            approval_timeout_minutes = $9,
            max_executions_per_hour = $10,
            cooldown_minutes = $11,
            default_server_id = $12,
            target_from_alert = $13,
            target_alert_label = $14,
            target_os_filter = $15,
            version = version + 1,
            updated_at = NOW()
        WHERE id = $1
        RETURNING {RUNBOOK_COLUMNS}
        "#
    ))
    .bind(runbook_id)
    .bind(runbook.description)
    .bind(runbook.category)
    .bind(runbook.tags)
    .bind(runbook.enabled)
    .bind(runbook.auto_execute)
    .bind(runbook.approval_required)
    .bind(runbook.approval_roles)
    .bind(runbook.approval_timeout_minutes)
    .bind(runbook.max_executions_per_hour)
    .bind(runbook.cooldown_minutes)
    .bind(runbook.default_server_id)
    .bind(runbook.target_from_alert)
    .bind(runbook.target_alert_label)
    .bind(runbook.target_os_filter)
    .fetch_one(executor)
    .await
}

pub struct NewRunbookStep<'a> {
    pub runbook_id: Uuid,
    pub step_order: i32,
    pub name: &'a str,
    pub description: &'a str,
    pub step_type: &'a str,
    pub target_os: &'a str,
    pub command_linux: Option<&'a str>,
    pub command_windows: Option<&'a str>,
    pub requires_elevation: bool,
    pub timeout_seconds: i32,
    pub expected_exit_code: Option<i32>,
    pub expected_output_pattern: Option<&'a str>,
    pub retry_count: i32,
    pub retry_delay_seconds: i32,
    pub continue_on_fail: bool,
    pub rollback_command_linux: Option<&'a str>,
    pub rollback_command_windows: Option<&'a str>,
    pub output_variable: Option<&'a str>,
    pub output_extract_pattern: Option<&'a str>,
    pub run_if_variable: Option<&'a str>,
    pub run_if_value: Option<&'a str>,
    pub environment: &'a Value,
    pub working_directory: Option<&'a str>,
    pub api_method: Option<&'a str>,
    pub api_endpoint: Option<&'a str>,
    pub api_headers: &'a Value,
    pub api_query_params: &'a Value,
    pub api_body: Option<&'a str>,
    pub api_body_type: &'a str,
    pub api_expected_status_codes: &'a [i32],
    pub api_response_extract: &'a Value,
    pub api_follow_redirects: bool,
    pub api_credential_profile_id: Option<Uuid>,
}

pub async fn insert_step<'c, E>(
    executor: E,
    step: NewRunbookStep<'_>,
) -> Result<RunbookStep, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, RunbookStep>(&format!(
        r#"
        INSERT INTO runbook_steps (
            runbook_id, step_order, name, description, step_type, target_os,
            command_linux, command_windows, requires_elevation, timeout_seconds,
            expected_exit_code, expected_output_pattern, retry_count, retry_delay_seconds,
            continue_on_fail, rollback_command_linux, rollback_command_windows,
            output_variable, output_extract_pattern, run_if_variable, run_if_value,
            environment, working_directory, api_method, api_endpoint, api_headers,
            api_query_params, api_body, api_body_type, api_expected_status_codes,
            api_response_extract, api_follow_redirects, api_credential_profile_id
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, $28, $29, $30, $31, $32, $33)
        RETURNING {STEP_COLUMNS}
        "#
    ))
    .bind(step.runbook_id)
    .bind(step.step_order)
    .bind(step.name)
    .bind(step.description)
    .bind(step.step_type)
    .bind(step.target_os)
    .bind(step.command_linux)
    .bind(step.command_windows)
    .bind(step.requires_elevation)
    .bind(step.timeout_seconds)
    .bind(step.expected_exit_code)
    .bind(step.expected_output_pattern)
    .bind(step.retry_count)
    .bind(step.retry_delay_seconds)
    .bind(step.continue_on_fail)
    .bind(step.rollback_command_linux)
    .bind(step.rollback_command_windows)
    .bind(step.output_variable)
    .bind(step.output_extract_pattern)
    .bind(step.run_if_variable)
    .bind(step.run_if_value)
    .bind(step.environment)
    .bind(step.working_directory)
    .bind(step.api_method)
    .bind(step.api_endpoint)
    .bind(step.api_headers)
    .bind(step.api_query_params)
    .bind(step.api_body)
    .bind(step.api_body_type)
    .bind(step.api_expected_status_codes)
    .bind(step.api_response_extract)
    .bind(step.api_follow_redirects)
    .bind(step.api_credential_profile_id)
    .fetch_one(executor)
    .await
}

pub struct NewRunbookTrigger<'a> {
    pub runbook_id: Uuid,
    pub enabled: bool,
    pub priority: i32,
    pub alert_name_pattern: Option<&'a str>,
    pub severity_pattern: Option<&'a str>,
    pub instance_pattern: Option<&'a str>,
    pub job_pattern: Option<&'a str>,
    pub label_matchers: &'a Value,
    pub cooldown_minutes: i32,
}

pub async fn insert_trigger<'c, E>(
    executor: E,
    trigger: NewRunbookTrigger<'_>,
) -> Result<RunbookTrigger, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, RunbookTrigger>(&format!(
        r#"
        INSERT INTO runbook_triggers (
            runbook_id, enabled, priority, alert_name_pattern, severity_pattern,
            instance_pattern, job_pattern, label_matchers, cooldown_minutes
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        RETURNING {TRIGGER_COLUMNS}
        "#
    ))
    .bind(trigger.runbook_id)
    .bind(trigger.enabled)
    .bind(trigger.priority)
    .bind(trigger.alert_name_pattern)
    .bind(trigger.severity_pattern)
    .bind(trigger.instance_pattern)
    .bind(trigger.job_pattern)
    .bind(trigger.label_matchers)
    .bind(trigger.cooldown_minutes)
    .fetch_one(executor)
    .await
}

pub async fn delete_steps_and_triggers(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    runbook_id: Uuid,
) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM runbook_steps WHERE runbook_id = $1")
        .bind(runbook_id)
        .execute(&mut **tx)
        .await?;
    sqlx::query("DELETE FROM runbook_triggers WHERE runbook_id = $1")
        .bind(runbook_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

pub async fn set_embedding<'c, E>(
    executor: E,
    runbook_id: Uuid,
    embedding: &[f32],
) -> Result<(), sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query("UPDATE runbooks SET embedding = $2, updated_at = NOW() WHERE id = $1")
        .bind(runbook_id)
        .bind(embedding)
        .execute(executor)
        .await?;
    Ok(())
}
