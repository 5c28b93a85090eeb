use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use regex::{Regex, RegexBuilder};
use serde::Serialize;
use serde_json::{json, Map, Value};
use sqlx::PgPool;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::audit;
use crate::db::alerts::{get_alert, mark_resolved, Alert};
use crate::db::executions::{
    complete_execution, fail_before_start, get_execution, set_steps_total, update_progress,
    CompleteExecution, RunbookExecution,
};
use crate::db::runbooks::{get_runbook, list_steps, Runbook, RunbookStep};
use crate::db::servers::{
    get_api_credential_profile, get_credential_profile, get_server, ServerCredential,
};
use crate::db::solutions::{insert_outcome, NewSolutionOutcome};
use crate::db::step_executions::{finish_step, skip_step, start_step, FinishStep};
use crate::error::{AppError, AppResult};
use crate::executor::{ErrorType, ExecRequest, ExecutionResult, Executor, ExecutorFactory};
use crate::safety;
use crate::template;

const OUTPUT_TRUNCATE: usize = 10_000;
const DRY_RUN_STDOUT: &str = "[DRY RUN] Command would be executed";

/// Cooperative cancellation flag checked at step boundaries.
#[derive(Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DryRunStep {
    pub order: i32,
    pub name: String,
    pub skip_reason: Option<String>,
    pub command: Option<String>,
    pub rendered_command: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DryRunReport {
    pub valid: bool,
    pub steps: Vec<DryRunStep>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Runs one `RunbookExecution` end to end: per-step gating, template
/// rendering, retries, variable capture, rollback and the post-execution
/// effects on the breaker, the alert and the learning store.
pub struct RunbookEngine {
    pool: PgPool,
    factory: Arc<ExecutorFactory>,
    cancel: CancelHandle,
    executor_override: Option<Arc<dyn Executor>>,
}

impl RunbookEngine {
    pub fn new(pool: PgPool, factory: Arc<ExecutorFactory>) -> Self {
        Self {
            pool,
            factory,
            cancel: CancelHandle::default(),
            executor_override: None,
        }
    }

    /// Embedding seam: run every step through a caller-provided executor
    /// instead of resolving transports from server credentials.
    pub fn with_executor(
        pool: PgPool,
        factory: Arc<ExecutorFactory>,
        executor: Arc<dyn Executor>,
    ) -> Self {
        Self {
            pool,
            factory,
            cancel: CancelHandle::default(),
            executor_override: Some(executor),
        }
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub async fn execute(&self, execution_id: Uuid) -> AppResult<RunbookExecution> {
        let execution = get_execution(&self.pool, execution_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("execution {execution_id}")))?;

        let Some(runbook) = get_runbook(&self.pool, execution.runbook_id).await? else {
            fail_before_start(&self.pool, execution_id, "Runbook not found").await?;
            audit::record_transition(&self.pool, execution_id, Some("running"), "failed", None)
                .await;
            return self.reload(execution_id).await;
        };

        let steps = list_steps(&self.pool, runbook.id).await?;
        set_steps_total(&self.pool, execution_id, steps.len() as i32).await?;

        let server = match execution.server_id {
            Some(server_id) => match get_server(&self.pool, server_id).await? {
                Some(server) => Some(server),
                None => {
                    fail_before_start(&self.pool, execution_id, "Target server not found").await?;
                    self.record_post_effects(&runbook, &execution, false).await;
                    return self.reload(execution_id).await;
                }
            },
            None => None,
        };

        let needs_server = steps
            .iter()
            .any(|step| step.step_type != "api" || step.api_credential_profile_id.is_none());
        if server.is_none() && needs_server && self.executor_override.is_none() {
            fail_before_start(&self.pool, execution_id, "No target server specified").await?;
            self.record_post_effects(&runbook, &execution, false).await;
            return self.reload(execution_id).await;
        }

        let alert = match execution.alert_id {
            Some(alert_id) => get_alert(&self.pool, alert_id).await?,
            None => None,
        };

        let default_executor = match self.resolve_default_executor(server.as_ref()).await {
            Ok(executor) => executor,
            Err(err) => {
                let _ = complete_execution(
                    &self.pool,
                    CompleteExecution {
                        execution_id,
                        status: "failed",
                        result_summary: None,
                        error_message: Some(&format!("Connection error: {err}")),
                        rollback_executed: false,
                        variables: None,
                    },
                )
                .await?;
                self.record_post_effects(&runbook, &execution, false).await;
                audit::record_transition(&self.pool, execution_id, Some("running"), "failed", None)
                    .await;
                return self.reload(execution_id).await;
            }
        };

        let outcome = self
            .run_steps(&execution, &runbook, &steps, server.as_ref(), alert.as_ref(), &default_executor)
            .await?;

        let final_vars = json!(outcome.runtime_vars);
        let (status, summary, error_message) = if outcome.cancelled {
            (
                "cancelled",
                None,
                Some("Execution cancelled by user".to_string()),
            )
        } else if outcome.all_success {
            (
                "success",
                Some(format!("All {} steps completed successfully", steps.len())),
                None,
            )
        } else {
            ("failed", None, outcome.error_message.clone())
        };

        // Rollback only for real failures; cancellation leaves the target
        // as it stands.
        let mut rollback_executed = false;
        if status == "failed" && !execution.dry_run && !outcome.completed_steps.is_empty() {
            rollback_executed = true;
            self.run_rollback(
                &outcome.completed_steps,
                &outcome.context,
                server.as_ref(),
                &default_executor,
            )
            .await;
        }

        let _ = complete_execution(
            &self.pool,
            CompleteExecution {
                execution_id,
                status,
                result_summary: summary.as_deref(),
                error_message: error_message.as_deref(),
                rollback_executed,
                variables: Some(&final_vars),
            },
        )
        .await?;
        audit::record_transition(&self.pool, execution_id, Some("running"), status, None).await;

        if status != "cancelled" {
            self.record_post_effects(&runbook, &execution, status == "success")
                .await;
        }
        if status == "success" {
            if let Some(alert) = alert.as_ref() {
                if let Err(err) = mark_resolved(&self.pool, alert.id).await {
                    error!(?err, alert_id = %alert.id, "failed to auto-resolve alert");
                }
                if !execution.dry_run {
                    self.record_successful_solution(&execution, &runbook, alert)
                        .await;
                }
            }
        }

        info!(%execution_id, %status, "runbook execution finished");
        self.reload(execution_id).await
    }

    async fn reload(&self, execution_id: Uuid) -> AppResult<RunbookExecution> {
        get_execution(&self.pool, execution_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("execution {execution_id}")))
    }

    async fn resolve_default_executor(
        &self,
        server: Option<&ServerCredential>,
    ) -> AppResult<Option<Arc<dyn Executor>>> {
        if let Some(executor) = &self.executor_override {
            return Ok(Some(executor.clone()));
        }
        let Some(server) = server else {
            return Ok(None);
        };
        let profile = match (server.credential_source.as_str(), server.credential_profile_id) {
            ("shared_profile", Some(profile_id)) => {
                get_credential_profile(&self.pool, profile_id).await?
            }
            _ => None,
        };
        let executor = self
            .factory
            .executor_for(server, profile.as_ref())
            .map_err(|err| AppError::Message(err.to_string()))?;
        executor
            .connect()
            .await
            .map_err(|err| AppError::Message(err.to_string()))?;
        Ok(Some(executor))
    }

    async fn executor_for_step(
        &self,
        step: &RunbookStep,
        default_executor: &Option<Arc<dyn Executor>>,
    ) -> AppResult<Arc<dyn Executor>> {
        if self.executor_override.is_none() && step.step_type == "api" {
            if let Some(profile_id) = step.api_credential_profile_id {
                let profile = get_api_credential_profile(&self.pool, profile_id)
                    .await?
                    .ok_or_else(|| {
                        AppError::NotFound(format!("api credential profile {profile_id}"))
                    })?;
                return self
                    .factory
                    .api_executor_from_profile(&profile)
                    .map_err(|err| AppError::Message(err.to_string()));
            }
        }
        default_executor
            .clone()
            .ok_or_else(|| AppError::Message("no executor available for step".to_string()))
    }

    async fn run_steps(
        &self,
        execution: &RunbookExecution,
        runbook: &Runbook,
        steps: &[RunbookStep],
        server: Option<&ServerCredential>,
        alert: Option<&Alert>,
        default_executor: &Option<Arc<dyn Executor>>,
    ) -> AppResult<StepLoopOutcome> {
        let os_type = server
            .map(|server| server.os_type.clone())
            .unwrap_or_else(|| "linux".to_string());

        let mut runtime_vars = initial_runtime_vars(execution);
        let mut context = build_context(runbook, server, alert, Some(execution), &runtime_vars);
        let mut outcome = StepLoopOutcome {
            context: context.clone(),
            ..Default::default()
        };
        outcome.all_success = true;
        let mut steps_completed = 0;
        let mut steps_failed = 0;

        for step in steps {
            if self.cancel.is_cancelled() {
                outcome.cancelled = true;
                break;
            }

            let step_row =
                start_step(&self.pool, execution.id, step.step_order, &step.name).await?;

            // OS gate; API steps carry no OS restriction.
            if step.step_type != "api" && step.target_os != "any" && step.target_os != os_type {
                skip_step(
                    &self.pool,
                    step_row.id,
                    &format!(
                        "Skipped: OS mismatch (server: {os_type}, step: {})",
                        step.target_os
                    ),
                )
                .await?;
                continue;
            }

            // Conditional gate; a missing variable skips.
            if step.run_if_variable.is_some() && !check_conditional(step, &runtime_vars) {
                skip_step(
                    &self.pool,
                    step_row.id,
                    &format!(
                        "Skipped: Condition not met ({} did not match)",
                        step.run_if_variable.as_deref().unwrap_or_default()
                    ),
                )
                .await?;
                continue;
            }

            let Some(command) = command_for_step(step, &os_type) else {
                skip_step(
                    &self.pool,
                    step_row.id,
                    &format!("No command/config defined for {os_type}"),
                )
                .await?;
                continue;
            };

            // Strict rendering: an undefined reference fails the step.
            let rendered = match template::render(&command, &context) {
                Ok(rendered) => rendered,
                Err(err) => {
                    steps_failed += 1;
                    outcome.all_success = false;
                    finish_step(
                        &self.pool,
                        FinishStep {
                            step_execution_id: step_row.id,
                            status: "failed",
                            duration_ms: None,
                            command_executed: Some(&command),
                            stdout: None,
                            stderr: None,
                            exit_code: None,
                            http_status_code: None,
                            http_response_body: None,
                            retry_attempt: 0,
                            error_type: Some("command"),
                            error_message: Some(&format!("Template rendering failed: {err}")),
                        },
                    )
                    .await?;
                    update_progress(&self.pool, execution.id, steps_completed, steps_failed)
                        .await?;
                    if !step.continue_on_fail {
                        outcome.error_message = Some(format!("Step '{}' failed", step.name));
                        break;
                    }
                    continue;
                }
            };

            let executor = match self.executor_for_step(step, default_executor).await {
                Ok(executor) => executor,
                Err(err) => {
                    steps_failed += 1;
                    outcome.all_success = false;
                    finish_step(
                        &self.pool,
                        FinishStep {
                            step_execution_id: step_row.id,
                            status: "failed",
                            duration_ms: None,
                            command_executed: Some(&rendered),
                            stdout: None,
                            stderr: None,
                            exit_code: None,
                            http_status_code: None,
                            http_response_body: None,
                            retry_attempt: 0,
                            error_type: Some("unknown"),
                            error_message: Some(&err.to_string()),
                        },
                    )
                    .await?;
                    update_progress(&self.pool, execution.id, steps_completed, steps_failed)
                        .await?;
                    if !step.continue_on_fail {
                        outcome.error_message = Some(format!("Step '{}' failed", step.name));
                        break;
                    }
                    continue;
                }
            };

            let (result, attempts) = self
                .execute_with_step_retries(executor.as_ref(), &rendered, step, execution.dry_run)
                .await;

            let step_success = check_step_success(&result, step);
            let status = if step_success { "success" } else { "failed" };
            let truncated_stdout = truncate(&result.stdout);
            let truncated_stderr = truncate(&result.stderr);

            if step.step_type == "api" {
                finish_step(
                    &self.pool,
                    FinishStep {
                        step_execution_id: step_row.id,
                        status,
                        duration_ms: Some(result.duration_ms),
                        command_executed: Some(&rendered),
                        stdout: None,
                        stderr: None,
                        exit_code: None,
                        http_status_code: Some(result.exit_code),
                        http_response_body: Some(&truncated_stdout),
                        retry_attempt: attempts,
                        error_type: error_type_for(&result, step_success),
                        error_message: error_message_for(&result, step_success).as_deref(),
                    },
                )
                .await?;
            } else {
                finish_step(
                    &self.pool,
                    FinishStep {
                        step_execution_id: step_row.id,
                        status,
                        duration_ms: Some(result.duration_ms),
                        command_executed: Some(&rendered),
                        stdout: Some(&truncated_stdout),
                        stderr: Some(&truncated_stderr),
                        exit_code: Some(result.exit_code),
                        http_status_code: None,
                        http_response_body: None,
                        retry_attempt: attempts,
                        error_type: error_type_for(&result, step_success),
                        error_message: error_message_for(&result, step_success).as_deref(),
                    },
                )
                .await?;
            }

            if step_success {
                steps_completed += 1;
                outcome.completed_steps.push(step.clone());
            } else {
                steps_failed += 1;
                outcome.all_success = false;
            }
            update_progress(&self.pool, execution.id, steps_completed, steps_failed).await?;

            // Step result context for later steps.
            capture_step_result(&mut runtime_vars, step, &result, step_success);
            if let Some(variable) = step.output_variable.as_deref() {
                if let Some(value) = extract_output_value(step, &result.stdout) {
                    info!(%variable, "captured output variable");
                    runtime_vars.insert(variable.to_string(), Value::String(value));
                }
            }
            for (key, value) in &result.extracted {
                runtime_vars.insert(key.clone(), Value::String(value.clone()));
            }

            context = build_context(runbook, server, alert, Some(execution), &runtime_vars);
            outcome.context = context.clone();

            if !step_success && !step.continue_on_fail {
                outcome.error_message = Some(format!("Step '{}' failed", step.name));
                break;
            }
        }

        if self.cancel.is_cancelled() {
            outcome.cancelled = true;
        }
        outcome.runtime_vars = runtime_vars;
        Ok(outcome)
    }

    /// Step execution: dry runs synthesize success without touching any
    /// transport; everything else goes through the executor's retry
    /// capability, with plain command failures retried only when the step
    /// declares retries.
    async fn execute_with_step_retries(
        &self,
        executor: &dyn Executor,
        command: &str,
        step: &RunbookStep,
        dry_run: bool,
    ) -> (ExecutionResult, i32) {
        if dry_run {
            let mut result = ExecutionResult::failure(
                command,
                executor.hostname(),
                ErrorType::Unknown,
                "",
                false,
                0,
            );
            result.success = true;
            result.exit_code = 0;
            result.error_type = None;
            result.error_message = None;
            result.stderr = String::new();
            result.stdout = DRY_RUN_STDOUT.to_string();
            return (result, 0);
        }

        let request = ExecRequest {
            timeout_seconds: Some(step.timeout_seconds.max(1) as u64),
            with_elevation: step.requires_elevation,
            env: json_string_map(&step.environment),
            working_directory: step.working_directory.clone(),
        };
        let max_retries = step.retry_count.max(0) as u32;
        let retry_delay = step.retry_delay_seconds.max(0) as u64;

        let (result, attempts) = executor
            .execute_with_retry(command, &request, max_retries, retry_delay, max_retries > 0)
            .await;
        (result, attempts as i32)
    }

    /// Rollback completed steps in reverse order. Errors are logged and
    /// swallowed; the execution outcome stays `failed`.
    async fn run_rollback(
        &self,
        completed_steps: &[RunbookStep],
        context: &Value,
        server: Option<&ServerCredential>,
        default_executor: &Option<Arc<dyn Executor>>,
    ) {
        let Some(executor) = default_executor else {
            return;
        };
        let os_type = server
            .map(|server| server.os_type.as_str())
            .unwrap_or("linux");

        info!(steps = completed_steps.len(), "executing rollback");
        for step in completed_steps.iter().rev() {
            let Some(command) = rollback_command_for(step, os_type) else {
                continue;
            };
            let rendered = match template::render(command, context) {
                Ok(rendered) => rendered,
                Err(err) => {
                    error!(?err, step = %step.name, "rollback template rendering failed");
                    continue;
                }
            };
            let request = ExecRequest {
                timeout_seconds: Some(step.timeout_seconds.max(1) as u64),
                with_elevation: step.requires_elevation,
                env: json_string_map(&step.environment),
                working_directory: step.working_directory.clone(),
            };
            let result = executor.execute(&rendered, &request).await;
            if result.success {
                info!(step = %step.name, "rollback successful");
            } else {
                warn!(step = %step.name, stderr = %result.stderr, "rollback failed");
            }
        }
    }

    async fn record_post_effects(
        &self,
        runbook: &Runbook,
        execution: &RunbookExecution,
        success: bool,
    ) {
        if execution.dry_run {
            return;
        }
        if let Err(err) = safety::on_execution_complete(&self.pool, runbook.id, success).await {
            error!(?err, runbook_id = %runbook.id, "failed to update circuit breaker");
        }
    }

    /// Auto-learning: a successful alert-triggered run becomes a proven
    /// solution snapshot for the ranker's feedback loop.
    async fn record_successful_solution(
        &self,
        execution: &RunbookExecution,
        runbook: &Runbook,
        alert: &Alert,
    ) {
        let mut problem_parts = vec![
            format!("Alert: {}", alert.alert_name),
            format!("Severity: {}", alert.severity),
        ];
        if !alert.instance.is_empty() {
            problem_parts.push(format!("Instance: {}", alert.instance));
        }
        if let Some(annotations) = alert.annotations.as_object() {
            let description = annotations
                .get("description")
                .or_else(|| annotations.get("summary"))
                .and_then(Value::as_str);
            if let Some(description) = description {
                problem_parts.push(format!("Description: {description}"));
            }
        }
        let problem_description = problem_parts.join("\n");

        let result = insert_outcome(
            &self.pool,
            NewSolutionOutcome {
                problem_description: &problem_description,
                problem_embedding: alert.embedding.as_deref(),
                alert_id: Some(alert.id),
                server_id: execution.server_id,
                solution_type: "runbook",
                solution_reference: &execution.runbook_id.to_string(),
                solution_summary: &format!("Runbook: {}", runbook.name),
                success: true,
                auto_detected: true,
            },
        )
        .await;

        match result {
            Ok(_) => info!(
                runbook = %runbook.name,
                alert = %alert.alert_name,
                execution_id = %execution.id,
                "auto-recorded successful solution"
            ),
            Err(err) => error!(?err, "failed to record solution outcome"),
        }
    }

    /// Validate a runbook against a target without executing: render every
    /// step, flag unresolved variables and probe connectivity.
    pub async fn execute_dry_run(
        &self,
        runbook_id: Uuid,
        server_id: Option<Uuid>,
        alert: Option<&Alert>,
        extra_vars: &Map<String, Value>,
    ) -> AppResult<DryRunReport> {
        let runbook = get_runbook(&self.pool, runbook_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("runbook {runbook_id}")))?;
        let steps = list_steps(&self.pool, runbook_id).await?;

        let server = match server_id.or(runbook.default_server_id) {
            Some(server_id) => get_server(&self.pool, server_id).await?,
            None => None,
        };
        let os_type = server
            .as_ref()
            .map(|server| server.os_type.clone())
            .unwrap_or_else(|| "linux".to_string());

        let mut runtime_vars = extra_vars.clone();
        runtime_vars.insert("steps".to_string(), Value::Object(Map::new()));
        let context = build_context(&runbook, server.as_ref(), alert, None, &runtime_vars);

        let mut report = DryRunReport {
            valid: true,
            steps: Vec::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
        };

        for step in &steps {
            let mut entry = DryRunStep {
                order: step.step_order,
                name: step.name.clone(),
                skip_reason: None,
                command: None,
                rendered_command: None,
            };

            if step.step_type != "api" && step.target_os != "any" && step.target_os != os_type {
                entry.skip_reason = Some(format!(
                    "OS mismatch (server: {os_type}, step: {})",
                    step.target_os
                ));
                report.steps.push(entry);
                continue;
            }

            let Some(command) = command_for_step(step, &os_type) else {
                entry.skip_reason = Some(format!("No command/config for {os_type}"));
                report.steps.push(entry);
                continue;
            };
            entry.command = Some(command.clone());

            match template::render(&command, &context) {
                Ok(rendered) => {
                    if rendered.contains("{{") || rendered.contains("}}") {
                        report.warnings.push(format!(
                            "Step {}: Command may have unresolved variables",
                            step.step_order
                        ));
                    }
                    entry.rendered_command = Some(rendered);
                }
                Err(err) => {
                    report.valid = false;
                    report
                        .errors
                        .push(format!("Step {}: Template error - {err}", step.step_order));
                }
            }
            report.steps.push(entry);
        }

        match self.resolve_default_executor(server.as_ref()).await {
            Ok(Some(executor)) => {
                if !executor.test_connection().await {
                    report
                        .warnings
                        .push("Server connection test returned unexpected result".to_string());
                }
                executor.disconnect().await;
            }
            Ok(None) => {}
            Err(err) => {
                report.valid = false;
                report.errors.push(format!("Server connection failed: {err}"));
            }
        }

        Ok(report)
    }
}

#[derive(Default)]
struct StepLoopOutcome {
    all_success: bool,
    cancelled: bool,
    error_message: Option<String>,
    completed_steps: Vec<RunbookStep>,
    runtime_vars: Map<String, Value>,
    context: Value,
}

fn initial_runtime_vars(execution: &RunbookExecution) -> Map<String, Value> {
    let mut vars = Map::new();
    vars.insert("steps".to_string(), Value::Object(Map::new()));
    if let Some(object) = execution.variables.as_object() {
        for (key, value) in object {
            vars.insert(key.clone(), value.clone());
        }
    }
    vars
}

/// Replace anything outside `[A-Za-z0-9_]` so a step name can be used as a
/// template path segment.
pub fn safe_step_name(name: &str) -> String {
    name.chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '_' { ch } else { '_' })
        .collect()
}

fn capture_step_result(
    runtime_vars: &mut Map<String, Value>,
    step: &RunbookStep,
    result: &ExecutionResult,
    step_success: bool,
) {
    let entry = json!({
        "stdout": result.stdout,
        "stderr": result.stderr,
        "exit_code": result.exit_code,
        "success": step_success,
    });
    let steps = runtime_vars
        .entry("steps".to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if let Some(map) = steps.as_object_mut() {
        map.insert(safe_step_name(&step.name), entry);
    }
}

/// Command selection: API steps serialize their request config; command
/// steps pick the per-OS command slot.
pub fn command_for_step(step: &RunbookStep, os_type: &str) -> Option<String> {
    if step.step_type == "api" {
        let config = json!({
            "method": step.api_method.clone().unwrap_or_else(|| "GET".to_string()),
            "endpoint": step.api_endpoint.clone().unwrap_or_else(|| "/".to_string()),
            "headers": step.api_headers,
            "query_params": step.api_query_params,
            "body": step.api_body,
            "body_type": step.api_body_type,
            "expected_status_codes": step.api_expected_status_codes,
            "extract": step.api_response_extract,
            "follow_redirects": step.api_follow_redirects,
        });
        return Some(config.to_string());
    }
    let command = match os_type {
        "windows" => step.command_windows.as_deref(),
        _ => step.command_linux.as_deref(),
    };
    command
        .filter(|command| !command.trim().is_empty())
        .map(str::to_string)
}

pub fn rollback_command_for<'a>(step: &'a RunbookStep, os_type: &str) -> Option<&'a str> {
    let command = match os_type {
        "windows" => step.rollback_command_windows.as_deref(),
        _ => step.rollback_command_linux.as_deref(),
    };
    command.filter(|command| !command.trim().is_empty())
}

/// Conditional gate: the variable must exist and equal the expected value
/// exactly or match it as a full regex.
pub fn check_conditional(step: &RunbookStep, runtime_vars: &Map<String, Value>) -> bool {
    let Some(variable) = step.run_if_variable.as_deref() else {
        return true;
    };
    let Some(actual) = runtime_vars.get(variable) else {
        return false;
    };
    let actual = match actual {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    };
    let expected = step.run_if_value.as_deref().unwrap_or_default();

    if actual == expected {
        return true;
    }
    if let Ok(regex) = Regex::new(&format!("^(?:{expected})$")) {
        if regex.is_match(&actual) {
            return true;
        }
    }
    false
}

/// Step success: expected exit code (default 0) or expected HTTP status
/// set, plus an optional case-insensitive multiline pattern over the
/// output.
pub fn check_step_success(result: &ExecutionResult, step: &RunbookStep) -> bool {
    if step.step_type == "api" {
        if result.stdout == DRY_RUN_STDOUT && result.exit_code == 0 {
            return true;
        }
        if !step.api_expected_status_codes.contains(&result.exit_code) {
            return false;
        }
    } else {
        let expected = step.expected_exit_code.unwrap_or(0);
        if result.exit_code != expected {
            return false;
        }
    }

    if let Some(pattern) = step.expected_output_pattern.as_deref() {
        match RegexBuilder::new(pattern)
            .case_insensitive(true)
            .multi_line(true)
            .build()
        {
            Ok(regex) => {
                if !regex.is_match(&result.stdout) {
                    return false;
                }
            }
            Err(err) => warn!(?err, %pattern, "invalid expected output pattern"),
        }
    }
    true
}

/// Output-variable extraction: the configured pattern's first group (whole
/// match when the pattern has no groups), or the trimmed full output when
/// no pattern is set.
pub fn extract_output_value(step: &RunbookStep, content: &str) -> Option<String> {
    match step.output_extract_pattern.as_deref() {
        Some(pattern) => match Regex::new(pattern) {
            Ok(regex) => regex.captures(content).map(|captures| {
                captures
                    .get(1)
                    .or_else(|| captures.get(0))
                    .map(|matched| matched.as_str().to_string())
                    .unwrap_or_default()
            }),
            Err(err) => {
                warn!(?err, %pattern, "invalid output extract pattern");
                None
            }
        },
        None => Some(content.trim().to_string()),
    }
}

fn error_type_for(result: &ExecutionResult, step_success: bool) -> Option<&'static str> {
    if step_success {
        return None;
    }
    Some(result.error_type.map(|kind| kind.as_str()).unwrap_or("command"))
}

fn error_message_for(result: &ExecutionResult, step_success: bool) -> Option<String> {
    if step_success {
        return None;
    }
    result
        .error_message
        .clone()
        .or_else(|| (!result.stderr.is_empty()).then(|| result.stderr.clone()))
}

fn truncate(text: &str) -> String {
    if text.len() <= OUTPUT_TRUNCATE {
        return text.to_string();
    }
    let mut cut = OUTPUT_TRUNCATE;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text[..cut].to_string()
}

fn json_string_map(value: &Value) -> std::collections::HashMap<String, String> {
    value
        .as_object()
        .map(|map| {
            map.iter()
                .filter_map(|(key, entry)| {
                    entry.as_str().map(|text| (key.clone(), text.to_string()))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Template context: server, runbook, alert (labels also lifted to
/// top-level `labels`), execution, `now`, user vars, and every runtime
/// variable at the top level with prior step results under `steps`.
pub fn build_context(
    runbook: &Runbook,
    server: Option<&ServerCredential>,
    alert: Option<&Alert>,
    execution: Option<&RunbookExecution>,
    runtime_vars: &Map<String, Value>,
) -> Value {
    let mut context = Map::new();

    if let Some(server) = server {
        context.insert(
            "server".to_string(),
            json!({
                "hostname": server.hostname,
                "ip": server.hostname,
                "os_type": server.os_type,
                "environment": server.environment,
                "username": server.username,
                "port": server.port,
            }),
        );
    }
    context.insert(
        "runbook".to_string(),
        json!({"name": runbook.name, "category": runbook.category}),
    );

    if let Some(alert) = alert {
        context.insert(
            "alert".to_string(),
            json!({
                "alert_name": alert.alert_name,
                "alert_severity": alert.severity,
                "alert_instance": alert.instance,
                "alert_job": alert.job,
                "alert_labels": alert.labels,
                "alert_annotations": alert.annotations,
            }),
        );
        context.insert("labels".to_string(), alert.labels.clone());
    } else {
        context.insert("alert".to_string(), json!({}));
    }

    match execution {
        Some(execution) => {
            context.insert(
                "execution".to_string(),
                json!({
                    "id": execution.id.to_string(),
                    "mode": execution.execution_mode,
                    "dry_run": execution.dry_run,
                }),
            );
        }
        None => {
            context.insert(
                "execution".to_string(),
                json!({"id": "dry-run", "mode": "dry_run", "dry_run": true}),
            );
        }
    }
    context.insert(
        "now".to_string(),
        Value::String(chrono::Utc::now().to_rfc3339()),
    );

    let mut vars = Map::new();
    if let Some(execution) = execution {
        if let Some(object) = execution.variables.as_object() {
            for (key, value) in object {
                vars.insert(key.clone(), value.clone());
            }
        }
    }
    for (key, value) in runtime_vars {
        if key != "steps" {
            vars.insert(key.clone(), value.clone());
        }
    }
    context.insert("vars".to_string(), Value::Object(vars));

    for (key, value) in runtime_vars {
        context.insert(key.clone(), value.clone());
    }

    Value::Object(context)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn step(step_type: &str) -> RunbookStep {
        RunbookStep {
            id: Uuid::new_v4(),
            runbook_id: Uuid::new_v4(),
            step_order: 1,
            name: "check nginx".into(),
            description: String::new(),
            step_type: step_type.into(),
            target_os: "any".into(),
            command_linux: Some("systemctl is-active nginx".into()),
            command_windows: None,
            requires_elevation: false,
            timeout_seconds: 60,
            expected_exit_code: None,
            expected_output_pattern: None,
            retry_count: 0,
            retry_delay_seconds: 5,
            continue_on_fail: false,
            rollback_command_linux: None,
            rollback_command_windows: None,
            output_variable: None,
            output_extract_pattern: None,
            run_if_variable: None,
            run_if_value: None,
            environment: json!({}),
            working_directory: None,
            api_method: None,
            api_endpoint: None,
            api_headers: json!({}),
            api_query_params: json!({}),
            api_body: None,
            api_body_type: "json".into(),
            api_expected_status_codes: vec![200, 201, 202, 204],
            api_response_extract: json!({}),
            api_follow_redirects: true,
            api_credential_profile_id: None,
        }
    }

    fn result(exit_code: i32, stdout: &str) -> ExecutionResult {
        ExecutionResult {
            success: exit_code == 0,
            exit_code,
            stdout: stdout.into(),
            stderr: String::new(),
            duration_ms: 1,
            command: "x".into(),
            server_hostname: "h".into(),
            executed_at: Utc::now(),
            error_type: None,
            error_message: None,
            retryable: false,
            extracted: Default::default(),
        }
    }

    #[test]
    fn safe_step_name_replaces_non_identifier_chars() {
        assert_eq!(safe_step_name("check nginx"), "check_nginx");
        assert_eq!(safe_step_name("restart-db (primary)"), "restart_db__primary_");
        assert_eq!(safe_step_name("plain_name_9"), "plain_name_9");
    }

    #[test]
    fn command_selection_follows_target_os() {
        let mut command_step = step("command");
        command_step.command_windows = Some("Get-Service nginx".into());
        assert_eq!(
            command_for_step(&command_step, "linux").as_deref(),
            Some("systemctl is-active nginx")
        );
        assert_eq!(
            command_for_step(&command_step, "windows").as_deref(),
            Some("Get-Service nginx")
        );
        command_step.command_linux = Some("   ".into());
        assert_eq!(command_for_step(&command_step, "linux"), None);
    }

    #[test]
    fn api_steps_serialize_their_config() {
        let mut api_step = step("api");
        api_step.api_method = Some("POST".into());
        api_step.api_endpoint = Some("/api/v2/jobs".into());
        let config = command_for_step(&api_step, "linux").unwrap();
        let parsed: Value = serde_json::from_str(&config).unwrap();
        assert_eq!(parsed["method"], "POST");
        assert_eq!(parsed["endpoint"], "/api/v2/jobs");
        assert_eq!(parsed["expected_status_codes"], json!([200, 201, 202, 204]));
    }

    #[test]
    fn conditional_requires_exact_or_regex_match() {
        let mut gated = step("command");
        gated.run_if_variable = Some("is_active".into());
        gated.run_if_value = Some("active".into());

        let mut vars = Map::new();
        assert!(!check_conditional(&gated, &vars));

        vars.insert("is_active".into(), Value::String("active".into()));
        assert!(check_conditional(&gated, &vars));

        vars.insert("is_active".into(), Value::String("inactive".into()));
        assert!(!check_conditional(&gated, &vars));

        gated.run_if_value = Some("act.*".into());
        vars.insert("is_active".into(), Value::String("active".into()));
        assert!(check_conditional(&gated, &vars));
        // Full match only: the regex must cover the whole value.
        vars.insert("is_active".into(), Value::String("deactivated".into()));
        assert!(!check_conditional(&gated, &vars));
    }

    #[test]
    fn success_check_honors_expected_exit_code_and_pattern() {
        let mut checked = step("command");
        assert!(check_step_success(&result(0, "active"), &checked));
        assert!(!check_step_success(&result(1, "failed"), &checked));

        checked.expected_exit_code = Some(1);
        assert!(check_step_success(&result(1, ""), &checked));

        checked.expected_exit_code = None;
        checked.expected_output_pattern = Some("^active$".into());
        assert!(check_step_success(&result(0, "active"), &checked));
        assert!(check_step_success(&result(0, "ACTIVE"), &checked));
        assert!(!check_step_success(&result(0, "inactive stuff"), &checked));
    }

    #[test]
    fn api_success_check_uses_status_codes() {
        let mut api_step = step("api");
        api_step.api_expected_status_codes = vec![200, 202];
        assert!(check_step_success(&result(202, "{}"), &api_step));
        assert!(!check_step_success(&result(500, "{}"), &api_step));
    }

    #[test]
    fn output_extraction_prefers_first_group() {
        let mut capture = step("command");
        capture.output_extract_pattern = Some(r"^(active)$".into());
        assert_eq!(
            extract_output_value(&capture, "active").as_deref(),
            Some("active")
        );
        assert_eq!(extract_output_value(&capture, "inactive"), None);

        capture.output_extract_pattern = None;
        assert_eq!(
            extract_output_value(&capture, "  padded out  ").as_deref(),
            Some("padded out")
        );
    }

    #[test]
    fn context_lifts_labels_and_runtime_vars() {
        let runbook = Runbook {
            id: Uuid::new_v4(),
            name: "restart-nginx".into(),
            description: String::new(),
            category: "web".into(),
            tags: vec![],
            enabled: true,
            auto_execute: true,
            approval_required: false,
            approval_roles: vec![],
            approval_timeout_minutes: 240,
            max_executions_per_hour: None,
            cooldown_minutes: 0,
            default_server_id: None,
            target_from_alert: false,
            target_alert_label: None,
            target_os_filter: vec![],
            version: 1,
            embedding: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let mut runtime_vars = Map::new();
        runtime_vars.insert("is_active".into(), Value::String("active".into()));
        runtime_vars.insert(
            "steps".into(),
            json!({"check_nginx": {"stdout": "active", "success": true}}),
        );

        let context = build_context(&runbook, None, None, None, &runtime_vars);
        assert_eq!(context["runbook"]["name"], "restart-nginx");
        assert_eq!(context["is_active"], "active");
        assert_eq!(context["steps"]["check_nginx"]["stdout"], "active");
        assert_eq!(context["execution"]["dry_run"], true);
        assert_eq!(context["vars"]["is_active"], "active");

        let rendered =
            template::render("state={{steps.check_nginx.stdout}}", &context).unwrap();
        assert_eq!(rendered, "state=active");
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let long = "é".repeat(OUTPUT_TRUNCATE);
        let cut = truncate(&long);
        assert!(cut.len() <= OUTPUT_TRUNCATE);
        assert!(long.starts_with(&cut));
    }
}
