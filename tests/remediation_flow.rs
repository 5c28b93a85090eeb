use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use remediation_core::alerts::{ingest_alert_batch, AlertWebhookBatch, WebhookAlert};
use remediation_core::approvals::{
    approve_execution, cleanup_expired, reject_execution, ApprovalOutcome,
};
use remediation_core::db::circuit_breakers::{ensure_breaker, get_breaker, set_thresholds};
use remediation_core::db::executions::{claim_ready_executions, get_execution, RunbookExecution};
use remediation_core::db::step_executions::list_for_execution;
use remediation_core::engine::RunbookEngine;
use remediation_core::executor::{
    ErrorType, ExecRequest, ExecutionResult, Executor, ExecutorError, ExecutorFactory, ServerInfo,
};
use remediation_core::import::{import_runbook, parse_runbook_document};
use remediation_core::principal::Principal;
use remediation_core::triggers::match_alert;
use remediation_core::vault::SecretVault;

/// Transport stub with canned command responses; records every executed
/// command so ordering (rollback in particular) can be asserted.
struct ScriptedExecutor {
    responses: StdMutex<HashMap<String, (i32, String)>>,
    executed: StdMutex<Vec<String>>,
}

impl ScriptedExecutor {
    fn new(responses: &[(&str, i32, &str)]) -> Arc<Self> {
        Arc::new(Self {
            responses: StdMutex::new(
                responses
                    .iter()
                    .map(|(command, code, stdout)| {
                        (command.to_string(), (*code, stdout.to_string()))
                    })
                    .collect(),
            ),
            executed: StdMutex::new(Vec::new()),
        })
    }

    fn executed_commands(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    fn protocol(&self) -> &'static str {
        "ssh"
    }

    fn hostname(&self) -> &str {
        "scripted-target"
    }

    fn supports_elevation(&self) -> bool {
        true
    }

    async fn connect(&self) -> Result<(), ExecutorError> {
        Ok(())
    }

    async fn disconnect(&self) {}

    async fn is_connected(&self) -> bool {
        true
    }

    async fn execute(&self, command: &str, _request: &ExecRequest) -> ExecutionResult {
        self.executed.lock().unwrap().push(command.to_string());
        let (exit_code, stdout) = self
            .responses
            .lock()
            .unwrap()
            .get(command)
            .cloned()
            .unwrap_or((0, String::new()));
        let success = exit_code == 0;
        ExecutionResult {
            success,
            exit_code,
            stdout,
            stderr: if success { String::new() } else { "scripted failure".into() },
            duration_ms: 1,
            command: command.to_string(),
            server_hostname: "scripted-target".into(),
            executed_at: Utc::now(),
            error_type: if success { None } else { Some(ErrorType::Command) },
            error_message: if success { None } else { Some("scripted failure".into()) },
            retryable: false,
            extracted: HashMap::new(),
        }
    }

    async fn test_connection(&self) -> bool {
        true
    }

    async fn server_info(&self) -> ServerInfo {
        ServerInfo::bare("scripted-target", "linux")
    }
}

fn factory() -> Arc<ExecutorFactory> {
    let vault = SecretVault::new(&hex::encode([3u8; 32])).unwrap();
    Arc::new(ExecutorFactory::new(vault))
}

async fn seed_server(pool: &PgPool) -> Uuid {
    sqlx::query_scalar(
        "INSERT INTO server_credentials (name, hostname, protocol, os_type) \
         VALUES ('scripted-target', 'scripted-target.internal', 'ssh', 'linux') \
         RETURNING id",
    )
    .fetch_one(pool)
    .await
    .unwrap()
}

async fn import_yaml(pool: &PgPool, yaml: &str) -> Uuid {
    let document = parse_runbook_document(yaml).unwrap();
    import_runbook(pool, &document).await.unwrap().id
}

fn firing_batch(alert_name: &str, fingerprint: &str) -> AlertWebhookBatch {
    AlertWebhookBatch {
        receiver: Some("remediation".into()),
        status: "firing".into(),
        alerts: vec![WebhookAlert {
            status: "firing".into(),
            labels: HashMap::from([
                ("alertname".to_string(), alert_name.to_string()),
                ("severity".to_string(), "critical".to_string()),
                ("instance".to_string(), "h1:9100".to_string()),
                ("job".to_string(), "node".to_string()),
            ]),
            annotations: HashMap::from([("summary".to_string(), "it broke".to_string())]),
            starts_at: Some(Utc::now()),
            ends_at: None,
            fingerprint: Some(fingerprint.to_string()),
        }],
    }
}

async fn claim_one(pool: &PgPool) -> RunbookExecution {
    let mut claimed = claim_ready_executions(pool, 5).await.unwrap();
    assert_eq!(claimed.len(), 1, "expected exactly one claimable execution");
    claimed.remove(0)
}

async fn run_claimed(
    pool: &PgPool,
    scripted: &Arc<ScriptedExecutor>,
    execution_id: Uuid,
) -> RunbookExecution {
    let engine = RunbookEngine::with_executor(
        pool.clone(),
        factory(),
        scripted.clone() as Arc<dyn Executor>,
    );
    engine.execute(execution_id).await.unwrap()
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn auto_execute_happy_path(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    seed_server(&pool).await;
    import_yaml(
        &pool,
        r#"
name: echo-ok
auto_execute: true
default_server: scripted-target
steps:
  - step_order: 1
    name: say ok
    command_linux: echo ok
triggers:
  - alert_name_pattern: "HighCpu*"
"#,
    )
    .await;

    let summary = ingest_alert_batch(&pool, &firing_batch("HighCpuLoad", "fp-auto"))
        .await
        .unwrap();
    assert_eq!(summary.auto_queued, 1);
    assert_eq!(summary.pending_approval, 0);

    let claimed = claim_one(&pool).await;
    assert_eq!(claimed.status, "running");
    assert!(claimed.started_at.is_some());

    let scripted = ScriptedExecutor::new(&[("echo ok", 0, "ok\n")]);
    let finished = run_claimed(&pool, &scripted, claimed.id).await;
    assert_eq!(finished.status, "success");
    assert!(finished.completed_at.is_some());
    assert_eq!(finished.steps_completed, 1);
    assert_eq!(finished.steps_failed, 0);

    let steps = list_for_execution(&pool, finished.id).await.unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].status, "success");
    assert_eq!(steps[0].stdout.as_deref(), Some("ok\n"));

    // The triggering alert resolves on success.
    let (status,): (String,) =
        sqlx::query_as("SELECT status FROM alerts WHERE fingerprint = 'fp-auto'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(status, "resolved");

    // And a proven-solution snapshot is recorded.
    let (outcomes,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM solution_outcomes WHERE success AND auto_detected",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(outcomes, 1);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn approval_flow_expires_without_running(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    seed_server(&pool).await;
    import_yaml(
        &pool,
        r#"
name: guarded-restart
approval_required: true
approval_timeout_minutes: 1
default_server: scripted-target
steps:
  - step_order: 1
    name: restart
    command_linux: systemctl restart nginx
triggers:
  - alert_name_pattern: "HighCpu*"
"#,
    )
    .await;

    let summary = ingest_alert_batch(&pool, &firing_batch("HighCpuLoad", "fp-approval"))
        .await
        .unwrap();
    assert_eq!(summary.pending_approval, 1);
    assert_eq!(summary.auto_queued, 0);

    let (execution_id, token): (Uuid, String) = sqlx::query_as(
        "SELECT id, approval_token FROM runbook_executions WHERE status = 'pending'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(token.len(), 43);

    // Nothing is claimable while approval is outstanding.
    assert!(claim_ready_executions(&pool, 5).await.unwrap().is_empty());

    // Age the approval window past its expiry.
    sqlx::query(
        "UPDATE runbook_executions SET approval_expires_at = NOW() - INTERVAL '61 seconds' \
         WHERE id = $1",
    )
    .bind(execution_id)
    .execute(&pool)
    .await
    .unwrap();

    assert_eq!(cleanup_expired(&pool).await.unwrap(), 1);

    let execution = get_execution(&pool, execution_id).await.unwrap().unwrap();
    assert_eq!(execution.status, "expired");
    assert!(execution.completed_at.is_some());
    assert!(execution.started_at.is_none());
    assert!(claim_ready_executions(&pool, 5).await.unwrap().is_empty());
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn approval_token_and_roles_are_enforced(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    seed_server(&pool).await;
    import_yaml(
        &pool,
        r#"
name: guarded-restart
approval_required: true
approval_roles: [sre]
default_server: scripted-target
steps:
  - step_order: 1
    name: restart
    command_linux: systemctl restart nginx
triggers:
  - alert_name_pattern: "HighCpu*"
"#,
    )
    .await;
    ingest_alert_batch(&pool, &firing_batch("HighCpuLoad", "fp-roles"))
        .await
        .unwrap();

    let (execution_id, token): (Uuid, String) = sqlx::query_as(
        "SELECT id, approval_token FROM runbook_executions WHERE status = 'pending'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();

    let sre = Principal::new("casey", vec!["sre".into()]);
    let dev = Principal::new("sam", vec!["developer".into()]);

    assert_eq!(
        approve_execution(&pool, execution_id, "wrong-token", &sre)
            .await
            .unwrap(),
        ApprovalOutcome::InvalidToken
    );
    assert_eq!(
        approve_execution(&pool, execution_id, &token, &dev)
            .await
            .unwrap(),
        ApprovalOutcome::Forbidden
    );
    assert_eq!(
        approve_execution(&pool, execution_id, &token, &sre)
            .await
            .unwrap(),
        ApprovalOutcome::Approved
    );
    // Idempotent: a second approval is a stable no-op.
    assert_eq!(
        approve_execution(&pool, execution_id, &token, &sre)
            .await
            .unwrap(),
        ApprovalOutcome::AlreadyApproved
    );

    let execution = get_execution(&pool, execution_id).await.unwrap().unwrap();
    assert_eq!(execution.status, "approved");
    assert_eq!(execution.approved_by.as_deref(), Some("casey"));

    // Approved executions are claimable.
    let claimed = claim_one(&pool).await;
    assert_eq!(claimed.id, execution_id);
    assert_eq!(claimed.status, "running");
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn lapsed_window_blocks_rejection_too(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    seed_server(&pool).await;
    import_yaml(
        &pool,
        r#"
name: guarded-restart
approval_required: true
approval_roles: [sre]
default_server: scripted-target
steps:
  - step_order: 1
    name: restart
    command_linux: systemctl restart nginx
triggers:
  - alert_name_pattern: "HighCpu*"
"#,
    )
    .await;
    ingest_alert_batch(&pool, &firing_batch("HighCpuLoad", "fp-reject-expiry"))
        .await
        .unwrap();

    let (execution_id, token): (Uuid, String) = sqlx::query_as(
        "SELECT id, approval_token FROM runbook_executions WHERE status = 'pending'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();

    sqlx::query(
        "UPDATE runbook_executions SET approval_expires_at = NOW() - INTERVAL '1 minute' \
         WHERE id = $1",
    )
    .bind(execution_id)
    .execute(&pool)
    .await
    .unwrap();

    // A qualified rejector past the window gets Expired, not Rejected.
    let sre = Principal::new("casey", vec!["sre".into()]);
    assert_eq!(
        reject_execution(&pool, execution_id, &token, &sre, Some("too risky"))
            .await
            .unwrap(),
        ApprovalOutcome::Expired
    );

    let execution = get_execution(&pool, execution_id).await.unwrap().unwrap();
    assert_eq!(execution.status, "expired");
    assert!(execution.completed_at.is_some());
    assert_eq!(execution.rejection_reason, None);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn circuit_opens_after_threshold_and_blocks_matching(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    seed_server(&pool).await;
    let runbook_id = import_yaml(
        &pool,
        r#"
name: flaky-fix
auto_execute: true
default_server: scripted-target
steps:
  - step_order: 1
    name: always fails
    command_linux: exit 1
triggers:
  - alert_name_pattern: "HighCpu*"
"#,
    )
    .await;

    ensure_breaker(&pool, runbook_id).await.unwrap();
    set_thresholds(&pool, runbook_id, 3, 2, 5).await.unwrap();

    let scripted = ScriptedExecutor::new(&[("exit 1", 1, "")]);
    for attempt in 0..3 {
        let fingerprint = format!("fp-breaker-{attempt}");
        ingest_alert_batch(&pool, &firing_batch("HighCpuLoad", &fingerprint))
            .await
            .unwrap();
        let claimed = claim_one(&pool).await;
        let finished = run_claimed(&pool, &scripted, claimed.id).await;
        assert_eq!(finished.status, "failed");
    }

    let breaker = get_breaker(&pool, runbook_id).await.unwrap().unwrap();
    assert_eq!(breaker.state, "open");
    assert_eq!(breaker.failure_count, 3);
    let closes_at = breaker.closes_at.unwrap();
    let expected = Utc::now() + Duration::minutes(5);
    assert!((closes_at - expected).num_seconds().abs() < 30);

    // The fourth alert matches but is blocked by the breaker.
    let (alert_id,): (Uuid,) =
        sqlx::query_as("SELECT id FROM alerts ORDER BY created_at LIMIT 1")
            .fetch_one(&pool)
            .await
            .unwrap();
    let alert = remediation_core::db::alerts::get_alert(&pool, alert_id)
        .await
        .unwrap()
        .unwrap();
    let result = match_alert(&pool, &alert).await.unwrap();
    assert_eq!(result.blocked.len(), 1);
    assert!(result.blocked[0].1.contains("Circuit breaker"));
    assert!(result.auto_execute.is_empty());
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn failed_step_triggers_reverse_rollback(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    seed_server(&pool).await;
    import_yaml(
        &pool,
        r#"
name: two-phase-change
auto_execute: true
default_server: scripted-target
steps:
  - step_order: 1
    name: apply change
    command_linux: apply1
    rollback_command_linux: undo1
  - step_order: 2
    name: verify change
    command_linux: verify2
triggers:
  - alert_name_pattern: "HighCpu*"
"#,
    )
    .await;

    ingest_alert_batch(&pool, &firing_batch("HighCpuLoad", "fp-rollback"))
        .await
        .unwrap();
    let claimed = claim_one(&pool).await;

    let scripted = ScriptedExecutor::new(&[
        ("apply1", 0, "applied\n"),
        ("verify2", 1, ""),
        ("undo1", 0, "undone\n"),
    ]);
    let finished = run_claimed(&pool, &scripted, claimed.id).await;

    assert_eq!(finished.status, "failed");
    assert!(finished.rollback_executed);
    assert_eq!(finished.steps_completed, 1);
    assert_eq!(finished.steps_failed, 1);
    assert_eq!(
        finished.error_message.as_deref(),
        Some("Step 'verify change' failed")
    );
    assert_eq!(
        scripted.executed_commands(),
        vec!["apply1", "verify2", "undo1"]
    );

    let steps = list_for_execution(&pool, finished.id).await.unwrap();
    assert_eq!(steps[0].status, "success");
    assert_eq!(steps[1].status, "failed");
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn variable_capture_gates_conditional_step(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    seed_server(&pool).await;
    import_yaml(
        &pool,
        r#"
name: conditional-probe
auto_execute: true
default_server: scripted-target
steps:
  - step_order: 1
    name: check service
    command_linux: systemctl is-active nginx
    output_variable: is_active
    output_extract_pattern: "^(active)$"
  - step_order: 2
    name: probe endpoint
    command_linux: echo reachable
    run_if_variable: is_active
    run_if_value: active
triggers:
  - alert_name_pattern: "Nginx*"
"#,
    )
    .await;

    // Active host: both steps run, step 2 sees the captured variable.
    ingest_alert_batch(&pool, &firing_batch("NginxDown", "fp-cond-active"))
        .await
        .unwrap();
    let claimed = claim_one(&pool).await;
    let scripted = ScriptedExecutor::new(&[
        ("systemctl is-active nginx", 0, "active"),
        ("echo reachable", 0, "reachable\n"),
    ]);
    let finished = run_claimed(&pool, &scripted, claimed.id).await;
    assert_eq!(finished.status, "success");
    let steps = list_for_execution(&pool, finished.id).await.unwrap();
    assert_eq!(steps[0].status, "success");
    assert_eq!(steps[1].status, "success");
    assert_eq!(steps[1].stdout.as_deref(), Some("reachable\n"));
    assert_eq!(finished.variables["is_active"], json!("active"));

    // Inactive host: the extract pattern misses, so step 2 is skipped.
    ingest_alert_batch(&pool, &firing_batch("NginxDown", "fp-cond-inactive"))
        .await
        .unwrap();
    let claimed = claim_one(&pool).await;
    let scripted = ScriptedExecutor::new(&[
        ("systemctl is-active nginx", 0, "inactive"),
        ("echo reachable", 0, "reachable\n"),
    ]);
    let finished = run_claimed(&pool, &scripted, claimed.id).await;
    assert_eq!(finished.status, "success");
    let steps = list_for_execution(&pool, finished.id).await.unwrap();
    assert_eq!(steps[1].status, "skipped");
    assert_eq!(scripted.executed_commands(), vec!["systemctl is-active nginx"]);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn rate_limit_and_cooldown_block_further_matches(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    seed_server(&pool).await;
    import_yaml(
        &pool,
        r#"
name: throttled-fix
auto_execute: true
max_executions_per_hour: 1
cooldown_minutes: 30
default_server: scripted-target
steps:
  - step_order: 1
    name: fix
    command_linux: echo fixed
triggers:
  - alert_name_pattern: "Disk*"
"#,
    )
    .await;

    let first = ingest_alert_batch(&pool, &firing_batch("DiskFull", "fp-rate-1"))
        .await
        .unwrap();
    assert_eq!(first.auto_queued, 1);

    let second = ingest_alert_batch(&pool, &firing_batch("DiskFull", "fp-rate-2"))
        .await
        .unwrap();
    assert_eq!(second.auto_queued, 0);
    assert_eq!(second.blocked, 1);

    // In any one-hour window at most one execution was queued.
    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM runbook_executions \
         WHERE queued_at >= NOW() - INTERVAL '1 hour'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(count, 1);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn alert_ingestion_deduplicates_by_fingerprint(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    ingest_alert_batch(&pool, &firing_batch("HighCpuLoad", "fp-dedup"))
        .await
        .unwrap();
    ingest_alert_batch(&pool, &firing_batch("HighCpuLoad", "fp-dedup"))
        .await
        .unwrap();

    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM alerts WHERE fingerprint = 'fp-dedup'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(count, 1);

    // A resolved event updates the same row in place.
    let mut resolved = firing_batch("HighCpuLoad", "fp-dedup");
    resolved.alerts[0].status = "resolved".into();
    resolved.alerts[0].ends_at = Some(Utc::now());
    ingest_alert_batch(&pool, &resolved).await.unwrap();

    let (count, status): (i64, String) = sqlx::query_as(
        "SELECT COUNT(*), MIN(status) FROM alerts WHERE fingerprint = 'fp-dedup'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(count, 1);
    assert_eq!(status, "resolved");
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn reimport_bumps_version_and_replaces_steps(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let runbook_id = import_yaml(
        &pool,
        r#"
name: evolving
steps:
  - step_order: 1
    name: old step
    command_linux: echo v1
"#,
    )
    .await;

    let reimported_id = import_yaml(
        &pool,
        r#"
name: evolving
steps:
  - step_order: 1
    name: new step
    command_linux: echo v2
  - step_order: 2
    name: extra
    command_linux: echo extra
"#,
    )
    .await;
    assert_eq!(runbook_id, reimported_id);

    let runbook = remediation_core::db::runbooks::get_runbook(&pool, runbook_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(runbook.version, 2);

    let steps = remediation_core::db::runbooks::list_steps(&pool, runbook_id)
        .await
        .unwrap();
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0].name, "new step");
}
