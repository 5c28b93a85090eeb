use httpmock::prelude::*;
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

use remediation_core::db::executions::{claim_ready_executions, insert_execution, NewExecution};
use remediation_core::db::step_executions::list_for_execution;
use remediation_core::engine::RunbookEngine;
use remediation_core::executor::ExecutorFactory;
use remediation_core::import::{import_runbook, parse_runbook_document};
use remediation_core::vault::SecretVault;

fn factory() -> Arc<ExecutorFactory> {
    let vault = SecretVault::new(&hex::encode([5u8; 32])).unwrap();
    Arc::new(ExecutorFactory::new(vault))
}

async fn seed_api_server(pool: &PgPool, base_url: &str) -> Uuid {
    sqlx::query_scalar(
        "INSERT INTO server_credentials (name, hostname, protocol, os_type, api_base_url, api_auth_type) \
         VALUES ('awx', 'awx.internal', 'api', 'linux', $1, 'none') \
         RETURNING id",
    )
    .bind(base_url)
    .fetch_one(pool)
    .await
    .unwrap()
}

async fn queue_manual_execution(pool: &PgPool, runbook_id: Uuid, server_id: Uuid) -> Uuid {
    let variables = serde_json::json!({});
    insert_execution(
        pool,
        NewExecution {
            runbook_id,
            runbook_version: 1,
            trigger_id: None,
            alert_id: None,
            server_id: Some(server_id),
            scheduled_job_id: None,
            execution_mode: "manual",
            status: "queued",
            triggered_by_system: false,
            dry_run: false,
            variables: &variables,
            approval_required: false,
            approval_token: None,
            approval_expires_at: None,
        },
    )
    .await
    .unwrap()
    .id
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn api_step_launches_job_and_captures_response(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let mock_server = MockServer::start_async().await;
    let launch = mock_server
        .mock_async(|when, then| {
            when.method(POST).path("/api/v2/job_templates/7/launch/");
            then.status(201)
                .header("content-type", "application/json")
                .body(r#"{"job": {"id": 42, "status": "pending"}}"#);
        })
        .await;

    let server_id = seed_api_server(&pool, &mock_server.base_url()).await;
    let document = parse_runbook_document(
        r#"
name: launch-awx-job
steps:
  - step_order: 1
    name: launch job
    step_type: api
    api_method: POST
    api_endpoint: /api/v2/job_templates/7/launch/
    api_body: '{"extra_vars": {"target": "web-1"}}'
    api_expected_status_codes: [201, 202]
    api_response_extract:
      job_id: "$.job.id"
    output_variable: launch_body
"#,
    )
    .unwrap();
    let runbook_id = import_runbook(&pool, &document).await.unwrap().id;

    let execution_id = queue_manual_execution(&pool, runbook_id, server_id).await;
    let claimed = claim_ready_executions(&pool, 5).await.unwrap();
    assert_eq!(claimed.len(), 1);

    let engine = RunbookEngine::new(pool.clone(), factory());
    let finished = engine.execute(execution_id).await.unwrap();
    launch.assert_async().await;

    assert_eq!(finished.status, "success");
    assert_eq!(finished.steps_completed, 1);
    // Extracted values join the runtime variables.
    assert_eq!(finished.variables["job_id"], "42");

    let steps = list_for_execution(&pool, execution_id).await.unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].status, "success");
    assert_eq!(steps[0].http_status_code, Some(201));
    assert!(steps[0]
        .http_response_body
        .as_deref()
        .unwrap()
        .contains("\"id\": 42"));
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn unexpected_status_fails_the_step(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let mock_server = MockServer::start_async().await;
    mock_server
        .mock_async(|when, then| {
            when.method(GET).path("/health");
            then.status(503).body("overloaded");
        })
        .await;

    let server_id = seed_api_server(&pool, &mock_server.base_url()).await;
    let document = parse_runbook_document(
        r#"
name: probe-health
steps:
  - step_order: 1
    name: probe
    step_type: api
    api_method: GET
    api_endpoint: /health
    api_expected_status_codes: [200]
"#,
    )
    .unwrap();
    let runbook_id = import_runbook(&pool, &document).await.unwrap().id;

    let execution_id = queue_manual_execution(&pool, runbook_id, server_id).await;
    claim_ready_executions(&pool, 5).await.unwrap();

    let engine = RunbookEngine::new(pool.clone(), factory());
    let finished = engine.execute(execution_id).await.unwrap();

    assert_eq!(finished.status, "failed");
    let steps = list_for_execution(&pool, execution_id).await.unwrap();
    assert_eq!(steps[0].status, "failed");
    assert_eq!(steps[0].http_status_code, Some(503));
    assert_eq!(steps[0].error_type.as_deref(), Some("command"));
}
