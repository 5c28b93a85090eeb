use chrono::{Duration, Utc};
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use remediation_core::db::scheduled_jobs::{get_job, list_history, NewScheduledJob};
use remediation_core::import::{import_runbook, parse_runbook_document};
use remediation_core::scheduler::{create_job, pause_job, remove_job, resume_job, tick_once};

async fn seed_runbook(pool: &PgPool, yaml: &str) -> Uuid {
    let document = parse_runbook_document(yaml).unwrap();
    import_runbook(pool, &document).await.unwrap().id
}

fn interval_job<'a>(runbook_id: Uuid, params: &'a serde_json::Value) -> NewScheduledJob<'a> {
    NewScheduledJob {
        runbook_id,
        name: "periodic-cleanup",
        description: "",
        schedule_type: "interval",
        cron_expression: None,
        interval_seconds: Some(60),
        start_date: None,
        end_date: None,
        timezone: "UTC",
        target_server_id: None,
        execution_params: params,
        max_instances: 1,
        misfire_grace_time: 300,
        coalesce_runs: false,
        enabled: true,
    }
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn due_job_fires_and_records_history(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let runbook_id = seed_runbook(
        &pool,
        r#"
name: cleanup-temp
steps:
  - step_order: 1
    name: clean
    command_linux: rm -rf /tmp/scratch
"#,
    )
    .await;

    let params = json!({"retention_days": "7"});
    let job = create_job(&pool, interval_job(runbook_id, &params)).await.unwrap();
    assert!(job.next_run_at.is_some());
    assert!(job.next_run_at.unwrap() > Utc::now());

    // Pull the fire time into the past and tick.
    sqlx::query("UPDATE scheduled_jobs SET next_run_at = NOW() - INTERVAL '10 seconds' WHERE id = $1")
        .bind(job.id)
        .execute(&pool)
        .await
        .unwrap();
    tick_once(&pool).await.unwrap();

    let fired = get_job(&pool, job.id).await.unwrap().unwrap();
    assert_eq!(fired.run_count, 1);
    assert_eq!(fired.failure_count, 0);
    assert_eq!(fired.last_run_status.as_deref(), Some("success"));
    assert!(fired.next_run_at.unwrap() > Utc::now());

    let history = list_history(&pool, job.id, 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, "success");
    let execution_id = history[0].runbook_execution_id.unwrap();

    let (status, mode, by_system, variables): (String, String, bool, serde_json::Value) =
        sqlx::query_as(
            "SELECT status, execution_mode, triggered_by_system, variables \
             FROM runbook_executions WHERE id = $1",
        )
        .bind(execution_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(status, "queued");
    assert_eq!(mode, "auto");
    assert!(by_system);
    assert_eq!(variables["retention_days"], "7");
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn approval_required_runbook_schedules_pending(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let runbook_id = seed_runbook(
        &pool,
        r#"
name: guarded-cleanup
approval_required: true
steps:
  - step_order: 1
    name: clean
    command_linux: rm -rf /tmp/scratch
"#,
    )
    .await;

    let params = json!({});
    let job = create_job(&pool, interval_job(runbook_id, &params)).await.unwrap();
    sqlx::query("UPDATE scheduled_jobs SET next_run_at = NOW() - INTERVAL '10 seconds' WHERE id = $1")
        .bind(job.id)
        .execute(&pool)
        .await
        .unwrap();
    tick_once(&pool).await.unwrap();

    let (status, token): (String, Option<String>) = sqlx::query_as(
        "SELECT status, approval_token FROM runbook_executions WHERE scheduled_job_id = $1",
    )
    .bind(job.id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(status, "pending");
    assert_eq!(token.unwrap().len(), 43);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn late_fire_beyond_grace_is_recorded_as_missed(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let runbook_id = seed_runbook(
        &pool,
        r#"
name: cleanup-temp
steps:
  - step_order: 1
    name: clean
    command_linux: rm -rf /tmp/scratch
"#,
    )
    .await;

    let params = json!({});
    let job = create_job(&pool, interval_job(runbook_id, &params)).await.unwrap();
    // 20 minutes late against a 5 minute grace window.
    let stale = Utc::now() - Duration::minutes(20);
    sqlx::query("UPDATE scheduled_jobs SET next_run_at = $2 WHERE id = $1")
        .bind(job.id)
        .bind(stale)
        .execute(&pool)
        .await
        .unwrap();
    tick_once(&pool).await.unwrap();

    let history = list_history(&pool, job.id, 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, "missed");
    assert!(history[0].runbook_execution_id.is_none());

    // No execution was created, and the job moved on to a future fire.
    let (executions,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM runbook_executions WHERE scheduled_job_id = $1",
    )
    .bind(job.id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(executions, 0);

    let job = get_job(&pool, job.id).await.unwrap().unwrap();
    assert_eq!(job.run_count, 0);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn max_instances_skips_overlapping_fires(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let runbook_id = seed_runbook(
        &pool,
        r#"
name: cleanup-temp
steps:
  - step_order: 1
    name: clean
    command_linux: rm -rf /tmp/scratch
"#,
    )
    .await;

    let params = json!({});
    let job = create_job(&pool, interval_job(runbook_id, &params)).await.unwrap();

    // First fire leaves a queued (non-terminal) execution behind.
    sqlx::query("UPDATE scheduled_jobs SET next_run_at = NOW() - INTERVAL '10 seconds' WHERE id = $1")
        .bind(job.id)
        .execute(&pool)
        .await
        .unwrap();
    tick_once(&pool).await.unwrap();

    // Second fire while the first is still in flight is skipped.
    sqlx::query("UPDATE scheduled_jobs SET next_run_at = NOW() - INTERVAL '10 seconds' WHERE id = $1")
        .bind(job.id)
        .execute(&pool)
        .await
        .unwrap();
    tick_once(&pool).await.unwrap();

    let history = list_history(&pool, job.id, 10).await.unwrap();
    let statuses: Vec<&str> = history.iter().map(|entry| entry.status.as_str()).collect();
    assert!(statuses.contains(&"success"));
    assert!(statuses.contains(&"skipped"));

    let (executions,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM runbook_executions WHERE scheduled_job_id = $1",
    )
    .bind(job.id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(executions, 1);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn pause_resume_and_remove_lifecycle(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let runbook_id = seed_runbook(
        &pool,
        r#"
name: cleanup-temp
steps:
  - step_order: 1
    name: clean
    command_linux: rm -rf /tmp/scratch
"#,
    )
    .await;

    let params = json!({});
    let job = create_job(&pool, interval_job(runbook_id, &params)).await.unwrap();

    assert!(pause_job(&pool, job.id).await.unwrap());
    let paused = get_job(&pool, job.id).await.unwrap().unwrap();
    assert!(!paused.enabled);

    assert!(resume_job(&pool, job.id).await.unwrap());
    let resumed = get_job(&pool, job.id).await.unwrap().unwrap();
    assert!(resumed.enabled);
    assert!(resumed.next_run_at.unwrap() > Utc::now());

    assert!(remove_job(&pool, job.id).await.unwrap());
    assert!(get_job(&pool, job.id).await.unwrap().is_none());
}
