use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use croner::Cron;
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::approvals::generate_approval_token;
use crate::config;
use crate::db::executions::{count_active_for_job, insert_execution, NewExecution};
use crate::db::runbooks::get_runbook;
use crate::db::scheduled_jobs::{
    delete_job, get_job, insert_history, insert_job, list_due_for_update, list_unscheduled,
    record_fire, set_enabled, set_next_run, NewHistoryEntry, NewScheduledJob, ScheduledJob,
};
use crate::error::{AppError, AppResult};

const MAX_JOBS_PER_TICK: i64 = 50;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid cron expression `{0}`")]
    InvalidCron(String),
    #[error("unknown timezone `{0}`")]
    UnknownTimezone(String),
    #[error("schedule is missing required field `{0}`")]
    MissingField(&'static str),
    #[error("unknown schedule type `{0}`")]
    UnknownScheduleType(String),
}

#[derive(Clone)]
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
}

impl SchedulerHandle {
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

// key: scheduler -> durable time-based firing
pub fn spawn(pool: PgPool) -> SchedulerHandle {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        scheduler_loop(pool, shutdown_rx).await;
    });
    SchedulerHandle {
        shutdown: shutdown_tx,
    }
}

async fn scheduler_loop(pool: PgPool, shutdown: watch::Receiver<bool>) {
    let tick_interval = std::time::Duration::from_secs(*config::SCHEDULER_TICK_SECS);
    info!(tick_secs = tick_interval.as_secs(), "scheduler started");

    loop {
        if *shutdown.borrow() {
            break;
        }
        if let Err(err) = tick(&pool).await {
            warn!(?err, "scheduler tick failed");
        }
        if *shutdown.borrow() {
            break;
        }
        sleep(tick_interval).await;
    }
    info!("scheduler stopped");
}

async fn tick(pool: &PgPool) -> AppResult<()> {
    initialize_unscheduled(pool).await?;
    fire_due_jobs(pool).await?;
    Ok(())
}

/// One synchronous scheduler pass, for hosts that drive ticks themselves.
pub async fn tick_once(pool: &PgPool) -> AppResult<()> {
    tick(pool).await
}

/// Give fresh jobs their first `next_run_at`; jobs whose schedule has no
/// future occurrence are disabled rather than rescanned forever.
async fn initialize_unscheduled(pool: &PgPool) -> AppResult<()> {
    let now = Utc::now();
    for job in list_unscheduled(pool, MAX_JOBS_PER_TICK).await? {
        match compute_next_run(&job, now) {
            Ok(Some(next)) => {
                set_next_run(pool, job.id, Some(next)).await?;
                info!(job = %job.name, %next, "scheduled job initialized");
            }
            Ok(None) => {
                set_enabled(pool, job.id, false).await?;
                info!(job = %job.name, "schedule exhausted; job disabled");
            }
            Err(err) => {
                set_enabled(pool, job.id, false).await?;
                error!(?err, job = %job.name, "unschedulable job disabled");
            }
        }
    }
    Ok(())
}

/// Fire everything due. Each job's outcome, its history row and its new
/// `next_run_at` are committed in one transaction, which is what makes the
/// firing at-most-once per interval.
async fn fire_due_jobs(pool: &PgPool) -> AppResult<()> {
    let now = Utc::now();
    let mut tx = pool.begin().await?;
    let due = list_due_for_update(&mut tx, now, MAX_JOBS_PER_TICK).await?;

    for job in due {
        let scheduled_at = job.next_run_at.unwrap_or(now);
        let lateness = now - scheduled_at;

        let next = match compute_next_run(&job, if job.coalesce_runs { now } else { scheduled_at })
        {
            Ok(next) => next,
            Err(err) => {
                error!(?err, job = %job.name, "failed to compute next run; disabling job");
                set_enabled(&mut *tx, job.id, false).await?;
                continue;
            }
        };

        // Too late to honor this fire: record it as missed and move on.
        if lateness > Duration::seconds(i64::from(job.misfire_grace_time)) {
            insert_history(
                &mut *tx,
                NewHistoryEntry {
                    scheduled_job_id: job.id,
                    runbook_execution_id: None,
                    scheduled_at,
                    executed_at: None,
                    completed_at: Some(now),
                    status: "missed",
                    error_message: Some("misfire grace time exceeded"),
                    duration_ms: None,
                },
            )
            .await?;
            warn!(job = %job.name, %scheduled_at, "scheduled fire missed");
            finish_job(&mut tx, &job, next).await?;
            continue;
        }

        // `max_instances` bounds concurrent firings of one job.
        let active = count_active_for_job(&mut *tx, job.id).await?;
        if active >= i64::from(job.max_instances) {
            insert_history(
                &mut *tx,
                NewHistoryEntry {
                    scheduled_job_id: job.id,
                    runbook_execution_id: None,
                    scheduled_at,
                    executed_at: None,
                    completed_at: Some(now),
                    status: "skipped",
                    error_message: Some("max concurrent instances reached"),
                    duration_ms: None,
                },
            )
            .await?;
            finish_job(&mut tx, &job, next).await?;
            continue;
        }

        match fire_job(&mut tx, &job, now).await {
            Ok(execution_id) => {
                let completed = Utc::now();
                insert_history(
                    &mut *tx,
                    NewHistoryEntry {
                        scheduled_job_id: job.id,
                        runbook_execution_id: Some(execution_id),
                        scheduled_at,
                        executed_at: Some(now),
                        completed_at: Some(completed),
                        status: "success",
                        error_message: None,
                        duration_ms: Some((completed - now).num_milliseconds()),
                    },
                )
                .await?;
                record_fire(&mut *tx, job.id, now, "success", next, false).await?;
                info!(job = %job.name, %execution_id, "scheduled runbook queued");
            }
            Err(err) => {
                // Fire errors never abort the loop; the failure lands in
                // history and the counters.
                let message = err.to_string();
                insert_history(
                    &mut *tx,
                    NewHistoryEntry {
                        scheduled_job_id: job.id,
                        runbook_execution_id: None,
                        scheduled_at,
                        executed_at: Some(now),
                        completed_at: Some(Utc::now()),
                        status: "failed",
                        error_message: Some(&message),
                        duration_ms: None,
                    },
                )
                .await?;
                record_fire(&mut *tx, job.id, now, "failed", next, true).await?;
                error!(job = %job.name, %message, "scheduled fire failed");
            }
        }
    }

    tx.commit().await?;
    Ok(())
}

async fn finish_job(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    job: &ScheduledJob,
    next: Option<DateTime<Utc>>,
) -> AppResult<()> {
    match next {
        Some(next) => set_next_run(&mut **tx, job.id, Some(next)).await?,
        None => {
            set_enabled(&mut **tx, job.id, false).await?;
        }
    }
    Ok(())
}

/// Create the `RunbookExecution` for one fire: `pending` with approval
/// bookkeeping when the runbook requires it, otherwise straight to the
/// worker queue.
async fn fire_job(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    job: &ScheduledJob,
    now: DateTime<Utc>,
) -> AppResult<Uuid> {
    let runbook = get_runbook(&mut **tx, job.runbook_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("runbook {}", job.runbook_id)))?;

    let (status, approval_required, token, expires_at) = if runbook.approval_required {
        let timeout = i64::from(runbook.approval_timeout_minutes.max(1));
        (
            "pending",
            true,
            Some(generate_approval_token()),
            Some(now + Duration::minutes(timeout)),
        )
    } else {
        ("queued", false, None, None)
    };

    let execution = insert_execution(
        &mut **tx,
        NewExecution {
            runbook_id: runbook.id,
            runbook_version: runbook.version,
            trigger_id: None,
            alert_id: None,
            server_id: job.target_server_id.or(runbook.default_server_id),
            scheduled_job_id: Some(job.id),
            execution_mode: "auto",
            status,
            triggered_by_system: true,
            dry_run: false,
            variables: &job.execution_params,
            approval_required,
            approval_token: token.as_deref(),
            approval_expires_at: expires_at,
        },
    )
    .await?;
    Ok(execution.id)
}

/// Next occurrence strictly after `after`, honoring the job's timezone and
/// start/end bounds. `None` means the schedule has run out.
pub fn compute_next_run(
    job: &ScheduledJob,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    let next = match job.schedule_type.as_str() {
        "cron" => {
            let expression = job
                .cron_expression
                .as_deref()
                .ok_or(ScheduleError::MissingField("cron_expression"))?;
            let cron = Cron::new(expression)
                .parse()
                .map_err(|_| ScheduleError::InvalidCron(expression.to_string()))?;
            let timezone: Tz = job
                .timezone
                .parse()
                .map_err(|_| ScheduleError::UnknownTimezone(job.timezone.clone()))?;
            let localized = after.with_timezone(&timezone);
            match cron.find_next_occurrence(&localized, false) {
                Ok(next) => Some(next.with_timezone(&Utc)),
                Err(_) => None,
            }
        }
        "interval" => {
            let seconds = job
                .interval_seconds
                .filter(|seconds| *seconds > 0)
                .ok_or(ScheduleError::MissingField("interval_seconds"))?;
            let seconds = i64::from(seconds);
            match job.start_date {
                Some(start) if after < start => Some(start),
                Some(start) => {
                    let elapsed = (after - start).num_seconds();
                    let intervals = elapsed / seconds + 1;
                    Some(start + Duration::seconds(intervals * seconds))
                }
                None => Some(after + Duration::seconds(seconds)),
            }
        }
        "date" => {
            let fire_at = job
                .start_date
                .ok_or(ScheduleError::MissingField("start_date"))?;
            if fire_at > after {
                Some(fire_at)
            } else {
                None
            }
        }
        other => return Err(ScheduleError::UnknownScheduleType(other.to_string())),
    };

    match (next, job.end_date) {
        (Some(next), Some(end)) if next > end => Ok(None),
        (next, _) => Ok(next),
    }
}

/// Validate and persist a new scheduled job, stamping its first
/// `next_run_at`.
pub async fn create_job(pool: &PgPool, new_job: NewScheduledJob<'_>) -> AppResult<ScheduledJob> {
    let job = insert_job(pool, new_job).await?;
    match compute_next_run(&job, Utc::now()) {
        Ok(next) => {
            set_next_run(pool, job.id, next).await?;
            if next.is_none() {
                set_enabled(pool, job.id, false).await?;
            }
        }
        Err(err) => {
            set_enabled(pool, job.id, false).await?;
            return Err(AppError::BadRequest(err.to_string()));
        }
    }
    let job = get_job(pool, job.id)
        .await?
        .ok_or_else(|| AppError::NotFound("scheduled job".to_string()))?;
    info!(job = %job.name, next = ?job.next_run_at, "scheduled job created");
    Ok(job)
}

pub async fn pause_job(pool: &PgPool, job_id: Uuid) -> AppResult<bool> {
    let paused = set_enabled(pool, job_id, false).await?;
    if paused {
        info!(%job_id, "scheduled job paused");
    }
    Ok(paused)
}

/// Resume recomputes the next fire from now; missed occurrences while
/// paused are not replayed.
pub async fn resume_job(pool: &PgPool, job_id: Uuid) -> AppResult<bool> {
    let Some(job) = get_job(pool, job_id).await? else {
        return Ok(false);
    };
    let next = compute_next_run(&job, Utc::now())
        .map_err(|err| AppError::BadRequest(err.to_string()))?;
    if next.is_none() {
        return Ok(false);
    }
    set_next_run(pool, job_id, next).await?;
    let resumed = set_enabled(pool, job_id, true).await?;
    if resumed {
        info!(%job_id, "scheduled job resumed");
    }
    Ok(resumed)
}

pub async fn remove_job(pool: &PgPool, job_id: Uuid) -> AppResult<bool> {
    let removed = delete_job(pool, job_id).await?;
    if removed {
        info!(%job_id, "scheduled job removed");
    }
    Ok(removed)
}
