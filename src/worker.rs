use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use sqlx::PgPool;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::approvals;
use crate::config;
use crate::db::executions::{cancel_if_not_started, claim_ready_executions, fail_before_start};
use crate::engine::{CancelHandle, RunbookEngine};
use crate::executor::ExecutorFactory;

/// What happened to a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// A running execution was signalled; it stops at the next step boundary.
    Signalled,
    /// The execution had not started and was cancelled in place.
    Cancelled,
    /// Nothing cancellable was found.
    NotCancellable,
}

/// Handle over the background execution worker: shutdown signal plus the
/// registry of in-flight cancel flags.
#[derive(Clone)]
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    running: Arc<DashMap<Uuid, CancelHandle>>,
}

impl WorkerHandle {
    /// Cooperative shutdown; the loop drains the execution it is on.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Cancel an execution: flip the engine flag when it is running, or
    /// terminate it directly when it never started.
    pub async fn cancel_execution(
        &self,
        pool: &PgPool,
        execution_id: Uuid,
    ) -> Result<CancelOutcome, sqlx::Error> {
        if let Some(handle) = self.running.get(&execution_id) {
            handle.cancel();
            info!(%execution_id, "cancellation requested for running execution");
            return Ok(CancelOutcome::Signalled);
        }
        if cancel_if_not_started(pool, execution_id, "Execution cancelled by user").await? {
            info!(%execution_id, "queued execution cancelled");
            return Ok(CancelOutcome::Cancelled);
        }
        Ok(CancelOutcome::NotCancellable)
    }
}

// key: execution-worker -> polling claim loop
pub fn spawn(pool: PgPool, factory: Arc<ExecutorFactory>) -> WorkerHandle {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let running: Arc<DashMap<Uuid, CancelHandle>> = Arc::new(DashMap::new());
    let handle = WorkerHandle {
        shutdown: shutdown_tx,
        running: running.clone(),
    };

    tokio::spawn(async move {
        worker_loop(pool, factory, running, shutdown_rx).await;
    });

    handle
}

async fn worker_loop(
    pool: PgPool,
    factory: Arc<ExecutorFactory>,
    running: Arc<DashMap<Uuid, CancelHandle>>,
    shutdown: watch::Receiver<bool>,
) {
    let poll_interval = Duration::from_secs(*config::WORKER_POLL_INTERVAL_SECS);
    info!(poll_secs = poll_interval.as_secs(), "execution worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        if let Err(err) = process_ready_executions(&pool, &factory, &running, &shutdown).await {
            error!(?err, "worker failed to process ready executions");
        }

        if let Err(err) = approvals::cleanup_expired(&pool).await {
            error!(?err, "worker failed to expire lapsed approvals");
        }

        if *shutdown.borrow() {
            break;
        }
        sleep(poll_interval).await;
    }

    info!("execution worker stopped");
}

/// Claim a batch and run each execution in `queued_at` order. The claim
/// query moves rows to `running` under `FOR UPDATE SKIP LOCKED`, so a
/// second worker cannot pick up the same rows.
async fn process_ready_executions(
    pool: &PgPool,
    factory: &Arc<ExecutorFactory>,
    running: &Arc<DashMap<Uuid, CancelHandle>>,
    shutdown: &watch::Receiver<bool>,
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    let claimed = claim_ready_executions(&mut *tx, *config::WORKER_BATCH_SIZE).await?;
    tx.commit().await?;

    if claimed.is_empty() {
        return Ok(());
    }
    info!(count = claimed.len(), "claimed executions");

    for execution in claimed {
        if *shutdown.borrow() {
            warn!(execution_id = %execution.id, "shutdown during batch; execution left claimed");
            break;
        }

        let engine = RunbookEngine::new(pool.clone(), factory.clone());
        running.insert(execution.id, engine.cancel_handle());

        match engine.execute(execution.id).await {
            Ok(finished) => {
                info!(
                    execution_id = %finished.id,
                    status = %finished.status,
                    "execution processed"
                );
            }
            Err(err) => {
                error!(?err, execution_id = %execution.id, "execution errored");
                let message = format!("Execution error: {err}");
                if let Err(db_err) = fail_before_start(pool, execution.id, &message).await {
                    error!(?db_err, execution_id = %execution.id, "failed to persist execution error");
                }
            }
        }
        running.remove(&execution.id);
    }

    Ok(())
}
