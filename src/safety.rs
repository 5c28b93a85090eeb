use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::blackout_windows::{list_active, BlackoutWindow};
use crate::db::circuit_breakers::{
    ensure_breaker, get_breaker, get_breaker_for_update, update_breaker, BreakerUpdate,
    CircuitBreaker,
};
use crate::db::executions::{count_queued_since, last_queued_at, oldest_queued_since};
use crate::db::rate_limits::get_rate_limit;
use crate::db::runbooks::Runbook;
use crate::error::AppResult;

pub const STATE_CLOSED: &str = "closed";
pub const STATE_OPEN: &str = "open";
pub const STATE_HALF_OPEN: &str = "half_open";

const RATE_LIMIT_WINDOW_SECS: i64 = 3600;

/// Outcome of one safety check; denials carry a reason and, where one can
/// be computed, the time a retry would be admitted.
#[derive(Debug, Clone, Serialize)]
pub struct SafetyCheckResult {
    pub allowed: bool,
    pub reason: Option<String>,
    pub retry_after: Option<DateTime<Utc>>,
}

impl SafetyCheckResult {
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            reason: None,
            retry_after: None,
        }
    }

    pub fn denied(reason: impl Into<String>, retry_after: Option<DateTime<Utc>>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            retry_after,
        }
    }
}

// key: safety-gate -> breaker/rate/blackout/cooldown aggregation

/// Check whether the breaker admits an execution, applying lazy state
/// transitions (open past its deadline moves to half-open; an auto-open
/// whose threshold was raised re-closes unless it was opened by hand).
pub async fn check_circuit(pool: &PgPool, runbook_id: Uuid) -> AppResult<SafetyCheckResult> {
    ensure_breaker(pool, runbook_id).await?;
    let mut tx = pool.begin().await?;
    let Some(breaker) = get_breaker_for_update(&mut tx, runbook_id).await? else {
        tx.rollback().await?;
        return Ok(SafetyCheckResult::allowed());
    };

    if breaker.state != STATE_OPEN {
        tx.rollback().await?;
        return Ok(SafetyCheckResult::allowed());
    }

    let now = Utc::now();

    if breaker.closes_at.map(|closes| closes <= now).unwrap_or(false) {
        // Open period elapsed: probe traffic through half-open with a fresh
        // consecutive-success counter.
        update_breaker(
            &mut *tx,
            breaker.id,
            BreakerUpdate {
                state: STATE_HALF_OPEN,
                failure_count: breaker.failure_count,
                success_count: 0,
                opened_at: breaker.opened_at,
                closes_at: None,
                last_failure_at: breaker.last_failure_at,
                last_success_at: breaker.last_success_at,
                manually_opened: breaker.manually_opened,
                manually_opened_reason: breaker.manually_opened_reason.as_deref(),
            },
        )
        .await?;
        tx.commit().await?;
        info!(%runbook_id, "circuit breaker transitioned to half-open");
        return Ok(SafetyCheckResult::allowed());
    }

    if !breaker.manually_opened && breaker.failure_count < breaker.failure_threshold {
        update_breaker(
            &mut *tx,
            breaker.id,
            BreakerUpdate {
                state: STATE_CLOSED,
                failure_count: breaker.failure_count,
                success_count: breaker.success_count,
                opened_at: None,
                closes_at: None,
                last_failure_at: breaker.last_failure_at,
                last_success_at: breaker.last_success_at,
                manually_opened: false,
                manually_opened_reason: None,
            },
        )
        .await?;
        tx.commit().await?;
        info!(%runbook_id, "circuit breaker auto-closed after threshold adjustment");
        return Ok(SafetyCheckResult::allowed());
    }

    let reason = format!(
        "Circuit breaker is open due to {} failures",
        breaker.failure_count
    );
    let retry_after = breaker.closes_at;
    tx.rollback().await?;
    Ok(SafetyCheckResult::denied(reason, retry_after))
}

pub async fn record_success(pool: &PgPool, runbook_id: Uuid) -> AppResult<()> {
    ensure_breaker(pool, runbook_id).await?;
    let mut tx = pool.begin().await?;
    let Some(breaker) = get_breaker_for_update(&mut tx, runbook_id).await? else {
        tx.rollback().await?;
        return Ok(());
    };

    let now = Utc::now();
    let mut update = BreakerUpdate {
        state: breaker.state.as_str(),
        failure_count: breaker.failure_count,
        success_count: breaker.success_count + 1,
        opened_at: breaker.opened_at,
        closes_at: breaker.closes_at,
        last_failure_at: breaker.last_failure_at,
        last_success_at: Some(now),
        manually_opened: breaker.manually_opened,
        manually_opened_reason: breaker.manually_opened_reason.as_deref(),
    };

    match breaker.state.as_str() {
        STATE_HALF_OPEN => {
            if update.success_count >= breaker.success_threshold {
                update.state = STATE_CLOSED;
                update.failure_count = 0;
                update.success_count = 0;
                update.opened_at = None;
                update.closes_at = None;
                info!(%runbook_id, "circuit breaker closed after recovery");
            }
        }
        STATE_CLOSED => {
            update.failure_count = 0;
        }
        _ => {}
    }

    update_breaker(&mut *tx, breaker.id, update).await?;
    tx.commit().await?;
    Ok(())
}

pub async fn record_failure(pool: &PgPool, runbook_id: Uuid) -> AppResult<()> {
    ensure_breaker(pool, runbook_id).await?;
    let mut tx = pool.begin().await?;
    let Some(breaker) = get_breaker_for_update(&mut tx, runbook_id).await? else {
        tx.rollback().await?;
        return Ok(());
    };

    let now = Utc::now();
    let mut update = BreakerUpdate {
        state: breaker.state.as_str(),
        failure_count: breaker.failure_count + 1,
        success_count: 0,
        opened_at: breaker.opened_at,
        closes_at: breaker.closes_at,
        last_failure_at: Some(now),
        last_success_at: breaker.last_success_at,
        manually_opened: breaker.manually_opened,
        manually_opened_reason: breaker.manually_opened_reason.as_deref(),
    };

    match breaker.state.as_str() {
        STATE_HALF_OPEN => {
            // Failure during the probe window re-opens for twice as long.
            let duration = i64::from(breaker.open_duration_minutes) * 2;
            update.state = STATE_OPEN;
            update.opened_at = Some(now);
            update.closes_at = Some(now + Duration::minutes(duration));
            warn!(%runbook_id, "circuit breaker reopened after half-open failure");
        }
        STATE_CLOSED if update.failure_count >= breaker.failure_threshold => {
            update.state = STATE_OPEN;
            update.opened_at = Some(now);
            update.closes_at =
                Some(now + Duration::minutes(i64::from(breaker.open_duration_minutes)));
            warn!(
                %runbook_id,
                failures = update.failure_count,
                "circuit breaker opened"
            );
        }
        _ => {}
    }

    update_breaker(&mut *tx, breaker.id, update).await?;
    tx.commit().await?;
    Ok(())
}

/// Operator override: force the breaker open for a fixed period.
pub async fn force_open(
    pool: &PgPool,
    runbook_id: Uuid,
    duration_minutes: i64,
    reason: Option<&str>,
) -> AppResult<()> {
    ensure_breaker(pool, runbook_id).await?;
    let mut tx = pool.begin().await?;
    let Some(breaker) = get_breaker_for_update(&mut tx, runbook_id).await? else {
        tx.rollback().await?;
        return Ok(());
    };
    let now = Utc::now();
    update_breaker(
        &mut *tx,
        breaker.id,
        BreakerUpdate {
            state: STATE_OPEN,
            failure_count: breaker.failure_count,
            success_count: breaker.success_count,
            opened_at: Some(now),
            closes_at: Some(now + Duration::minutes(duration_minutes)),
            last_failure_at: breaker.last_failure_at,
            last_success_at: breaker.last_success_at,
            manually_opened: true,
            manually_opened_reason: reason,
        },
    )
    .await?;
    tx.commit().await?;
    info!(%runbook_id, ?reason, "circuit breaker manually opened");
    Ok(())
}

/// Operator override: close the breaker and clear its counters.
pub async fn force_close(pool: &PgPool, runbook_id: Uuid, reason: Option<&str>) -> AppResult<()> {
    ensure_breaker(pool, runbook_id).await?;
    let mut tx = pool.begin().await?;
    let Some(breaker) = get_breaker_for_update(&mut tx, runbook_id).await? else {
        tx.rollback().await?;
        return Ok(());
    };
    update_breaker(
        &mut *tx,
        breaker.id,
        BreakerUpdate {
            state: STATE_CLOSED,
            failure_count: 0,
            success_count: 0,
            opened_at: None,
            closes_at: None,
            last_failure_at: breaker.last_failure_at,
            last_success_at: breaker.last_success_at,
            manually_opened: false,
            manually_opened_reason: reason,
        },
    )
    .await?;
    tx.commit().await?;
    info!(%runbook_id, ?reason, "circuit breaker manually closed");
    Ok(())
}

pub async fn breaker_status(pool: &PgPool, runbook_id: Uuid) -> AppResult<Option<CircuitBreaker>> {
    Ok(get_breaker(pool, runbook_id).await?)
}

/// Sliding-window rate limit: an explicit `ExecutionRateLimit` record wins,
/// otherwise the runbook's `max_executions_per_hour` applies.
pub async fn check_rate_limit(pool: &PgPool, runbook: &Runbook) -> AppResult<SafetyCheckResult> {
    let (max_executions, window_seconds) = match get_rate_limit(pool, runbook.id).await? {
        Some(limit) => (limit.max_executions, i64::from(limit.window_seconds)),
        None => match runbook.max_executions_per_hour {
            Some(max) => (max, RATE_LIMIT_WINDOW_SECS),
            None => return Ok(SafetyCheckResult::allowed()),
        },
    };

    let now = Utc::now();
    let window_start = now - Duration::seconds(window_seconds);
    let count = count_queued_since(pool, runbook.id, window_start).await?;

    if count >= i64::from(max_executions) {
        let oldest = oldest_queued_since(pool, runbook.id, window_start).await?;
        let retry_after = oldest.map(|queued| queued + Duration::seconds(window_seconds));
        return Ok(SafetyCheckResult::denied(
            format!("Rate limit exceeded: {count}/{max_executions} executions in {window_seconds}s window"),
            retry_after,
        ));
    }
    Ok(SafetyCheckResult::allowed())
}

pub async fn check_blackout(pool: &PgPool, runbook: &Runbook) -> AppResult<SafetyCheckResult> {
    let now = Utc::now();
    let windows = list_active(pool, now).await?;
    for window in &windows {
        if blackout_affects(window, runbook) {
            return Ok(SafetyCheckResult::denied(
                format!("Blackout window active: {}", window.name),
                Some(window.end_time),
            ));
        }
    }
    Ok(SafetyCheckResult::allowed())
}

pub fn blackout_affects(window: &BlackoutWindow, runbook: &Runbook) -> bool {
    match window.scope.as_str() {
        "all" => true,
        "category" => window
            .affected_categories
            .iter()
            .any(|category| category == &runbook.category),
        "runbook" => window.affected_runbook_ids.contains(&runbook.id),
        _ => false,
    }
}

/// Quiet period after the most recent execution, independent of the rate
/// window.
pub async fn check_cooldown(pool: &PgPool, runbook: &Runbook) -> AppResult<SafetyCheckResult> {
    if runbook.cooldown_minutes <= 0 {
        return Ok(SafetyCheckResult::allowed());
    }
    let Some(last) = last_queued_at(pool, runbook.id).await? else {
        return Ok(SafetyCheckResult::allowed());
    };
    let cooldown_end = last + Duration::minutes(i64::from(runbook.cooldown_minutes));
    let now = Utc::now();
    if now < cooldown_end {
        let remaining = (cooldown_end - now).num_minutes().max(0);
        return Ok(SafetyCheckResult::denied(
            format!("Cooldown period active: {remaining} minutes remaining"),
            Some(cooldown_end),
        ));
    }
    Ok(SafetyCheckResult::allowed())
}

/// Aggregate gate: circuit breaker, rate limit, blackout and cooldown must
/// all admit the request. Denials never raise; every reason is collected.
pub async fn check_can_execute(
    pool: &PgPool,
    runbook: &Runbook,
) -> AppResult<(bool, Vec<String>)> {
    let mut reasons = Vec::new();

    for check in [
        check_circuit(pool, runbook.id).await?,
        check_rate_limit(pool, runbook).await?,
        check_blackout(pool, runbook).await?,
        check_cooldown(pool, runbook).await?,
    ] {
        if !check.allowed {
            if let Some(reason) = check.reason {
                reasons.push(reason);
            }
        }
    }

    Ok((reasons.is_empty(), reasons))
}

/// Post-execution hook feeding the breaker.
pub async fn on_execution_complete(
    pool: &PgPool,
    runbook_id: Uuid,
    success: bool,
) -> AppResult<()> {
    if success {
        record_success(pool, runbook_id).await
    } else {
        record_failure(pool, runbook_id).await
    }
}
