use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use rand_core::{OsRng, RngCore};
use serde::Serialize;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use crate::audit;
use crate::db::executions::{expire_pending_approvals, get_execution_for_update};
use crate::db::runbooks::get_runbook;
use crate::error::AppResult;
use crate::principal::Principal;

const TOKEN_BYTES: usize = 32;

/// 32 random bytes, URL-safe encoded; carried in the out-of-band approval
/// link and compared verbatim.
pub fn generate_approval_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Outcome of an approval or rejection attempt. Failures are explicit
/// values, not errors; callers surface them verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum ApprovalOutcome {
    Approved,
    AlreadyApproved,
    Rejected,
    NotFound,
    InvalidToken,
    Expired,
    Forbidden,
    NotPending { status: String },
}

// key: approval-service -> human-in-the-loop gate

/// Approve a pending execution. The token must match, the expiry must not
/// have passed and the approver must hold one of the runbook's approval
/// roles (operator-class principals always qualify). Approving an
/// already-approved execution is a stable no-op.
pub async fn approve_execution(
    pool: &PgPool,
    execution_id: Uuid,
    token: &str,
    approver: &Principal,
) -> AppResult<ApprovalOutcome> {
    let mut tx = pool.begin().await?;
    let Some(execution) = get_execution_for_update(&mut tx, execution_id).await? else {
        tx.rollback().await?;
        return Ok(ApprovalOutcome::NotFound);
    };

    if execution.status == "approved" {
        tx.rollback().await?;
        return Ok(ApprovalOutcome::AlreadyApproved);
    }
    if execution.status != "pending" {
        let status = execution.status;
        tx.rollback().await?;
        return Ok(ApprovalOutcome::NotPending { status });
    }
    if execution.approval_token.as_deref() != Some(token) {
        tx.rollback().await?;
        return Ok(ApprovalOutcome::InvalidToken);
    }

    let now = Utc::now();
    if execution
        .approval_expires_at
        .map(|expires| expires < now)
        .unwrap_or(false)
    {
        sqlx::query(
            "UPDATE runbook_executions \
             SET status = 'expired', completed_at = NOW(), \
                 error_message = 'Approval expired before a decision was made' \
             WHERE id = $1",
        )
        .bind(execution_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        audit::record_transition(pool, execution_id, Some("pending"), "expired", None).await;
        return Ok(ApprovalOutcome::Expired);
    }

    if !approver_qualifies(pool, &execution.runbook_id, approver).await? {
        tx.rollback().await?;
        return Ok(ApprovalOutcome::Forbidden);
    }

    sqlx::query(
        "UPDATE runbook_executions \
         SET status = 'approved', approved_by = $2, approved_at = NOW() \
         WHERE id = $1 AND status = 'pending'",
    )
    .bind(execution_id)
    .bind(&approver.name)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    audit::record_transition(pool, execution_id, Some("pending"), "approved", None).await;
    info!(%execution_id, approver = %approver.name, "execution approved");
    Ok(ApprovalOutcome::Approved)
}

/// Reject a pending execution. Same preconditions as approval; the reason
/// is stored and the execution reaches the terminal `rejected` state.
pub async fn reject_execution(
    pool: &PgPool,
    execution_id: Uuid,
    token: &str,
    rejector: &Principal,
    reason: Option<&str>,
) -> AppResult<ApprovalOutcome> {
    let mut tx = pool.begin().await?;
    let Some(execution) = get_execution_for_update(&mut tx, execution_id).await? else {
        tx.rollback().await?;
        return Ok(ApprovalOutcome::NotFound);
    };

    if execution.status != "pending" {
        let status = execution.status;
        tx.rollback().await?;
        return Ok(ApprovalOutcome::NotPending { status });
    }
    if execution.approval_token.as_deref() != Some(token) {
        tx.rollback().await?;
        return Ok(ApprovalOutcome::InvalidToken);
    }

    let now = Utc::now();
    if execution
        .approval_expires_at
        .map(|expires| expires < now)
        .unwrap_or(false)
    {
        sqlx::query(
            "UPDATE runbook_executions \
             SET status = 'expired', completed_at = NOW(), \
                 error_message = 'Approval expired before a decision was made' \
             WHERE id = $1",
        )
        .bind(execution_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        audit::record_transition(pool, execution_id, Some("pending"), "expired", None).await;
        return Ok(ApprovalOutcome::Expired);
    }

    if !approver_qualifies(pool, &execution.runbook_id, rejector).await? {
        tx.rollback().await?;
        return Ok(ApprovalOutcome::Forbidden);
    }

    sqlx::query(
        "UPDATE runbook_executions \
         SET status = 'rejected', approved_by = $2, approved_at = NOW(), \
             rejection_reason = $3, completed_at = NOW(), \
             error_message = COALESCE($3, 'Execution rejected') \
         WHERE id = $1 AND status = 'pending'",
    )
    .bind(execution_id)
    .bind(&rejector.name)
    .bind(reason)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    audit::record_transition(pool, execution_id, Some("pending"), "rejected", None).await;
    info!(%execution_id, rejector = %rejector.name, ?reason, "execution rejected");
    Ok(ApprovalOutcome::Rejected)
}

/// Sweep `pending` executions whose approval window has lapsed.
pub async fn cleanup_expired(pool: &PgPool) -> AppResult<u64> {
    let expired = expire_pending_approvals(pool).await?;
    if expired > 0 {
        info!(count = expired, "marked approval requests as expired");
    }
    Ok(expired)
}

async fn approver_qualifies(
    pool: &PgPool,
    runbook_id: &Uuid,
    principal: &Principal,
) -> AppResult<bool> {
    if principal.is_operator_class() {
        return Ok(true);
    }
    let Some(runbook) = get_runbook(pool, *runbook_id).await? else {
        // Orphaned execution: only operator-class principals may decide it.
        return Ok(false);
    };
    if runbook.approval_roles.is_empty() {
        return Ok(true);
    }
    Ok(principal.has_any_role(&runbook.approval_roles))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_urlsafe_and_unique() {
        let first = generate_approval_token();
        let second = generate_approval_token();
        assert_ne!(first, second);
        // 32 bytes -> 43 chars of unpadded url-safe base64
        assert_eq!(first.len(), 43);
        assert!(first
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_'));
    }
}
