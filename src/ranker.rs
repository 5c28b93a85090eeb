use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::Serialize;
use serde_json::json;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::executions::recent_statuses;
use crate::db::runbooks::{list_enabled_with_embedding, Runbook};
use crate::db::solutions::{click_counts_since, feedback_totals, record_click, record_feedback};
use crate::error::AppResult;
use crate::principal::Principal;

const CANDIDATE_MULTIPLIER: usize = 3;
const SUCCESS_HISTORY_WINDOW: i64 = 20;
const POPULARITY_WINDOW_DAYS: i64 = 30;

const SEMANTIC_WEIGHT: f64 = 0.5;
const SUCCESS_WEIGHT: f64 = 0.3;
const CONTEXT_WEIGHT: f64 = 0.2;
const AUTOMATION_BONUS: f64 = 0.15;
const POPULARITY_BONUS_MAX: f64 = 0.10;
const FEEDBACK_BONUS_MAX: f64 = 0.15;
const SCORE_FLOOR: f64 = 0.1;
const SCORE_CEILING: f64 = 1.0;

/// External embedding collaborator. The core never generates vectors
/// itself; an unavailable embedder simply yields no solutions.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn dimension(&self) -> usize;
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;
}

#[derive(Debug, Clone, Default)]
pub struct QueryContext {
    pub server_type: Option<String>,
    pub os: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Solution {
    pub solution_type: String,
    pub id: String,
    pub title: String,
    pub description: String,
    pub confidence: f64,
    pub success_rate: f64,
    pub permission_status: String,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct RankedSolutions {
    pub solutions: Vec<Solution>,
    pub presentation_strategy: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    View,
    Execute,
}

// key: solution-ranker -> feedback-weighted candidate ordering

/// Rank candidate runbooks for a natural-language query: semantic
/// similarity against stored embeddings, historical success, context fit,
/// then additive automation/popularity/feedback bonuses, clamped and cut
/// to the top `limit` with a presentation strategy.
pub async fn rank_solutions(
    pool: &PgPool,
    embedder: &dyn Embedder,
    query: &str,
    context: &QueryContext,
    principal: &Principal,
    limit: usize,
) -> AppResult<RankedSolutions> {
    let query_embedding = match embedder.embed(query).await {
        Ok(embedding) => embedding,
        Err(err) => {
            warn!(?err, "embedder unavailable; returning no solutions");
            return Ok(RankedSolutions {
                solutions: Vec::new(),
                presentation_strategy: "no_solutions".to_string(),
            });
        }
    };

    let candidates = list_enabled_with_embedding(pool).await?;
    let mut scored: Vec<(Runbook, f64)> = candidates
        .into_iter()
        .filter_map(|runbook| {
            let embedding = runbook.embedding.as_deref()?;
            let distance = cosine_distance(&query_embedding, embedding)?;
            Some((runbook, distance))
        })
        .collect();
    scored.sort_by(|left, right| left.1.total_cmp(&right.1));
    scored.truncate(limit.max(1) * CANDIDATE_MULTIPLIER);

    // RBAC filter before any scoring work.
    scored.retain(|(runbook, _)| check_runbook_access(principal, runbook, Permission::View));

    let candidate_ids: Vec<Uuid> = scored.iter().map(|(runbook, _)| runbook.id).collect();
    let clicks = click_counts_since(
        pool,
        &candidate_ids,
        Utc::now() - Duration::days(POPULARITY_WINDOW_DAYS),
    )
    .await?;
    let feedback = feedback_totals(pool, &candidate_ids).await?;
    let top_clicks = clicks.values().copied().max().unwrap_or(0);

    let mut solutions = Vec::with_capacity(scored.len());
    for (runbook, distance) in scored {
        let statuses = recent_statuses(pool, runbook.id, SUCCESS_HISTORY_WINDOW).await?;
        let success_rate = historical_success_rate(&statuses);
        let base = base_score(distance, success_rate, context, &runbook);

        let clicks_ratio = if top_clicks > 0 {
            *clicks.get(&runbook.id).unwrap_or(&0) as f64 / top_clicks as f64
        } else {
            0.0
        };
        let (ups, downs) = feedback.get(&runbook.id).copied().unwrap_or((0, 0));
        let confidence = apply_bonuses(base, runbook.auto_execute, clicks_ratio, ups, downs);

        let permission_status = if check_runbook_access(principal, &runbook, Permission::Execute) {
            "can_execute"
        } else {
            "view_only"
        };

        solutions.push(Solution {
            solution_type: "runbook".to_string(),
            id: runbook.id.to_string(),
            title: runbook.name.clone(),
            description: runbook.description.clone(),
            confidence,
            success_rate,
            permission_status: permission_status.to_string(),
            metadata: json!({
                "runbook_id": runbook.id.to_string(),
                "url": format!("/runbooks/{}", runbook.id),
                "category": runbook.category,
                "automation_level": if runbook.auto_execute { "automated" } else { "manual" },
                "popularity_score": clicks_ratio,
            }),
        });
    }

    solutions.sort_by(|left, right| right.confidence.total_cmp(&left.confidence));
    solutions.truncate(limit);

    let confidences: Vec<f64> = solutions.iter().map(|solution| solution.confidence).collect();
    let presentation_strategy = determine_presentation_strategy(&confidences).to_string();

    info!(
        query_len = query.len(),
        candidates = solutions.len(),
        strategy = %presentation_strategy,
        "solution ranking complete"
    );

    Ok(RankedSolutions {
        solutions,
        presentation_strategy,
    })
}

/// RBAC contract: operator-class principals see every enabled runbook;
/// everyone else gets view-level access only to runbooks with no explicit
/// restriction, and execute only through `approval_roles` membership.
pub fn check_runbook_access(
    principal: &Principal,
    runbook: &Runbook,
    permission: Permission,
) -> bool {
    if !runbook.enabled {
        return false;
    }
    if principal.is_operator_class() {
        return true;
    }
    match permission {
        Permission::View => runbook.approval_roles.is_empty(),
        Permission::Execute => principal.has_any_role(&runbook.approval_roles),
    }
}

/// `1 - cosine_distance` weighted with historical success and context fit.
pub fn base_score(
    distance: f64,
    success_rate: f64,
    context: &QueryContext,
    runbook: &Runbook,
) -> f64 {
    let semantic = (1.0 - distance).max(0.0);
    let context_score = context_match(context, runbook);
    let score =
        semantic * SEMANTIC_WEIGHT + success_rate * SUCCESS_WEIGHT + context_score * CONTEXT_WEIGHT;
    score.clamp(0.0, 1.0)
}

/// Successes over the last non-dry-run executions; a neutral 0.5 when
/// there is no history at all.
pub fn historical_success_rate(statuses: &[String]) -> f64 {
    if statuses.is_empty() {
        return 0.5;
    }
    let successes = statuses.iter().filter(|status| *status == "success").count();
    successes as f64 / statuses.len() as f64
}

fn context_match(context: &QueryContext, runbook: &Runbook) -> f64 {
    let mut score: f64 = 0.0;
    if let Some(server_type) = context.server_type.as_deref() {
        if runbook.tags.iter().any(|tag| tag == server_type) {
            score += 0.5;
        }
    }
    if let Some(os) = context.os.as_deref() {
        if runbook.target_os_filter.iter().any(|target| target == os) {
            score += 0.5;
        }
    }
    score.min(1.0)
}

/// Second scoring pass: automation, popularity (clicks vs the most-clicked
/// candidate over 30 days) and net thumbs feedback, clamped to
/// `[0.1, 1.0]`.
pub fn apply_bonuses(
    base: f64,
    automated: bool,
    clicks_ratio: f64,
    thumbs_up: i64,
    thumbs_down: i64,
) -> f64 {
    let automation = if automated { AUTOMATION_BONUS } else { 0.0 };
    let popularity = clicks_ratio.clamp(0.0, 1.0) * POPULARITY_BONUS_MAX;
    let total = thumbs_up + thumbs_down;
    let feedback = if total > 0 {
        ((thumbs_up - thumbs_down) as f64 / total as f64) * FEEDBACK_BONUS_MAX
    } else {
        0.0
    };
    (base + automation + popularity + feedback).clamp(SCORE_FLOOR, SCORE_CEILING)
}

/// Decision matrix over the top two confidences.
pub fn determine_presentation_strategy(confidences: &[f64]) -> &'static str {
    let Some(&top) = confidences.first() else {
        return "no_solutions";
    };
    if confidences.len() == 1 {
        return "single_solution";
    }
    let second = confidences[1];
    let difference = top - second;

    if difference >= 0.15 || top > 0.85 {
        "single_solution"
    } else if difference < 0.10 {
        "multiple_options"
    } else if top > 0.90 {
        "primary_with_alternatives"
    } else if top < 0.60 {
        "experimental_options"
    } else {
        "primary_plus_one"
    }
}

/// Cosine distance over equal-length vectors; `None` for mismatched or
/// zero-magnitude input.
pub fn cosine_distance(left: &[f32], right: &[f32]) -> Option<f64> {
    if left.len() != right.len() || left.is_empty() {
        return None;
    }
    let mut dot = 0.0f64;
    let mut left_norm = 0.0f64;
    let mut right_norm = 0.0f64;
    for (a, b) in left.iter().zip(right.iter()) {
        dot += f64::from(*a) * f64::from(*b);
        left_norm += f64::from(*a) * f64::from(*a);
        right_norm += f64::from(*b) * f64::from(*b);
    }
    if left_norm == 0.0 || right_norm == 0.0 {
        return None;
    }
    Some(1.0 - dot / (left_norm.sqrt() * right_norm.sqrt()))
}

/// A surfaced runbook was clicked through; feeds the popularity bonus.
pub async fn record_solution_click(
    pool: &PgPool,
    runbook_id: Uuid,
    principal: &Principal,
) -> AppResult<()> {
    record_click(pool, runbook_id, Some(&principal.name)).await?;
    Ok(())
}

/// Thumbs up/down on a surfaced runbook; feeds the feedback bonus.
pub async fn record_solution_feedback(
    pool: &PgPool,
    runbook_id: Uuid,
    thumbs_up: bool,
    principal: &Principal,
) -> AppResult<()> {
    record_feedback(pool, runbook_id, thumbs_up, Some(&principal.name)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn runbook(tags: &[&str], os_filter: &[&str], approval_roles: &[&str]) -> Runbook {
        Runbook {
            id: Uuid::new_v4(),
            name: "clear-disk-space".into(),
            description: "frees disk".into(),
            category: "disk".into(),
            tags: tags.iter().map(|tag| tag.to_string()).collect(),
            enabled: true,
            auto_execute: false,
            approval_required: false,
            approval_roles: approval_roles.iter().map(|role| role.to_string()).collect(),
            approval_timeout_minutes: 240,
            max_executions_per_hour: None,
            cooldown_minutes: 0,
            default_server_id: None,
            target_from_alert: false,
            target_alert_label: None,
            target_os_filter: os_filter.iter().map(|os| os.to_string()).collect(),
            version: 1,
            embedding: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn cosine_distance_behaves() {
        assert_eq!(cosine_distance(&[1.0, 0.0], &[1.0, 0.0]), Some(0.0));
        let orthogonal = cosine_distance(&[1.0, 0.0], &[0.0, 1.0]).unwrap();
        assert!((orthogonal - 1.0).abs() < 1e-9);
        assert_eq!(cosine_distance(&[1.0], &[1.0, 2.0]), None);
        assert_eq!(cosine_distance(&[0.0, 0.0], &[1.0, 2.0]), None);
    }

    #[test]
    fn base_score_weights_components() {
        let candidate = runbook(&["web"], &["linux"], &[]);
        let context = QueryContext {
            server_type: Some("web".into()),
            os: Some("linux".into()),
        };
        // distance 0.0, perfect history, full context: 0.5 + 0.3 + 0.2
        let score = base_score(0.0, 1.0, &context, &candidate);
        assert!((score - 1.0).abs() < 1e-9);

        let neutral = base_score(0.5, 0.5, &QueryContext::default(), &candidate);
        assert!((neutral - (0.5 * 0.5 + 0.5 * 0.3)).abs() < 1e-9);
    }

    #[test]
    fn success_rate_defaults_to_neutral() {
        assert_eq!(historical_success_rate(&[]), 0.5);
        let statuses: Vec<String> = vec!["success".into(), "failed".into(), "success".into()];
        assert!((historical_success_rate(&statuses) - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn bonuses_clamp_to_bounds() {
        assert!((apply_bonuses(0.8, true, 1.0, 10, 0) - 1.0).abs() < 1e-9);
        assert!((apply_bonuses(0.0, false, 0.0, 0, 10) - 0.1).abs() < 1e-9);
        let mixed = apply_bonuses(0.5, false, 0.5, 3, 1);
        // 0.5 + 0.05 popularity + 0.075 feedback
        assert!((mixed - 0.625).abs() < 1e-9);
    }

    #[test]
    fn strategy_decision_matrix() {
        assert_eq!(determine_presentation_strategy(&[]), "no_solutions");
        assert_eq!(determine_presentation_strategy(&[0.4]), "single_solution");
        // Clear winner by gap.
        assert_eq!(
            determine_presentation_strategy(&[0.80, 0.60]),
            "single_solution"
        );
        // Clear winner by absolute confidence.
        assert_eq!(
            determine_presentation_strategy(&[0.86, 0.80]),
            "single_solution"
        );
        // Near tie.
        assert_eq!(
            determine_presentation_strategy(&[0.70, 0.65]),
            "multiple_options"
        );
        // Moderate gap, low top confidence.
        assert_eq!(
            determine_presentation_strategy(&[0.55, 0.44]),
            "experimental_options"
        );
        // Moderate gap, mid confidence.
        assert_eq!(
            determine_presentation_strategy(&[0.75, 0.64]),
            "primary_plus_one"
        );
    }

    #[test]
    fn access_control_distinguishes_roles() {
        let operator = Principal::new("op", vec!["operator".into()]);
        let viewer = Principal::new("dev", vec!["developer".into()]);
        let open = runbook(&[], &[], &[]);
        let restricted = runbook(&[], &[], &["sre"]);

        assert!(check_runbook_access(&operator, &open, Permission::View));
        assert!(check_runbook_access(&operator, &restricted, Permission::Execute));

        assert!(check_runbook_access(&viewer, &open, Permission::View));
        assert!(!check_runbook_access(&viewer, &restricted, Permission::View));
        assert!(!check_runbook_access(&viewer, &restricted, Permission::Execute));

        let sre = Principal::new("sre-1", vec!["sre".into()]);
        assert!(check_runbook_access(&sre, &restricted, Permission::Execute));

        let mut disabled = runbook(&[], &[], &[]);
        disabled.enabled = false;
        assert!(!check_runbook_access(&operator, &disabled, Permission::View));
    }
}
