use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use remediation_core::db::runbooks::set_embedding;
use remediation_core::import::{import_runbook, parse_runbook_document};
use remediation_core::principal::Principal;
use remediation_core::ranker::{
    rank_solutions, record_solution_click, record_solution_feedback, Embedder, QueryContext,
};

struct StaticEmbedder {
    vector: Vec<f32>,
}

#[async_trait]
impl Embedder for StaticEmbedder {
    fn dimension(&self) -> usize {
        self.vector.len()
    }

    async fn embed(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
        Ok(self.vector.clone())
    }
}

struct FailingEmbedder;

#[async_trait]
impl Embedder for FailingEmbedder {
    fn dimension(&self) -> usize {
        2
    }

    async fn embed(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
        anyhow::bail!("embedding backend offline")
    }
}

async fn seed_runbook(pool: &PgPool, name: &str, embedding: &[f32]) -> Uuid {
    let yaml = format!(
        r#"
name: {name}
description: candidate runbook
auto_execute: true
steps:
  - step_order: 1
    name: fix
    command_linux: echo fix
"#
    );
    let document = parse_runbook_document(&yaml).unwrap();
    let runbook = import_runbook(pool, &document).await.unwrap();
    set_embedding(pool, runbook.id, embedding).await.unwrap();
    runbook.id
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn close_embedding_with_feedback_wins_single_solution(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    // cos distances against the query vector: ~0.05 and ~0.22.
    let near = seed_runbook(&pool, "restart-nginx", &[0.95, 0.312_25]).await;
    let far = seed_runbook(&pool, "rotate-logs", &[0.78, 0.625_88]).await;

    let operator = Principal::new("op", vec!["operator".into()]);
    record_solution_click(&pool, near, &operator).await.unwrap();
    for _ in 0..3 {
        record_solution_feedback(&pool, near, true, &operator)
            .await
            .unwrap();
    }

    let embedder = StaticEmbedder {
        vector: vec![1.0, 0.0],
    };
    let ranked = rank_solutions(
        &pool,
        &embedder,
        "nginx stopped responding",
        &QueryContext::default(),
        &operator,
        3,
    )
    .await
    .unwrap();

    assert_eq!(ranked.presentation_strategy, "single_solution");
    assert_eq!(ranked.solutions.len(), 2);
    assert_eq!(ranked.solutions[0].id, near.to_string());
    assert_eq!(ranked.solutions[1].id, far.to_string());
    assert!(ranked.solutions[0].confidence > 0.9);
    assert!(ranked.solutions[0].confidence > ranked.solutions[1].confidence + 0.15);
    assert_eq!(ranked.solutions[0].permission_status, "can_execute");
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn unavailable_embedder_yields_no_solutions(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    seed_runbook(&pool, "restart-nginx", &[1.0, 0.0]).await;

    let operator = Principal::new("op", vec!["operator".into()]);
    let ranked = rank_solutions(
        &pool,
        &FailingEmbedder,
        "nginx stopped responding",
        &QueryContext::default(),
        &operator,
        3,
    )
    .await
    .unwrap();

    assert!(ranked.solutions.is_empty());
    assert_eq!(ranked.presentation_strategy, "no_solutions");
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn non_operator_principals_see_only_unrestricted_runbooks(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let open = seed_runbook(&pool, "restart-nginx", &[1.0, 0.0]).await;
    let restricted = seed_runbook(&pool, "rotate-keys", &[0.99, 0.141]).await;
    sqlx::query("UPDATE runbooks SET approval_roles = '{sre}' WHERE id = $1")
        .bind(restricted)
        .execute(&pool)
        .await
        .unwrap();

    let viewer = Principal::new("dev", vec!["developer".into()]);
    let embedder = StaticEmbedder {
        vector: vec![1.0, 0.0],
    };
    let ranked = rank_solutions(
        &pool,
        &embedder,
        "nginx stopped responding",
        &QueryContext::default(),
        &viewer,
        3,
    )
    .await
    .unwrap();

    assert_eq!(ranked.solutions.len(), 1);
    assert_eq!(ranked.solutions[0].id, open.to_string());
    assert_eq!(ranked.solutions[0].permission_status, "view_only");
}
