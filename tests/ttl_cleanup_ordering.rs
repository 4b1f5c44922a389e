//! Scenario: a single `cleanup` call reclaims every eligible candidate
//! class in one pass — already-expired rows, low-priority-aged rows, and
//! oversize-aged rows are concatenated into one candidate list rather than
//! tried as a class-to-class fallback (`spec.md` §8, §4.6).

mod support;

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use uuid::Uuid;

use weather_orchestrator::storage::repo::RawResponseRepo;
use weather_orchestrator::telemetry::Metrics;
use weather_orchestrator::ttl::{TtlEngine, TtlPolicyConfig};

async fn insert_backdated(
    pool: &sqlx::PgPool,
    created_at: chrono::DateTime<Utc>,
    ttl_days: i32,
    priority: i16,
    response_size_bytes: i64,
) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO raw_api_responses
            (id, provider, endpoint, request_url, params, response,
             response_size_bytes, status_code, execution_time_ms,
             created_at, ttl_days, priority, archived)
        VALUES ($1, 'kma', 'short_forecast', 'https://example.invalid', '{}'::jsonb, '{}'::jsonb,
                $2, 200, 10.0, $3, $4, $5, false)
        "#,
    )
    .bind(id)
    .bind(response_size_bytes)
    .bind(created_at)
    .bind(ttl_days)
    .bind(priority)
    .execute(pool)
    .await
    .expect("insert backdated raw response");
    id
}

#[tokio::test(flavor = "multi_thread")]
async fn cleanup_reclaims_every_candidate_class_in_one_pass() {
    let Some(database_url) = support::test_database_url() else {
        eprintln!("skipping: WFB_TEST_DATABASE_URL/DATABASE_URL not set");
        return;
    };

    let pool = support::connect_and_migrate(&database_url).await;
    support::truncate_all(&pool).await;

    let now = Utc::now();

    // Already expired: ttl_days=1 but inserted 2 days ago. High priority and
    // small, so it can't also match the low-priority or oversize classes.
    let expired_id = insert_backdated(&pool, now - ChronoDuration::days(2), 1, 5, 100).await;

    // Low-priority (3) and aged past the default 30-day horizon, but not
    // expired by its own (generous) ttl_days.
    let low_priority_id = insert_backdated(&pool, now - ChronoDuration::days(35), 365, 3, 100).await;

    // Oversized (> default 10MB), priority 2, aged past the default 7-day
    // horizon, but not priority 3 so it never matches the low-priority class.
    let oversize_id = insert_backdated(&pool, now - ChronoDuration::days(10), 365, 2, 50 * 1024 * 1024).await;

    // Untouched: fresh, small, mid priority — not a candidate in any class.
    let fresh_id = insert_backdated(&pool, now, 365, 2, 100).await;

    let repo = Arc::new(RawResponseRepo::new(pool.clone()));
    let metrics = Arc::new(Metrics::new());
    let engine = TtlEngine::new(repo.clone(), TtlPolicyConfig::default(), metrics);

    let report = engine.cleanup(None, false).await.expect("cleanup runs");

    assert_eq!(report.candidates, 3, "all three eligible rows are collected in one pass");
    assert_eq!(report.deleted, 3);
    assert!(report.errors.is_empty());
    assert!(!row_exists(&pool, expired_id).await);
    assert!(!row_exists(&pool, low_priority_id).await);
    assert!(!row_exists(&pool, oversize_id).await);
    assert!(row_exists(&pool, fresh_id).await);

    let second = engine.cleanup(None, false).await.expect("cleanup runs");
    assert_eq!(second.candidates, 0, "cleanup is idempotent once nothing is eligible");
    assert_eq!(second.deleted, 0);
}

async fn row_exists(pool: &sqlx::PgPool, id: Uuid) -> bool {
    sqlx::query_scalar::<_, i64>("SELECT count(*) FROM raw_api_responses WHERE id = $1")
        .bind(id)
        .fetch_one(pool)
        .await
        .expect("count query")
        > 0
}
