//! Shared test scaffolding: environment-gated Postgres/Redis setup and a
//! minimal `Config` builder, used by the scenario tests in this directory.
//!
//! These tests exercise real Postgres and Redis rather than mocking the
//! repositories, matching `golemcloud-golem`'s integration-test style; they
//! are skipped (not failed) when the services aren't configured, since this
//! crate has no in-process fake for either.

#![allow(dead_code)]

use std::collections::HashMap;
use std::time::Duration;

use sqlx::PgPool;
use weather_orchestrator::config::{
    AlertRuleConfig, CacheConfig, Config, ProviderConfig, StorageQueueConfig, StorageRuleConfig,
};

/// Returns `None` (and prints a skip notice) when the test database isn't
/// configured, so `cargo test` stays green in environments without Postgres.
pub fn test_database_url() -> Option<String> {
    std::env::var("WFB_TEST_DATABASE_URL")
        .or_else(|_| std::env::var("DATABASE_URL"))
        .ok()
}

pub fn test_redis_url() -> Option<String> {
    std::env::var("WFB_TEST_REDIS_URL")
        .or_else(|_| std::env::var("REDIS_URL"))
        .ok()
}

pub async fn connect_and_migrate(database_url: &str) -> PgPool {
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(8)
        .connect(database_url)
        .await
        .expect("connect to test database");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("run migrations");
    pool
}

/// Clears every table this crate owns, so scenario tests don't see state
/// left over from a previous run.
pub async fn truncate_all(pool: &PgPool) {
    sqlx::query("TRUNCATE job_logs, job_executions, raw_api_responses")
        .execute(pool)
        .await
        .expect("truncate test tables");
}

/// A minimal, fully-populated `Config` pointed at wiremock-stubbed provider
/// base URLs, suitable for `Runtime::build`.
pub fn test_config(database_url: &str, redis_url: &str, kma_base: &str, kto_base: &str) -> Config {
    let mut providers = HashMap::new();
    providers.insert(
        "kma".to_string(),
        ProviderConfig {
            keys: vec!["kma-key-1".to_string(), "kma-key-2".to_string()],
            daily_quota: 1_000,
            reset_timezone: "Asia/Seoul".to_string(),
            base_url: kma_base.to_string(),
        },
    );
    providers.insert(
        "kto".to_string(),
        ProviderConfig {
            keys: vec!["kto-key-1".to_string()],
            daily_quota: 1_000,
            reset_timezone: "Asia/Seoul".to_string(),
            base_url: kto_base.to_string(),
        },
    );

    Config {
        max_concurrent_jobs: 4,
        api_key: "test-api-key".to_string(),
        database_url: database_url.to_string(),
        bind_addr: "127.0.0.1:0".to_string(),
        providers,
        storage_rules: vec![StorageRuleConfig {
            provider: "kma".to_string(),
            endpoint: None,
            enabled: true,
            min_size: 0,
            max_size: 0,
            allowed_status_codes: vec![],
            priority: 1,
            ttl_days: 7,
        }],
        storage_queue: StorageQueueConfig {
            queue_size: 100,
            worker_count: 2,
            batch_size: 10,
            flush_interval: Duration::from_millis(100),
            max_retries: 1,
        },
        alert_rules: Vec::<AlertRuleConfig>::new(),
        cache: CacheConfig {
            default_ttl: Duration::from_secs(60),
            refresh_threshold: 0.8,
            lock_ttl: Duration::from_secs(10),
        },
        redis_url: redis_url.to_string(),
    }
}
