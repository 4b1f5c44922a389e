//! Scenario: submit a `SystemHealthCheck` job and see it run end to end
//! through `JobManager::execute`, landing in `Completed` with a populated
//! result summary (`spec.md` §8).

mod support;

use weather_orchestrator::domain::{JobStatus, JobType, OpaqueBag};
use weather_orchestrator::runtime::Runtime;

#[tokio::test(flavor = "multi_thread")]
async fn submit_and_complete_health_check() {
    let Some(database_url) = support::test_database_url() else {
        eprintln!("skipping: WFB_TEST_DATABASE_URL/DATABASE_URL not set");
        return;
    };
    let Some(redis_url) = support::test_redis_url() else {
        eprintln!("skipping: WFB_TEST_REDIS_URL/REDIS_URL not set");
        return;
    };

    let pool = support::connect_and_migrate(&database_url).await;
    support::truncate_all(&pool).await;

    let config = support::test_config(
        &database_url,
        &redis_url,
        "http://127.0.0.1:1/kma",
        "http://127.0.0.1:1/kto",
    );
    let runtime: std::sync::Arc<Runtime> = Runtime::build(config).await.expect("runtime builds");

    let job = runtime
        .job_manager
        .submit(JobType::SystemHealthCheck, OpaqueBag::new(), Some("test-harness".to_string()))
        .await
        .expect("submit succeeds");
    assert_eq!(job.status, JobStatus::Pending);

    runtime.job_manager.execute(job.clone()).await.expect("execute succeeds");

    let finished = runtime.job_manager.get(job.id).await.expect("job exists");
    assert_eq!(finished.status, JobStatus::Completed);
    assert_eq!(finished.progress, 100.0);
    let summary = finished.result_summary.expect("health check returns a summary");
    assert!(summary.get("kma_active_keys").is_some());
    assert!(summary.get("kto_active_keys").is_some());
    assert!(summary.get("scheduler_queue_depth").is_some());

    let logs = runtime
        .job_manager
        .logs(job.id, weather_orchestrator::domain::PageRequest { page: 1, size: 50 })
        .await
        .expect("logs readable");
    assert_eq!(logs.items.len(), 0, "health check body never logs on the happy path");

    runtime.shutdown().await;
}
