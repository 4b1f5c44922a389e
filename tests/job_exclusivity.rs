//! Scenario: submitting a second instance of an exclusive job type while one
//! is still pending/running is rejected (`spec.md` §8, §4.9 "Exclusive job
//! type"), surfaced over HTTP as `409 Conflict` via
//! `OrchestratorError::JobTypeAlreadyRunning`.

mod support;

use weather_orchestrator::domain::{JobType, OpaqueBag};
use weather_orchestrator::error::OrchestratorError;
use weather_orchestrator::runtime::Runtime;

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_exclusive_submission_is_rejected() {
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

    assert!(JobType::WeatherDataCollection.is_exclusive());

    let first = runtime
        .job_manager
        .submit(JobType::WeatherDataCollection, OpaqueBag::new(), None)
        .await
        .expect("first submission succeeds while nothing else is running");

    let second = runtime
        .job_manager
        .submit(JobType::WeatherDataCollection, OpaqueBag::new(), None)
        .await;

    match second {
        Err(OrchestratorError::JobTypeAlreadyRunning { job_type }) => {
            assert_eq!(job_type, "weather_data_collection");
        }
        other => panic!("expected JobTypeAlreadyRunning, got {other:?}"),
    }

    // A non-exclusive job type is unaffected by the pending collection job.
    let health_check = runtime
        .job_manager
        .submit(JobType::SystemHealthCheck, OpaqueBag::new(), None)
        .await;
    assert!(health_check.is_ok());

    let _ = first;
    runtime.shutdown().await;
}
