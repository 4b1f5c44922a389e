//! Scenario: a cooperative `stop(force=false)` issued while a job is
//! mid-flight lands the job in `Stopped` rather than `Completed`
//! (`spec.md` §8, §4.8 `stop`).

mod support;

use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use weather_orchestrator::domain::{JobStatus, JobType, OpaqueBag};
use weather_orchestrator::runtime::Runtime;

#[tokio::test(flavor = "multi_thread")]
async fn stop_mid_run_lands_in_stopped() {
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

    let kma_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/short_forecast"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"forecast": "sunny"})).set_delay(Duration::from_millis(250)))
        .mount(&kma_server)
        .await;

    let config = support::test_config(&database_url, &redis_url, &kma_server.uri(), "http://127.0.0.1:1/kto");
    let runtime: std::sync::Arc<Runtime> = Runtime::build(config).await.expect("runtime builds");

    let job = runtime
        .job_manager
        .submit(JobType::WeatherDataCollection, OpaqueBag::new(), None)
        .await
        .expect("submit succeeds");

    let manager = runtime.job_manager.clone();
    let job_for_task = job.clone();
    let handle = tokio::spawn(async move { manager.execute(job_for_task).await });

    // Let the first region's (slow) call start, then stop before the body
    // reaches the end of its region loop.
    tokio::time::sleep(Duration::from_millis(100)).await;
    runtime.job_manager.stop(job.id, false).await.expect("job is running");

    handle.await.expect("task didn't panic").expect("execute returns Ok even on stop");

    let finished = runtime.job_manager.get(job.id).await.expect("job exists");
    assert_eq!(finished.status, JobStatus::Stopped);
    assert!(finished.error_message.is_some());

    runtime.shutdown().await;
}
