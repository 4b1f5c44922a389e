//! Scenario: two near-simultaneous reads of a cache entry past its refresh
//! threshold trigger exactly one background refresh, not two
//! (`spec.md` §8, §4.2 refresh-ahead + distributed lock).

mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use weather_orchestrator::cache::Cache;
use weather_orchestrator::telemetry::Metrics;

#[tokio::test(flavor = "multi_thread")]
async fn refresh_ahead_is_single_flight() {
    let Some(redis_url) = support::test_redis_url() else {
        eprintln!("skipping: WFB_TEST_REDIS_URL/REDIS_URL not set");
        return;
    };

    let metrics = Arc::new(Metrics::new());
    // A generous refresh threshold so the entry is already "due" for
    // refresh well before it actually expires.
    let cache = Arc::new(
        Cache::new(&redis_url, 0.99, Duration::from_secs(5), std::collections::HashMap::new(), metrics)
            .expect("cache connects"),
    );

    let key = format!("test:single-flight:{}", uuid::Uuid::new_v4());
    cache.set(&key, "stale-value", Duration::from_secs(2)).await.expect("seed cache entry");

    // Let the entry age past the refresh threshold without expiring.
    tokio::time::sleep(Duration::from_millis(600)).await;

    let refresh_calls = Arc::new(AtomicUsize::new(0));
    let ttl = Duration::from_secs(2);

    let (first, second) = tokio::join!(
        {
            let cache = cache.clone();
            let key = key.clone();
            let refresh_calls = refresh_calls.clone();
            async move {
                cache
                    .get(&key, ttl, move || async move {
                        refresh_calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok("fresh-value".to_string())
                    })
                    .await
            }
        },
        {
            let cache = cache.clone();
            let key = key.clone();
            let refresh_calls = refresh_calls.clone();
            async move {
                cache
                    .get(&key, ttl, move || async move {
                        refresh_calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok("fresh-value".to_string())
                    })
                    .await
            }
        }
    );

    assert_eq!(first.expect("hit"), Some("stale-value".to_string()));
    assert_eq!(second.expect("hit"), Some("stale-value".to_string()));

    // Give the winning background refresh time to finish and release its lock.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(
        refresh_calls.load(Ordering::SeqCst),
        1,
        "only one concurrent reader should win the refresh lock"
    );
}
