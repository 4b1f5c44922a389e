//! Scenario: a provider rejecting one key with `429` causes the Unified API
//! Client to rotate to the next key in the pool and succeed, while the
//! rate-limited key is placed into cooldown (`spec.md` §8, §4.1, §4.3).

mod support;

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use weather_orchestrator::cache::Cache;
use weather_orchestrator::client::{CallOptions, UnifiedApiClient};
use weather_orchestrator::config::ProviderConfig;
use weather_orchestrator::keypool::KeyPool;
use weather_orchestrator::providers::{endpoints, Provider};
use weather_orchestrator::telemetry::Metrics;

#[tokio::test(flavor = "multi_thread")]
async fn rotates_key_after_429_and_cools_down_the_rejected_key() {
    let Some(redis_url) = support::test_redis_url() else {
        eprintln!("skipping: WFB_TEST_REDIS_URL/REDIS_URL not set");
        return;
    };

    let kma_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/short_forecast"))
        .and(header("authorization", "Bearer kma-key-1"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&kma_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/short_forecast"))
        .and(header("authorization", "Bearer kma-key-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"forecast": "clear"})))
        .mount(&kma_server)
        .await;

    let metrics = std::sync::Arc::new(Metrics::new());
    let mut providers = std::collections::HashMap::new();
    providers.insert(
        "kma".to_string(),
        ProviderConfig {
            keys: vec!["kma-key-1".to_string(), "kma-key-2".to_string()],
            daily_quota: 1_000,
            reset_timezone: "Asia/Seoul".to_string(),
            base_url: kma_server.uri(),
        },
    );
    let key_pool = std::sync::Arc::new(KeyPool::new(&providers, metrics.clone()));

    let cache = std::sync::Arc::new(
        Cache::new(
            &redis_url,
            0.8,
            Duration::from_secs(10),
            std::collections::HashMap::new(),
            metrics.clone(),
        )
        .expect("cache connects"),
    );

    struct DiscardSink;
    #[async_trait::async_trait]
    impl weather_orchestrator::client::RawResponseSink for DiscardSink {
        async fn record(
            &self,
            _event: weather_orchestrator::storage::policy::RawResponseEvent,
        ) -> Option<uuid::Uuid> {
            None
        }
    }

    let mut base_urls = std::collections::BTreeMap::new();
    base_urls.insert(Provider::Kma, kma_server.uri());

    let client = UnifiedApiClient::new(key_pool.clone(), cache, std::sync::Arc::new(DiscardSink), base_urls);

    let mut params = BTreeMap::new();
    params.insert("region".to_string(), "seoul".to_string());
    let response = client
        .call(
            Provider::Kma,
            endpoints::KMA_SHORT_FORECAST,
            &params,
            CallOptions {
                store_raw: false,
                cache_ttl: None,
                timeout: Duration::from_secs(5),
                max_retries: 2,
            },
        )
        .await
        .expect("rotates to the second key and succeeds");

    assert_eq!(response.body, json!({"forecast": "clear"}));

    let snapshot = key_pool.snapshot(Provider::Kma).await;
    let rejected = snapshot.iter().find(|k| k.id == 0).expect("key 0 present");
    assert!(rejected.cooldown_until.is_some(), "rate-limited key should be cooling down");
}
