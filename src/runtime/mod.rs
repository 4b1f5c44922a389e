//! Explicit application context (`SPEC_FULL.md` §9 redesign guidance):
//! every component is constructed once at startup and wired together here,
//! then shared via `Arc<Runtime>` — no lazily-initialized globals.

use std::collections::BTreeMap;
use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;

use crate::archival::{ArchivalConfig, ArchivalEngine};
use crate::cache::Cache;
use crate::client::UnifiedApiClient;
use crate::config::Config;
use crate::error::{OrchestratorError, Result};
use crate::jobs::bodies::JobBodyDeps;
use crate::jobs::{default_bodies, JobManager};
use crate::keypool::KeyPool;
use crate::monitor::{Monitor, SelfMetricProbe};
use crate::providers::Provider;
use crate::retry::NotificationBridge;
use crate::scheduler::{Scheduler, SchedulerHandle};
use crate::storage::policy::StoragePolicyEngine;
use crate::storage::queue::StorageQueue;
use crate::storage::repo::{JobRepo, RawResponseRepo};
use crate::telemetry::Metrics;
use crate::ttl::{TtlEngine, TtlPolicyConfig};
use crate::ws::WsFanout;

pub struct Runtime {
    pub config: Config,
    pub metrics: Arc<Metrics>,
    pub db_pool: sqlx::PgPool,
    pub key_pool: Arc<KeyPool>,
    pub cache: Arc<Cache>,
    pub client: Arc<UnifiedApiClient>,
    pub job_repo: Arc<JobRepo>,
    pub raw_response_repo: Arc<RawResponseRepo>,
    pub job_manager: Arc<JobManager>,
    pub scheduler_handle: Arc<SchedulerHandle>,
    pub ttl_engine: Arc<TtlEngine>,
    pub archival_engine: Arc<ArchivalEngine>,
    pub ws_fanout: Arc<WsFanout>,
    pub monitor: Arc<Monitor>,
    pub notification_bridge: Arc<NotificationBridge>,
    pub shutdown: CancellationToken,
    background_tasks: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Runtime {
    pub async fn build(config: Config) -> Result<Arc<Self>> {
        let metrics = Arc::new(Metrics::new());
        let shutdown = CancellationToken::new();

        let db_pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(&config.database_url)
            .await
            .map_err(OrchestratorError::Database)?;
        sqlx::migrate!("./migrations")
            .run(&db_pool)
            .await
            .map_err(|e| OrchestratorError::Config(format!("migration failed: {e}")))?;

        let key_pool = Arc::new(KeyPool::new(&config.providers, metrics.clone()));

        let cache = Arc::new(
            Cache::new(
                &config.redis_url,
                config.cache.refresh_threshold,
                config.cache.lock_ttl,
                default_invalidation_map(),
                metrics.clone(),
            )
            .map_err(|e| OrchestratorError::Config(format!("redis: {e}")))?,
        );

        let job_repo = Arc::new(JobRepo::new(db_pool.clone()));
        let raw_response_repo = Arc::new(RawResponseRepo::new(db_pool.clone()));
        let policy = Arc::new(StoragePolicyEngine::new(&config.storage_rules, metrics.clone()));

        let storage_queue = StorageQueue::new(
            config.storage_queue.queue_size,
            config.storage_queue.worker_count,
            config.storage_queue.batch_size,
            config.storage_queue.flush_interval,
            config.storage_queue.max_retries,
            policy,
            raw_response_repo.clone(),
            metrics.clone(),
        );
        let storage_queue_handle = Arc::new(storage_queue.handle());

        let base_urls: BTreeMap<Provider, String> = config
            .providers
            .iter()
            .filter_map(|(name, cfg)| name.parse::<Provider>().ok().map(|p| (p, cfg.base_url.clone())))
            .collect();

        let client = Arc::new(UnifiedApiClient::new(
            key_pool.clone(),
            cache.clone(),
            storage_queue_handle,
            base_urls,
        ));

        let ttl_engine = Arc::new(TtlEngine::new(
            raw_response_repo.clone(),
            TtlPolicyConfig::default(),
            metrics.clone(),
        ));
        let archival_engine = Arc::new(ArchivalEngine::new(
            raw_response_repo.clone(),
            ArchivalConfig::default(),
            metrics.clone(),
        ));

        let ws_fanout = Arc::new(WsFanout::new(config.api_key.clone(), job_repo.clone()));

        // Channel/recipient routing rules are operator-supplied at deploy
        // time via `NotificationBridge::register_channel`; none ship by
        // default.
        let notification_bridge = Arc::new(NotificationBridge::new(Vec::new(), 5.0, 10.0));

        let probe = Arc::new(SelfMetricProbe::new(metrics.clone()));
        let monitor = Arc::new(Monitor::new(config.alert_rules.clone(), probe, metrics.clone()));

        // `Scheduler`'s submission queue and handle exist independently of
        // `JobManager`; job bodies need the handle (for backlog metrics)
        // before `JobManager` is constructed, and `JobManager` itself is
        // only supplied to `Scheduler::run` once both are ready.
        let scheduler = Scheduler::new(
            config.max_concurrent_jobs * 4,
            config.max_concurrent_jobs,
            metrics.clone(),
        );
        let scheduler_handle = Arc::new(scheduler.handle());

        let regions = default_regions();
        let body_deps = JobBodyDeps {
            client: client.clone(),
            key_pool: key_pool.clone(),
            ttl_engine: ttl_engine.clone(),
            archival_engine: archival_engine.clone(),
            job_repo: job_repo.clone(),
            raw_response_repo: raw_response_repo.clone(),
            scheduler: scheduler_handle.clone(),
            regions,
        };
        let bodies = default_bodies(body_deps);
        let job_manager = Arc::new(JobManager::new(
            job_repo.clone(),
            metrics.clone(),
            ws_fanout.clone(),
            notification_bridge.clone(),
            bodies,
        ));

        let runtime = Arc::new(Self {
            config,
            metrics,
            db_pool,
            key_pool,
            cache,
            client,
            job_repo,
            raw_response_repo,
            job_manager,
            scheduler_handle,
            ttl_engine,
            archival_engine,
            ws_fanout,
            monitor,
            notification_bridge,
            shutdown,
            background_tasks: std::sync::Mutex::new(Vec::new()),
        });

        let mut tasks = Vec::new();
        tasks.push(crate::keypool::spawn_reset_ticker(runtime.key_pool.clone()));
        tasks.push(crate::ttl::spawn_ticker(
            runtime.ttl_engine.clone(),
            std::time::Duration::from_secs(3600),
            runtime.shutdown.clone(),
        ));
        tasks.push(crate::monitor::spawn_loop(
            runtime.monitor.clone(),
            std::time::Duration::from_secs(5),
            runtime.shutdown.clone(),
        ));
        tasks.push(tokio::spawn(storage_queue.run(runtime.shutdown.clone())));
        tasks.push(tokio::spawn(scheduler.run(runtime.job_manager.clone(), runtime.shutdown.clone())));
        *runtime.background_tasks.lock().expect("not poisoned") = tasks;

        Ok(runtime)
    }

    /// Signals every background task to stop and waits briefly for them to
    /// exit (`spec.md` §6 graceful shutdown).
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.background_tasks.lock().expect("not poisoned"));
        for task in tasks {
            let _ = tokio::time::timeout(std::time::Duration::from_secs(10), task).await;
        }
    }
}

fn default_invalidation_map() -> crate::cache::InvalidationMap {
    let mut map = std::collections::HashMap::new();
    map.insert("kma:".to_string(), vec!["recommendation:*".to_string()]);
    map.insert("kto:".to_string(), vec!["recommendation:*".to_string()]);
    map
}

fn default_regions() -> Vec<String> {
    vec![
        "seoul".to_string(),
        "busan".to_string(),
        "incheon".to_string(),
        "jeju".to_string(),
    ]
}
