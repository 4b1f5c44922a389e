//! Cache Layer with Refresh-Ahead & Distributed Lock (C2, `spec.md` §4.2).
//!
//! Grounded on the teacher's `redis`/`deadpool-redis` dependency (used for
//! entity caching in `apollo-router`) and on `original_source`'s
//! `advanced_cache_manager.py` (refresh-ahead, dependency invalidation,
//! distributed lock via a value-tagged key).

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use deadpool_redis::{redis::AsyncCommands, Config as RedisConfig, Pool, Runtime as DeadpoolRuntime};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::telemetry::Metrics;

/// Mapping of a mutated key's prefix to the cache-key patterns that must be
/// invalidated when it changes (`spec.md` §4.2 Dependency invalidation).
pub type InvalidationMap = HashMap<String, Vec<String>>;

pub struct Cache {
    pool: Pool,
    refresh_threshold: f64,
    lock_ttl: Duration,
    invalidation_map: InvalidationMap,
    metrics: Arc<Metrics>,
}

impl Cache {
    pub fn new(
        redis_url: &str,
        refresh_threshold: f64,
        lock_ttl: Duration,
        invalidation_map: InvalidationMap,
        metrics: Arc<Metrics>,
    ) -> anyhow::Result<Self> {
        let cfg = RedisConfig::from_url(redis_url);
        let pool = cfg.create_pool(Some(DeadpoolRuntime::Tokio1))?;
        Ok(Self {
            pool,
            refresh_threshold,
            lock_ttl,
            invalidation_map,
            metrics,
        })
    }

    /// `get(key, ttl, refresh_threshold, refresh_fn)` from `spec.md` §4.2.
    ///
    /// On hit with plenty of remaining TTL, returns the cached value. On hit
    /// with remaining TTL below `refresh_threshold * ttl`, returns the
    /// cached value immediately and launches a non-blocking background
    /// refresh guarded by a single-flight lock. On miss, returns `None` and
    /// the caller is expected to populate via [`Cache::set`].
    pub async fn get<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        refresh_fn: F,
    ) -> Result<Option<String>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<String>> + Send + 'static,
    {
        let mut conn = self.connection().await?;
        let entry_key = Self::entry_key(key);

        let raw: Option<(String, i64, i64)> = {
            let value: Option<String> = conn
                .get(&entry_key)
                .await
                .map_err(Self::redis_err)?;
            match value {
                Some(raw) => match serde_json::from_str::<StoredEntry>(&raw) {
                    Ok(entry) => Some((entry.value, entry.created_at_epoch, entry.ttl_secs)),
                    Err(_) => None,
                },
                None => None,
            }
        };

        let Some((value, created_at_epoch, ttl_secs)) = raw else {
            self.metrics.cache_misses.inc();
            return Ok(None);
        };
        self.metrics.cache_hits.inc();

        let now = chrono::Utc::now().timestamp();
        let age = (now - created_at_epoch).max(0) as f64;
        let remaining = (ttl_secs as f64 - age).max(0.0);
        let fraction_remaining = if ttl_secs > 0 {
            remaining / ttl_secs as f64
        } else {
            0.0
        };

        if fraction_remaining < self.refresh_threshold {
            self.spawn_refresh(key.to_string(), ttl, refresh_fn);
        }

        Ok(Some(value))
    }

    /// Unconditionally overwrites `key`'s cached value (`spec.md` §4.2
    /// Write policy).
    pub async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.connection().await?;
        let entry = StoredEntry {
            value: value.to_string(),
            created_at_epoch: chrono::Utc::now().timestamp(),
            ttl_secs: ttl.as_secs() as i64,
        };
        let raw = serde_json::to_string(&entry).expect("serializable");
        let _: () = conn
            .set_ex(Self::entry_key(key), raw, ttl.as_secs().max(1))
            .await
            .map_err(Self::redis_err)?;
        self.invalidate_dependents(key).await;
        Ok(())
    }

    /// Removes all keys matching `pattern`, in bounded-size batches
    /// (`spec.md` §4.2 Write policy).
    pub async fn delete(&self, pattern: &str) -> Result<u64> {
        let mut conn = self.connection().await?;
        Self::delete_pattern(&mut conn, &Self::entry_key(pattern)).await
    }

    async fn delete_pattern(
        conn: &mut deadpool_redis::Connection,
        full_pattern: &str,
    ) -> Result<u64> {
        let mut cursor: u64 = 0;
        let mut deleted = 0u64;
        const BATCH: usize = 200;
        loop {
            let (next_cursor, keys): (u64, Vec<String>) = deadpool_redis::redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(full_pattern)
                .arg("COUNT")
                .arg(BATCH)
                .query_async(conn)
                .await
                .map_err(Self::redis_err)?;
            if !keys.is_empty() {
                let n: u64 = conn.del(&keys).await.map_err(Self::redis_err)?;
                deleted += n;
            }
            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }
        Ok(deleted)
    }

    /// Asynchronously invalidates every pattern configured as a dependent of
    /// `mutated_key`'s prefix (`spec.md` §4.2 Dependency invalidation).
    async fn invalidate_dependents(&self, mutated_key: &str) {
        for (prefix, dependents) in &self.invalidation_map {
            if !mutated_key.starts_with(prefix.as_str()) {
                continue;
            }
            for pattern in dependents {
                let pattern = Self::entry_key(pattern);
                let pool = self.pool.clone();
                tokio::spawn(async move {
                    if let Ok(mut conn) = pool.get().await {
                        if let Err(e) = Self::delete_pattern(&mut conn, &pattern).await {
                            warn!(%pattern, error = %e, "dependent cache invalidation failed");
                        }
                    }
                });
            }
        }
    }

    /// Single-flight background refresh guarded by `lock:refresh:<key>`.
    /// The lock is acquired with a value tag (owner id); release is
    /// conditional on the tag still matching, so a worker that outlives its
    /// own lock TTL cannot clobber a newer owner's lock.
    fn spawn_refresh<F, Fut>(&self, key: String, ttl: Duration, refresh_fn: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<String>> + Send + 'static,
    {
        let pool = self.pool.clone();
        let lock_ttl = self.lock_ttl;
        tokio::spawn(async move {
            let owner = Uuid::new_v4().to_string();
            let lock_key = format!("lock:refresh:{key}");
            let mut conn = match pool.get().await {
                Ok(c) => c,
                Err(e) => {
                    warn!(error = %e, "refresh-ahead: could not get redis connection");
                    return;
                }
            };

            let acquired: bool = deadpool_redis::redis::cmd("SET")
                .arg(&lock_key)
                .arg(&owner)
                .arg("NX")
                .arg("EX")
                .arg(lock_ttl.as_secs().max(1))
                .query_async::<_, Option<String>>(&mut conn)
                .await
                .ok()
                .flatten()
                .is_some();

            if !acquired {
                debug!(%key, "refresh-ahead: another worker already holds the lock");
                return;
            }

            let result = refresh_fn().await;
            match result {
                Ok(value) => {
                    let entry = StoredEntry {
                        value,
                        created_at_epoch: chrono::Utc::now().timestamp(),
                        ttl_secs: ttl.as_secs() as i64,
                    };
                    let raw = serde_json::to_string(&entry).expect("serializable");
                    let _: Result<(), _> = conn
                        .set_ex(format!("cache:{key}"), raw, ttl.as_secs().max(1))
                        .await;
                }
                Err(e) => warn!(%key, error = %e, "refresh-ahead function failed"),
            }

            // Compare-and-delete: only release if we still hold the tag.
            let current: Option<String> = conn.get(&lock_key).await.ok().flatten();
            if current.as_deref() == Some(owner.as_str()) {
                let _: Result<(), _> = conn.del(&lock_key).await;
            }
        });
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| OrchestratorError::Config(format!("redis pool error: {e}")))
    }

    fn entry_key(key: &str) -> String {
        format!("cache:{key}")
    }

    fn redis_err(e: deadpool_redis::redis::RedisError) -> OrchestratorError {
        OrchestratorError::Config(format!("redis error: {e}"))
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct StoredEntry {
    value: String,
    created_at_epoch: i64,
    ttl_secs: i64,
}
