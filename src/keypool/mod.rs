//! Key Pool (C1, `spec.md` §4.1): rotates outbound API credentials and
//! tracks per-key quota and error state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tokio::sync::Mutex;
use tracing::warn;

use crate::config::ProviderConfig;
use crate::error::{OrchestratorError, Result};
use crate::providers::Provider;

/// Outcome of a network call made using an acquired key, reported back via
/// [`KeyPool::report`] so the pool can update quota/cooldown state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOutcome {
    Ok,
    RateLimited,
    AuthFailed,
    TransientError { attempt: u32 },
}

#[derive(Debug, Clone)]
pub struct ApiKey {
    pub id: usize,
    pub provider: Provider,
    secret: String,
    pub daily_quota: u32,
    pub used_today: u32,
    pub last_error_at: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub is_active: bool,
}

impl ApiKey {
    fn is_selectable(&self, now: DateTime<Utc>) -> bool {
        self.is_active
            && self.cooldown_until.map(|t| t <= now).unwrap_or(true)
            && self.used_today < self.daily_quota
    }

    /// The raw credential value, for use by the Unified API Client only.
    pub fn secret(&self) -> &str {
        &self.secret
    }
}

struct ProviderPool {
    keys: Vec<ApiKey>,
    next: usize,
    reset_timezone: Tz,
    last_reset_date: chrono::NaiveDate,
}

const TRANSIENT_BACKOFF_BASE: Duration = Duration::from_secs(2);
const TRANSIENT_BACKOFF_CAP: Duration = Duration::from_secs(5 * 60);
const RATE_LIMIT_COOLDOWN: Duration = Duration::from_secs(60);

/// Process-scoped pool of API credentials, one critical section per provider
/// (`spec.md` §5 Shared-resource policy).
pub struct KeyPool {
    pools: HashMap<Provider, Arc<Mutex<ProviderPool>>>,
    metrics: Arc<crate::telemetry::Metrics>,
}

impl KeyPool {
    pub fn new(
        configs: &HashMap<String, ProviderConfig>,
        metrics: Arc<crate::telemetry::Metrics>,
    ) -> Self {
        let now = Utc::now();
        let mut pools = HashMap::new();
        for (name, cfg) in configs {
            let Ok(provider) = name.parse::<Provider>() else {
                warn!(provider = %name, "skipping unknown provider in key pool config");
                continue;
            };
            let tz: Tz = cfg.reset_timezone.parse().unwrap_or(chrono_tz::Asia::Seoul);
            let keys = cfg
                .keys
                .iter()
                .enumerate()
                .map(|(id, secret)| ApiKey {
                    id,
                    provider,
                    secret: secret.clone(),
                    daily_quota: cfg.daily_quota,
                    used_today: 0,
                    last_error_at: None,
                    cooldown_until: None,
                    is_active: true,
                })
                .collect();
            pools.insert(
                provider,
                Arc::new(Mutex::new(ProviderPool {
                    keys,
                    next: 0,
                    reset_timezone: tz,
                    last_reset_date: now.with_timezone(&tz).date_naive(),
                })),
            );
        }
        Self { pools, metrics }
    }

    /// Round-robin over active keys for `provider`; fails with
    /// `NoKeyAvailable` if all keys are quota-exhausted, cooling, or
    /// deactivated. Selection is atomic under the provider's mutex.
    pub async fn acquire(&self, provider: Provider) -> Result<ApiKey> {
        let pool = self
            .pools
            .get(&provider)
            .ok_or_else(|| OrchestratorError::NoKeyAvailable {
                provider: provider.to_string(),
            })?;
        let mut guard = pool.lock().await;
        Self::maybe_reset(&mut guard);

        let n = guard.keys.len();
        let now = Utc::now();
        for offset in 0..n {
            let idx = (guard.next + offset) % n;
            if guard.keys[idx].is_selectable(now) {
                guard.next = (idx + 1) % n;
                return Ok(guard.keys[idx].clone());
            }
        }
        self.metrics.keypool_no_key_available.inc();
        Err(OrchestratorError::NoKeyAvailable {
            provider: provider.to_string(),
        })
    }

    /// Update accounting for a key after a call completes.
    pub async fn report(&self, provider: Provider, key_id: usize, outcome: KeyOutcome) {
        let Some(pool) = self.pools.get(&provider) else {
            return;
        };
        let mut guard = pool.lock().await;
        let now = Utc::now();
        let Some(key) = guard.keys.iter_mut().find(|k| k.id == key_id) else {
            return;
        };
        match outcome {
            KeyOutcome::Ok => {
                key.used_today += 1;
            }
            KeyOutcome::RateLimited => {
                key.cooldown_until = Some(now + RATE_LIMIT_COOLDOWN);
                key.last_error_at = Some(now);
            }
            KeyOutcome::AuthFailed => {
                key.is_active = false;
                key.last_error_at = Some(now);
                warn!(provider = %provider, key_id, "key deactivated after auth failure");
            }
            KeyOutcome::TransientError { attempt } => {
                let backoff = (TRANSIENT_BACKOFF_BASE * 2u32.pow(attempt.min(8)))
                    .min(TRANSIENT_BACKOFF_CAP);
                key.cooldown_until = Some(now + backoff);
                key.last_error_at = Some(now);
            }
        }
    }

    /// Resets `used_today` to zero once the provider-local calendar day has
    /// rolled over (`spec.md` §3 API Key invariant, §9 Open Question 4).
    /// Called opportunistically on every `acquire`; a background ticker
    /// also invokes [`KeyPool::reset_all`] so idle providers still reset.
    fn maybe_reset(pool: &mut ProviderPool) {
        let today = Utc::now().with_timezone(&pool.reset_timezone).date_naive();
        if today != pool.last_reset_date {
            for key in &mut pool.keys {
                key.used_today = 0;
            }
            pool.last_reset_date = today;
        }
    }

    /// Background-ticker entrypoint: reset every provider's quota if its
    /// local day has rolled over. Intended to run on a short interval
    /// (e.g. every minute) from [`crate::runtime::Runtime`].
    pub async fn reset_all(&self) {
        for pool in self.pools.values() {
            let mut guard = pool.lock().await;
            Self::maybe_reset(&mut guard);
        }
    }

    pub async fn snapshot(&self, provider: Provider) -> Vec<KeySummary> {
        let Some(pool) = self.pools.get(&provider) else {
            return Vec::new();
        };
        let guard = pool.lock().await;
        guard
            .keys
            .iter()
            .map(|k| KeySummary {
                id: k.id,
                is_active: k.is_active,
                used_today: k.used_today,
                daily_quota: k.daily_quota,
                cooldown_until: k.cooldown_until,
            })
            .collect()
    }
}

/// Redacted view of key state for `/system/status`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct KeySummary {
    pub id: usize,
    pub is_active: bool,
    pub used_today: u32,
    pub daily_quota: u32,
    pub cooldown_until: Option<DateTime<Utc>>,
}

/// Spawns the minute-resolution midnight-reset ticker.
pub fn spawn_reset_ticker(pool: Arc<KeyPool>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            pool.reset_all().await;
        }
    })
}
