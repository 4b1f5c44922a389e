//! Startup configuration bag (`SPEC_FULL.md` §6).
//!
//! Loaded once at process start via [`Config::load`]: built-in defaults layer,
//! then an optional `config.yaml`, then environment variables prefixed
//! `WFB_`. A missing or invalid required field is a
//! [`crate::error::OrchestratorError::Config`], which the binary entrypoint
//! treats as a fatal startup error (process exit non-zero, spec.md §6).

use std::collections::HashMap;
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub max_concurrent_jobs: usize,
    pub api_key: String,
    pub database_url: String,
    pub bind_addr: String,
    pub providers: HashMap<String, ProviderConfig>,
    pub storage_rules: Vec<StorageRuleConfig>,
    pub storage_queue: StorageQueueConfig,
    pub alert_rules: Vec<AlertRuleConfig>,
    pub cache: CacheConfig,
    pub redis_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub keys: Vec<String>,
    pub daily_quota: u32,
    /// IANA timezone used to compute the provider-local midnight reset
    /// boundary (`SPEC_FULL.md` §9, Open Question 4).
    #[serde(default = "default_provider_timezone")]
    pub reset_timezone: String,
    pub base_url: String,
}

fn default_provider_timezone() -> String {
    "Asia/Seoul".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageRuleConfig {
    pub provider: String,
    /// `None` denotes the provider-default fallback rule (spec.md §4.4).
    pub endpoint: Option<String>,
    pub enabled: bool,
    pub min_size: u64,
    pub max_size: u64,
    pub allowed_status_codes: Vec<u16>,
    pub priority: u8,
    pub ttl_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageQueueConfig {
    pub queue_size: usize,
    pub worker_count: usize,
    pub batch_size: usize,
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,
    pub max_retries: u32,
}

impl Default for StorageQueueConfig {
    fn default() -> Self {
        Self {
            queue_size: 3_000,
            worker_count: 4,
            batch_size: 50,
            flush_interval: Duration::from_secs(2),
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRuleConfig {
    pub id: String,
    pub metric: String,
    pub threshold: f64,
    pub severity: String,
    #[serde(with = "humantime_serde")]
    pub check_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub escalation_time: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(with = "humantime_serde")]
    pub default_ttl: Duration,
    pub refresh_threshold: f64,
    #[serde(with = "humantime_serde")]
    pub lock_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(3600),
            refresh_threshold: 0.8,
            lock_ttl: Duration::from_secs(30),
        }
    }
}

fn defaults() -> serde_json::Value {
    serde_json::json!({
        "max_concurrent_jobs": 4,
        "bind_addr": "0.0.0.0:8080",
        "providers": {},
        "storage_rules": [],
        "storage_queue": StorageQueueConfig::default(),
        "alert_rules": [],
        "cache": CacheConfig::default(),
        "redis_url": "redis://127.0.0.1:6379",
    })
}

impl Config {
    /// Load configuration from built-in defaults, an optional `config.yaml`
    /// next to the working directory, and `WFB_`-prefixed environment
    /// variables, in that precedence order.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut figment = Figment::new().merge(Serialized::defaults(defaults()));
        if let Some(path) = config_path {
            figment = figment.merge(Yaml::file(path));
        } else if std::path::Path::new("config.yaml").exists() {
            figment = figment.merge(Yaml::file("config.yaml"));
        }
        figment = figment.merge(Env::prefixed("WFB_").split("__"));

        let config: Config = figment
            .extract()
            .map_err(|e| OrchestratorError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.api_key.trim().is_empty() {
            return Err(OrchestratorError::Config("api_key must be set".into()));
        }
        if self.database_url.trim().is_empty() {
            return Err(OrchestratorError::Config(
                "database_url must be set".into(),
            ));
        }
        if self.max_concurrent_jobs == 0 {
            return Err(OrchestratorError::Config(
                "max_concurrent_jobs must be > 0".into(),
            ));
        }
        for (name, provider) in &self.providers {
            if provider.keys.is_empty() {
                return Err(OrchestratorError::Config(format!(
                    "provider {name} has no keys configured"
                )));
            }
        }
        Ok(())
    }
}
