//! Storage Policy Engine (C4, `spec.md` §4.4).
//!
//! Grounded on `original_source/app/core/api_client_extension.py`'s
//! rule-gating logic: a raw response is either accepted for persistence or
//! rejected, decided per `(provider, endpoint)` with a provider-level
//! default fallback.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::config::StorageRuleConfig;
use crate::providers::Provider;
use crate::telemetry::Metrics;

/// A single completed HTTP exchange, offered to the policy engine for a
/// store/reject decision (`spec.md` §4.4 input).
#[derive(Debug, Clone)]
pub struct RawResponseEvent {
    pub provider: Provider,
    pub endpoint: String,
    pub request_url: String,
    pub params: std::collections::BTreeMap<String, String>,
    pub response: Value,
    pub response_size_bytes: u64,
    pub status_code: u16,
    pub execution_time_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    RuleDisabled,
    NoMatchingRule,
    StatusNotAllowed,
    TooSmall,
    TooLarge,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectReason::RuleDisabled => "rule_disabled",
            RejectReason::NoMatchingRule => "no_matching_rule",
            RejectReason::StatusNotAllowed => "status_not_allowed",
            RejectReason::TooSmall => "too_small",
            RejectReason::TooLarge => "too_large",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageDecision {
    Store { ttl_days: u32, priority: u8 },
    Reject(RejectReason),
}

/// Resolved rule, keyed by `(provider, endpoint)` with `endpoint: None`
/// entries acting as the provider-level default (`spec.md` §4.4 Rule
/// lookup: specific match, then provider default, then reject).
struct Rule {
    enabled: bool,
    min_size: u64,
    max_size: u64,
    allowed_status_codes: Vec<u16>,
    ttl_days: u32,
    priority: u8,
}

pub struct StoragePolicyEngine {
    specific: HashMap<(String, String), Rule>,
    defaults: HashMap<String, Rule>,
    metrics: Arc<Metrics>,
}

impl StoragePolicyEngine {
    pub fn new(rules: &[StorageRuleConfig], metrics: Arc<Metrics>) -> Self {
        let mut specific = HashMap::new();
        let mut defaults = HashMap::new();
        for rule_cfg in rules {
            let rule = Rule {
                enabled: rule_cfg.enabled,
                min_size: rule_cfg.min_size,
                max_size: rule_cfg.max_size,
                allowed_status_codes: rule_cfg.allowed_status_codes.clone(),
                ttl_days: rule_cfg.ttl_days,
                priority: rule_cfg.priority,
            };
            match &rule_cfg.endpoint {
                Some(endpoint) => {
                    specific.insert((rule_cfg.provider.clone(), endpoint.clone()), rule);
                }
                None => {
                    defaults.insert(rule_cfg.provider.clone(), rule);
                }
            }
        }
        Self {
            specific,
            defaults,
            metrics,
        }
    }

    /// Decide whether `event` should be persisted, and the resulting TTL
    /// class for the TTL engine's size-day policy (`spec.md` §4.4, §4.6).
    pub fn decide(&self, event: &RawResponseEvent) -> StorageDecision {
        let provider = event.provider.to_string();
        let rule = self
            .specific
            .get(&(provider.clone(), event.endpoint.clone()))
            .or_else(|| self.defaults.get(&provider));

        let Some(rule) = rule else {
            self.metrics.storage_records_rejected.inc();
            return StorageDecision::Reject(RejectReason::NoMatchingRule);
        };

        if !rule.enabled {
            self.metrics.storage_records_rejected.inc();
            return StorageDecision::Reject(RejectReason::RuleDisabled);
        }

        if !rule.allowed_status_codes.is_empty()
            && !rule.allowed_status_codes.contains(&event.status_code)
        {
            self.metrics.storage_records_rejected.inc();
            return StorageDecision::Reject(RejectReason::StatusNotAllowed);
        }

        if event.response_size_bytes < rule.min_size {
            self.metrics.storage_records_rejected.inc();
            return StorageDecision::Reject(RejectReason::TooSmall);
        }

        if rule.max_size > 0 && event.response_size_bytes > rule.max_size {
            self.metrics.storage_records_rejected.inc();
            return StorageDecision::Reject(RejectReason::TooLarge);
        }

        self.metrics.storage_records_stored.inc();
        StorageDecision::Store {
            ttl_days: rule.ttl_days,
            priority: rule.priority,
        }
    }
}
