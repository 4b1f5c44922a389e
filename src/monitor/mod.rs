//! Monitor & Alert Loop (C12, `spec.md` §4.12).
//!
//! Per-rule periodic probes driving an open/escalate/resolve alert
//! lifecycle, grounded on `original_source/app/core/monitoring_service.py`
//! and the teacher's `prometheus` metrics surface for the probed values.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::AlertRuleConfig;
use crate::telemetry::Metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertState {
    Open,
    Escalated,
    Resolved,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Alert {
    pub rule_id: String,
    pub severity: String,
    pub state: AlertState,
    pub opened_at: DateTime<Utc>,
    pub escalated_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub acknowledged: bool,
    pub suppressed_until: Option<DateTime<Utc>>,
    pub last_value: f64,
    pub message: String,
}

impl Alert {
    /// `is_active ⇔ resolved_at absent ∧ (suppressed_until absent ∨
    /// suppressed_until < now)` (`spec.md` §3).
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.resolved_at.is_none() && self.suppressed_until.is_none_or(|until| until < now)
    }
}

/// A metric probe: given a metric name, returns its current value. Backed
/// by the process's own [`Metrics`] registry or by external checks (queue
/// depth, DB connectivity) registered by the runtime.
#[async_trait::async_trait]
pub trait MetricProbe: Send + Sync {
    async fn sample(&self, metric: &str) -> Option<f64>;
}

struct RuleState {
    config: AlertRuleConfig,
    alert: Option<Alert>,
    suppressed_until: Option<DateTime<Utc>>,
    last_checked: Option<std::time::Instant>,
}

impl RuleState {
    fn is_suppressed(&self, now: DateTime<Utc>) -> bool {
        self.suppressed_until.is_some_and(|until| until > now)
    }
}

pub struct Monitor {
    rules: Mutex<HashMap<String, RuleState>>,
    probe: Arc<dyn MetricProbe>,
    metrics: Arc<Metrics>,
    history: Mutex<Vec<Alert>>,
    history_cap: usize,
}

impl Monitor {
    pub fn new(rules: Vec<AlertRuleConfig>, probe: Arc<dyn MetricProbe>, metrics: Arc<Metrics>) -> Self {
        let rules = rules
            .into_iter()
            .map(|cfg| {
                (
                    cfg.id.clone(),
                    RuleState {
                        config: cfg,
                        alert: None,
                        suppressed_until: None,
                        last_checked: None,
                    },
                )
            })
            .collect();
        Self {
            rules: Mutex::new(rules),
            probe,
            metrics,
            history: Mutex::new(Vec::new()),
            history_cap: 500,
        }
    }

    /// Probes every rule whose own `check_interval` has elapsed since its
    /// last probe, advancing each rule's alert lifecycle (`spec.md` §4.12
    /// Alert lifecycle: open -> escalate -> resolve). Intended to be driven
    /// by a ticker finer-grained than the shortest configured
    /// `check_interval` (see [`spawn_loop`]).
    pub async fn check_all(&self) {
        let now = std::time::Instant::now();
        let wall_now = Utc::now();
        let mut guard = self.rules.lock().await;
        for state in guard.values_mut() {
            if state.is_suppressed(wall_now) {
                continue;
            }
            let due = state
                .last_checked
                .map(|t| now.duration_since(t) >= state.config.check_interval)
                .unwrap_or(true);
            if !due {
                continue;
            }
            state.last_checked = Some(now);
            let Some(value) = self.probe.sample(&state.config.metric).await else {
                continue;
            };
            self.evaluate_rule(state, value).await;
        }
    }

    async fn evaluate_rule(&self, state: &mut RuleState, value: f64) {
        let breached = value >= state.config.threshold;
        let now = Utc::now();

        match (&mut state.alert, breached) {
            (None, true) => {
                let alert = Alert {
                    rule_id: state.config.id.clone(),
                    severity: state.config.severity.clone(),
                    state: AlertState::Open,
                    opened_at: now,
                    escalated_at: None,
                    resolved_at: None,
                    acknowledged: false,
                    suppressed_until: state.suppressed_until,
                    last_value: value,
                    message: format!("{} breached threshold: {value} >= {}", state.config.metric, state.config.threshold),
                };
                warn!(rule = %state.config.id, value, "alert opened");
                self.metrics.alerts_active.inc();
                state.alert = Some(alert);
            }
            (Some(alert), true) => {
                alert.last_value = value;
                if alert.state == AlertState::Open
                    && now.signed_duration_since(alert.opened_at).to_std().unwrap_or_default()
                        >= state.config.escalation_time
                {
                    alert.state = AlertState::Escalated;
                    alert.escalated_at = Some(now);
                    warn!(rule = %state.config.id, "alert escalated");
                }
            }
            (Some(_), false) => {
                let mut alert = state.alert.take().expect("checked Some above");
                alert.state = AlertState::Resolved;
                alert.resolved_at = Some(now);
                alert.last_value = value;
                info!(rule = %state.config.id, "alert resolved");
                self.metrics.alerts_active.dec();
                self.push_history(alert).await;
            }
            (None, false) => {}
        }
    }

    async fn push_history(&self, alert: Alert) {
        let mut history = self.history.lock().await;
        history.push(alert);
        if history.len() > self.history_cap {
            let overflow = history.len() - self.history_cap;
            history.drain(0..overflow);
        }
    }

    /// Marks an alert acknowledged so on-call tooling can note it has been
    /// seen without resolving it (`spec.md` §4.12 `acknowledge`).
    pub async fn acknowledge(&self, rule_id: &str) -> bool {
        let mut guard = self.rules.lock().await;
        if let Some(state) = guard.get_mut(rule_id) {
            if let Some(alert) = &mut state.alert {
                alert.acknowledged = true;
                return true;
            }
        }
        false
    }

    /// Sets `suppressed_until = now + minutes` for `alert_id`'s rule: the
    /// rule stops re-notifying and its alert is excluded from
    /// [`Monitor::active_alerts`] until the window elapses, after which
    /// probing and notification resume on their own (`spec.md` §4.12
    /// `suppress(alert_id, minutes)`).
    pub async fn suppress(&self, alert_id: &str, minutes: i64) -> bool {
        let mut guard = self.rules.lock().await;
        if let Some(state) = guard.get_mut(alert_id) {
            let until = Utc::now() + chrono::Duration::minutes(minutes);
            state.suppressed_until = Some(until);
            if let Some(alert) = &mut state.alert {
                alert.suppressed_until = Some(until);
            }
            return true;
        }
        false
    }

    pub async fn active_alerts(&self) -> Vec<Alert> {
        let now = Utc::now();
        self.rules
            .lock()
            .await
            .values()
            .filter_map(|s| s.alert.clone())
            .filter(|a| a.is_active(now))
            .collect()
    }

    pub async fn recent_history(&self, limit: usize) -> Vec<Alert> {
        let history = self.history.lock().await;
        history.iter().rev().take(limit).cloned().collect()
    }
}

/// Metric probe backed by the process's own Prometheus registry.
pub struct SelfMetricProbe {
    metrics: Arc<Metrics>,
}

impl SelfMetricProbe {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self { metrics }
    }
}

#[async_trait::async_trait]
impl MetricProbe for SelfMetricProbe {
    async fn sample(&self, metric: &str) -> Option<f64> {
        match metric {
            "jobs_running" => Some(self.metrics.jobs_running.get() as f64),
            "storage_queue_depth" => Some(self.metrics.storage_queue_depth.get() as f64),
            "keypool_no_key_available_total" => Some(self.metrics.keypool_no_key_available.get() as f64),
            _ => None,
        }
    }
}

pub fn spawn_loop(
    monitor: Arc<Monitor>,
    interval: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => monitor.check_all().await,
            }
        }
    })
}
