//! Retry & Notification Bridge (C10, `spec.md` §4.10).
//!
//! Per-job-type retry policy plus a rate-limited notification multiplexer
//! that fans lifecycle transitions out to channel-specific senders.
//! Grounded on the teacher's notification-channel abstractions (trait-based
//! senders, concrete transports out of scope) and on
//! `original_source/app/core/notification_service.py`'s channel/recipient
//! filtering.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::domain::{Job, JobStatus, JobType};
use crate::error::OrchestratorError;
use crate::jobs::NotificationSink;

/// Per-job-type retry policy (`spec.md` §4.10 Retry policy).
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub exponent: f64,
    pub jitter: f64,
    /// Error kinds eligible for automatic retry; empty means "any retryable
    /// kind" (see [`OrchestratorError::is_retryable`]).
    pub retryable_kinds: Vec<&'static str>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_secs(5),
            exponent: 2.0,
            jitter: 0.2,
            retryable_kinds: Vec::new(),
        }
    }
}

impl RetryPolicy {
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let raw = self.base_backoff.as_secs_f64() * self.exponent.powi(attempt as i32);
        let jitter_factor = 1.0 + (rand::random::<f64>() * 2.0 - 1.0) * self.jitter;
        Duration::from_secs_f64((raw * jitter_factor).max(0.0))
    }

    /// `should_retry(job, error)` (`spec.md` §4.10).
    pub fn should_retry(&self, retry_count: u32, error: &OrchestratorError) -> bool {
        if retry_count >= self.max_retries {
            return false;
        }
        if self.retryable_kinds.is_empty() {
            error.is_retryable()
        } else {
            self.retryable_kinds.contains(&error.kind())
        }
    }
}

/// Single notification event handed to channel senders.
#[derive(Debug, Clone)]
pub struct NotificationEvent {
    pub job_id: uuid::Uuid,
    pub job_type: JobType,
    pub status: JobStatus,
    pub message: String,
}

/// A concrete delivery channel (email, Slack, webhook, ...). No concrete
/// sender ships in this crate; integrations register their own
/// implementation with [`NotificationBridge::register_channel`].
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &str;
    async fn send(&self, event: &NotificationEvent) -> anyhow::Result<()>;
}

/// A channel/recipient/event-filter rule selecting which channels receive
/// which transitions (`spec.md` §4.10 Notification routing).
#[derive(Debug, Clone)]
pub struct NotificationRule {
    pub channel: String,
    pub job_types: Vec<JobType>,
    pub statuses: Vec<JobStatus>,
}

impl NotificationRule {
    fn matches(&self, job_type: JobType, status: JobStatus) -> bool {
        (self.job_types.is_empty() || self.job_types.contains(&job_type))
            && (self.statuses.is_empty() || self.statuses.contains(&status))
    }
}

/// Token-bucket rate limiter guarding outbound notification volume
/// (`spec.md` §4.10 Rate limiting).
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec,
            last_refill: Instant::now(),
        }
    }

    fn try_consume(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

pub struct NotificationBridge {
    channels: HashMap<String, Arc<dyn NotificationChannel>>,
    rules: Vec<NotificationRule>,
    bucket: Arc<Mutex<TokenBucket>>,
    retry_policies: HashMap<JobType, RetryPolicy>,
    default_policy: RetryPolicy,
}

impl NotificationBridge {
    pub fn new(rules: Vec<NotificationRule>, rate_per_sec: f64, burst: f64) -> Self {
        Self {
            channels: HashMap::new(),
            rules,
            bucket: Arc::new(Mutex::new(TokenBucket::new(burst, rate_per_sec))),
            retry_policies: HashMap::new(),
            default_policy: RetryPolicy::default(),
        }
    }

    pub fn register_channel(&mut self, channel: Arc<dyn NotificationChannel>) {
        self.channels.insert(channel.name().to_string(), channel);
    }

    pub fn set_policy(&mut self, job_type: JobType, policy: RetryPolicy) {
        self.retry_policies.insert(job_type, policy);
    }

    pub fn policy_for(&self, job_type: JobType) -> &RetryPolicy {
        self.retry_policies.get(&job_type).unwrap_or(&self.default_policy)
    }

    /// Emits a notification for every matching rule's channel, subject to
    /// the shared rate limiter. A job that exhausts its retry budget always
    /// routes through here with `OrchestratorError::kind() ==
    /// "max_retries_exceeded"`-style messaging embedded in the event text
    /// (`spec.md` §4.10 Max-attempts notification).
    async fn dispatch(&self, job_type: JobType, status: JobStatus, event: NotificationEvent) {
        if !self.bucket.lock().await.try_consume() {
            warn!(job_type = job_type.as_str(), "notification rate limit exceeded, dropping");
            return;
        }

        for rule in &self.rules {
            if !rule.matches(job_type, status) {
                continue;
            }
            let Some(channel) = self.channels.get(&rule.channel) else {
                continue;
            };
            if let Err(e) = channel.send(&event).await {
                warn!(channel = rule.channel.as_str(), error = %e, "notification delivery failed");
            }
        }
    }
}

#[async_trait]
impl NotificationSink for NotificationBridge {
    async fn notify_transition(&self, job: &Job, from: JobStatus, to: JobStatus) {
        if from == to {
            return;
        }
        info!(job_id = %job.id, from = from.as_str(), to = to.as_str(), "job transition");

        if !matches!(to, JobStatus::Running | JobStatus::Completed | JobStatus::Failed) {
            return;
        }

        let message = match to {
            JobStatus::Running => format!("job {} started", job.job_type.as_str()),
            JobStatus::Completed => format!("job {} completed successfully", job.job_type.as_str()),
            JobStatus::Failed => format!(
                "job {} failed: {}",
                job.job_type.as_str(),
                job.error_message.as_deref().unwrap_or("unknown error")
            ),
            _ => unreachable!(),
        };

        let event = NotificationEvent {
            job_id: job.id,
            job_type: job.job_type,
            status: to,
            message,
        };
        self.dispatch(job.job_type, to, event).await;
    }
}
