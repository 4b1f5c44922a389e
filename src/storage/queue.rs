//! Async Storage Queue (C5, `spec.md` §4.5).
//!
//! Three bounded priority FIFOs, drained strictly High-before-Normal-before-Low
//! into a batch that commits once it reaches `batch_size` or `flush_interval`
//! elapses, whichever comes first; up to `worker_count` batches can be
//! in flight at a time. Grounded on
//! `original_source/app/core/advanced_cache_manager.py`'s batching idiom
//! and on the teacher's `tokio::sync::mpsc` usage for internal work queues.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::error::OrchestratorError;
use crate::storage::policy::{RawResponseEvent, StorageDecision, StoragePolicyEngine};
use crate::storage::repo::{NewRawResponse, RawResponseRepo};
use crate::telemetry::Metrics;

/// Queue priority, low to high (`spec.md` §4.5 Priority classes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl Priority {
    /// `min(3, priority + 1)` escalation on retry (`spec.md` §4.5 Retry
    /// policy); `High` already saturates the three-level scale.
    fn escalate(self) -> Self {
        match self {
            Priority::Low => Priority::Normal,
            Priority::Normal | Priority::High => Priority::High,
        }
    }

    fn index(self) -> usize {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
        }
    }
}

struct QueueItem {
    event: RawResponseEvent,
    priority: Priority,
    attempt: u32,
}

/// Handle used by producers (the Unified API Client) to enqueue a raw
/// response for asynchronous persistence. Also used internally to requeue
/// an item after a failed, retryable persistence attempt.
#[derive(Clone)]
pub struct StorageQueueHandle {
    senders: [mpsc::Sender<QueueItem>; 3],
    metrics: Arc<Metrics>,
}

impl StorageQueueHandle {
    /// `enqueue(event, priority)` (`spec.md` §4.5). Returns
    /// [`OrchestratorError::QueueFull`] if the priority's bounded FIFO is at
    /// capacity, the producer-visible backpressure signal.
    pub async fn enqueue(&self, event: RawResponseEvent, priority: Priority) -> crate::error::Result<()> {
        self.try_push(QueueItem {
            event,
            priority,
            attempt: 0,
        })
    }

    fn try_push(&self, item: QueueItem) -> crate::error::Result<()> {
        let priority = item.priority;
        self.senders[priority.index()]
            .try_send(item)
            .map_err(|_| OrchestratorError::QueueFull {
                priority: priority.index() as u8,
            })?;
        self.metrics.storage_queue_depth.inc();
        Ok(())
    }
}

pub struct StorageQueue {
    low_rx: mpsc::Receiver<QueueItem>,
    normal_rx: mpsc::Receiver<QueueItem>,
    high_rx: mpsc::Receiver<QueueItem>,
    handle: StorageQueueHandle,
    policy: Arc<StoragePolicyEngine>,
    repo: Arc<RawResponseRepo>,
    worker_count: usize,
    batch_size: usize,
    flush_interval: Duration,
    max_retries: u32,
    metrics: Arc<Metrics>,
}

impl StorageQueue {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue_size: usize,
        worker_count: usize,
        batch_size: usize,
        flush_interval: Duration,
        max_retries: u32,
        policy: Arc<StoragePolicyEngine>,
        repo: Arc<RawResponseRepo>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (tx_low, low_rx) = mpsc::channel(queue_size);
        let (tx_normal, normal_rx) = mpsc::channel(queue_size);
        let (tx_high, high_rx) = mpsc::channel(queue_size);
        let handle = StorageQueueHandle {
            senders: [tx_low, tx_normal, tx_high],
            metrics: metrics.clone(),
        };
        Self {
            low_rx,
            normal_rx,
            high_rx,
            handle,
            policy,
            repo,
            worker_count,
            batch_size: batch_size.max(1),
            flush_interval,
            max_retries,
            metrics,
        }
    }

    pub fn handle(&self) -> StorageQueueHandle {
        self.handle.clone()
    }

    /// Drains the three priority channels until `shutdown` fires, always
    /// preferring High over Normal over Low (`spec.md` §4.5 Drain order),
    /// accumulating a batch until it reaches `batch_size` or `flush_interval`
    /// elapses, whichever comes first (`spec.md` §4.5 Workers). Each batch is
    /// flushed on its own task, bounded to `worker_count` concurrent flushes
    /// by a semaphore; a batch whose commit fails is retried item-by-item at
    /// an escalated priority, up to `max_retries`. Intended to run as a
    /// single background task owned by [`crate::runtime::Runtime`].
    pub async fn run(mut self, shutdown: CancellationToken) {
        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.worker_count.max(1)));
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut buffer: Vec<QueueItem> = Vec::with_capacity(self.batch_size);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    self.drain_remaining(&mut buffer, &semaphore).await;
                    break;
                }

                _ = ticker.tick() => {
                    if !buffer.is_empty() {
                        self.spawn_flush(std::mem::take(&mut buffer), &semaphore);
                    }
                }

                Some(item) = self.high_rx.recv() => {
                    buffer.push(item);
                    self.drain_ready(&mut buffer);
                    if buffer.len() >= self.batch_size {
                        self.spawn_flush(std::mem::take(&mut buffer), &semaphore);
                    }
                }

                Some(item) = self.normal_rx.recv(), if self.high_rx.is_empty() => {
                    buffer.push(item);
                    self.drain_ready(&mut buffer);
                    if buffer.len() >= self.batch_size {
                        self.spawn_flush(std::mem::take(&mut buffer), &semaphore);
                    }
                }

                Some(item) = self.low_rx.recv(), if self.high_rx.is_empty() && self.normal_rx.is_empty() => {
                    buffer.push(item);
                    self.drain_ready(&mut buffer);
                    if buffer.len() >= self.batch_size {
                        self.spawn_flush(std::mem::take(&mut buffer), &semaphore);
                    }
                }
            }
        }
    }

    /// Tops a partially filled batch up to `batch_size` with whatever is
    /// immediately available, strictly preferring High over Normal over Low,
    /// without blocking the select loop.
    fn drain_ready(&mut self, buffer: &mut Vec<QueueItem>) {
        while buffer.len() < self.batch_size {
            if let Ok(item) = self.high_rx.try_recv() {
                buffer.push(item);
                continue;
            }
            if let Ok(item) = self.normal_rx.try_recv() {
                buffer.push(item);
                continue;
            }
            if let Ok(item) = self.low_rx.try_recv() {
                buffer.push(item);
                continue;
            }
            break;
        }
    }

    fn spawn_flush(&self, batch: Vec<QueueItem>, semaphore: &Arc<tokio::sync::Semaphore>) {
        self.metrics.storage_queue_depth.sub(batch.len() as i64);
        let policy = self.policy.clone();
        let repo = self.repo.clone();
        let handle = self.handle.clone();
        let max_retries = self.max_retries;
        let semaphore = semaphore.clone();
        tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return;
            };
            process_batch(batch, &policy, &repo, &handle, max_retries).await;
        });
    }

    async fn drain_remaining(&mut self, buffer: &mut Vec<QueueItem>, semaphore: &Arc<tokio::sync::Semaphore>) {
        self.high_rx.close();
        self.normal_rx.close();
        self.low_rx.close();
        while let Ok(item) = self.high_rx.try_recv() {
            buffer.push(item);
        }
        while let Ok(item) = self.normal_rx.try_recv() {
            buffer.push(item);
        }
        while let Ok(item) = self.low_rx.try_recv() {
            buffer.push(item);
        }
        if !buffer.is_empty() {
            self.spawn_flush(std::mem::take(buffer), semaphore);
        }
        // Give in-flight persistence tasks a chance to finish before the
        // process exits; `Runtime::shutdown` bounds this with its own
        // overall deadline.
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

/// Adapts [`StorageQueueHandle`] to [`crate::client::RawResponseSink`] so the
/// Unified API Client can hand off captured responses without depending on
/// the queue's internal types. Server errors and rate-limit responses are
/// prioritized `High` since they are the events most useful for the
/// Monitor & Alert loop (C12) to see promptly; everything else is `Normal`.
#[async_trait::async_trait]
impl crate::client::RawResponseSink for StorageQueueHandle {
    async fn record(&self, event: RawResponseEvent) -> Option<uuid::Uuid> {
        let priority = if event.status_code >= 500 || event.status_code == 429 {
            Priority::High
        } else {
            Priority::Normal
        };
        if let Err(e) = self.enqueue(event, priority).await {
            warn!(error = %e, "failed to enqueue raw response for storage");
        }
        None
    }
}

/// Applies the storage policy to every item of a drained batch, then commits
/// the accepted rows in one round trip (`spec.md` §4.5 "then call the batch
/// store path"). If the batch insert fails, every accepted item is requeued
/// individually at an escalated priority, up to `max_retries`; beyond that it
/// is dropped with a logged callback.
async fn process_batch(
    batch: Vec<QueueItem>,
    policy: &Arc<StoragePolicyEngine>,
    repo: &Arc<RawResponseRepo>,
    handle: &StorageQueueHandle,
    max_retries: u32,
) {
    let mut accepted: Vec<QueueItem> = Vec::with_capacity(batch.len());
    let mut rows: Vec<NewRawResponse> = Vec::with_capacity(batch.len());

    for item in batch {
        match policy.decide(&item.event) {
            StorageDecision::Reject(reason) => {
                warn!(reason = reason.as_str(), "raw response rejected by storage policy");
            }
            StorageDecision::Store { ttl_days, priority } => {
                let event = &item.event;
                rows.push(NewRawResponse {
                    provider: event.provider,
                    endpoint: event.endpoint.clone(),
                    request_url: event.request_url.clone(),
                    params: event.params.clone(),
                    response: event.response.clone(),
                    response_size_bytes: event.response_size_bytes,
                    status_code: event.status_code,
                    execution_time_ms: event.execution_time_ms,
                    ttl_days,
                    priority,
                });
                accepted.push(item);
            }
        }
    }

    if rows.is_empty() {
        return;
    }

    if let Err(e) = repo.insert_many(&rows).await {
        error!(error = %e, batch_len = accepted.len(), "batch persistence failed, retrying individually");
        for mut item in accepted {
            if item.attempt >= max_retries {
                error!(attempt = item.attempt, "dropping raw response after exhausting retries");
                continue;
            }
            item.attempt += 1;
            item.priority = item.priority.escalate();
            if handle.try_push(item).is_err() {
                warn!("storage queue full, dropping retried raw response");
            }
        }
    }
}
