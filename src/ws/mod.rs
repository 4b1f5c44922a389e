//! WebSocket Fan-out (C11, `spec.md` §4.11).
//!
//! `job_id -> subscriber set` map behind one concurrent map, grounded on the
//! teacher's connection-registry pattern for router event subscriptions.
//! Auth is a constant-time comparison against the shared API key
//! (`spec.md` §4.11 `connect`); a mismatch closes with code 4001.
//!
//! `connect` replays a historical log page before tailing: the subscriber is
//! registered first so events published while the snapshot query runs are
//! buffered rather than lost, then the snapshot (`created_at <= T`) is sent
//! reversed to chronological order, then the tail delivers only
//! `created_at > T` — no event is duplicated or dropped across the boundary
//! (`SPEC_FULL.md` §9 Open Question 3).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use subtle::ConstantTimeEq;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::domain::{JobLogEntry, JobStatus};
use crate::jobs::ProgressSink;
use crate::storage::repo::JobRepo;

const CLOSE_CODE_UNAUTHORIZED: u16 = 4001;

/// Idle period after which the fan-out emits a server-initiated ping
/// (`spec.md` §4.11 Keep-alive: "a read timeout triggers a server ping").
const IDLE_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Historical log page size sent on connect (`spec.md` §4.11 `connect`:
/// "configurable size").
const DEFAULT_REPLAY_PAGE_SIZE: i64 = 100;

#[derive(serde::Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutboundEvent<'a> {
    Progress {
        job_id: Uuid,
        status: &'static str,
        progress: f64,
        step: Option<&'a str>,
    },
    Log {
        job_id: Uuid,
        entry: &'a JobLogEntry,
        historical: bool,
    },
    Ping,
    Pong,
}

/// Internal queue payload. Kept as domain values rather than pre-serialized
/// text so the tail loop can still inspect `created_at` to drop log entries
/// already covered by the replay snapshot.
enum FanoutPayload {
    Log(JobLogEntry),
    Progress {
        status: JobStatus,
        progress: f64,
        step: Option<String>,
    },
    Ping,
    Pong,
}

impl FanoutPayload {
    fn duplicate(&self) -> Self {
        match self {
            FanoutPayload::Log(entry) => FanoutPayload::Log(entry.clone()),
            FanoutPayload::Progress { status, progress, step } => FanoutPayload::Progress {
                status: *status,
                progress: *progress,
                step: step.clone(),
            },
            FanoutPayload::Ping => FanoutPayload::Ping,
            FanoutPayload::Pong => FanoutPayload::Pong,
        }
    }
}

struct Subscriber {
    tx: mpsc::Sender<FanoutPayload>,
}

/// Registry of job-log/progress subscribers, one entry per connected
/// WebSocket. Sharded so a registration or publish for one job never blocks
/// one for another (`spec.md` §4.11 invariant).
pub struct WsFanout {
    subscribers: DashMap<Uuid, Vec<Subscriber>>,
    api_key: String,
    repo: Arc<JobRepo>,
    replay_page_size: i64,
}

impl WsFanout {
    pub fn new(api_key: String, repo: Arc<JobRepo>) -> Self {
        Self {
            subscribers: DashMap::new(),
            api_key,
            repo,
            replay_page_size: DEFAULT_REPLAY_PAGE_SIZE,
        }
    }

    /// Constant-time key check, independent of connected-subscriber state
    /// (`spec.md` §4.11 Auth).
    pub fn authorize(&self, supplied_key: &str) -> bool {
        let expected = self.api_key.as_bytes();
        let supplied = supplied_key.as_bytes();
        expected.len() == supplied.len() && expected.ct_eq(supplied).into()
    }

    /// Drives one accepted connection until it closes. On an unauthorized
    /// key the socket is closed immediately with code 4001 and this
    /// function returns without registering a subscriber. Otherwise:
    /// register -> replay the historical log page -> tail live events,
    /// answering `"ping"` with `"pong"` and emitting our own ping on an idle
    /// read (`spec.md` §4.11 Keep-alive).
    pub async fn handle_socket(self: Arc<Self>, socket: WebSocket, job_id: Uuid, supplied_key: String) {
        if !self.authorize(&supplied_key) {
            let _ = socket
                .close_frame(axum::extract::ws::CloseFrame {
                    code: CLOSE_CODE_UNAUTHORIZED,
                    reason: "invalid api key".into(),
                })
                .await;
            return;
        }

        let (mut sink, mut stream) = socket.split();
        let (tx, mut rx) = mpsc::channel::<FanoutPayload>(256);

        // Register before the snapshot read runs: anything published while
        // the query is in flight lands in `rx` and is de-duplicated against
        // `snapshot_at` below rather than being missed.
        self.subscribers.entry(job_id).or_default().push(Subscriber { tx: tx.clone() });

        let snapshot_at = Utc::now();
        match self.repo.recent_logs_before(job_id, snapshot_at, self.replay_page_size).await {
            Ok(mut entries) => {
                entries.reverse(); // query is newest-first; replay is chronological
                for entry in &entries {
                    let event = OutboundEvent::Log {
                        job_id,
                        entry,
                        historical: true,
                    };
                    let Ok(text) = serde_json::to_string(&event) else {
                        continue;
                    };
                    if sink.send(Message::Text(text)).await.is_err() {
                        self.remove_subscriber(job_id, &tx);
                        return;
                    }
                }
            }
            Err(e) => debug!(%job_id, error = %e, "historical log replay failed"),
        }

        let send_task = tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                if let FanoutPayload::Log(ref entry) = payload {
                    if entry.created_at <= snapshot_at {
                        continue; // already delivered in the replay snapshot
                    }
                }
                let Some(message) = encode(job_id, payload) else {
                    continue;
                };
                if sink.send(message).await.is_err() {
                    break;
                }
            }
        });

        loop {
            match tokio::time::timeout(IDLE_PING_INTERVAL, stream.next()).await {
                Ok(Some(Ok(Message::Close(_)))) | Ok(None) => break,
                Ok(Some(Ok(Message::Text(text)))) => {
                    if text.trim().eq_ignore_ascii_case("ping") && tx.send(FanoutPayload::Pong).await.is_err() {
                        break;
                    }
                }
                Ok(Some(Ok(_))) => {} // binary/ping/pong control frames: nothing app-level to do
                Ok(Some(Err(_))) => break,
                Err(_elapsed) => {
                    if tx.send(FanoutPayload::Ping).await.is_err() {
                        break;
                    }
                }
            }
        }

        send_task.abort();
        self.remove_subscriber(job_id, &tx);
    }

    fn remove_subscriber(&self, job_id: Uuid, tx: &mpsc::Sender<FanoutPayload>) {
        let mut empty = false;
        if let Some(mut subs) = self.subscribers.get_mut(&job_id) {
            subs.retain(|s| !s.tx.same_channel(tx));
            empty = subs.is_empty();
        }
        if empty {
            self.subscribers.remove(&job_id);
        }
    }

    /// Best-effort publish: a subscriber whose channel is full or closed is
    /// dropped rather than blocking the publisher (`spec.md` §4.11
    /// Backpressure).
    async fn publish(&self, job_id: Uuid, payload: FanoutPayload) {
        let Some(subs) = self.subscribers.get(&job_id) else {
            return;
        };
        for sub in subs.iter() {
            if sub.tx.try_send(payload.duplicate()).is_err() {
                debug!(%job_id, "dropping slow websocket subscriber message");
            }
        }
    }
}

fn encode(job_id: Uuid, payload: FanoutPayload) -> Option<Message> {
    let event = match payload {
        FanoutPayload::Log(entry) => OutboundEvent::Log {
            job_id,
            entry: &entry,
            historical: false,
        },
        FanoutPayload::Progress { status, progress, step } => OutboundEvent::Progress {
            job_id,
            status: status.as_str(),
            progress,
            step: step.as_deref(),
        },
        FanoutPayload::Ping => OutboundEvent::Ping,
        FanoutPayload::Pong => OutboundEvent::Pong,
    };
    serde_json::to_string(&event).ok().map(Message::Text)
}

#[async_trait]
impl ProgressSink for WsFanout {
    async fn publish_progress(&self, job_id: Uuid, status: JobStatus, progress: f64, step: Option<&str>) {
        self.publish(
            job_id,
            FanoutPayload::Progress {
                status,
                progress,
                step: step.map(str::to_string),
            },
        )
        .await;
    }

    async fn publish_log(&self, job_id: Uuid, entry: &JobLogEntry) {
        self.publish(job_id, FanoutPayload::Log(entry.clone())).await;
    }
}
