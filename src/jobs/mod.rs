//! Job Manager (C8, `spec.md` §4.8): submit/list/get/logs/stop/stats/cleanup,
//! the PENDING -> RUNNING -> {COMPLETED, FAILED, STOPPED} state machine, and
//! the concrete job bodies for the eight job types.
//!
//! Grounded on `original_source/app/api/services/job_manager.py`'s
//! lifecycle contract; fan-out to log subscribers and notification hooks is
//! grounded on the teacher's subscriber/broadcast idioms used for router
//! event plumbing.

pub mod bodies;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::domain::{Job, JobLogEntry, JobStatus, JobType, JobTypeStats, LogLevel, OpaqueBag, Page, PageRequest};
use crate::error::{OrchestratorError, Result};
use crate::storage::repo::JobRepo;
use crate::telemetry::Metrics;

/// Sink for job progress/log events, implemented by the WebSocket fan-out
/// (C11) so `JobManager` never depends on axum types directly.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn publish_progress(&self, job_id: Uuid, status: JobStatus, progress: f64, step: Option<&str>);
    async fn publish_log(&self, job_id: Uuid, entry: &JobLogEntry);
}

/// Sink for lifecycle notifications, implemented by the Retry & Notification
/// Bridge (C10).
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify_transition(&self, job: &Job, from: JobStatus, to: JobStatus);
}

/// Cooperative handle passed to a running job body: checked periodically so
/// a long-running body can stop at its next checkpoint (`spec.md` §4.8
/// `stop(force=false)`), plus a hard `CancellationToken` for `force=true`.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: Uuid,
    pub parameters: OpaqueBag,
    should_stop: watch::Receiver<bool>,
    pub cancel: CancellationToken,
    manager: Arc<JobManagerInner>,
}

impl JobContext {
    pub fn should_stop(&self) -> bool {
        *self.should_stop.borrow()
    }

    pub async fn report_progress(&self, progress: f64, step: impl Into<String>) {
        self.manager.report_progress(self.job_id, progress, step.into()).await;
    }

    pub async fn log(&self, level: LogLevel, message: impl Into<String>, details: Option<OpaqueBag>) {
        self.manager.append_log(self.job_id, level, message.into(), details).await;
    }
}

/// A unit of work for one `JobType`. Implementations live in [`bodies`].
#[async_trait]
pub trait JobBody: Send + Sync {
    async fn run(&self, ctx: JobContext) -> Result<OpaqueBag>;
}

struct RunningJob {
    stop_tx: watch::Sender<bool>,
    cancel: CancellationToken,
}

struct JobManagerInner {
    repo: Arc<JobRepo>,
    metrics: Arc<Metrics>,
    progress_sink: Arc<dyn ProgressSink>,
    notification_sink: Arc<dyn NotificationSink>,
    running: tokio::sync::Mutex<HashMap<Uuid, RunningJob>>,
}

impl JobManagerInner {
    async fn report_progress(&self, job_id: Uuid, progress: f64, step: String) {
        if let Err(e) = self
            .repo
            .update_progress(job_id, JobStatus::Running, progress, Some(&step))
            .await
        {
            warn!(%job_id, error = %e, "failed to persist job progress");
        }
        self.progress_sink
            .publish_progress(job_id, JobStatus::Running, progress, Some(&step))
            .await;
    }

    async fn append_log(&self, job_id: Uuid, level: LogLevel, message: String, details: Option<OpaqueBag>) {
        if let Err(e) = self.repo.append_log(job_id, level, &message, details.as_ref()).await {
            warn!(%job_id, error = %e, "failed to persist job log entry");
            return;
        }
        let entry = JobLogEntry {
            id: 0,
            job_id,
            level,
            message,
            details,
            created_at: Utc::now(),
        };
        self.progress_sink.publish_log(job_id, &entry).await;
    }
}

/// Owns job persistence, the PENDING/RUNNING/terminal state machine, and the
/// dispatch table of job bodies. Does not itself decide *when* a job runs —
/// that is the Scheduler's job (C9); `JobManager::execute` is called once a
/// worker slot is available.
pub struct JobManager {
    inner: Arc<JobManagerInner>,
    bodies: HashMap<JobType, Arc<dyn JobBody>>,
}

impl JobManager {
    pub fn new(
        repo: Arc<JobRepo>,
        metrics: Arc<Metrics>,
        progress_sink: Arc<dyn ProgressSink>,
        notification_sink: Arc<dyn NotificationSink>,
        bodies: HashMap<JobType, Arc<dyn JobBody>>,
    ) -> Self {
        Self {
            inner: Arc::new(JobManagerInner {
                repo,
                metrics,
                progress_sink,
                notification_sink,
                running: tokio::sync::Mutex::new(HashMap::new()),
            }),
            bodies,
        }
    }

    /// Creates a new PENDING job row. Exclusivity (`spec.md` §4.9) is
    /// enforced by the Scheduler before calling this, but is re-checked here
    /// against the repo as the final authority to avoid a race between two
    /// concurrent submissions.
    pub async fn submit(
        &self,
        job_type: JobType,
        parameters: OpaqueBag,
        created_by: Option<String>,
    ) -> Result<Job> {
        if job_type.is_exclusive() && self.inner.repo.has_active(job_type).await? {
            return Err(OrchestratorError::JobTypeAlreadyRunning {
                job_type: job_type.as_str().to_string(),
            });
        }

        let job = Job {
            id: Uuid::new_v4(),
            job_type,
            status: JobStatus::Pending,
            parameters,
            progress: 0.0,
            current_step: None,
            created_at: Utc::now(),
            created_by,
            started_at: None,
            completed_at: None,
            error_message: None,
            result_summary: None,
            retry_status: None,
            retry_count: 0,
        };
        self.inner.repo.insert(&job).await?;
        self.inner.metrics.jobs_submitted.inc();
        Ok(job)
    }

    pub async fn get(&self, id: Uuid) -> Result<Job> {
        self.inner.repo.get(id).await
    }

    pub async fn list(&self, job_type: Option<JobType>, status: Option<JobStatus>, page: PageRequest) -> Result<Page<Job>> {
        self.inner.repo.list(job_type, status, page).await
    }

    pub async fn logs(&self, id: Uuid, page: PageRequest) -> Result<Page<JobLogEntry>> {
        self.inner.repo.logs(id, page).await
    }

    pub async fn stats(&self) -> Result<Vec<JobTypeStats>> {
        self.inner.repo.stats().await
    }

    /// `cleanup(older_than)` (`spec.md` §4.8): deletes terminal jobs older
    /// than the given horizon and returns the count removed.
    pub async fn cleanup(&self, older_than: chrono::DateTime<Utc>) -> Result<u64> {
        self.inner.repo.cleanup_terminal_before(older_than).await
    }

    /// Requests that a running job stop. `force = false` sets the
    /// cooperative flag only; `force = true` additionally fires the hard
    /// cancellation token (`spec.md` §4.8 `stop`).
    pub async fn stop(&self, id: Uuid, force: bool) -> Result<()> {
        let running = self.inner.running.lock().await;
        let Some(entry) = running.get(&id) else {
            return Err(OrchestratorError::InvalidRequest(format!(
                "job {id} is not running"
            )));
        };
        let _ = entry.stop_tx.send(true);
        if force {
            entry.cancel.cancel();
        }
        Ok(())
    }

    /// Force-fails `job_id` as a timeout (`spec.md` §4.9 "exceeding
    /// [deadline] causes cancellation and a FAILED transition with a
    /// `timeout` error kind"). Used by the Scheduler after its
    /// `tokio::time::timeout` has already dropped the in-flight
    /// `execute(...)` future: that drop happens before `execute`'s own
    /// terminal-transition code runs, so without this, the job's `running`
    /// entry and DB row would both be stuck at RUNNING forever.
    pub async fn force_fail_timeout(&self, job_id: Uuid, deadline_secs: u64) -> Result<()> {
        if self.inner.running.lock().await.remove(&job_id).is_some() {
            self.inner.metrics.jobs_running.dec();
        }
        self.inner.metrics.jobs_failed.inc();

        let progress = self.inner.repo.get(job_id).await.map(|row| row.progress).unwrap_or(0.0);
        let error_message = format!("job exceeded its {deadline_secs}s deadline (timeout)");
        let completed_at = Utc::now();
        self.inner
            .repo
            .complete(job_id, JobStatus::Failed, progress, completed_at, Some(&error_message), None)
            .await?;

        if let Ok(job) = self.inner.repo.get(job_id).await {
            self.inner
                .notification_sink
                .notify_transition(&job, JobStatus::Running, JobStatus::Failed)
                .await;
            self.inner
                .progress_sink
                .publish_progress(job.id, JobStatus::Failed, progress, Some("timeout"))
                .await;
        }
        Ok(())
    }

    /// Executes `job`'s body end to end, driving the PENDING -> RUNNING ->
    /// terminal transition and firing notification hooks at each edge
    /// (`spec.md` §4.8). Called by the Scheduler once a worker slot opens.
    pub async fn execute(&self, job: Job) -> Result<()> {
        let Some(body) = self.bodies.get(&job.job_type).cloned() else {
            return Err(OrchestratorError::InvalidRequest(format!(
                "no job body registered for {}",
                job.job_type.as_str()
            )));
        };

        let (stop_tx, stop_rx) = watch::channel(false);
        let cancel = CancellationToken::new();
        {
            let mut running = self.inner.running.lock().await;
            running.insert(
                job.id,
                RunningJob {
                    stop_tx,
                    cancel: cancel.clone(),
                },
            );
        }

        let started_at = Utc::now();
        self.inner.repo.mark_started(job.id, started_at).await?;
        self.inner.metrics.jobs_running.inc();
        self.inner
            .notification_sink
            .notify_transition(&job, JobStatus::Pending, JobStatus::Running)
            .await;
        self.inner
            .progress_sink
            .publish_progress(job.id, JobStatus::Running, 0.0, Some("started"))
            .await;

        let ctx = JobContext {
            job_id: job.id,
            parameters: job.parameters.clone(),
            should_stop: stop_rx,
            cancel: cancel.clone(),
            manager: self.inner.clone(),
        };

        let outcome = tokio::select! {
            result = body.run(ctx) => result,
            _ = cancel.cancelled() => Err(OrchestratorError::Cancelled { reason: "force stop requested".into() }),
        };

        self.inner.running.lock().await.remove(&job.id);
        self.inner.metrics.jobs_running.dec();

        let (to_status, error_message, result_summary) = match outcome {
            Ok(summary) => {
                self.inner.metrics.jobs_completed.inc();
                (JobStatus::Completed, None, Some(summary))
            }
            Err(OrchestratorError::Cancelled { reason }) => {
                self.inner.metrics.jobs_stopped.inc();
                (JobStatus::Stopped, Some(reason), None)
            }
            Err(e) => {
                self.inner.metrics.jobs_failed.inc();
                error!(job_id = %job.id, error = %e, "job failed");
                (JobStatus::Failed, Some(e.to_string()), None)
            }
        };

        // `spec.md` §8: progress == 100 iff status == COMPLETED. A
        // FAILED/STOPPED job keeps whatever progress it last reported, read
        // back from the row `report_progress` has been updating throughout
        // the run.
        let final_progress = if to_status == JobStatus::Completed {
            100.0
        } else {
            self.inner
                .repo
                .get(job.id)
                .await
                .map(|row| row.progress)
                .unwrap_or(job.progress)
        };

        let completed_at = Utc::now();
        self.inner
            .repo
            .complete(
                job.id,
                to_status,
                final_progress,
                completed_at,
                error_message.as_deref(),
                result_summary.as_ref(),
            )
            .await?;

        let mut completed_job = job;
        completed_job.status = to_status;
        completed_job.progress = final_progress;
        completed_job.completed_at = Some(completed_at);
        completed_job.error_message = error_message;
        completed_job.result_summary = result_summary;

        self.inner
            .notification_sink
            .notify_transition(&completed_job, JobStatus::Running, to_status)
            .await;
        self.inner
            .progress_sink
            .publish_progress(completed_job.id, to_status, final_progress, Some("finished"))
            .await;

        info!(job_id = %completed_job.id, status = to_status.as_str(), "job execution finished");
        Ok(())
    }
}

/// Builds the dispatch table mapping each `JobType` to its concrete body
/// (`spec.md` §4.8, `SPEC_FULL.md` job catalog).
pub fn default_bodies(deps: bodies::JobBodyDeps) -> HashMap<JobType, Arc<dyn JobBody>> {
    bodies::default_bodies(deps)
}

/// Placeholder summary shape for job bodies that don't produce a richer
/// result (`spec.md` §3 Job.result_summary is opaque).
pub fn summary(fields: &[(&str, Value)]) -> OpaqueBag {
    let mut map = serde_json::Map::new();
    for (k, v) in fields {
        map.insert((*k).to_string(), v.clone());
    }
    OpaqueBag::from(map)
}
