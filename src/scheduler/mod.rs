//! Scheduler / Worker Pool (C9, `spec.md` §4.9).
//!
//! A fixed-size worker pool of `max_concurrent_jobs` pulls from a bounded
//! FIFO submission queue; exclusivity and per-job deadlines are enforced
//! here. Grounded on the teacher's bounded `mpsc` + semaphore worker-pool
//! idiom used for request-handling concurrency limits.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use uuid::Uuid;

use crate::domain::{Job, JobType};
use crate::error::{OrchestratorError, Result};
use crate::jobs::JobManager;
use crate::telemetry::Metrics;

struct SubmittedJob {
    job: Job,
    deadline: Option<Duration>,
}

/// Handle used by the HTTP layer and job bodies to submit work and observe
/// backlog depth, without owning the worker pool itself.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<SubmittedJob>,
    depth: Arc<AtomicUsize>,
}

impl SchedulerHandle {
    /// Enqueues an already-PENDING job for execution. Returns
    /// [`OrchestratorError::SchedulerQueueFull`] if the bounded submission
    /// queue is at capacity (`spec.md` §4.9 Queue policy).
    pub fn submit(&self, job: Job, deadline: Option<Duration>) -> Result<()> {
        self.tx
            .try_send(SubmittedJob { job, deadline })
            .map_err(|_| OrchestratorError::SchedulerQueueFull)?;
        self.depth.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn queue_depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }
}

pub struct Scheduler {
    rx: mpsc::Receiver<SubmittedJob>,
    handle: SchedulerHandle,
    max_concurrent_jobs: usize,
    metrics: Arc<Metrics>,
}

impl Scheduler {
    /// Constructs the bounded submission queue and its handle. `manager`
    /// (the job executor) is supplied later, to [`Scheduler::run`], so a
    /// [`SchedulerHandle`] can be handed to job bodies that need it (e.g.
    /// for backlog metrics) before `JobManager` itself finishes wiring —
    /// the two components reference each other only at runtime, not at
    /// construction.
    pub fn new(queue_size: usize, max_concurrent_jobs: usize, metrics: Arc<Metrics>) -> Self {
        let (tx, rx) = mpsc::channel(queue_size);
        Self {
            rx,
            handle: SchedulerHandle {
                tx,
                depth: Arc::new(AtomicUsize::new(0)),
            },
            max_concurrent_jobs,
            metrics,
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    /// Runs the worker pool until `shutdown` fires. Each worker slot is a
    /// semaphore permit; a job with a `deadline` is raced against
    /// `tokio::time::timeout`, turning an overrun into a `JobTimeout` error
    /// on the job's terminal state (`spec.md` §4.9 Deadlines).
    pub async fn run(mut self, manager: Arc<JobManager>, shutdown: CancellationToken) {
        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.max_concurrent_jobs.max(1)));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                maybe_submitted = self.rx.recv() => {
                    let Some(submitted) = maybe_submitted else { break };
                    self.handle.depth.fetch_sub(1, Ordering::Relaxed);
                    let permit = match semaphore.clone().acquire_owned().await {
                        Ok(p) => p,
                        Err(_) => break,
                    };
                    let manager = manager.clone();
                    let metrics = self.metrics.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        run_one(manager, metrics, submitted).await;
                    });
                }
            }
        }
    }
}

async fn run_one(manager: Arc<JobManager>, metrics: Arc<Metrics>, submitted: SubmittedJob) {
    let job_id: Uuid = submitted.job.id;
    let job_type: JobType = submitted.job.job_type;

    let outcome = match submitted.deadline {
        Some(deadline) => match tokio::time::timeout(deadline, manager.execute(submitted.job)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(%job_id, ?job_type, "job exceeded its deadline");
                // `tokio::time::timeout` has already dropped the `execute`
                // future; it never reaches its own terminal-transition
                // code, so the DB/`running`-set cleanup has to happen here
                // directly instead of through `manager.stop`, which would
                // be a no-op against a task that no longer exists.
                if let Err(e) = manager.force_fail_timeout(job_id, deadline.as_secs()).await {
                    error!(%job_id, error = %e, "failed to record job timeout");
                }
                Err(OrchestratorError::JobTimeout {
                    deadline_secs: deadline.as_secs(),
                })
            }
        },
        None => manager.execute(submitted.job).await,
    };

    if let Err(e) = outcome {
        error!(%job_id, ?job_type, error = %e, "scheduler failed to run job to completion");
        metrics.jobs_failed.inc();
    }
}
