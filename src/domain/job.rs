//! Job and Job Log Entry data model (`spec.md` §3, `SPEC_FULL.md` §4.8a).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::opaque_bag::OpaqueBag;

/// Closed enum of job kinds, recovered from `original_source/jobs/*` and
/// `app/api/services/job_manager.py`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    KtoDataCollection,
    WeatherDataCollection,
    RecommendationCalculation,
    DataQualityCheck,
    ArchiveBackup,
    SystemHealthCheck,
    TtlCleanup,
    RegionSync,
}

impl JobType {
    /// Job types for which at most one non-terminal Job may exist at a time
    /// (spec.md §4.9 "Exclusive job type"). Recovered from the source
    /// system's per-provider collection jobs, which are exclusive to avoid
    /// colliding key-pool/rate-limit pressure; derived, computation-only job
    /// types are not exclusive.
    pub fn is_exclusive(self) -> bool {
        matches!(
            self,
            JobType::KtoDataCollection
                | JobType::WeatherDataCollection
                | JobType::ArchiveBackup
                | JobType::TtlCleanup
                | JobType::RegionSync
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobType::KtoDataCollection => "kto_data_collection",
            JobType::WeatherDataCollection => "weather_data_collection",
            JobType::RecommendationCalculation => "recommendation_calculation",
            JobType::DataQualityCheck => "data_quality_check",
            JobType::ArchiveBackup => "archive_backup",
            JobType::SystemHealthCheck => "system_health_check",
            JobType::TtlCleanup => "ttl_cleanup",
            JobType::RegionSync => "region_sync",
        }
    }
}

impl std::str::FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "kto_data_collection" => Ok(JobType::KtoDataCollection),
            "weather_data_collection" => Ok(JobType::WeatherDataCollection),
            "recommendation_calculation" => Ok(JobType::RecommendationCalculation),
            "data_quality_check" => Ok(JobType::DataQualityCheck),
            "archive_backup" => Ok(JobType::ArchiveBackup),
            "system_health_check" => Ok(JobType::SystemHealthCheck),
            "ttl_cleanup" => Ok(JobType::TtlCleanup),
            "region_sync" => Ok(JobType::RegionSync),
            other => Err(format!("unknown job type: {other}")),
        }
    }
}

/// `spec.md` §3 Job.status, DAG PENDING -> RUNNING -> {COMPLETED, FAILED, STOPPED}.
///
/// The source system alternates between `COMPLETED` and `SUCCESS` for the
/// same terminal state; `Completed` is the canonical value (`SPEC_FULL.md`
/// §9 Open Question 1). `Success` is accepted on deserialize only, for
/// interop with older persisted rows, and is never produced by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    #[serde(alias = "success")]
    Completed,
    Failed,
    Stopped,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Stopped
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Critical => "CRITICAL",
        }
    }
}

/// One execution attempt of a named unit of work (`spec.md` §3 Job).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Job {
    pub id: Uuid,
    pub job_type: JobType,
    pub status: JobStatus,
    #[sqlx(json)]
    pub parameters: OpaqueBag,
    pub progress: f64,
    pub current_step: Option<String>,
    pub created_at: DateTime<Utc>,
    pub created_by: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    #[sqlx(json)]
    pub result_summary: Option<OpaqueBag>,
    pub retry_status: Option<String>,
    pub retry_count: i32,
}

impl Job {
    /// `spec.md` §8 invariant: progress == 100 iff status == COMPLETED.
    pub fn progress_matches_status(&self) -> bool {
        (self.progress >= 100.0) == (self.status == JobStatus::Completed)
    }
}

/// Append-only record attached to a Job (`spec.md` §3 Job Log Entry).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct JobLogEntry {
    pub id: i64,
    pub job_id: Uuid,
    pub level: LogLevel,
    pub message: String,
    #[sqlx(json)]
    pub details: Option<OpaqueBag>,
    pub created_at: DateTime<Utc>,
}

/// Per-type aggregate statistics (`spec.md` §4.8 `stats`).
#[derive(Debug, Clone, Serialize)]
pub struct JobTypeStats {
    pub job_type: JobType,
    pub total: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub running_count: i64,
    pub average_duration_secs: Option<f64>,
    pub success_rate: f64,
}
