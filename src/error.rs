//! Crate-wide error kinds.
//!
//! One variant per row of the error-handling table in `SPEC_FULL.md` §7.
//! Job bodies and the HTTP layer both consume this type: job bodies map it to
//! a `FAILED`/`STOPPED` transition (see [`crate::jobs::JobOutcome`]), the HTTP
//! layer maps it to a status code via [`axum::response::IntoResponse`].

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Error kinds produced anywhere in the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// Outbound HTTP transport failure (connection reset, DNS, etc).
    #[error("transport error calling {provider}/{endpoint}: {source}")]
    Transport {
        provider: String,
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    /// A per-call deadline was exceeded.
    #[error("timeout calling {provider}/{endpoint} after {elapsed_ms}ms")]
    Timeout {
        provider: String,
        endpoint: String,
        elapsed_ms: u64,
    },

    /// Every key for a provider is rate limited, cooling down, or deactivated.
    #[error("no key available for provider {provider}")]
    NoKeyAvailable { provider: String },

    /// A provider rejected a key as unauthorized (401/403).
    #[error("auth failed for provider {provider}, key exhausted")]
    AuthFailed { provider: String },

    /// A provider returned 429 and no key could absorb the retry.
    #[error("rate limited on provider {provider}, all keys cooling")]
    RateLimited { provider: String },

    /// Response body could not be parsed into the expected shape.
    #[error("failed to parse response from {provider}/{endpoint}: {message}")]
    ParseError {
        provider: String,
        endpoint: String,
        message: String,
    },

    /// The async storage queue rejected an item (queue full for priority).
    #[error("storage queue full for priority {priority}")]
    QueueFull { priority: u8 },

    /// The scheduler's bounded submission queue is full.
    #[error("scheduler queue is full, try again later")]
    SchedulerQueueFull,

    /// A job of this type is already running and the type is exclusive.
    #[error("job type {job_type} is already running")]
    JobTypeAlreadyRunning { job_type: String },

    /// A job execution was cancelled via `stop(force=true)` or a scheduler timeout.
    #[error("job was cancelled: {reason}")]
    Cancelled { reason: String },

    /// A job exceeded its configured deadline.
    #[error("job exceeded its deadline of {deadline_secs}s")]
    JobTimeout { deadline_secs: u64 },

    /// Startup configuration was invalid or incomplete.
    #[error("configuration error: {0}")]
    Config(String),

    /// A database operation failed after the allotted single retry.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Generic not-found for HTTP lookups (job id, etc).
    #[error("{0} not found")]
    NotFound(String),

    /// Caller supplied invalid request parameters.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl OrchestratorError {
    /// Whether this error kind is safe to retry automatically (spec.md §7/§4.10).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Transport { .. }
                | OrchestratorError::Timeout { .. }
                | OrchestratorError::JobTimeout { .. }
                | OrchestratorError::Database(_)
        )
    }

    /// Short machine-readable kind tag, used in HTTP error bodies and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestratorError::Transport { .. } => "transport",
            OrchestratorError::Timeout { .. } => "timeout",
            OrchestratorError::NoKeyAvailable { .. } => "no_key_available",
            OrchestratorError::AuthFailed { .. } => "auth_failed",
            OrchestratorError::RateLimited { .. } => "rate_limited",
            OrchestratorError::ParseError { .. } => "parse_error",
            OrchestratorError::QueueFull { .. } => "queue_full",
            OrchestratorError::SchedulerQueueFull => "scheduler_queue_full",
            OrchestratorError::JobTypeAlreadyRunning { .. } => "job_type_already_running",
            OrchestratorError::Cancelled { .. } => "cancelled",
            OrchestratorError::JobTimeout { .. } => "job_timeout",
            OrchestratorError::Config(_) => "config_error",
            OrchestratorError::Database(_) => "db_error",
            OrchestratorError::NotFound(_) => "not_found",
            OrchestratorError::InvalidRequest(_) => "invalid_request",
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorBodyInner,
}

#[derive(Serialize)]
struct ErrorBodyInner {
    kind: &'static str,
    message: String,
}

impl IntoResponse for OrchestratorError {
    fn into_response(self) -> Response {
        let status = match &self {
            OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
            OrchestratorError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            OrchestratorError::JobTypeAlreadyRunning { .. } => StatusCode::CONFLICT,
            OrchestratorError::SchedulerQueueFull | OrchestratorError::QueueFull { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            OrchestratorError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            error: ErrorBodyInner {
                kind: self.kind(),
                message: self.to_string(),
            },
        };
        (status, axum::Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
