//! Postgres repositories for jobs, job logs, and raw API responses.
//!
//! Grounded on `golemcloud-golem`'s `cloud-common/src/repo/component.rs`
//! sqlx query style (typed `FromRow` structs, `query_as!`-free explicit
//! binds so the pool can stay generic over `PgPool`).

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::domain::{Job, JobLogEntry, JobStatus, JobType, JobTypeStats, LogLevel, OpaqueBag, Page, PageRequest};
use crate::error::{OrchestratorError, Result};
use crate::providers::Provider;

#[derive(Clone)]
pub struct JobRepo {
    pool: PgPool,
}

impl JobRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, job: &Job) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO job_executions
                (id, job_type, status, parameters, progress, current_step,
                 created_at, created_by, started_at, completed_at,
                 error_message, result_summary, retry_status, retry_count)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(job.id)
        .bind(job.job_type)
        .bind(job.status)
        .bind(sqlx::types::Json(&job.parameters))
        .bind(job.progress)
        .bind(&job.current_step)
        .bind(job.created_at)
        .bind(&job.created_by)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(&job.error_message)
        .bind(job.result_summary.as_ref().map(sqlx::types::Json))
        .bind(&job.retry_status)
        .bind(job.retry_count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_progress(
        &self,
        id: Uuid,
        status: JobStatus,
        progress: f64,
        current_step: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE job_executions SET status = $2, progress = $3, current_step = $4 WHERE id = $1",
        )
        .bind(id)
        .bind(status)
        .bind(progress)
        .bind(current_step)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Writes the terminal transition. `progress` is the caller's
    /// responsibility: `spec.md` §8 requires `progress == 100 iff status ==
    /// COMPLETED`, so a FAILED/STOPPED job must pass its last-reported
    /// progress through, not a hardcoded 100.
    pub async fn complete(
        &self,
        id: Uuid,
        status: JobStatus,
        progress: f64,
        completed_at: DateTime<Utc>,
        error_message: Option<&str>,
        result_summary: Option<&OpaqueBag>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE job_executions
            SET status = $2, progress = $3, completed_at = $4,
                error_message = $5, result_summary = $6
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(progress)
        .bind(completed_at)
        .bind(error_message)
        .bind(result_summary.map(sqlx::types::Json))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_started(&self, id: Uuid, started_at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE job_executions SET status = 'running', started_at = $2 WHERE id = $1")
            .bind(id)
            .bind(started_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<Job> {
        sqlx::query_as::<_, Job>("SELECT * FROM job_executions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("job {id}")))
    }

    pub async fn has_active(&self, job_type: JobType) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM job_executions WHERE job_type = $1 AND status IN ('pending', 'running') LIMIT 1",
        )
        .bind(job_type)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    pub async fn list(
        &self,
        job_type: Option<JobType>,
        status: Option<JobStatus>,
        page: PageRequest,
    ) -> Result<Page<Job>> {
        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT count(*) FROM job_executions
            WHERE ($1::text IS NULL OR job_type = $1)
              AND ($2::text IS NULL OR status = $2)
            "#,
        )
        .bind(job_type)
        .bind(status)
        .fetch_one(&self.pool)
        .await?;

        let items = sqlx::query_as::<_, Job>(
            r#"
            SELECT * FROM job_executions
            WHERE ($1::text IS NULL OR job_type = $1)
              AND ($2::text IS NULL OR status = $2)
            ORDER BY created_at DESC
            OFFSET $3 LIMIT $4
            "#,
        )
        .bind(job_type)
        .bind(status)
        .bind(page.offset())
        .bind(page.limit())
        .fetch_all(&self.pool)
        .await?;

        Ok(Page::new(items, total, page))
    }

    pub async fn append_log(
        &self,
        job_id: Uuid,
        level: LogLevel,
        message: &str,
        details: Option<&OpaqueBag>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO job_logs (job_id, level, message, details, created_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(job_id)
        .bind(level)
        .bind(message)
        .bind(details.map(sqlx::types::Json))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Most recent `limit` log rows at or before `before`, newest first —
    /// the snapshot read behind the WebSocket fan-out's historical replay
    /// (`spec.md` §4.11 `connect`: "send historical log page ... reversed
    /// to chronological"). Callers reverse the result for delivery.
    pub async fn recent_logs_before(
        &self,
        job_id: Uuid,
        before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<JobLogEntry>> {
        sqlx::query_as::<_, JobLogEntry>(
            "SELECT * FROM job_logs WHERE job_id = $1 AND created_at <= $2 ORDER BY created_at DESC LIMIT $3",
        )
        .bind(job_id)
        .bind(before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(OrchestratorError::from)
    }

    pub async fn logs(&self, job_id: Uuid, page: PageRequest) -> Result<Page<JobLogEntry>> {
        let total: i64 = sqlx::query_scalar("SELECT count(*) FROM job_logs WHERE job_id = $1")
            .bind(job_id)
            .fetch_one(&self.pool)
            .await?;
        let items = sqlx::query_as::<_, JobLogEntry>(
            "SELECT * FROM job_logs WHERE job_id = $1 ORDER BY created_at ASC OFFSET $2 LIMIT $3",
        )
        .bind(job_id)
        .bind(page.offset())
        .bind(page.limit())
        .fetch_all(&self.pool)
        .await?;
        Ok(Page::new(items, total, page))
    }

    pub async fn stats(&self) -> Result<Vec<JobTypeStats>> {
        let rows: Vec<(JobType, i64, i64, i64, i64, Option<f64>)> = sqlx::query_as(
            r#"
            SELECT
                job_type,
                count(*) AS total,
                count(*) FILTER (WHERE status = 'completed') AS success_count,
                count(*) FILTER (WHERE status = 'failed') AS failure_count,
                count(*) FILTER (WHERE status IN ('pending', 'running')) AS running_count,
                avg(extract(epoch FROM (completed_at - started_at)))
                    FILTER (WHERE completed_at IS NOT NULL AND started_at IS NOT NULL) AS avg_duration
            FROM job_executions
            GROUP BY job_type
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(job_type, total, success_count, failure_count, running_count, avg_duration)| {
                    let success_rate = if total > 0 {
                        success_count as f64 / total as f64
                    } else {
                        0.0
                    };
                    JobTypeStats {
                        job_type,
                        total,
                        success_count,
                        failure_count,
                        running_count,
                        average_duration_secs: avg_duration,
                        success_rate,
                    }
                },
            )
            .collect())
    }

    /// Deletes terminal jobs older than `older_than`, returning the count
    /// removed (`spec.md` §4.8 `cleanup`).
    pub async fn cleanup_terminal_before(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM job_executions WHERE status IN ('completed', 'failed', 'stopped') AND completed_at < $1",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

/// Metadata row persisted for every stored raw API response, mirroring the
/// TTL-relevant columns used by the TTL (C6) and Archival (C7) engines.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RawResponseRecord {
    pub id: Uuid,
    pub provider: String,
    pub endpoint: String,
    pub request_url: String,
    #[sqlx(json)]
    pub params: sqlx::types::Json<std::collections::BTreeMap<String, String>>,
    #[sqlx(json)]
    pub response: sqlx::types::Json<serde_json::Value>,
    pub response_size_bytes: i64,
    pub status_code: i32,
    pub execution_time_ms: f64,
    pub created_at: DateTime<Utc>,
    pub ttl_days: i32,
    pub priority: i16,
    pub archived: bool,
}

/// One row of a [`RawResponseRepo::insert_many`] batch.
pub struct NewRawResponse {
    pub provider: Provider,
    pub endpoint: String,
    pub request_url: String,
    pub params: std::collections::BTreeMap<String, String>,
    pub response: serde_json::Value,
    pub response_size_bytes: u64,
    pub status_code: u16,
    pub execution_time_ms: f64,
    pub ttl_days: u32,
    pub priority: u8,
}

#[derive(Clone)]
pub struct RawResponseRepo {
    pool: PgPool,
}

impl RawResponseRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn insert(
        &self,
        provider: Provider,
        endpoint: &str,
        request_url: &str,
        params: &std::collections::BTreeMap<String, String>,
        response: &serde_json::Value,
        response_size_bytes: u64,
        status_code: u16,
        execution_time_ms: f64,
        ttl_days: u32,
        priority: u8,
    ) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO raw_api_responses
                (id, provider, endpoint, request_url, params, response,
                 response_size_bytes, status_code, execution_time_ms,
                 created_at, ttl_days, priority, archived)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, false)
            "#,
        )
        .bind(id)
        .bind(provider.as_str())
        .bind(endpoint)
        .bind(request_url)
        .bind(sqlx::types::Json(params))
        .bind(sqlx::types::Json(response))
        .bind(response_size_bytes as i64)
        .bind(status_code as i32)
        .bind(execution_time_ms)
        .bind(Utc::now())
        .bind(ttl_days as i32)
        .bind(priority as i16)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    /// Inserts every accepted item of a drained queue batch in one round
    /// trip (`spec.md` §4.5 "drain up to `batch_size` items ... then call
    /// the batch store path"). Returns the number of rows written.
    pub async fn insert_many(&self, items: &[NewRawResponse]) -> Result<u64> {
        if items.is_empty() {
            return Ok(0);
        }

        let now = Utc::now();
        let mut builder = sqlx::QueryBuilder::new(
            "INSERT INTO raw_api_responses \
             (id, provider, endpoint, request_url, params, response, \
              response_size_bytes, status_code, execution_time_ms, \
              created_at, ttl_days, priority, archived) ",
        );
        builder.push_values(items, |mut row, item| {
            row.push_bind(Uuid::new_v4())
                .push_bind(item.provider.as_str())
                .push_bind(&item.endpoint)
                .push_bind(&item.request_url)
                .push_bind(sqlx::types::Json(&item.params))
                .push_bind(sqlx::types::Json(&item.response))
                .push_bind(item.response_size_bytes as i64)
                .push_bind(item.status_code as i32)
                .push_bind(item.execution_time_ms)
                .push_bind(now)
                .push_bind(item.ttl_days as i32)
                .push_bind(item.priority as i16)
                .push_bind(false);
        });

        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    pub async fn batch_delete(&self, ids: &[Uuid]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query("DELETE FROM raw_api_responses WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn mark_archived(&self, ids: &[Uuid]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query("UPDATE raw_api_responses SET archived = true WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Rows whose TTL has already expired (`spec.md` §4.6 class: `Expired`).
    pub async fn expired(&self, limit: i64) -> Result<Vec<RawResponseRecord>> {
        sqlx::query_as(
            r#"
            SELECT * FROM raw_api_responses
            WHERE archived = false AND created_at + (ttl_days || ' days')::interval < now()
            ORDER BY created_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(OrchestratorError::from)
    }

    /// Rows at priority 3 older than `aged_after_days` (`spec.md` §4.6
    /// class 2: `LowPriorityAged` — "priority = 3 and age > 30 days").
    pub async fn low_priority_aged(&self, aged_after_days: i32, limit: i64) -> Result<Vec<RawResponseRecord>> {
        sqlx::query_as(
            r#"
            SELECT * FROM raw_api_responses
            WHERE archived = false AND priority = 3 AND created_at < now() - ($1 || ' days')::interval
            ORDER BY created_at ASC
            LIMIT $2
            "#,
        )
        .bind(aged_after_days)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(OrchestratorError::from)
    }

    /// Rows above `min_size_bytes`, priority >= 2, and older than
    /// `aged_after_days` (`spec.md` §4.6 class 3: `OversizeAged` — "size >
    /// 10 MiB and priority >= 2 and age > 7 days").
    pub async fn oversize_aged(
        &self,
        min_size_bytes: i64,
        aged_after_days: i32,
        limit: i64,
    ) -> Result<Vec<RawResponseRecord>> {
        sqlx::query_as(
            r#"
            SELECT * FROM raw_api_responses
            WHERE archived = false AND response_size_bytes >= $1 AND priority >= 2
              AND created_at < now() - ($2 || ' days')::interval
            ORDER BY response_size_bytes DESC
            LIMIT $3
            "#,
        )
        .bind(min_size_bytes)
        .bind(aged_after_days)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(OrchestratorError::from)
    }

    /// Rows at priority >= 2 older than `aged_after_days` (`spec.md` §4.6
    /// class 4: `Emergency` — "priority >= 2 and age > 3 days").
    pub async fn emergency_aged(&self, aged_after_days: i32, limit: i64) -> Result<Vec<RawResponseRecord>> {
        sqlx::query_as(
            r#"
            SELECT * FROM raw_api_responses
            WHERE archived = false AND priority >= 2 AND created_at < now() - ($1 || ' days')::interval
            ORDER BY created_at ASC
            LIMIT $2
            "#,
        )
        .bind(aged_after_days)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(OrchestratorError::from)
    }

    /// Rows past `aged_after_days` and not yet archived (`spec.md` §4.7
    /// Candidates: "records past their archival age per provider that are
    /// not yet archived"), distinct from the TTL Engine's priority-keyed
    /// classes above.
    pub async fn archival_candidates(
        &self,
        provider: Option<&str>,
        aged_after_days: i32,
        limit: i64,
    ) -> Result<Vec<RawResponseRecord>> {
        sqlx::query_as(
            r#"
            SELECT * FROM raw_api_responses
            WHERE archived = false
              AND ($1::text IS NULL OR provider = $1)
              AND created_at < now() - ($2 || ' days')::interval
            ORDER BY created_at ASC
            LIMIT $3
            "#,
        )
        .bind(provider)
        .bind(aged_after_days)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(OrchestratorError::from)
    }

    /// `(recent, total)` non-archived row counts for `provider`, used by
    /// the Data Quality Check job to flag providers with no fresh captures
    /// in `fresh_within_hours` (`SPEC_FULL.md` job catalog: "validating
    /// freshness/completeness of collected data").
    pub async fn freshness_counts(&self, provider: &str, fresh_within_hours: i64) -> Result<(i64, i64)> {
        sqlx::query_as(
            r#"
            SELECT
                count(*) FILTER (WHERE created_at >= now() - ($2 || ' hours')::interval) AS recent,
                count(*) AS total
            FROM raw_api_responses
            WHERE provider = $1 AND archived = false
            "#,
        )
        .bind(provider)
        .bind(fresh_within_hours)
        .fetch_one(&self.pool)
        .await
        .map_err(OrchestratorError::from)
    }

    pub async fn total_size_mb(&self) -> Result<f64> {
        let total: Option<i64> = sqlx::query_scalar(
            "SELECT sum(response_size_bytes) FROM raw_api_responses WHERE archived = false",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(total.unwrap_or(0) as f64 / (1024.0 * 1024.0))
    }
}
