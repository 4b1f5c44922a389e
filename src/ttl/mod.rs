//! TTL Engine (C6, `spec.md` §4.6).
//!
//! Grounded on `original_source/app/core/ttl_policy_engine.py`: four
//! candidate classes, evaluated in strict order and concatenated into one
//! candidate list, then sorted and optionally truncated to a size target
//! before a single bulk delete per class-contiguous batch.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::info;
use uuid::Uuid;

use crate::error::Result;
use crate::storage::repo::{RawResponseRecord, RawResponseRepo};
use crate::telemetry::Metrics;

/// Candidate classes, in the strict scan order required by `spec.md` §4.6:
/// already-expired rows are reclaimed first, then low-priority aged rows,
/// then oversized aged rows, then (only under emergency disk pressure) aged
/// rows at priority >= 2 regardless of size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CandidateClass {
    Expired,
    LowPriorityAged,
    OversizeAged,
    Emergency,
}

impl CandidateClass {
    /// Ascending sort key used to order candidates within the combined scan
    /// (`spec.md` §4.6: sort by `(class_score ASC, size_mb DESC)`).
    fn class_score(self) -> u8 {
        match self {
            CandidateClass::Expired => 0,
            CandidateClass::LowPriorityAged => 1,
            CandidateClass::OversizeAged => 2,
            CandidateClass::Emergency => 3,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            CandidateClass::Expired => "expired",
            CandidateClass::LowPriorityAged => "low_priority_aged",
            CandidateClass::OversizeAged => "oversize_aged",
            CandidateClass::Emergency => "emergency",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TtlPolicyConfig {
    /// Class 2 age threshold in days; spec.md §4.6 fixes this at 30.
    pub low_priority_aged_days: i32,
    pub oversize_min_bytes: i64,
    /// Class 3 age threshold in days; spec.md §4.6 fixes this at 7.
    pub oversize_aged_days: i32,
    /// Class 4 age threshold in days; spec.md §4.6 fixes this at 3.
    pub emergency_aged_days: i32,
    pub batch_size: i64,
}

impl Default for TtlPolicyConfig {
    fn default() -> Self {
        Self {
            low_priority_aged_days: 30,
            oversize_min_bytes: 10 * 1024 * 1024,
            oversize_aged_days: 7,
            emergency_aged_days: 3,
            batch_size: 500,
        }
    }
}

/// Result of one [`TtlEngine::cleanup`] call (`spec.md` §4.6 `Report`).
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct Report {
    pub candidates: usize,
    pub deleted: u64,
    pub bytes_reclaimed: u64,
    pub duration_ms: u128,
    pub errors: Vec<String>,
    pub summary_by_priority: std::collections::BTreeMap<String, u64>,
}

pub struct TtlEngine {
    repo: Arc<RawResponseRepo>,
    config: TtlPolicyConfig,
    metrics: Arc<Metrics>,
}

#[derive(Debug, Clone)]
struct Candidate {
    id: Uuid,
    class: CandidateClass,
    size_mb: f64,
    priority: i16,
}

impl TtlEngine {
    pub fn new(repo: Arc<RawResponseRepo>, config: TtlPolicyConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            repo,
            config,
            metrics,
        }
    }

    /// Runs one sweep (`cleanup(target_mb?, emergency) → Report`,
    /// `spec.md` §4.6). The four candidate classes are queried
    /// independently and concatenated into a single list — not tried as a
    /// cascading fallback — then sorted `(class_score ASC, size_mb DESC)`
    /// and, if `target_mb` is given, truncated once cumulative size meets
    /// the target. Idempotent: a sweep with nothing eligible deletes
    /// nothing and returns a zeroed `Report`.
    pub async fn cleanup(&self, target_mb: Option<f64>, emergency: bool) -> Result<Report> {
        let started = Instant::now();
        let mut errors = Vec::new();

        let mut candidates = Vec::new();
        match self.collect_expired().await {
            Ok(mut c) => candidates.append(&mut c),
            Err(e) => errors.push(format!("{}: {e}", CandidateClass::Expired.as_str())),
        }
        match self.collect_low_priority_aged().await {
            Ok(mut c) => candidates.append(&mut c),
            Err(e) => errors.push(format!("{}: {e}", CandidateClass::LowPriorityAged.as_str())),
        }
        match self.collect_oversize_aged().await {
            Ok(mut c) => candidates.append(&mut c),
            Err(e) => errors.push(format!("{}: {e}", CandidateClass::OversizeAged.as_str())),
        }
        if emergency {
            match self.collect_emergency().await {
                Ok(mut c) => candidates.append(&mut c),
                Err(e) => errors.push(format!("{}: {e}", CandidateClass::Emergency.as_str())),
            }
        }

        candidates.sort_by(|a, b| {
            a.class
                .class_score()
                .cmp(&b.class.class_score())
                .then(b.size_mb.partial_cmp(&a.size_mb).unwrap_or(std::cmp::Ordering::Equal))
        });

        if let Some(target_mb) = target_mb {
            let mut cumulative = 0.0;
            let mut cutoff = candidates.len();
            for (idx, candidate) in candidates.iter().enumerate() {
                if cumulative >= target_mb {
                    cutoff = idx;
                    break;
                }
                cumulative += candidate.size_mb;
            }
            candidates.truncate(cutoff.max(0));
        }

        let report_candidates = candidates.len();
        let mut deleted = 0u64;
        let mut bytes_reclaimed = 0u64;
        let mut summary_by_priority: std::collections::BTreeMap<String, u64> = std::collections::BTreeMap::new();

        for chunk in candidates.chunks(self.config.batch_size.max(1) as usize) {
            let ids: Vec<Uuid> = chunk.iter().map(|c| c.id).collect();
            match self.repo.batch_delete(&ids).await {
                Ok(n) => {
                    deleted += n;
                    bytes_reclaimed += chunk.iter().map(|c| (c.size_mb * 1024.0 * 1024.0) as u64).sum::<u64>();
                    for candidate in chunk {
                        *summary_by_priority.entry(candidate.priority.to_string()).or_insert(0) += 1;
                    }
                }
                Err(e) => errors.push(format!("batch_delete: {e}")),
            }
        }

        self.metrics.ttl_records_reclaimed.inc_by(deleted);
        let report = Report {
            candidates: report_candidates,
            deleted,
            bytes_reclaimed,
            duration_ms: started.elapsed().as_millis(),
            errors,
            summary_by_priority,
        };
        info!(
            candidates = report.candidates,
            deleted = report.deleted,
            bytes_reclaimed = report.bytes_reclaimed,
            "ttl cleanup reclaimed rows"
        );
        Ok(report)
    }

    async fn collect_expired(&self) -> Result<Vec<Candidate>> {
        Ok(self
            .repo
            .expired(self.config.batch_size)
            .await?
            .into_iter()
            .map(|r| to_candidate(r, CandidateClass::Expired))
            .collect())
    }

    async fn collect_low_priority_aged(&self) -> Result<Vec<Candidate>> {
        Ok(self
            .repo
            .low_priority_aged(self.config.low_priority_aged_days, self.config.batch_size)
            .await?
            .into_iter()
            .map(|r| to_candidate(r, CandidateClass::LowPriorityAged))
            .collect())
    }

    async fn collect_oversize_aged(&self) -> Result<Vec<Candidate>> {
        Ok(self
            .repo
            .oversize_aged(
                self.config.oversize_min_bytes,
                self.config.oversize_aged_days,
                self.config.batch_size,
            )
            .await?
            .into_iter()
            .map(|r| to_candidate(r, CandidateClass::OversizeAged))
            .collect())
    }

    async fn collect_emergency(&self) -> Result<Vec<Candidate>> {
        Ok(self
            .repo
            .emergency_aged(self.config.emergency_aged_days, self.config.batch_size)
            .await?
            .into_iter()
            .map(|r| to_candidate(r, CandidateClass::Emergency))
            .collect())
    }
}

fn to_candidate(record: RawResponseRecord, class: CandidateClass) -> Candidate {
    Candidate {
        id: record.id,
        class,
        size_mb: record.response_size_bytes as f64 / (1024.0 * 1024.0),
        priority: record.priority,
    }
}

/// Spawns the periodic TTL sweep ticker. Each tick is a non-emergency,
/// untargeted cleanup; emergency/target-driven cleanups are triggered
/// on-demand (e.g. by the `TtlCleanup` job body).
pub fn spawn_ticker(
    engine: Arc<TtlEngine>,
    interval: Duration,
    shutdown: tokio_util::sync::CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = engine.cleanup(None, false).await {
                        tracing::warn!(error = %e, "ttl cleanup failed");
                    }
                }
            }
        }
    })
}
