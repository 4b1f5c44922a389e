//! Archival Engine (C7, `spec.md` §4.7).
//!
//! Grounded on `original_source/app/core/ttl_policy_engine.py`'s archival
//! companion pass and on the teacher's `async-compression` dependency for
//! streaming gzip. Archive candidates are compressed to a cold-storage sink
//! on the local filesystem, then the source row is marked archived; on
//! `dry_run` nothing is written or mutated, only counted.

use std::path::PathBuf;
use std::sync::Arc;

use async_compression::tokio::write::GzipEncoder;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::providers::Provider;
use crate::storage::repo::{RawResponseRecord, RawResponseRepo};
use crate::telemetry::Metrics;

#[derive(Debug, Clone)]
pub struct ArchivalConfig {
    pub cold_store_dir: PathBuf,
    pub aged_after_days: i32,
    pub batch_size: i64,
    pub dry_run: bool,
}

impl Default for ArchivalConfig {
    fn default() -> Self {
        Self {
            cold_store_dir: PathBuf::from("./archive"),
            aged_after_days: 30,
            batch_size: 200,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ArchivalReport {
    pub candidates: usize,
    pub archived: usize,
    pub failed: usize,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

impl ArchivalReport {
    pub fn compression_ratio(&self) -> f64 {
        if self.bytes_before == 0 {
            0.0
        } else {
            self.bytes_after as f64 / self.bytes_before as f64
        }
    }
}

pub struct ArchivalEngine {
    repo: Arc<RawResponseRepo>,
    config: ArchivalConfig,
    metrics: Arc<Metrics>,
}

impl ArchivalEngine {
    pub fn new(repo: Arc<RawResponseRepo>, config: ArchivalConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            repo,
            config,
            metrics,
        }
    }

    /// Runs one archival pass (`archive(provider?, dry_run) → Summary`,
    /// `spec.md` §4.7): selects rows past their archival age, not yet
    /// archived, optionally restricted to one provider — a query of its
    /// own, distinct from the TTL Engine's priority-keyed classes — then
    /// compresses each to the cold store and marks the source rows
    /// archived. Archive-then-mutate ordering means a crash mid-pass leaves
    /// already-archived rows re-archivable on the next run (the write is to
    /// a fresh path keyed by id, so it is naturally idempotent) rather than
    /// losing data (`spec.md` §4.7 Atomicity). `dry_run` takes precedence
    /// over the engine's own configured default.
    pub async fn run_pass(&self, provider: Option<Provider>, dry_run: bool) -> Result<ArchivalReport> {
        let provider_str = provider.map(Provider::as_str);
        let candidates = self
            .repo
            .archival_candidates(provider_str, self.config.aged_after_days, self.config.batch_size)
            .await?;
        let mut report = ArchivalReport {
            candidates: candidates.len(),
            ..Default::default()
        };

        if dry_run || self.config.dry_run {
            report.bytes_before = candidates.iter().map(|c| c.response_size_bytes as u64).sum();
            info!(candidates = report.candidates, "archival dry run, no writes performed");
            return Ok(report);
        }

        if !candidates.is_empty() {
            tokio::fs::create_dir_all(&self.config.cold_store_dir)
                .await
                .map_err(|e| crate::error::OrchestratorError::Config(format!("cold store dir: {e}")))?;
        }

        let mut reconciled = Vec::with_capacity(candidates.len());
        for record in &candidates {
            match self.archive_one(record).await {
                Ok(compressed_len) => {
                    report.bytes_before += record.response_size_bytes as u64;
                    report.bytes_after += compressed_len;
                    report.archived += 1;
                    reconciled.push(record.id);
                }
                Err(e) => {
                    warn!(id = %record.id, error = %e, "archival write failed, leaving row unarchived");
                    report.failed += 1;
                }
            }
        }

        if !reconciled.is_empty() {
            self.repo.mark_archived(&reconciled).await?;
        }

        info!(
            archived = report.archived,
            failed = report.failed,
            ratio = report.compression_ratio(),
            "archival pass complete"
        );
        Ok(report)
    }

    async fn archive_one(&self, record: &RawResponseRecord) -> anyhow::Result<u64> {
        let path = self.archive_path(record.id);
        let raw = serde_json::to_vec(&record.response.0)?;
        let file = tokio::fs::File::create(&path).await?;
        let mut encoder = GzipEncoder::new(file);
        encoder.write_all(&raw).await?;
        encoder.shutdown().await?;
        let written = tokio::fs::metadata(&path).await?.len();
        Ok(written)
    }

    fn archive_path(&self, id: Uuid) -> PathBuf {
        self.config.cold_store_dir.join(format!("{id}.json.gz"))
    }
}
