//! Task loop.
//!
//! Each loop claims an item, moves it through
//! `Selected -> Downloaded -> Converted -> Uploaded -> Committed` and
//! records the outcome, until no claimable item is left.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn, Instrument};
use uuid::Uuid;
use vconv_media::Transcoder;
use vconv_models::{ConversionResult, DATE_FORMAT};

use crate::aggregator::RunAggregator;
use crate::coordinator::{Claim, ClaimCoordinator};
use crate::error::{WorkerError, WorkerResult};
use crate::logging::JobLogger;
use crate::metrics;
use crate::retry::{retry_async, RetryConfig};

/// Scratch workspace name prefix.
const WORKSPACE_PREFIX: &str = "video_processing_";

/// Last state an item reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStage {
    Selected,
    Downloaded,
    Converted,
    Uploaded,
    Committed,
}

impl fmt::Display for ItemStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ItemStage::Selected => "selected",
            ItemStage::Downloaded => "downloaded",
            ItemStage::Converted => "converted",
            ItemStage::Uploaded => "uploaded",
            ItemStage::Committed => "committed",
        };
        f.write_str(name)
    }
}

/// Result of processing one claimed item.
#[derive(Debug, Clone)]
pub enum ItemOutcome {
    Succeeded {
        item: String,
        output_key: String,
        result: ConversionResult,
        elapsed: Duration,
    },
    Failed {
        item: String,
        /// Last state reached before the failure
        stage: ItemStage,
        error: String,
        elapsed: Duration,
    },
}

impl ItemOutcome {
    pub fn item(&self) -> &str {
        match self {
            ItemOutcome::Succeeded { item, .. } | ItemOutcome::Failed { item, .. } => item,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ItemOutcome::Succeeded { .. })
    }

    /// Add this outcome to a run.
    pub fn record(&self, run: &mut RunAggregator) {
        match self {
            ItemOutcome::Succeeded {
                item,
                result,
                elapsed,
                ..
            } => run.record_success(item, elapsed.as_secs_f64(), result),
            ItemOutcome::Failed {
                item, error, elapsed, ..
            } => run.record_failure(item, elapsed.as_secs_f64(), error),
        }
    }
}

/// Totals of one `Worker::run`.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    /// Media items under the input prefix at start
    pub total_items: usize,
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub saved_bytes: i64,
    pub elapsed: Duration,
}

/// Claims and converts items until none are left.
#[derive(Clone)]
pub struct Worker {
    coordinator: ClaimCoordinator,
    transcoder: Arc<dyn Transcoder>,
    work_dir: PathBuf,
    concurrency: usize,
    transfer_retry: RetryConfig,
    shutdown: Option<watch::Receiver<bool>>,
}

impl Worker {
    pub fn new(
        coordinator: ClaimCoordinator,
        transcoder: Arc<dyn Transcoder>,
        work_dir: impl Into<PathBuf>,
        concurrency: usize,
    ) -> Self {
        Self {
            coordinator,
            transcoder,
            work_dir: work_dir.into(),
            concurrency: concurrency.max(1),
            transfer_retry: RetryConfig::new("transfer"),
            shutdown: None,
        }
    }

    /// Stop claiming new items once the flag turns true.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn with_transfer_retry(mut self, retry: RetryConfig) -> Self {
        self.transfer_retry = retry;
        self
    }

    pub fn coordinator(&self) -> &ClaimCoordinator {
        &self.coordinator
    }

    /// Run all claim loops, then flush the run log and stats.
    pub async fn run(&self) -> WorkerResult<RunSummary> {
        let started = Instant::now();
        let started_at = Utc::now();
        let total_items = self.coordinator.list_items().await?.len();
        info!(
            worker_id = %self.coordinator.worker_id(),
            total_items,
            concurrency = self.concurrency,
            "Starting claim loops"
        );

        tokio::fs::create_dir_all(&self.work_dir).await?;

        let mut loops = JoinSet::new();
        for loop_id in 0..self.concurrency {
            let worker = self.clone();
            loops.spawn(async move { worker.claim_loop(loop_id, started_at).await });
        }

        let mut run = RunAggregator::new(started_at);
        while let Some(joined) = loops.join_next().await {
            match joined {
                Ok(partial) => run.absorb(partial),
                Err(e) => error!(error = %e, "Claim loop panicked"),
            }
        }

        let counts = run.counts();
        if let Err(e) = run.finish(&self.coordinator).await {
            error!(error = %e, "Failed to finish run bookkeeping");
        }

        let summary = RunSummary {
            total_items,
            attempted: counts.processed,
            succeeded: counts.succeeded,
            failed: counts.failed,
            saved_bytes: counts.saved_bytes,
            elapsed: started.elapsed(),
        };
        info!(
            processed = summary.attempted,
            total = summary.total_items,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "Processed {}/{} items",
            summary.attempted,
            summary.total_items
        );
        Ok(summary)
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    async fn claim_loop(self, loop_id: usize, started_at: chrono::DateTime<Utc>) -> RunAggregator {
        let mut run = RunAggregator::new(started_at);

        loop {
            if self.shutdown_requested() {
                info!(loop_id, "Shutdown requested, not claiming more items");
                break;
            }

            match self.coordinator.claim_next().await {
                Ok(Some(claim)) => {
                    let outcome = self.process_item(&claim).await;
                    outcome.record(&mut run);
                }
                Ok(None) => {
                    info!(loop_id, "No claimable items left");
                    break;
                }
                Err(e) => {
                    error!(loop_id, error = %e, "Claim scan failed");
                    break;
                }
            }
        }

        run
    }

    /// Process one claimed item. Failures are returned as an outcome.
    pub async fn process_item(&self, claim: &Claim) -> ItemOutcome {
        let logger = JobLogger::new(&claim.item, claim.attempt, "convert");
        let started = Instant::now();
        let heartbeat = self.coordinator.spawn_heartbeat(claim);
        let mut stage = ItemStage::Selected;

        let result = self
            .run_stages(claim, &logger, &mut stage)
            .instrument(logger.create_span())
            .await;
        heartbeat.stop();
        let elapsed = started.elapsed();

        match result {
            Ok((output_key, result)) => {
                logger.log_completion(
                    &format!("{} ({:.1}% smaller)", output_key, result.reduction),
                    elapsed.as_secs_f64(),
                );
                metrics::record_item("succeeded", elapsed.as_secs_f64(), result.bytes_saved());
                ItemOutcome::Succeeded {
                    item: claim.item.clone(),
                    output_key,
                    result,
                    elapsed,
                }
            }
            Err(e) => {
                let message = e.to_string();
                logger.log_error(&format!("{} (reached {})", message, stage), elapsed.as_secs_f64());
                metrics::record_item("failed", elapsed.as_secs_f64(), 0);

                if let Err(commit_err) = self.coordinator.commit_failed(claim, &message).await {
                    logger.log_warning(&format!("Could not record failure: {}", commit_err));
                }

                ItemOutcome::Failed {
                    item: claim.item.clone(),
                    stage,
                    error: message,
                    elapsed,
                }
            }
        }
    }

    async fn run_stages(
        &self,
        claim: &Claim,
        logger: &JobLogger,
        stage: &mut ItemStage,
    ) -> WorkerResult<(String, ConversionResult)> {
        logger.log_start(&format!("attempt {} ({})", claim.attempt, claim.kind.as_str()));

        // Removed on drop, so every early return cleans up
        let workspace = tempfile::Builder::new()
            .prefix(WORKSPACE_PREFIX)
            .tempdir_in(&self.work_dir)?;
        let input = workspace.path().join(input_file_name(&claim.item));
        let output = workspace.path().join("output.mp4");

        let backend = self.coordinator.backend();
        let item = claim.item.as_str();
        let input_path = input.as_path();
        retry_async(&self.transfer_retry, WorkerError::is_retryable, || async move {
            backend.download_file(item, input_path).await.map_err(WorkerError::from)
        })
        .await?;
        *stage = ItemStage::Downloaded;
        logger.log_progress("downloaded");

        let mut on_progress = |percent: u8| logger.log_percent(percent);
        let result = self.transcoder.convert(&input, &output, &mut on_progress).await?;
        *stage = ItemStage::Converted;

        let date = Utc::now().format(DATE_FORMAT).to_string();
        let suffix = Uuid::new_v4().simple().to_string();
        let output_key = self.coordinator.layout().output_key(item, &date, &suffix[..8]);
        let output_path = output.as_path();
        let key = output_key.as_str();
        retry_async(&self.transfer_retry, WorkerError::is_retryable, || async move {
            backend.upload_file(output_path, key).await.map_err(WorkerError::from)
        })
        .await?;
        *stage = ItemStage::Uploaded;
        logger.log_progress(&format!("uploaded to {}", output_key));

        self.coordinator
            .commit_done(claim, &date, &output_key, result)
            .await?;
        *stage = ItemStage::Committed;

        if let Err(e) = workspace.close() {
            warn!(error = %e, "Failed to remove scratch workspace");
        }

        Ok((output_key, result))
    }
}

/// `input.<ext>`, keeping the source container's extension.
fn input_file_name(item: &str) -> String {
    let ext = Path::new(item)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .filter(|e| !e.is_empty())
        .unwrap_or_else(|| "mp4".to_string());
    format!("input.{}", ext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_file_name_keeps_extension() {
        assert_eq!(input_file_name("in/a.MOV"), "input.mov");
        assert_eq!(input_file_name("in/b.mkv"), "input.mkv");
        assert_eq!(input_file_name("in/noext"), "input.mp4");
    }

    #[test]
    fn test_stage_display() {
        assert_eq!(ItemStage::Downloaded.to_string(), "downloaded");
        assert_eq!(ItemStage::Committed.to_string(), "committed");
    }

    #[test]
    fn test_outcome_records_into_run() {
        let mut run = RunAggregator::new(Utc::now());
        let ok = ItemOutcome::Succeeded {
            item: "in/a.mp4".into(),
            output_key: "out/a.mp4".into(),
            result: ConversionResult::new(100, 40, 8, 4),
            elapsed: Duration::from_secs(1),
        };
        let failed = ItemOutcome::Failed {
            item: "in/b.mp4".into(),
            stage: ItemStage::Downloaded,
            error: "boom".into(),
            elapsed: Duration::from_millis(10),
        };

        ok.record(&mut run);
        failed.record(&mut run);

        assert!(ok.is_success());
        assert_eq!(failed.item(), "in/b.mp4");
        assert_eq!(run.counts().saved_bytes, 60);
        assert_eq!(run.counts().failed, 1);
    }
}
