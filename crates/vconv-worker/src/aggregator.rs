//! Run aggregation.
//!
//! Each claim loop threads its own [`RunAggregator`]; loops are merged with
//! [`RunAggregator::absorb`] and the result is flushed once at exit.

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use vconv_models::{ConversionResult, ProcessingLogEntry, RunCounts, RunLog, SystemInfo};

use crate::coordinator::ClaimCoordinator;
use crate::error::{WorkerError, WorkerResult};

/// In-memory record of one worker execution.
#[derive(Debug, Clone)]
pub struct RunAggregator {
    log: RunLog,
}

impl RunAggregator {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self::with_system_info(started_at, SystemInfo::current())
    }

    pub fn with_system_info(started_at: DateTime<Utc>, system_info: SystemInfo) -> Self {
        Self {
            log: RunLog::new(started_at, system_info),
        }
    }

    pub fn record_success(&mut self, item: &str, elapsed_secs: f64, result: &ConversionResult) {
        self.log
            .push(ProcessingLogEntry::success(item, elapsed_secs, result, Utc::now()));
    }

    pub fn record_failure(&mut self, item: &str, elapsed_secs: f64, error: &str) {
        self.log
            .push(ProcessingLogEntry::failure(item, elapsed_secs, error, Utc::now()));
    }

    /// Merge another loop's entries into this one.
    pub fn absorb(&mut self, other: RunAggregator) {
        self.log.extend(other.log);
    }

    pub fn counts(&self) -> RunCounts {
        self.log.counts()
    }

    pub fn log(&self) -> &RunLog {
        &self.log
    }

    /// Append the run's entries to the day's log and merge the counts into
    /// the cumulative stats.
    ///
    /// A run that processed nothing writes neither document. Both writes
    /// are attempted even when the first fails; a failed stats merge is
    /// reported as `MergeFailed`.
    pub async fn finish(self, coordinator: &ClaimCoordinator) -> WorkerResult<RunCounts> {
        let counts = self.counts();
        if counts.processed == 0 {
            info!("Nothing processed, run log and stats left untouched");
            return Ok(counts);
        }

        let logged = coordinator.append_run_log(self.log).await;
        match &logged {
            Ok(day) => info!(
                date = %day.date,
                processed = counts.processed,
                succeeded = counts.succeeded,
                failed = counts.failed,
                saved_bytes = counts.saved_bytes,
                day_total = day.files_processed,
                "Run log written"
            ),
            Err(e) => warn!(error = %e, "Failed to write run log"),
        }

        let merged = match coordinator.merge_stats(&counts).await {
            Ok(stats) => {
                info!(
                    total_processed = stats.total_processed,
                    total_saved_space = stats.total_saved_space,
                    "Cumulative stats updated"
                );
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Failed to merge cumulative stats");
                Err(WorkerError::merge_failed(e.to_string()))
            }
        };

        logged?;
        merged?;
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio_test::{assert_err, assert_ok};
    use vconv_models::{CumulativeStats, DATE_FORMAT};
    use vconv_storage::{MemoryBackend, StorageLayout};

    use crate::coordinator::{ClaimCoordinator, CoordinatorSettings};

    fn system() -> SystemInfo {
        SystemInfo {
            platform: "linux".into(),
            processor: "x86_64".into(),
            runtime_version: "test".into(),
            hostname: "host".into(),
        }
    }

    fn coordinator(backend: &MemoryBackend) -> ClaimCoordinator {
        ClaimCoordinator::new(
            Arc::new(backend.clone()),
            StorageLayout::new("in/", "out/", "meta/"),
            "worker-a",
            CoordinatorSettings::default(),
        )
    }

    #[test]
    fn test_absorb_combines_loops() {
        let now = Utc::now();
        let mut first = RunAggregator::with_system_info(now, system());
        let mut second = RunAggregator::with_system_info(now, system());

        first.record_success("in/a.mp4", 1.0, &ConversionResult::new(1000, 400, 8, 4));
        second.record_failure("in/b.mp4", 0.5, "boom");
        second.record_success("in/c.mp4", 2.0, &ConversionResult::new(500, 300, 8, 4));
        first.absorb(second);

        let counts = first.counts();
        assert_eq!(counts.processed, 3);
        assert_eq!(counts.succeeded, 2);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.saved_bytes, 800);
        assert_eq!(first.log().processing_details[1].file, "in/b.mp4");
    }

    #[tokio::test]
    async fn test_finish_writes_log_and_stats() {
        let backend = MemoryBackend::new();
        let coordinator = coordinator(&backend);
        let now = Utc::now();
        let mut run = RunAggregator::with_system_info(now, system());
        run.record_success("in/a.mp4", 1.0, &ConversionResult::new(1000, 400, 8, 4));

        let counts = assert_ok!(run.finish(&coordinator).await);
        assert_eq!(counts.succeeded, 1);

        let log_key = format!("meta/logs/{}_processing_log.json", now.format(DATE_FORMAT));
        let log: RunLog = serde_json::from_slice(&backend.read(&log_key).unwrap()).unwrap();
        assert_eq!(log.files_processed, 1);
        assert_eq!(log.system_info.hostname, "host");

        let stats = CumulativeStats::from_slice(&backend.read("meta/stats.json").unwrap()).unwrap();
        assert_eq!(stats.total_successful, 1);
        assert_eq!(stats.total_saved_space, 600);
    }

    #[tokio::test]
    async fn test_merge_failure_is_reported_after_log_write() {
        let backend = MemoryBackend::new();
        backend.insert("meta/stats.json", "corrupt");
        let coordinator = coordinator(&backend);
        let now = Utc::now();
        let mut run = RunAggregator::with_system_info(now, system());
        run.record_failure("in/a.mp4", 0.1, "boom");

        let result = run.finish(&coordinator).await;
        assert!(matches!(result, Err(WorkerError::MergeFailed(_))));

        let log_key = format!("meta/logs/{}_processing_log.json", now.format(DATE_FORMAT));
        assert!(backend.contains(&log_key));
        assert_eq!(backend.read("meta/stats.json").unwrap(), b"corrupt");
    }

    #[tokio::test]
    async fn test_idle_run_keeps_days_log() {
        let backend = MemoryBackend::new();
        let coordinator = coordinator(&backend);
        let now = Utc::now();
        let mut busy = RunAggregator::with_system_info(now, system());
        busy.record_success("in/a.mp4", 1.0, &ConversionResult::new(1000, 400, 8, 4));
        assert_ok!(busy.finish(&coordinator).await);

        let idle = RunAggregator::with_system_info(now, system());
        let counts = assert_ok!(idle.finish(&coordinator).await);
        assert_eq!(counts.processed, 0);

        let log_key = format!("meta/logs/{}_processing_log.json", now.format(DATE_FORMAT));
        let log: RunLog = serde_json::from_slice(&backend.read(&log_key).unwrap()).unwrap();
        assert_eq!(log.files_processed, 1);
        assert_eq!(log.processing_details.len(), 1);
    }

    #[tokio::test]
    async fn test_log_failure_still_merges_stats() {
        let backend = MemoryBackend::new();
        let coordinator = coordinator(&backend);
        let now = Utc::now();
        let log_key = format!("meta/logs/{}_processing_log.json", now.format(DATE_FORMAT));
        backend.insert(log_key.as_str(), "{truncated");

        let mut run = RunAggregator::with_system_info(now, system());
        run.record_failure("in/a.mp4", 0.1, "boom");
        let err = assert_err!(run.finish(&coordinator).await);
        assert!(matches!(err, WorkerError::MalformedDocument { .. }));

        assert_eq!(backend.read(&log_key).unwrap(), b"{truncated");
        let stats = CumulativeStats::from_slice(&backend.read("meta/stats.json").unwrap()).unwrap();
        assert_eq!(stats.total_failed, 1);
    }
}
