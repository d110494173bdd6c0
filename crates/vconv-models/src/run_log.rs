//! Per-run processing log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::conversion::ConversionResult;
use crate::{DATE_FORMAT, TIMESTAMP_FORMAT};

/// Host and platform descriptors recorded with each run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub platform: String,
    pub processor: String,
    pub runtime_version: String,
    pub hostname: String,
}

impl SystemInfo {
    /// Describe the current host.
    pub fn current() -> Self {
        Self {
            platform: std::env::consts::OS.to_string(),
            processor: std::env::consts::ARCH.to_string(),
            runtime_version: format!("vconv {}", env!("CARGO_PKG_VERSION")),
            hostname: std::env::var("HOSTNAME")
                .or_else(|_| std::env::var("COMPUTERNAME"))
                .unwrap_or_else(|_| "unknown".to_string()),
        }
    }
}

/// One attempt recorded in the run log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingLogEntry {
    /// Source item key
    pub file: String,
    /// When the attempt finished (`%Y-%m-%d %H:%M:%S`)
    pub timestamp: String,
    pub success: bool,
    pub processing_time_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_reduction_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_bitrate: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_bitrate: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProcessingLogEntry {
    /// Entry for a successful conversion.
    pub fn success(
        file: impl Into<String>,
        processing_time_seconds: f64,
        result: &ConversionResult,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            file: file.into(),
            timestamp: at.format(TIMESTAMP_FORMAT).to_string(),
            success: true,
            processing_time_seconds,
            input_size: Some(result.input_size),
            output_size: Some(result.output_size),
            size_reduction_percent: Some(result.reduction),
            input_bitrate: Some(result.input_bitrate),
            target_bitrate: Some(result.target_bitrate),
            error: None,
        }
    }

    /// Entry for a failed attempt.
    pub fn failure(
        file: impl Into<String>,
        processing_time_seconds: f64,
        error: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            file: file.into(),
            timestamp: at.format(TIMESTAMP_FORMAT).to_string(),
            success: false,
            processing_time_seconds,
            input_size: None,
            output_size: None,
            size_reduction_percent: None,
            input_bitrate: None,
            target_bitrate: None,
            error: Some(error.into()),
        }
    }
}

/// Counters of a run, as merged into the cumulative stats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub saved_bytes: i64,
}

/// Record of a single worker execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLog {
    /// Run date (`YYYY-MM-DD`)
    pub date: String,
    pub system_info: SystemInfo,
    pub files_processed: u64,
    pub successful: u64,
    pub failed: u64,
    pub total_saved_space: i64,
    pub processing_details: Vec<ProcessingLogEntry>,
}

impl RunLog {
    /// Start an empty log for a run beginning at `started_at`.
    pub fn new(started_at: DateTime<Utc>, system_info: SystemInfo) -> Self {
        Self {
            date: started_at.format(DATE_FORMAT).to_string(),
            system_info,
            files_processed: 0,
            successful: 0,
            failed: 0,
            total_saved_space: 0,
            processing_details: Vec::new(),
        }
    }

    /// Append an entry and update the counters.
    pub fn push(&mut self, entry: ProcessingLogEntry) {
        if entry.success {
            self.successful += 1;
            if let (Some(input), Some(output)) = (entry.input_size, entry.output_size) {
                self.total_saved_space += input as i64 - output as i64;
            }
        } else {
            self.failed += 1;
        }
        self.files_processed += 1;
        self.processing_details.push(entry);
    }

    /// Append all entries of another log, keeping their order.
    pub fn extend(&mut self, other: RunLog) {
        for entry in other.processing_details {
            self.push(entry);
        }
    }

    pub fn counts(&self) -> RunCounts {
        RunCounts {
            processed: self.files_processed,
            succeeded: self.successful,
            failed: self.failed,
            saved_bytes: self.total_saved_space,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log() -> RunLog {
        RunLog::new(Utc::now(), SystemInfo::current())
    }

    #[test]
    fn test_push_updates_counters() {
        let now = Utc::now();
        let mut run = log();
        let result = ConversionResult::new(10_000, 4_000, 4_000_000, 2_000_000);

        run.push(ProcessingLogEntry::success("in/a.mp4", 12.5, &result, now));
        run.push(ProcessingLogEntry::failure("in/b.mp4", 1.0, "boom", now));

        assert_eq!(run.counts(), RunCounts {
            processed: 2,
            succeeded: 1,
            failed: 1,
            saved_bytes: 6_000,
        });
        assert_eq!(run.processing_details[1].error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_extend_merges_in_order() {
        let now = Utc::now();
        let mut a = log();
        let mut b = log();
        a.push(ProcessingLogEntry::failure("in/a.mp4", 1.0, "x", now));
        b.push(ProcessingLogEntry::failure("in/b.mp4", 1.0, "y", now));
        b.push(ProcessingLogEntry::failure("in/c.mp4", 1.0, "z", now));

        a.extend(b);
        let files: Vec<_> = a.processing_details.iter().map(|e| e.file.as_str()).collect();
        assert_eq!(files, ["in/a.mp4", "in/b.mp4", "in/c.mp4"]);
        assert_eq!(a.files_processed, 3);
        assert_eq!(a.failed, 3);
    }

    #[test]
    fn test_failure_entry_omits_metrics() {
        let entry = ProcessingLogEntry::failure("in/a.mp4", 2.0, "nope", Utc::now());
        let value = serde_json::to_value(&entry).unwrap();
        assert!(value.get("input_size").is_none());
        assert_eq!(value["error"], "nope");
        assert_eq!(value["success"], false);
    }
}
