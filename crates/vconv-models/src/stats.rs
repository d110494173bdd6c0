//! Cross-run cumulative statistics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::run_log::RunCounts;
use crate::TIMESTAMP_FORMAT;

/// Running totals merged from successive run logs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CumulativeStats {
    #[serde(default)]
    pub total_processed: u64,
    #[serde(default)]
    pub total_successful: u64,
    #[serde(default)]
    pub total_failed: u64,
    #[serde(default)]
    pub total_saved_space: i64,
    /// Last merge time (`%Y-%m-%d %H:%M:%S`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CumulativeStats {
    pub fn from_slice(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    pub fn to_vec(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
    }

    /// Add a run's counters and stamp the update time.
    pub fn merge(&mut self, counts: &RunCounts, now: DateTime<Utc>) {
        self.total_processed += counts.processed;
        self.total_successful += counts.succeeded;
        self.total_failed += counts.failed;
        self.total_saved_space += counts.saved_bytes;
        self.last_update = Some(now.format(TIMESTAMP_FORMAT).to_string());
    }

    pub fn totals(&self) -> RunCounts {
        RunCounts {
            processed: self.total_processed,
            succeeded: self.total_successful,
            failed: self.total_failed,
            saved_bytes: self.total_saved_space,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(p: u64, s: u64, f: u64, b: i64) -> RunCounts {
        RunCounts {
            processed: p,
            succeeded: s,
            failed: f,
            saved_bytes: b,
        }
    }

    #[test]
    fn test_merge_is_additive() {
        let mut stats = CumulativeStats {
            total_processed: 10,
            total_successful: 8,
            total_failed: 2,
            total_saved_space: 1_000,
            ..Default::default()
        };

        stats.merge(&counts(3, 2, 1, 500), Utc::now());
        assert_eq!(stats.totals(), counts(13, 10, 3, 1_500));
        assert!(stats.last_update.is_some());
    }

    #[test]
    fn test_merge_order_does_not_matter() {
        let runs = [counts(1, 1, 0, 10), counts(4, 2, 2, -5), counts(7, 7, 0, 300)];
        let now = Utc::now();

        let mut forward = CumulativeStats::default();
        runs.iter().for_each(|r| forward.merge(r, now));

        let mut backward = CumulativeStats::default();
        runs.iter().rev().for_each(|r| backward.merge(r, now));

        assert_eq!(forward.totals(), backward.totals());
        assert_eq!(forward.totals(), counts(12, 10, 2, 305));
    }

    #[test]
    fn test_missing_fields_default_to_zero() {
        let stats = CumulativeStats::from_slice(br#"{"total_processed": 4}"#).unwrap();
        assert_eq!(stats.totals(), counts(4, 0, 0, 0));
        assert!(stats.last_update.is_none());
    }
}
