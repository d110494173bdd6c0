//! Catalog index and per-item processing records.
//!
//! The catalog is persisted as a single JSON object keyed by the source
//! item's storage key. Records written by older tooling may lack the
//! `status` field (successful conversions only carried `success: true`),
//! so the effective status is derived when it is missing.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::conversion::ConversionResult;

/// Processing status of a catalog item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    /// A worker holds a claim and is converting the item
    Processing,
    /// Converted and uploaded
    Done,
    /// Last attempt failed
    Failed,
}

impl ProcessingStatus {
    /// Get string representation of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Processing => "processing",
            ProcessingStatus::Done => "done",
            ProcessingStatus::Failed => "failed",
        }
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessingStatus::Done | ProcessingStatus::Failed)
    }
}

impl std::fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Processing record for a single item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingRecord {
    /// Explicit status (absent on legacy success records)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ProcessingStatus>,

    /// Date the conversion completed (`YYYY-MM-DD`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_date: Option<String>,

    /// Storage key of the converted output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,

    /// Whether the conversion succeeded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,

    /// Size and bitrate metrics of the conversion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_results: Option<ConversionResult>,

    /// Claim attempt that wrote this record (fencing token)
    #[serde(default, skip_serializing_if = "is_zero")]
    pub attempt: u32,

    /// Worker that holds or held the claim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,

    /// When the claim was taken
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,

    /// Failure text of the last attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Fields this version does not know about, kept verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl ProcessingRecord {
    /// Record marking an item as claimed by `worker_id` for `attempt`.
    pub fn processing(attempt: u32, worker_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            status: Some(ProcessingStatus::Processing),
            attempt,
            claimed_by: Some(worker_id.into()),
            claimed_at: Some(now),
            ..Default::default()
        }
    }

    /// Effective status, derived from `success` for legacy records.
    pub fn status(&self) -> ProcessingStatus {
        match (self.status, self.success) {
            (Some(status), _) => status,
            (None, Some(true)) => ProcessingStatus::Done,
            (None, Some(false)) => ProcessingStatus::Failed,
            (None, None) => ProcessingStatus::Processing,
        }
    }

    /// Mark the record as done with the given output and metrics.
    pub fn mark_done(
        &mut self,
        processed_date: impl Into<String>,
        output_path: impl Into<String>,
        results: ConversionResult,
    ) {
        self.status = Some(ProcessingStatus::Done);
        self.processed_date = Some(processed_date.into());
        self.output_path = Some(output_path.into());
        self.success = Some(true);
        self.processing_results = Some(results);
        self.error = None;
    }

    /// Mark the record as failed with the given error text.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = Some(ProcessingStatus::Failed);
        self.success = Some(false);
        self.error = Some(error.into());
    }
}

/// Durable map from item key to processing record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CatalogIndex(BTreeMap<String, ProcessingRecord>);

impl CatalogIndex {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a catalog document.
    pub fn from_slice(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    /// Serialize the catalog as pretty JSON.
    pub fn to_vec(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
    }

    pub fn get(&self, item: &str) -> Option<&ProcessingRecord> {
        self.0.get(item)
    }

    pub fn get_mut(&mut self, item: &str) -> Option<&mut ProcessingRecord> {
        self.0.get_mut(item)
    }

    pub fn contains(&self, item: &str) -> bool {
        self.0.contains_key(item)
    }

    /// Insert or replace the record for an item.
    pub fn insert(&mut self, item: impl Into<String>, record: ProcessingRecord) {
        self.0.insert(item.into(), record);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ProcessingRecord)> {
        self.0.iter()
    }

    /// Number of records with the given effective status.
    pub fn count_status(&self, status: ProcessingStatus) -> usize {
        self.0.values().filter(|r| r.status() == status).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_success_record_is_done() {
        let doc = r#"{
            "in/a.mp4": {
                "processed_date": "2024-11-02",
                "output_path": "out/2024-11-02/a_1a2b3c4d.mp4",
                "success": true,
                "processing_results": {
                    "input_size": 100,
                    "output_size": 50,
                    "input_bitrate": 4000000,
                    "target_bitrate": 2000000,
                    "reduction": 50.0
                }
            },
            "in/b.mp4": {"status": "processing"}
        }"#;

        let catalog = CatalogIndex::from_slice(doc.as_bytes()).unwrap();
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.get("in/a.mp4").unwrap().status(), ProcessingStatus::Done);
        assert_eq!(
            catalog.get("in/b.mp4").unwrap().status(),
            ProcessingStatus::Processing
        );
        assert_eq!(catalog.get("in/b.mp4").unwrap().attempt, 0);
    }

    #[test]
    fn test_unknown_fields_survive_rewrite() {
        let doc = r#"{"in/a.mp4": {"status": "done", "reviewed_by": "ops"}}"#;
        let catalog = CatalogIndex::from_slice(doc.as_bytes()).unwrap();
        let bytes = catalog.to_vec().unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["in/a.mp4"]["reviewed_by"], "ops");
    }

    #[test]
    fn test_processing_record_serializes_status() {
        let record = ProcessingRecord::processing(1, "worker-1", Utc::now());
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["status"], "processing");
        assert_eq!(value["attempt"], 1);
        assert_eq!(value["claimed_by"], "worker-1");
        assert!(value.get("success").is_none());
    }

    #[test]
    fn test_mark_failed_then_done() {
        let mut record = ProcessingRecord::processing(2, "w", Utc::now());
        record.mark_failed("ffmpeg exited with 1");
        assert_eq!(record.status(), ProcessingStatus::Failed);
        assert_eq!(record.success, Some(false));

        record.mark_done(
            "2025-01-01",
            "out/x.mp4",
            ConversionResult::new(10, 5, 4_000_000, 2_000_000),
        );
        assert_eq!(record.status(), ProcessingStatus::Done);
        assert!(record.error.is_none());
        assert!(record.status().is_terminal());
    }

    #[test]
    fn test_unknown_status_rejected() {
        let doc = r#"{"in/a.mp4": {"status": "exploded"}}"#;
        assert!(CatalogIndex::from_slice(doc.as_bytes()).is_err());
    }
}
