//! Shared data models for the vconv conversion pipeline.
//!
//! This crate provides Serde-serializable types for:
//! - The catalog index and per-item processing records
//! - Claim and lock markers used for mutual exclusion
//! - Conversion results and encoding policy
//! - Run logs and cumulative cross-run statistics

pub mod catalog;
pub mod conversion;
pub mod encoding;
pub mod marker;
pub mod run_log;
pub mod stats;

// Re-export common types
pub use catalog::{CatalogIndex, ProcessingRecord, ProcessingStatus};
pub use conversion::ConversionResult;
pub use encoding::{EncodingPolicy, MIN_TARGET_BITRATE};
pub use marker::{ClaimMarker, LockMarker};
pub use run_log::{ProcessingLogEntry, RunCounts, RunLog, SystemInfo};
pub use stats::CumulativeStats;

/// Date format used for output folders, record dates and log names.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Timestamp format used inside run logs and stats documents.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
