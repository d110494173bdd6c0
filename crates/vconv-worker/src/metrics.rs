//! Worker metrics.
//!
//! Counters are recorded through the `metrics` facade; without an
//! installed recorder they are no-ops.

use metrics::{counter, histogram};

// =============================================================================
// Metric Names
// =============================================================================

pub mod names {
    /// Claims won by this worker, by kind (new, reclaim, retry).
    pub const CLAIMS_TOTAL: &str = "vconv_claims_total";

    /// Claim attempts lost to another worker.
    pub const CLAIM_CONFLICTS_TOTAL: &str = "vconv_claim_conflicts_total";

    /// Abandoned last attempts turned into failed records.
    pub const CLAIMS_EXPIRED_TOTAL: &str = "vconv_claims_expired_total";

    /// Lock acquisitions that found the lock held.
    pub const LOCK_CONTENTION_TOTAL: &str = "vconv_lock_contention_total";

    /// Stale locks broken by this worker.
    pub const LOCKS_BROKEN_TOTAL: &str = "vconv_locks_broken_total";

    /// Finished items by outcome.
    pub const ITEMS_TOTAL: &str = "vconv_items_total";

    /// Item processing time in seconds.
    pub const ITEM_SECONDS: &str = "vconv_item_seconds";

    /// Bytes saved by successful conversions.
    pub const BYTES_SAVED_TOTAL: &str = "vconv_bytes_saved_total";
}

// =============================================================================
// Recording Functions
// =============================================================================

pub fn record_claim(kind: &'static str) {
    counter!(names::CLAIMS_TOTAL, "kind" => kind).increment(1);
}

pub fn record_claim_conflict() {
    counter!(names::CLAIM_CONFLICTS_TOTAL).increment(1);
}

pub fn record_claim_expired() {
    counter!(names::CLAIMS_EXPIRED_TOTAL).increment(1);
}

pub fn record_lock_contention() {
    counter!(names::LOCK_CONTENTION_TOTAL).increment(1);
}

pub fn record_lock_broken() {
    counter!(names::LOCKS_BROKEN_TOTAL).increment(1);
}

/// Record a finished item.
pub fn record_item(outcome: &'static str, elapsed_secs: f64, bytes_saved: i64) {
    counter!(names::ITEMS_TOTAL, "outcome" => outcome).increment(1);
    histogram!(names::ITEM_SECONDS, "outcome" => outcome).record(elapsed_secs);
    if bytes_saved > 0 {
        counter!(names::BYTES_SAVED_TOTAL).increment(bytes_saved as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_names() {
        assert!(names::CLAIMS_TOTAL.starts_with("vconv_"));
        assert!(names::LOCK_CONTENTION_TOTAL.contains("lock"));
        assert!(names::ITEM_SECONDS.ends_with("_seconds"));
    }

    #[test]
    fn test_recording_without_recorder() {
        record_claim("new");
        record_item("succeeded", 1.5, 1024);
        record_item("failed", 0.2, 0);
    }
}
