//! Storage key layout.
//!
//! All workers must derive keys identically, so every key the pipeline
//! reads or writes is built here.

use std::path::Path;

use sha2::{Digest, Sha256};

/// Catalog document name under the metadata prefix.
const CATALOG_FILE: &str = "processed_files.json";
/// Shared bookkeeping lock under the metadata prefix.
const LOCK_FILE: &str = "update.lock";
/// Cumulative stats document under the metadata prefix.
const STATS_FILE: &str = "stats.json";

/// Prefixes that define where items, outputs and metadata live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    input_prefix: String,
    output_prefix: String,
    metadata_prefix: String,
}

/// Append a trailing `/` to non-empty prefixes that lack one.
fn normalize_prefix(prefix: &str) -> String {
    if prefix.is_empty() || prefix.ends_with('/') {
        prefix.to_string()
    } else {
        format!("{}/", prefix)
    }
}

impl StorageLayout {
    pub fn new(input_prefix: &str, output_prefix: &str, metadata_prefix: &str) -> Self {
        Self {
            input_prefix: normalize_prefix(input_prefix),
            output_prefix: normalize_prefix(output_prefix),
            metadata_prefix: normalize_prefix(metadata_prefix),
        }
    }

    pub fn input_prefix(&self) -> &str {
        &self.input_prefix
    }

    pub fn output_prefix(&self) -> &str {
        &self.output_prefix
    }

    pub fn metadata_prefix(&self) -> &str {
        &self.metadata_prefix
    }

    /// Key of the catalog index document.
    pub fn catalog_key(&self) -> String {
        format!("{}{}", self.metadata_prefix, CATALOG_FILE)
    }

    /// Key of the shared bookkeeping lock.
    pub fn lock_key(&self) -> String {
        format!("{}{}", self.metadata_prefix, LOCK_FILE)
    }

    /// Key whose creation grants the right to break the stale lock `token`.
    pub fn lock_break_key(&self, token: &str) -> String {
        format!("{}{}.break-{}", self.metadata_prefix, LOCK_FILE, token)
    }

    /// Key of the cumulative stats document.
    pub fn stats_key(&self) -> String {
        format!("{}{}", self.metadata_prefix, STATS_FILE)
    }

    /// Key of the run log for `date` (`YYYY-MM-DD`).
    pub fn run_log_key(&self, date: &str) -> String {
        format!("{}logs/{}_processing_log.json", self.metadata_prefix, date)
    }

    /// Prefix holding every claim marker of an item.
    pub fn claim_prefix(&self, item: &str) -> String {
        let digest = Sha256::digest(item.as_bytes());
        format!("{}claims/{:x}/", self.metadata_prefix, digest)
    }

    /// Key of the claim marker for attempt `attempt` of `item`.
    pub fn claim_key(&self, item: &str, attempt: u32) -> String {
        format!("{}{}.json", self.claim_prefix(item), attempt)
    }

    /// Upload destination for a converted item.
    ///
    /// Format: `{output_prefix}{date}/{stem}_{suffix}.mp4`
    pub fn output_key(&self, item: &str, date: &str, suffix: &str) -> String {
        let stem = Path::new(item)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "output".to_string());
        format!("{}{}/{}_{}.mp4", self.output_prefix, date, stem, suffix)
    }
}
