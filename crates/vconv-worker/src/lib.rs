//! Distributed video conversion worker.
//!
//! This crate provides:
//! - Claim coordination over a shared blob store (claim markers and a lease lock)
//! - The per-item task loop: download, convert, upload, commit
//! - Run aggregation into a run log and cumulative stats
//! - Environment configuration, structured logging and retry helpers

pub mod aggregator;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod retry;

pub use aggregator::RunAggregator;
pub use config::{BackendKind, StorageConfig, WorkerConfig};
pub use coordinator::{Claim, ClaimCoordinator, ClaimKind, CoordinatorSettings, Heartbeat};
pub use error::{WorkerError, WorkerResult};
pub use logging::JobLogger;
pub use pipeline::{ItemOutcome, ItemStage, RunSummary, Worker};
pub use retry::{retry_async, FailureTracker, RetryConfig};
