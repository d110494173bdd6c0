//! Structured item logging utilities.
//!
//! Provides consistent, structured logging for item processing with
//! tracing spans and contextual information.

use tracing::{debug, error, info, warn, Span};

/// Item logger for structured logging with consistent formatting.
///
/// Every event carries the item key, the attempt and the operation, so one
/// item's lifecycle can be followed across workers.
#[derive(Debug, Clone)]
pub struct JobLogger {
    item: String,
    attempt: u32,
    operation: String,
}

impl JobLogger {
    /// Create a new logger for one attempt of one item.
    ///
    /// # Arguments
    /// * `item` - The storage key of the item
    /// * `attempt` - The attempt number owned by this worker
    /// * `operation` - The type of operation (e.g., "convert")
    pub fn new(item: &str, attempt: u32, operation: &str) -> Self {
        Self {
            item: item.to_string(),
            attempt,
            operation: operation.to_string(),
        }
    }

    pub fn log_start(&self, message: &str) {
        info!(
            item = %self.item,
            attempt = self.attempt,
            operation = %self.operation,
            "Item started: {}", message
        );
    }

    /// Log a conversion percentage: debug for every step, info every 10%.
    pub fn log_percent(&self, percent: u8) {
        if percent % 10 == 0 {
            info!(
                item = %self.item,
                attempt = self.attempt,
                operation = %self.operation,
                percent,
                "Item progress: {}%", percent
            );
        } else {
            debug!(
                item = %self.item,
                attempt = self.attempt,
                percent,
                "Item progress: {}%", percent
            );
        }
    }

    pub fn log_progress(&self, message: &str) {
        info!(
            item = %self.item,
            attempt = self.attempt,
            operation = %self.operation,
            "Item progress: {}", message
        );
    }

    pub fn log_warning(&self, message: &str) {
        warn!(
            item = %self.item,
            attempt = self.attempt,
            operation = %self.operation,
            "Item warning: {}", message
        );
    }

    /// Log a failed attempt with its elapsed time.
    pub fn log_error(&self, message: &str, elapsed_secs: f64) {
        error!(
            item = %self.item,
            attempt = self.attempt,
            operation = %self.operation,
            elapsed_secs,
            "Item failed after {:.2}s: {}", elapsed_secs, message
        );
    }

    pub fn log_completion(&self, message: &str, elapsed_secs: f64) {
        info!(
            item = %self.item,
            attempt = self.attempt,
            operation = %self.operation,
            elapsed_secs,
            "Item completed in {:.2}s: {}", elapsed_secs, message
        );
    }

    pub fn item(&self) -> &str {
        &self.item
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Create a tracing span for this item.
    pub fn create_span(&self) -> Span {
        tracing::info_span!(
            "item",
            item = %self.item,
            attempt = self.attempt,
            operation = %self.operation
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_logger_creation() {
        let logger = JobLogger::new("input/a.mp4", 2, "convert");

        assert_eq!(logger.item(), "input/a.mp4");
        assert_eq!(logger.attempt(), 2);
        assert_eq!(logger.operation(), "convert");
    }
}
