//! Worker error types.

use thiserror::Error;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Lock busy: {0}")]
    LockBusy(String),

    #[error("Stats merge failed: {0}")]
    MergeFailed(String),

    #[error("Claim lost on {item}: attempt {attempt} was superseded")]
    ClaimLost { item: String, attempt: u32 },

    #[error("Malformed document {key}: {message}")]
    MalformedDocument { key: String, message: String },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Storage error: {0}")]
    Storage(#[from] vconv_storage::StorageError),

    #[error("Media error: {0}")]
    Media(#[from] vconv_media::MediaError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn lock_busy(msg: impl Into<String>) -> Self {
        Self::LockBusy(msg.into())
    }

    pub fn merge_failed(msg: impl Into<String>) -> Self {
        Self::MergeFailed(msg.into())
    }

    pub fn claim_lost(item: impl Into<String>, attempt: u32) -> Self {
        Self::ClaimLost {
            item: item.into(),
            attempt,
        }
    }

    pub fn malformed(key: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::MalformedDocument {
            key: key.into(),
            message: err.to_string(),
        }
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// Check if the error came from lock contention.
    pub fn is_lock_busy(&self) -> bool {
        matches!(self, WorkerError::LockBusy(_))
    }

    /// Check if another worker superseded our attempt.
    pub fn is_claim_lost(&self) -> bool {
        matches!(self, WorkerError::ClaimLost { .. })
    }

    /// Check if a transient backend call may succeed when repeated.
    pub fn is_retryable(&self) -> bool {
        use vconv_storage::StorageError;

        matches!(
            self,
            WorkerError::Storage(
                StorageError::UploadFailed(_)
                    | StorageError::DownloadFailed(_)
                    | StorageError::ListFailed(_)
                    | StorageError::AwsSdk(_)
                    | StorageError::Io(_)
            )
        )
    }
}
