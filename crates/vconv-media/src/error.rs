//! Error types for media operations.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type for media operations.
pub type MediaResult<T> = Result<T, MediaError>;

/// Errors that can occur during media processing.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("FFmpeg not found in PATH")]
    FfmpegNotFound,

    #[error("FFprobe not found in PATH")]
    FfprobeNotFound,

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Inspection failed: {0}")]
    InspectionFailed(String),

    #[error("Conversion failed: {message}")]
    ConversionFailed {
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    #[error("No progress from FFmpeg for {0:?}")]
    Stalled(Duration),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MediaError {
    /// Create an inspection failure error.
    pub fn inspection_failed(message: impl Into<String>) -> Self {
        Self::InspectionFailed(message.into())
    }

    /// Create a conversion failure error.
    pub fn conversion_failed(
        message: impl Into<String>,
        stderr: Option<String>,
        exit_code: Option<i32>,
    ) -> Self {
        Self::ConversionFailed {
            message: message.into(),
            stderr,
            exit_code,
        }
    }

    /// Diagnostic text captured from the tool, if any.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            MediaError::ConversionFailed { stderr, .. } => stderr.as_deref(),
            _ => None,
        }
    }
}
