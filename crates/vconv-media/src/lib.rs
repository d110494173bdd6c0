//! FFmpeg CLI wrapper for the vconv conversion pipeline.
//!
//! This crate provides:
//! - Source inspection through FFprobe with a bitrate fallback chain
//! - Type-safe FFmpeg command building
//! - Progress parsing from `-progress pipe:1` over a bounded channel
//! - Stall detection and cancellation support via tokio
//! - The [`Transcoder`] seam used by the task loop

pub mod command;
pub mod error;
pub mod probe;
pub mod progress;
pub mod transcoder;

pub use command::{check_ffmpeg, check_ffprobe, FfmpegCommand, FfmpegRunner};
pub use error::{MediaError, MediaResult};
pub use probe::{probe_video, resolve_bitrate, SourceInfo};
pub use progress::{FfmpegProgress, ProgressStream, ProgressTracker};
pub use transcoder::{FfmpegTranscoder, Transcoder, TranscoderOptions};
