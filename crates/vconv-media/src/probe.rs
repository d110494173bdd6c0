//! FFprobe source inspection.

use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use crate::command::check_ffprobe;
use crate::error::{MediaError, MediaResult};

/// Source video information used to derive encoding parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SourceInfo {
    /// Height of the first video stream in pixels
    pub height: u32,
    /// Duration in seconds
    pub duration: f64,
    /// Bitrate in bits/second
    pub bitrate: u64,
    /// File size in bytes
    pub size: u64,
}

/// FFprobe JSON output format.
#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    format: Option<FfprobeFormat>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
    bit_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    height: Option<u32>,
    bit_rate: Option<String>,
}

/// Pick the bitrate: stream value, else container value, else an
/// estimate from file size and duration.
pub fn resolve_bitrate(
    stream_bit_rate: Option<&str>,
    format_bit_rate: Option<&str>,
    file_size: u64,
    duration: f64,
) -> u64 {
    let parse = |v: Option<&str>| v.and_then(|b| b.trim().parse::<u64>().ok());

    parse(stream_bit_rate)
        .or_else(|| parse(format_bit_rate))
        .unwrap_or_else(|| {
            if duration > 0.0 {
                ((file_size * 8) as f64 / duration) as u64
            } else {
                0
            }
        })
}

/// Parse FFprobe JSON for a file of `file_size` bytes.
pub fn parse_probe_output(stdout: &[u8], file_size: u64) -> MediaResult<SourceInfo> {
    let probe: FfprobeOutput = serde_json::from_slice(stdout)
        .map_err(|e| MediaError::inspection_failed(format!("Unparseable ffprobe output: {}", e)))?;

    let stream = probe
        .streams
        .first()
        .ok_or_else(|| MediaError::inspection_failed("No video stream found"))?;

    let height = stream
        .height
        .ok_or_else(|| MediaError::inspection_failed("Video stream has no height"))?;

    let format = probe
        .format
        .as_ref()
        .ok_or_else(|| MediaError::inspection_failed("No format section"))?;

    let duration = format
        .duration
        .as_deref()
        .and_then(|d| d.trim().parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d > 0.0)
        .ok_or_else(|| MediaError::inspection_failed("Missing or invalid duration"))?;

    let bitrate = resolve_bitrate(
        stream.bit_rate.as_deref(),
        format.bit_rate.as_deref(),
        file_size,
        duration,
    );

    Ok(SourceInfo {
        height,
        duration,
        bitrate,
        size: file_size,
    })
}

/// Probe a video file with the FFprobe found in PATH.
pub async fn probe_video(path: impl AsRef<Path>) -> MediaResult<SourceInfo> {
    let ffprobe = check_ffprobe()?;
    probe_video_with(ffprobe.as_os_str(), path).await
}

/// Probe a video file using a specific ffprobe binary.
pub async fn probe_video_with(ffprobe: &OsStr, path: impl AsRef<Path>) -> MediaResult<SourceInfo> {
    let path = path.as_ref();

    let metadata = match tokio::fs::metadata(path).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(MediaError::FileNotFound(path.to_path_buf()));
        }
        Err(e) => return Err(e.into()),
    };

    let output = Command::new(ffprobe)
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=height,bit_rate",
            "-show_entries",
            "format=duration,bit_rate",
            "-of",
            "json",
        ])
        .arg(path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => MediaError::FfprobeNotFound,
            _ => MediaError::Io(e),
        })?;

    if !output.status.success() {
        return Err(MediaError::inspection_failed(format!(
            "ffprobe exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let info = parse_probe_output(&output.stdout, metadata.len())?;
    debug!(
        path = %path.display(),
        height = info.height,
        duration = info.duration,
        bitrate = info.bitrate,
        "Probed source"
    );
    Ok(info)
}
