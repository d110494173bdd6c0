//! FFmpeg command builder and runner.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{MediaError, MediaResult};
use crate::progress::{FfmpegProgress, ProgressStream};

/// Default capacity of the progress channel.
const DEFAULT_PROGRESS_CAPACITY: usize = 16;

/// Default time without progress before FFmpeg is considered stuck.
const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(300);

/// Builder for FFmpeg commands.
#[derive(Debug, Clone)]
pub struct FfmpegCommand {
    /// Input file path
    input: PathBuf,
    /// Output file path
    output: PathBuf,
    /// Output arguments (after -i)
    output_args: Vec<String>,
    /// Whether to overwrite output
    overwrite: bool,
    /// Log level
    log_level: String,
}

impl FfmpegCommand {
    /// Create a new FFmpeg command.
    pub fn new(input: impl AsRef<Path>, output: impl AsRef<Path>) -> Self {
        Self {
            input: input.as_ref().to_path_buf(),
            output: output.as_ref().to_path_buf(),
            output_args: Vec::new(),
            overwrite: true,
            log_level: "warning".to_string(),
        }
    }

    /// Add output arguments (after -i).
    pub fn output_arg(mut self, arg: impl Into<String>) -> Self {
        self.output_args.push(arg.into());
        self
    }

    /// Set video codec.
    pub fn video_codec(self, codec: impl Into<String>) -> Self {
        self.output_arg("-c:v").output_arg(codec)
    }

    /// Set audio codec.
    pub fn audio_codec(self, codec: impl Into<String>) -> Self {
        self.output_arg("-c:a").output_arg(codec)
    }

    /// Set preset.
    pub fn preset(self, preset: impl Into<String>) -> Self {
        self.output_arg("-preset").output_arg(preset)
    }

    /// Set average video bitrate in kbit/s.
    pub fn video_bitrate_kbps(self, kbps: u64) -> Self {
        self.output_arg("-b:v").output_arg(format!("{}k", kbps))
    }

    /// Set rate-control ceiling in kbit/s.
    pub fn maxrate_kbps(self, kbps: u64) -> Self {
        self.output_arg("-maxrate").output_arg(format!("{}k", kbps))
    }

    /// Set rate-control buffer in kbit/s.
    pub fn bufsize_kbps(self, kbps: u64) -> Self {
        self.output_arg("-bufsize").output_arg(format!("{}k", kbps))
    }

    /// Set log level.
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    /// Build the command arguments.
    pub fn build_args(&self) -> Vec<String> {
        let mut args = Vec::new();

        // Overwrite flag
        if self.overwrite {
            args.push("-y".to_string());
        }

        // Diagnostics go to stderr at this level
        args.push("-loglevel".to_string());
        args.push(self.log_level.clone());

        // Machine-readable progress on stdout
        args.push("-progress".to_string());
        args.push("pipe:1".to_string());
        args.push("-nostats".to_string());

        // Input file
        args.push("-i".to_string());
        args.push(self.input.to_string_lossy().to_string());

        // Output args
        args.extend(self.output_args.clone());

        // Output file
        args.push(self.output.to_string_lossy().to_string());

        args
    }
}

/// Runner for FFmpeg commands with progress tracking and cancellation.
pub struct FfmpegRunner {
    /// FFmpeg binary
    program: OsString,
    /// Cancellation signal receiver
    cancel_rx: Option<watch::Receiver<bool>>,
    /// Maximum time between progress snapshots
    stall_timeout: Duration,
    /// Progress channel capacity
    progress_capacity: usize,
}

impl FfmpegRunner {
    /// Create a runner for a specific FFmpeg binary.
    pub fn with_program(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            cancel_rx: None,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
            progress_capacity: DEFAULT_PROGRESS_CAPACITY,
        }
    }

    /// Set cancellation signal.
    pub fn with_cancel(mut self, cancel_rx: watch::Receiver<bool>) -> Self {
        self.cancel_rx = Some(cancel_rx);
        self
    }

    /// Set the stall timeout.
    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = timeout;
        self
    }

    /// Run an FFmpeg command with progress callback.
    ///
    /// The callback runs on the caller's task, once per progress snapshot.
    pub async fn run_with_progress<F>(&self, cmd: &FfmpegCommand, mut progress_callback: F) -> MediaResult<()>
    where
        F: FnMut(&FfmpegProgress) + Send,
    {
        let args = cmd.build_args();
        debug!("Running FFmpeg: {} {}", self.program.to_string_lossy(), args.join(" "));

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => MediaError::FfmpegNotFound,
                _ => MediaError::Io(e),
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MediaError::conversion_failed("stdout not captured", None, None))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| MediaError::conversion_failed("stderr not captured", None, None))?;

        // Drain stderr concurrently so FFmpeg never blocks on it
        let stderr_handle = tokio::spawn(async move {
            let mut text = String::new();
            let mut stderr = stderr;
            let _ = stderr.read_to_string(&mut text).await;
            text
        });

        let mut progress = ProgressStream::spawn(stdout, self.progress_capacity, self.stall_timeout);
        let mut cancel_rx = self.cancel_rx.clone();

        let streamed: MediaResult<()> = loop {
            tokio::select! {
                _ = wait_cancelled(&mut cancel_rx) => break Err(MediaError::Cancelled),
                next = progress.next() => match next {
                    Ok(Some(snapshot)) => progress_callback(&snapshot),
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e),
                },
            }
        };
        drop(progress);

        if let Err(e) = streamed {
            match &e {
                MediaError::Cancelled => info!("FFmpeg cancelled, killing process"),
                _ => warn!("FFmpeg {}, killing process", e),
            }
            kill(&mut child).await;
            let _ = stderr_handle.await;
            return Err(e);
        }

        let status = match tokio::time::timeout(self.stall_timeout, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                warn!("FFmpeg did not exit after closing stdout, killing process");
                kill(&mut child).await;
                let _ = stderr_handle.await;
                return Err(MediaError::Stalled(self.stall_timeout));
            }
        };

        let stderr_text = stderr_handle.await.unwrap_or_default();
        if !stderr_text.trim().is_empty() {
            debug!("FFmpeg output: {}", stderr_text.trim());
        }

        if status.success() {
            Ok(())
        } else {
            Err(MediaError::conversion_failed(
                format!("FFmpeg exited with {}", status),
                Some(stderr_text),
                status.code(),
            ))
        }
    }
}

/// Resolve once the cancellation flag is set; never if there is none.
async fn wait_cancelled(cancel_rx: &mut Option<watch::Receiver<bool>>) {
    let Some(rx) = cancel_rx else {
        return std::future::pending().await;
    };

    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender dropped: cancellation can no longer happen
            return std::future::pending().await;
        }
    }
}

async fn kill(child: &mut Child) {
    if let Err(e) = child.kill().await {
        warn!("Failed to kill FFmpeg: {}", e);
    }
}

/// Check if FFmpeg is available.
pub fn check_ffmpeg() -> MediaResult<PathBuf> {
    which::which("ffmpeg").map_err(|_| MediaError::FfmpegNotFound)
}

/// Check if FFprobe is available.
pub fn check_ffprobe() -> MediaResult<PathBuf> {
    which::which("ffprobe").map_err(|_| MediaError::FfprobeNotFound)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_builder() {
        let cmd = FfmpegCommand::new("input.mp4", "output.mp4")
            .video_codec("libx265")
            .preset("veryfast")
            .video_bitrate_kbps(2000)
            .maxrate_kbps(3000)
            .bufsize_kbps(4000)
            .audio_codec("copy");

        let args = cmd.build_args();
        let joined = args.join(" ");
        assert!(joined.contains("-i input.mp4"));
        assert!(joined.contains("-c:v libx265 -preset veryfast"));
        assert!(joined.contains("-b:v 2000k -maxrate 3000k -bufsize 4000k"));
        assert!(joined.contains("-c:a copy"));
        assert!(joined.contains("-progress pipe:1"));
        assert!(args.contains(&"-y".to_string()));
        assert_eq!(args.last().unwrap(), "output.mp4");
    }

    #[test]
    fn test_log_level_override() {
        let args = FfmpegCommand::new("a", "b").log_level("error").build_args();
        let pos = args.iter().position(|a| a == "-loglevel").unwrap();
        assert_eq!(args[pos + 1], "error");
    }

    #[tokio::test]
    async fn test_missing_binary_reports_not_found() {
        let runner = FfmpegRunner::with_program("/nonexistent/ffmpeg-binary");
        let cmd = FfmpegCommand::new("in.mp4", "out.mp4");

        let result = runner.run_with_progress(&cmd, |_| {}).await;
        assert!(matches!(result, Err(MediaError::FfmpegNotFound)));
    }

    /// Write an executable shell script standing in for FFmpeg.
    #[cfg(unix)]
    fn stub_ffmpeg(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("ffmpeg");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_keeps_stderr_and_code() {
        let dir = tempfile::TempDir::new().unwrap();
        let ffmpeg = stub_ffmpeg(
            dir.path(),
            "echo out_time=00:00:30.000000\necho progress=continue\necho boom >&2\nexit 3",
        );
        let runner = FfmpegRunner::with_program(ffmpeg);
        let cmd = FfmpegCommand::new("in.mp4", "out.mp4");

        let mut seen = Vec::new();
        let err = runner
            .run_with_progress(&cmd, |p| seen.push(p.out_time_secs))
            .await
            .unwrap_err();

        match err {
            MediaError::ConversionFailed { stderr, exit_code, .. } => {
                assert!(stderr.unwrap_or_default().contains("boom"));
                assert_eq!(exit_code, Some(3));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(seen, [30, 30]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_progress_lines_reach_callback() {
        let dir = tempfile::TempDir::new().unwrap();
        let ffmpeg = stub_ffmpeg(
            dir.path(),
            "echo frame=10\necho out_time=00:00:15.000000\necho progress=continue\n\
             echo out_time=00:00:45.000000\necho progress=end",
        );
        let runner = FfmpegRunner::with_program(ffmpeg);
        let cmd = FfmpegCommand::new("in.mp4", "out.mp4");

        let mut seen = Vec::new();
        runner
            .run_with_progress(&cmd, |p| seen.push((p.out_time_secs, p.is_complete)))
            .await
            .unwrap();

        assert_eq!(seen, [(15, false), (15, false), (45, false), (45, true)]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_silent_process_is_killed_as_stalled() {
        let dir = tempfile::TempDir::new().unwrap();
        let ffmpeg = stub_ffmpeg(dir.path(), "exec sleep 30");
        let runner = FfmpegRunner::with_program(ffmpeg).with_stall_timeout(Duration::from_millis(100));
        let cmd = FfmpegCommand::new("in.mp4", "out.mp4");

        let result = tokio::time::timeout(Duration::from_secs(10), runner.run_with_progress(&cmd, |_| {}))
            .await
            .expect("stalled run should be killed");
        assert!(matches!(result, Err(MediaError::Stalled(_))));
    }

    #[tokio::test]
    async fn test_cancel_signal_resolves() {
        let (tx, rx) = watch::channel(false);
        let mut rx = Some(rx);
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), wait_cancelled(&mut rx))
            .await
            .expect("cancellation should resolve");
    }
}
