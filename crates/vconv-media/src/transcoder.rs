//! Bitrate-halving HEVC transcoder.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info};
use vconv_models::{encoding::AUDIO_COPY, ConversionResult, EncodingPolicy};

use crate::command::{check_ffmpeg, check_ffprobe, FfmpegCommand, FfmpegRunner};
use crate::error::{MediaError, MediaResult};
use crate::probe::probe_video_with;
use crate::progress::ProgressTracker;

/// Converts one local file into another.
///
/// `on_progress` receives integer percentages, each strictly greater than
/// the previous one.
#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn convert(
        &self,
        input: &Path,
        output: &Path,
        on_progress: &mut (dyn FnMut(u8) + Send),
    ) -> MediaResult<ConversionResult>;
}

/// Options for [`FfmpegTranscoder`].
#[derive(Debug, Clone)]
pub struct TranscoderOptions {
    pub policy: EncodingPolicy,
    /// Maximum time between progress snapshots
    pub stall_timeout: Duration,
    /// Progress channel capacity
    pub channel_capacity: usize,
}

impl Default for TranscoderOptions {
    fn default() -> Self {
        Self {
            policy: EncodingPolicy::default(),
            stall_timeout: Duration::from_secs(300),
            channel_capacity: 16,
        }
    }
}

/// [`Transcoder`] backed by the FFmpeg and FFprobe binaries.
pub struct FfmpegTranscoder {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    options: TranscoderOptions,
    cancel_rx: Option<watch::Receiver<bool>>,
}

impl FfmpegTranscoder {
    /// Resolve both binaries from PATH.
    pub fn new(options: TranscoderOptions) -> MediaResult<Self> {
        Ok(Self {
            ffmpeg: check_ffmpeg()?,
            ffprobe: check_ffprobe()?,
            options,
            cancel_rx: None,
        })
    }

    /// Kill running conversions once the flag turns true.
    pub fn with_cancel(mut self, cancel_rx: watch::Receiver<bool>) -> Self {
        self.cancel_rx = Some(cancel_rx);
        self
    }

    fn runner(&self) -> FfmpegRunner {
        let runner = FfmpegRunner::with_program(self.ffmpeg.as_os_str())
            .with_stall_timeout(self.options.stall_timeout);
        match &self.cancel_rx {
            Some(rx) => runner.with_cancel(rx.clone()),
            None => runner,
        }
    }

    /// Build the FFmpeg invocation for a source of `source_bitrate` bits/s.
    pub fn build_command(&self, input: &Path, output: &Path, source_bitrate: u64) -> FfmpegCommand {
        FfmpegCommand::new(input, output)
            .video_codec(&self.options.policy.codec)
            .preset(&self.options.policy.preset)
            .video_bitrate_kbps(EncodingPolicy::target_kbps(source_bitrate))
            .maxrate_kbps(EncodingPolicy::maxrate_kbps(source_bitrate))
            .bufsize_kbps(EncodingPolicy::bufsize_kbps(source_bitrate))
            .audio_codec(AUDIO_COPY)
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn convert(
        &self,
        input: &Path,
        output: &Path,
        on_progress: &mut (dyn FnMut(u8) + Send),
    ) -> MediaResult<ConversionResult> {
        if !tokio::fs::try_exists(input).await.unwrap_or(false) {
            return Err(MediaError::FileNotFound(input.to_path_buf()));
        }

        let source = probe_video_with(self.ffprobe.as_os_str(), input).await?;
        let target_bitrate = EncodingPolicy::target_bitrate(source.bitrate);
        info!(
            input = %input.display(),
            height = source.height,
            duration = source.duration,
            source_bitrate = source.bitrate,
            target_bitrate,
            "Starting conversion"
        );

        let cmd = self.build_command(input, output, source.bitrate);
        let mut tracker = ProgressTracker::new(source.duration);
        self.runner()
            .run_with_progress(&cmd, |p| {
                if let Some(percent) = tracker.observe(p.out_time_secs) {
                    on_progress(percent);
                }
            })
            .await?;

        let output_size = match tokio::fs::metadata(output).await {
            Ok(m) if m.len() > 0 => m.len(),
            Ok(_) => {
                return Err(MediaError::conversion_failed(
                    format!("Output is empty: {}", output.display()),
                    None,
                    None,
                ))
            }
            Err(_) => {
                return Err(MediaError::conversion_failed(
                    format!("Output not produced: {}", output.display()),
                    None,
                    None,
                ))
            }
        };

        let result = ConversionResult::new(source.size, output_size, source.bitrate, target_bitrate);
        debug!(
            output = %output.display(),
            output_size,
            reduction = result.reduction,
            "Conversion finished"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transcoder() -> FfmpegTranscoder {
        FfmpegTranscoder {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
            options: TranscoderOptions::default(),
            cancel_rx: None,
        }
    }

    #[test]
    fn test_command_follows_policy() {
        let args = transcoder()
            .build_command(Path::new("in.mp4"), Path::new("out.mp4"), 4_000_000)
            .build_args()
            .join(" ");

        assert!(args.contains("-c:v libx265 -preset veryfast"));
        assert!(args.contains("-b:v 2000k -maxrate 3000k -bufsize 4000k"));
        assert!(args.contains("-c:a copy"));
    }

    #[test]
    fn test_low_bitrate_uses_floor() {
        let args = transcoder()
            .build_command(Path::new("in.mp4"), Path::new("out.mp4"), 800_000)
            .build_args()
            .join(" ");

        assert!(args.contains("-b:v 1000k -maxrate 1500k -bufsize 2000k"));
    }

    const PROBE_JSON: &str = r#"{"streams":[{"height":720,"bit_rate":"4000000"}],"format":{"duration":"60.0","bit_rate":"4100000"}}"#;

    /// Transcoder over stub FFprobe/FFmpeg scripts. `ffmpeg_body` sees the
    /// output path as its last argument.
    #[cfg(unix)]
    fn stubbed(dir: &Path, ffmpeg_body: &str) -> FfmpegTranscoder {
        use std::os::unix::fs::PermissionsExt;

        let write_script = |name: &str, body: &str| {
            let path = dir.join(name);
            std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        };

        FfmpegTranscoder {
            ffprobe: write_script("ffprobe", &format!("echo '{}'", PROBE_JSON)),
            ffmpeg: write_script(
                "ffmpeg",
                &format!("for last; do :; done\nout=\"$last\"\n{}", ffmpeg_body),
            ),
            options: TranscoderOptions::default(),
            cancel_rx: None,
        }
    }

    #[cfg(unix)]
    async fn convert_in(dir: &Path, transcoder: &FfmpegTranscoder) -> (MediaResult<ConversionResult>, Vec<u8>) {
        let input = dir.join("input.mp4");
        std::fs::write(&input, vec![0u8; 1000]).unwrap();
        let mut percents = Vec::new();
        let mut on_progress = |p: u8| percents.push(p);
        let result = transcoder
            .convert(&input, &dir.join("output.mp4"), &mut on_progress)
            .await;
        (result, percents)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_successful_conversion_reports_progress() {
        let dir = tempfile::TempDir::new().unwrap();
        let transcoder = stubbed(
            dir.path(),
            "echo out_time=00:00:30.000000\necho out_time=00:01:00.000000\necho progress=end\n\
             printf 'abcdefghij' > \"$out\"",
        );

        let (result, percents) = convert_in(dir.path(), &transcoder).await;
        let result = result.unwrap();

        assert_eq!(percents, [50, 100]);
        assert_eq!(result.input_size, 1000);
        assert_eq!(result.output_size, 10);
        assert_eq!(result.input_bitrate, 4_000_000);
        assert_eq!(result.target_bitrate, 2_000_000);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_empty_output_is_conversion_failure() {
        let dir = tempfile::TempDir::new().unwrap();
        let transcoder = stubbed(dir.path(), ": > \"$out\"");

        let (result, _) = convert_in(dir.path(), &transcoder).await;
        match result {
            Err(MediaError::ConversionFailed { message, .. }) => assert!(message.contains("empty")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_output_is_conversion_failure() {
        let dir = tempfile::TempDir::new().unwrap();
        let transcoder = stubbed(dir.path(), "exit 0");

        let (result, _) = convert_in(dir.path(), &transcoder).await;
        match result {
            Err(MediaError::ConversionFailed { message, .. }) => assert!(message.contains("not produced")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_encode_surfaces_exit_code() {
        let dir = tempfile::TempDir::new().unwrap();
        let transcoder = stubbed(dir.path(), "echo 'Unknown encoder' >&2\nexit 1");

        let (result, percents) = convert_in(dir.path(), &transcoder).await;
        assert!(percents.is_empty());
        match result {
            Err(e @ MediaError::ConversionFailed { exit_code: Some(1), .. }) => {
                assert!(e.stderr().unwrap_or_default().contains("Unknown encoder"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_input() {
        let mut progress = |_: u8| {};
        let result = transcoder()
            .convert(Path::new("/no/such/input.mp4"), Path::new("/tmp/out.mp4"), &mut progress)
            .await;
        assert!(matches!(result, Err(MediaError::FileNotFound(_))));
    }
}
