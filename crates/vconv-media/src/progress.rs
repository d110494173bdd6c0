//! FFmpeg progress parsing.
//!
//! FFmpeg is started with `-progress pipe:1`, which writes `key=value`
//! blocks to stdout. A reader task parses them and forwards snapshots over
//! a bounded channel: when the consumer falls behind the reader stops
//! draining the pipe and FFmpeg blocks, so memory stays bounded.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{MediaError, MediaResult};

/// Progress snapshot from FFmpeg.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FfmpegProgress {
    /// Output time in whole seconds (from `out_time=HH:MM:SS`)
    pub out_time_secs: u64,
    /// Whether encoding is complete
    pub is_complete: bool,
}

/// Parse `HH:MM:SS[.ffffff]` into whole seconds.
pub fn parse_clock(value: &str) -> Option<u64> {
    let mut parts = value.trim().splitn(3, ':');
    let hours: u64 = parts.next()?.parse().ok()?;
    let minutes: u64 = parts.next()?.parse().ok()?;
    let seconds = parts.next()?;
    let seconds: u64 = seconds.split('.').next()?.parse().ok()?;

    if minutes >= 60 || seconds >= 60 {
        return None;
    }
    Some(hours * 3600 + minutes * 60 + seconds)
}

/// Parse a line of `-progress` output into `current`.
///
/// Returns a snapshot for `out_time` and `progress` lines, which FFmpeg
/// emits once per block, so every returned snapshot is a liveness signal.
pub fn parse_progress_line(line: &str, current: &mut FfmpegProgress) -> Option<FfmpegProgress> {
    let (key, value) = line.trim().split_once('=')?;

    match key {
        "out_time" => {
            // Negative times appear before the first frame; ignore them.
            if let Some(secs) = parse_clock(value) {
                current.out_time_secs = secs;
            }
            Some(current.clone())
        }
        "progress" => {
            if value.trim() == "end" {
                current.is_complete = true;
            }
            Some(current.clone())
        }
        _ => None,
    }
}

/// Converts output times into de-duplicated integer percentages.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    total_secs: f64,
    last_percent: u8,
}

impl ProgressTracker {
    pub fn new(total_secs: f64) -> Self {
        Self {
            total_secs,
            last_percent: 0,
        }
    }

    /// Returns the new percentage only when it increased.
    pub fn observe(&mut self, out_time_secs: u64) -> Option<u8> {
        if self.total_secs <= 0.0 {
            return None;
        }

        let percent = ((out_time_secs as f64 / self.total_secs) * 100.0).min(100.0) as u8;
        if percent > self.last_percent {
            self.last_percent = percent;
            Some(percent)
        } else {
            None
        }
    }

    pub fn last_percent(&self) -> u8 {
        self.last_percent
    }
}

/// Bounded stream of progress snapshots read from FFmpeg's stdout.
pub struct ProgressStream {
    rx: mpsc::Receiver<FfmpegProgress>,
    reader: JoinHandle<()>,
    stall_timeout: Duration,
}

impl ProgressStream {
    /// Spawn a reader task over `stdout`.
    pub fn spawn<R>(stdout: R, capacity: usize, stall_timeout: Duration) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(capacity.max(1));

        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut current = FfmpegProgress::default();

            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(snapshot) = parse_progress_line(&line, &mut current) {
                    if tx.send(snapshot).await.is_err() {
                        break;
                    }
                }
            }
        });

        Self {
            rx,
            reader,
            stall_timeout,
        }
    }

    /// Next snapshot; `Ok(None)` once stdout is closed.
    ///
    /// Fails with [`MediaError::Stalled`] when nothing arrives within the
    /// stall timeout.
    pub async fn next(&mut self) -> MediaResult<Option<FfmpegProgress>> {
        match tokio::time::timeout(self.stall_timeout, self.rx.recv()).await {
            Ok(next) => Ok(next),
            Err(_) => Err(MediaError::Stalled(self.stall_timeout)),
        }
    }
}

impl Drop for ProgressStream {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_clock() {
        assert_eq!(parse_clock("00:00:00.000000"), Some(0));
        assert_eq!(parse_clock("00:01:30.500000"), Some(90));
        assert_eq!(parse_clock("01:00:05"), Some(3605));
        assert_eq!(parse_clock("-577014:32:22.77"), None);
        assert_eq!(parse_clock("N/A"), None);
    }

    #[test]
    fn test_progress_parsing() {
        let mut progress = FfmpegProgress::default();

        assert!(parse_progress_line("frame=120", &mut progress).is_none());
        assert!(parse_progress_line("speed=1.5x", &mut progress).is_none());
        assert_eq!(progress, FfmpegProgress::default());

        let snapshot = parse_progress_line("out_time=00:00:30.000000", &mut progress).unwrap();
        assert_eq!(snapshot.out_time_secs, 30);

        let end = parse_progress_line("progress=end", &mut progress).unwrap();
        assert!(end.is_complete);
    }

    #[test]
    fn test_tracker_is_monotonic_and_clamped() {
        let mut tracker = ProgressTracker::new(60.0);

        assert_eq!(tracker.observe(0), None);
        assert_eq!(tracker.observe(6), Some(10));
        assert_eq!(tracker.observe(6), None);
        assert_eq!(tracker.observe(3), None);
        assert_eq!(tracker.observe(30), Some(50));
        assert_eq!(tracker.observe(90), Some(100));
        assert_eq!(tracker.observe(120), None);
        assert_eq!(tracker.last_percent(), 100);
    }

    #[test]
    fn test_tracker_ignores_unknown_duration() {
        let mut tracker = ProgressTracker::new(0.0);
        assert_eq!(tracker.observe(10), None);
    }

    #[tokio::test]
    async fn test_stream_yields_snapshots_until_eof() {
        let output: &'static [u8] = b"frame=1\nout_time=00:00:15.000000\nprogress=continue\n\
            out_time=00:00:45.000000\nprogress=end\n";
        let mut stream = ProgressStream::spawn(output, 2, Duration::from_secs(5));
        let mut tracker = ProgressTracker::new(60.0);
        let mut percents = Vec::new();
        let mut complete = false;

        while let Some(snapshot) = stream.next().await.unwrap() {
            if let Some(p) = tracker.observe(snapshot.out_time_secs) {
                percents.push(p);
            }
            complete = snapshot.is_complete;
        }

        assert_eq!(percents, [25, 75]);
        assert!(complete);
    }

    #[tokio::test]
    async fn test_stream_stalls_without_output() {
        // Keep the writer half open so the reader never sees EOF.
        let (_writer, reader) = tokio::io::duplex(64);
        let mut stream = ProgressStream::spawn(reader, 1, Duration::from_millis(50));

        let result = stream.next().await;
        assert!(matches!(result, Err(MediaError::Stalled(_))));
    }
}
