//! Video encoding policy.

use serde::{Deserialize, Serialize};

/// Default video encoder (HEVC)
pub const DEFAULT_VIDEO_CODEC: &str = "libx265";
/// Default encoding preset
pub const DEFAULT_PRESET: &str = "veryfast";
/// Audio is passed through unchanged
pub const AUDIO_COPY: &str = "copy";
/// Lowest video bitrate the policy will request (bits/second)
pub const MIN_TARGET_BITRATE: u64 = 1_000_000;

/// Encoding policy applied to every item.
///
/// The target video bitrate is half the source bitrate, never below
/// [`MIN_TARGET_BITRATE`]. `maxrate` and `bufsize` are derived from the
/// target in kbit/s, the unit FFmpeg receives them in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodingPolicy {
    /// Video encoder (e.g., "libx265", "hevc_nvenc")
    #[serde(default = "default_video_codec")]
    pub codec: String,

    /// Encoder preset
    #[serde(default = "default_preset")]
    pub preset: String,
}

fn default_video_codec() -> String {
    DEFAULT_VIDEO_CODEC.to_string()
}

fn default_preset() -> String {
    DEFAULT_PRESET.to_string()
}

impl Default for EncodingPolicy {
    fn default() -> Self {
        Self {
            codec: default_video_codec(),
            preset: default_preset(),
        }
    }
}

impl EncodingPolicy {
    /// Target video bitrate for a source bitrate, in bits/second.
    pub fn target_bitrate(source_bitrate: u64) -> u64 {
        (source_bitrate / 2).max(MIN_TARGET_BITRATE)
    }

    /// Target bitrate in whole kbit/s.
    pub fn target_kbps(source_bitrate: u64) -> u64 {
        Self::target_bitrate(source_bitrate) / 1000
    }

    /// `-maxrate` in kbit/s (1.5x target).
    pub fn maxrate_kbps(source_bitrate: u64) -> u64 {
        Self::target_kbps(source_bitrate) * 3 / 2
    }

    /// `-bufsize` in kbit/s (2x target).
    pub fn bufsize_kbps(source_bitrate: u64) -> u64 {
        Self::target_kbps(source_bitrate) * 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_is_half_of_source() {
        assert_eq!(EncodingPolicy::target_bitrate(4_000_000), 2_000_000);
        assert_eq!(EncodingPolicy::target_kbps(4_000_000), 2000);
        assert_eq!(EncodingPolicy::maxrate_kbps(4_000_000), 3000);
        assert_eq!(EncodingPolicy::bufsize_kbps(4_000_000), 4000);
    }

    #[test]
    fn test_target_has_floor() {
        assert_eq!(EncodingPolicy::target_bitrate(1_500_000), MIN_TARGET_BITRATE);
        assert_eq!(EncodingPolicy::target_bitrate(0), MIN_TARGET_BITRATE);
    }

    #[test]
    fn test_odd_bitrates_floor() {
        // 3_333_333 / 2 = 1_666_666 -> 1666k, maxrate 2499k
        assert_eq!(EncodingPolicy::target_bitrate(3_333_333), 1_666_666);
        assert_eq!(EncodingPolicy::target_kbps(3_333_333), 1666);
        assert_eq!(EncodingPolicy::maxrate_kbps(3_333_333), 2499);
    }

    #[test]
    fn test_default_policy() {
        let policy = EncodingPolicy::default();
        assert_eq!(policy.codec, "libx265");
        assert_eq!(policy.preset, "veryfast");
    }
}
