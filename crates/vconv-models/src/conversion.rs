//! Conversion result metrics.

use serde::{Deserialize, Serialize};

/// Size and bitrate metrics of a finished conversion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConversionResult {
    /// Source file size in bytes
    pub input_size: u64,
    /// Converted file size in bytes
    pub output_size: u64,
    /// Source bitrate in bits/second
    pub input_bitrate: u64,
    /// Requested video bitrate in bits/second
    pub target_bitrate: u64,
    /// Size reduction in percent (negative when the output grew)
    pub reduction: f64,
}

impl ConversionResult {
    /// Build a result, deriving the reduction percentage from the sizes.
    pub fn new(input_size: u64, output_size: u64, input_bitrate: u64, target_bitrate: u64) -> Self {
        let reduction = if input_size == 0 {
            0.0
        } else {
            (1.0 - output_size as f64 / input_size as f64) * 100.0
        };

        Self {
            input_size,
            output_size,
            input_bitrate,
            target_bitrate,
            reduction,
        }
    }

    /// Bytes saved by the conversion (negative when the output grew).
    pub fn bytes_saved(&self) -> i64 {
        self.input_size as i64 - self.output_size as i64
    }
}
