//! FFmpeg progress reporting.

use serde::{Deserialize, Serialize};

/// Progress snapshot parsed from FFmpeg's `-progress` stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FfmpegProgress {
    /// Output timestamp in milliseconds
    pub out_time_ms: i64,
    /// Output timestamp as HH:MM:SS.micros
    pub out_time: String,
    /// Frames processed
    pub frame: u64,
    /// Current processing rate in frames per second
    pub fps: f64,
    /// Processing speed relative to realtime
    pub speed: f64,
    /// Set when the final `progress=end` record arrives
    pub is_complete: bool,
}

impl FfmpegProgress {
    /// Completion percentage given the expected output duration.
    pub fn percentage(&self, total_duration_secs: f64) -> f64 {
        if total_duration_secs <= 0.0 {
            return 0.0;
        }
        let out_secs = self.out_time_ms as f64 / 1000.0;
        (out_secs / total_duration_secs * 100.0).clamp(0.0, 100.0)
    }

    /// Estimated seconds remaining, if the speed is known.
    pub fn eta_seconds(&self, total_duration_secs: f64) -> Option<f64> {
        if self.speed <= 0.0 {
            return None;
        }
        let out_secs = self.out_time_ms as f64 / 1000.0;
        let remaining = (total_duration_secs - out_secs).max(0.0);
        Some(remaining / self.speed)
    }
}
