//! Recorder tunables.

use serde::{Deserialize, Serialize};

/// When to rotate the current recording into a new segment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CutPolicy {
    /// Single file per live session
    None,
    /// Rotate every N seconds
    Duration { seconds: u64 },
    /// Rotate every N bytes
    Size { bytes: u64 },
    /// Rotate when the room title changes
    TitleChange,
}

/// Transport preference for the danmaku session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DanmakuTransport {
    Random,
    Tcp,
    SecureWs,
    PlainWs,
}

/// Which danmaku event kinds to record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DanmakuOptions {
    pub enabled: bool,
    pub transport: DanmakuTransport,
    pub record_gifts: bool,
    pub record_super_chats: bool,
    pub record_guard_joins: bool,
}

impl Default for DanmakuOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            transport: DanmakuTransport::Random,
            record_gifts: true,
            record_super_chats: true,
            record_guard_joins: true,
        }
    }
}

/// Per-room recording configuration, read at monitor start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderConfig {
    /// Directory recordings land in
    pub output_dir: String,
    /// File name template; supports {{ name }}, {{ title }}, {{ date }},
    /// {{ time }} and {{ index }}
    pub file_template: String,
    /// Quality number requested from the platform
    pub quality: i64,
    pub cut_policy: CutPolicy,
    /// Title-change rotation is ignored before this much recording time
    pub title_split_min_secs: u64,
    /// Live status poll interval while idle
    pub check_interval_secs: u64,
    /// Wait between reconnect attempts
    pub stream_retry_ms: u64,
    /// Stream connect timeout
    pub connect_timeout_ms: u64,
    /// Wait when the room is live but no acceptable quality exists yet
    pub no_quality_wait_secs: u64,
    /// Rotate instead of appending across a detected stream gap
    pub flv_fix: bool,
    /// Disable gap-driven rotation for Annex-B encoded streams
    pub flv_fix_skip_annexb: bool,
    pub danmaku: DanmakuOptions,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            output_dir: "recordings".to_string(),
            file_template: "{{ name }}/{{ date }}_{{ time }}_{{ title }}_{{ index }}.flv".to_string(),
            quality: 10000,
            cut_policy: CutPolicy::None,
            title_split_min_secs: 1800,
            check_interval_secs: 180,
            stream_retry_ms: 6000,
            connect_timeout_ms: 5000,
            no_quality_wait_secs: 90,
            flv_fix: true,
            flv_fix_skip_annexb: false,
            danmaku: DanmakuOptions::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cut_policy_round_trip() {
        let policy = CutPolicy::Duration { seconds: 133 };
        let json = serde_json::to_string(&policy).unwrap();
        let back: CutPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, policy);
    }

    #[test]
    fn test_defaults() {
        let config = RecorderConfig::default();
        assert_eq!(config.title_split_min_secs, 1800);
        assert_eq!(config.stream_retry_ms, 6000);
        assert!(config.flv_fix);
    }
}
