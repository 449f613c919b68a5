//! Timestamp anomaly detection.
//!
//! Live recordings frequently carry broken timestamps: a stream that
//! starts well past zero, gaps where the connection dropped, or
//! backwards jumps where segments were stitched. Stream-copy trims on
//! such files produce desynced or truncated output, so the clip step
//! scans timestamps first and falls back to a transcode when the file
//! looks damaged.

use std::path::Path;
use tracing::{debug, warn};

use crate::error::MediaResult;
use crate::probe::{probe_packet_timestamps, PacketTimestamp};

/// How many leading packets to inspect per file.
const SCAN_PACKET_LIMIT: usize = 2000;

/// A stream whose first packet starts later than this is suspect.
const MAX_START_OFFSET_SECS: f64 = 1.0;

/// A forward gap between consecutive packets larger than this is suspect.
const MAX_GAP_SECS: f64 = 2.0;

/// A backwards jump larger than this is suspect.
const MAX_NEGATIVE_JUMP_SECS: f64 = -0.5;

/// How a source should be trimmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipMode {
    /// Stream copy, no re-encoding
    Copy,
    /// Full decode and re-encode to repair timestamps
    Transcode,
}

/// A single detected timestamp irregularity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TimestampAnomaly {
    /// First packet starts at this offset instead of near zero
    LateStart { offset_secs: f64 },
    /// Forward discontinuity between consecutive packets
    Gap { at_secs: f64, gap_secs: f64 },
    /// Timestamp went backwards
    NegativeJump { at_secs: f64, jump_secs: f64 },
}

/// Scan the leading packets of a file for timestamp anomalies.
pub async fn scan_for_timestamp_anomalies(
    path: impl AsRef<Path>,
) -> MediaResult<Vec<TimestampAnomaly>> {
    let path = path.as_ref();
    let timestamps = probe_packet_timestamps(path, SCAN_PACKET_LIMIT).await?;
    let anomalies = detect_anomalies(&timestamps);

    if anomalies.is_empty() {
        debug!(path = %path.display(), "timestamps look clean");
    } else {
        warn!(
            path = %path.display(),
            count = anomalies.len(),
            first = ?anomalies.first(),
            "timestamp anomalies detected"
        );
    }
    Ok(anomalies)
}

fn detect_anomalies(timestamps: &[PacketTimestamp]) -> Vec<TimestampAnomaly> {
    let mut anomalies = Vec::new();

    let Some(first) = timestamps.first() else {
        return anomalies;
    };

    if first.pts_secs > MAX_START_OFFSET_SECS {
        anomalies.push(TimestampAnomaly::LateStart {
            offset_secs: first.pts_secs,
        });
    }

    for pair in timestamps.windows(2) {
        let delta = pair[1].pts_secs - pair[0].pts_secs;
        if delta > MAX_GAP_SECS {
            anomalies.push(TimestampAnomaly::Gap {
                at_secs: pair[0].pts_secs,
                gap_secs: delta,
            });
        } else if delta < MAX_NEGATIVE_JUMP_SECS {
            anomalies.push(TimestampAnomaly::NegativeJump {
                at_secs: pair[0].pts_secs,
                jump_secs: delta,
            });
        }
    }

    anomalies
}

/// Decide whether a source can be trimmed with a stream copy.
pub fn choose_clip_mode(anomalies: &[TimestampAnomaly]) -> ClipMode {
    if anomalies.is_empty() {
        ClipMode::Copy
    } else {
        ClipMode::Transcode
    }
}
