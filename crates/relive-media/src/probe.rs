//! Media inspection via ffprobe.

use std::path::Path;
use std::process::Stdio;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use crate::error::{MediaError, MediaResult};

/// Key facts about a video file.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoInfo {
    pub duration_secs: f64,
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    pub video_codec: String,
    pub audio_codec: Option<String>,
    pub size_bytes: u64,
}

#[derive(Deserialize)]
struct FfprobeOutput {
    format: Option<FfprobeFormat>,
    streams: Option<Vec<FfprobeStream>>,
}

#[derive(Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
    size: Option<String>,
}

#[derive(Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
}

/// A single packet timestamp pulled from the container.
#[derive(Debug, Clone, Copy)]
pub struct PacketTimestamp {
    pub pts_secs: f64,
}

#[derive(Deserialize)]
struct FfprobePackets {
    packets: Option<Vec<FfprobePacket>>,
}

#[derive(Deserialize)]
struct FfprobePacket {
    pts_time: Option<String>,
}

async fn run_ffprobe(args: &[&str]) -> MediaResult<Vec<u8>> {
    which::which("ffprobe").map_err(|_| MediaError::FfprobeNotFound)?;

    debug!("running ffprobe {}", args.join(" "));
    let output = Command::new("ffprobe")
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await?;

    if !output.status.success() {
        return Err(MediaError::FfprobeFailed {
            message: "ffprobe exited with non-zero status".to_string(),
            stderr: Some(String::from_utf8_lossy(&output.stderr).into_owned()),
        });
    }
    Ok(output.stdout)
}

/// Probe format and stream metadata for a video file.
pub async fn probe_video(path: impl AsRef<Path>) -> MediaResult<VideoInfo> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(MediaError::FileNotFound(path.to_path_buf()));
    }

    let path_str = path.to_string_lossy();
    let stdout = run_ffprobe(&[
        "-v",
        "error",
        "-print_format",
        "json",
        "-show_format",
        "-show_streams",
        &path_str,
    ])
    .await?;

    let parsed: FfprobeOutput = serde_json::from_slice(&stdout)?;

    let format = parsed
        .format
        .ok_or_else(|| MediaError::InvalidVideo(format!("{}: no format section", path.display())))?;
    let streams = parsed.streams.unwrap_or_default();

    let video = streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| MediaError::InvalidVideo(format!("{}: no video stream", path.display())))?;
    let audio = streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("audio"));

    Ok(VideoInfo {
        duration_secs: format
            .duration
            .as_deref()
            .and_then(|d| d.parse().ok())
            .unwrap_or(0.0),
        width: video.width.unwrap_or(0),
        height: video.height.unwrap_or(0),
        frame_rate: video
            .r_frame_rate
            .as_deref()
            .map(parse_frame_rate)
            .unwrap_or(0.0),
        video_codec: video.codec_name.clone().unwrap_or_default(),
        audio_codec: audio.and_then(|s| s.codec_name.clone()),
        size_bytes: format
            .size
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0),
    })
}

/// Probe only the container duration, in seconds.
pub async fn probe_duration(path: impl AsRef<Path>) -> MediaResult<f64> {
    let info = probe_video(path).await?;
    Ok(info.duration_secs)
}

/// Read the first `limit` video packet timestamps from a file.
///
/// Used to detect timestamp discontinuities in recordings that were cut
/// mid-stream or stitched across reconnects.
pub async fn probe_packet_timestamps(
    path: impl AsRef<Path>,
    limit: usize,
) -> MediaResult<Vec<PacketTimestamp>> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(MediaError::FileNotFound(path.to_path_buf()));
    }

    let path_str = path.to_string_lossy();
    let read_intervals = format!("%+#{}", limit);
    let stdout = run_ffprobe(&[
        "-v",
        "error",
        "-print_format",
        "json",
        "-select_streams",
        "v:0",
        "-show_packets",
        "-show_entries",
        "packet=pts_time",
        "-read_intervals",
        &read_intervals,
        &path_str,
    ])
    .await?;

    let parsed: FfprobePackets = serde_json::from_slice(&stdout)?;
    let timestamps = parsed
        .packets
        .unwrap_or_default()
        .into_iter()
        .filter_map(|p| p.pts_time.as_deref().and_then(|t| t.parse().ok()))
        .map(|pts_secs| PacketTimestamp { pts_secs })
        .collect();
    Ok(timestamps)
}

/// Parse a frame rate expressed as a fraction like "30/1" or "30000/1001".
fn parse_frame_rate(rate: &str) -> f64 {
    match rate.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.parse().unwrap_or(0.0);
            let den: f64 = den.parse().unwrap_or(1.0);
            if den == 0.0 {
                0.0
            } else {
                num / den
            }
        }
        None => rate.parse().unwrap_or(0.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_frame_rate() {
        assert!((parse_frame_rate("30/1") - 30.0).abs() < 0.001);
        assert!((parse_frame_rate("30000/1001") - 29.97).abs() < 0.01);
        assert!((parse_frame_rate("25") - 25.0).abs() < 0.001);
        assert_eq!(parse_frame_rate("30/0"), 0.0);
        assert_eq!(parse_frame_rate("garbage"), 0.0);
    }

    #[test]
    fn test_probe_output_parsing() {
        let json = r#"{
            "format": {"duration": "120.5", "size": "1048576"},
            "streams": [
                {"codec_type": "video", "codec_name": "h264", "width": 1920, "height": 1080, "r_frame_rate": "60/1"},
                {"codec_type": "audio", "codec_name": "aac"}
            ]
        }"#;
        let parsed: FfprobeOutput = serde_json::from_str(json).unwrap();
        let format = parsed.format.unwrap();
        assert_eq!(format.duration.as_deref(), Some("120.5"));
        let streams = parsed.streams.unwrap();
        assert_eq!(streams.len(), 2);
        assert_eq!(streams[0].width, Some(1920));
    }

    #[test]
    fn test_packet_output_parsing() {
        let json = r#"{"packets": [{"pts_time": "0.000000"}, {"pts_time": "0.033367"}, {}]}"#;
        let parsed: FfprobePackets = serde_json::from_str(json).unwrap();
        let packets = parsed.packets.unwrap();
        assert_eq!(packets.len(), 3);
        assert_eq!(packets[0].pts_time.as_deref(), Some("0.000000"));
    }

    #[tokio::test]
    async fn test_probe_missing_file() {
        let err = probe_video("/nonexistent/file.mp4").await.unwrap_err();
        assert!(matches!(err, MediaError::FileNotFound(_)));
    }
}
