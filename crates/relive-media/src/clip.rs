//! Per-source trimming.

use std::path::Path;
use tokio::sync::watch;
use tracing::info;

use crate::anomaly::{choose_clip_mode, scan_for_timestamp_anomalies, ClipMode};
use crate::command::{FfmpegCommand, FfmpegRunner};
use crate::error::{MediaError, MediaResult};

/// Encoding settings used when a stream copy is not safe.
#[derive(Debug, Clone)]
pub struct TranscodeProfile {
    pub video_codec: String,
    pub audio_codec: String,
    pub crf: u8,
    pub preset: String,
    /// Normalize output to this frame rate
    pub fps: u32,
    /// Resample audio to this rate
    pub audio_sample_rate: u32,
}

impl Default for TranscodeProfile {
    fn default() -> Self {
        Self {
            video_codec: "libx264".to_string(),
            audio_codec: "aac".to_string(),
            crf: 23,
            preset: "veryfast".to_string(),
            fps: 30,
            audio_sample_rate: 48_000,
        }
    }
}

/// Trim one source file to `[start, end)`.
///
/// `start`/`end` of `None` mean "from the beginning" and "to the end".
/// The mode is decided per file: clean timestamps get a stream copy,
/// damaged ones are re-encoded with `profile`.
pub async fn clip_source(
    input: impl AsRef<Path>,
    output: impl AsRef<Path>,
    start: Option<f64>,
    end: Option<f64>,
    profile: &TranscodeProfile,
    cancel_rx: Option<watch::Receiver<bool>>,
) -> MediaResult<ClipMode> {
    let input = input.as_ref();
    let output = output.as_ref();
    if !input.exists() {
        return Err(MediaError::FileNotFound(input.to_path_buf()));
    }

    let anomalies = scan_for_timestamp_anomalies(input).await?;
    let mode = choose_clip_mode(&anomalies);

    info!(
        input = %input.display(),
        output = %output.display(),
        ?mode,
        start,
        end,
        "clipping source"
    );

    let mut cmd = FfmpegCommand::new(input, output);
    if let Some(start) = start {
        cmd = cmd.seek(start);
    }
    if let Some(end) = end {
        cmd = cmd.until(end);
    }

    cmd = match mode {
        ClipMode::Copy => cmd.codec_copy(),
        ClipMode::Transcode => cmd
            .video_codec(&profile.video_codec)
            .crf(profile.crf)
            .preset(&profile.preset)
            .video_filter(format!("fps={}", profile.fps))
            .audio_codec(&profile.audio_codec)
            .audio_filter(format!("aresample={}", profile.audio_sample_rate)),
    };

    let mut runner = FfmpegRunner::new();
    if let Some(rx) = cancel_rx {
        runner = runner.with_cancel(rx);
    }
    runner.run(&cmd).await?;

    Ok(mode)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_profile() {
        let profile = TranscodeProfile::default();
        assert_eq!(profile.video_codec, "libx264");
        assert_eq!(profile.audio_sample_rate, 48_000);
    }

    #[tokio::test]
    async fn test_clip_missing_input() {
        let err = clip_source(
            "/nonexistent/input.flv",
            "/tmp/out.mp4",
            None,
            None,
            &TranscodeProfile::default(),
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, MediaError::FileNotFound(_)));
    }
}
