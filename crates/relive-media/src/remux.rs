//! Container changes without re-encoding.

use std::path::Path;
use tokio::sync::watch;
use tracing::info;

use crate::command::{FfmpegCommand, FfmpegRunner};
use crate::error::{MediaError, MediaResult};

/// Rewrap a file into the container implied by the output extension.
///
/// Used to turn raw FLV recordings into MP4 with regenerated
/// timestamps before they enter the pipeline.
pub async fn remux(
    input: impl AsRef<Path>,
    output: impl AsRef<Path>,
    cancel_rx: Option<watch::Receiver<bool>>,
) -> MediaResult<()> {
    let input = input.as_ref();
    let output = output.as_ref();
    if !input.exists() {
        return Err(MediaError::FileNotFound(input.to_path_buf()));
    }

    info!(input = %input.display(), output = %output.display(), "remuxing");

    let cmd = FfmpegCommand::new(input, output)
        .codec_copy()
        // FLV recordings routinely need their timestamps rebuilt
        .input_args(["-fflags", "+genpts"])
        .output_args(["-movflags", "+faststart"]);

    let mut runner = FfmpegRunner::new();
    if let Some(rx) = cancel_rx {
        runner = runner.with_cancel(rx);
    }
    runner.run(&cmd).await
}
