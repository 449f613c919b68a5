//! Duration-bounded splitting.

use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::command::{FfmpegCommand, FfmpegRunner};
use crate::error::{MediaError, MediaResult};
use crate::fs_utils::move_file;
use crate::merge::merge_files;
use crate::probe::probe_duration;

/// A trailing segment shorter than this gets folded into its predecessor.
const MIN_TAIL_SECS: f64 = 10.0;

/// Split a file into parts of at most `segment_secs` each.
///
/// Parts land in `output_dir` named `<prefix>_part_000.mp4` onward. A
/// too-short trailing part is merged back into the previous one so no
/// upload ends with a stub clip. Returns the part paths in order.
pub async fn segment_file(
    input: impl AsRef<Path>,
    output_dir: impl AsRef<Path>,
    prefix: &str,
    segment_secs: u32,
    cancel_rx: Option<watch::Receiver<bool>>,
) -> MediaResult<Vec<PathBuf>> {
    let input = input.as_ref();
    let output_dir = output_dir.as_ref();
    if !input.exists() {
        return Err(MediaError::FileNotFound(input.to_path_buf()));
    }
    tokio::fs::create_dir_all(output_dir).await?;

    let pattern = output_dir.join(format!("{}_part_%03d.mp4", prefix));

    info!(
        input = %input.display(),
        segment_secs,
        output_dir = %output_dir.display(),
        "segmenting file"
    );

    let cmd = FfmpegCommand::new(input, &pattern)
        .codec_copy()
        .output_args([
            "-f",
            "segment",
            "-segment_time",
            &segment_secs.to_string(),
            "-reset_timestamps",
            "1",
        ]);

    let mut runner = FfmpegRunner::new();
    if let Some(rx) = cancel_rx.clone() {
        runner = runner.with_cancel(rx);
    }
    runner.run(&cmd).await?;

    let mut parts = collect_parts(output_dir, prefix).await?;
    if parts.is_empty() {
        return Err(MediaError::NoSegments(input.to_path_buf()));
    }

    merge_short_tail(&mut parts, cancel_rx).await?;
    Ok(parts)
}

/// Gather produced parts in index order.
async fn collect_parts(output_dir: &Path, prefix: &str) -> MediaResult<Vec<PathBuf>> {
    let mut parts = Vec::new();
    for index in 0.. {
        let part = output_dir.join(format!("{}_part_{:03}.mp4", prefix, index));
        if !part.exists() {
            break;
        }
        parts.push(part);
    }
    Ok(parts)
}

/// Fold a sub-minimum trailing part into the one before it.
async fn merge_short_tail(
    parts: &mut Vec<PathBuf>,
    cancel_rx: Option<watch::Receiver<bool>>,
) -> MediaResult<()> {
    if parts.len() < 2 {
        return Ok(());
    }

    let tail = parts.last().cloned().unwrap_or_default();
    let tail_secs = probe_duration(&tail).await?;
    if tail_secs >= MIN_TAIL_SECS {
        return Ok(());
    }

    debug!(tail = %tail.display(), tail_secs, "folding short tail into previous part");

    let tail = parts.pop().unwrap_or_default();
    let prev = parts.pop().unwrap_or_default();
    let combined = prev.with_extension("tail.mp4");

    merge_files(&[&prev, &tail], &combined, cancel_rx).await?;

    tokio::fs::remove_file(&tail).await?;
    tokio::fs::remove_file(&prev).await?;
    move_file(&combined, &prev).await?;
    parts.push(prev);
    Ok(())
}
