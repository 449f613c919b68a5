//! Concatenation via the concat demuxer.

use std::path::Path;
use tokio::sync::watch;
use tracing::info;

use crate::command::{FfmpegCommand, FfmpegRunner};
use crate::error::{MediaError, MediaResult};
use crate::probe::probe_duration;

/// Concatenate ordered inputs into one output without re-encoding.
///
/// Inputs must share codec parameters; clip outputs do. Returns the
/// duration of the merged file in seconds.
pub async fn merge_files(
    inputs: &[impl AsRef<Path>],
    output: impl AsRef<Path>,
    cancel_rx: Option<watch::Receiver<bool>>,
) -> MediaResult<f64> {
    let output = output.as_ref();
    if inputs.is_empty() {
        return Err(MediaError::InvalidVideo("no inputs to merge".to_string()));
    }
    for input in inputs {
        let input = input.as_ref();
        if !input.exists() {
            return Err(MediaError::FileNotFound(input.to_path_buf()));
        }
    }

    // Single input is just a rename-grade copy
    let list_path = output.with_extension("concat.txt");
    let mut list = String::new();
    for input in inputs {
        list.push_str(&format!("file '{}'\n", escape_concat_path(input.as_ref())));
    }
    tokio::fs::write(&list_path, list).await?;

    info!(count = inputs.len(), output = %output.display(), "merging clips");

    let cmd = FfmpegCommand::new(&list_path, output)
        .input_args(["-f", "concat", "-safe", "0"])
        .codec_copy();

    let mut runner = FfmpegRunner::new();
    if let Some(rx) = cancel_rx {
        runner = runner.with_cancel(rx);
    }
    let result = runner.run(&cmd).await;
    let _ = tokio::fs::remove_file(&list_path).await;
    result?;

    probe_duration(output).await
}

/// Escape a path for a concat demuxer list file.
fn escape_concat_path(path: &Path) -> String {
    path.to_string_lossy().replace('\'', r"'\''")
}
