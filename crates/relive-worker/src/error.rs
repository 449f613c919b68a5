//! Worker error types.

use std::path::PathBuf;
use thiserror::Error;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("platform error: {0}")]
    Platform(#[from] relive_platform::PlatformError),

    #[error("store error: {0}")]
    Store(#[from] relive_store::StoreError),

    #[error("media error: {0}")]
    Media(#[from] relive_media::MediaError),

    #[error("download queue is full ({active}/{limit})")]
    QueueFull { active: i64, limit: i64 },

    #[error("aria2c not found in PATH")]
    Aria2NotFound,

    #[error("aria2c exited with code {code}")]
    Aria2Failed { code: i32 },

    #[error("downloaded file is incomplete: {actual:.0}s of {expected:.0}s")]
    IncompleteDownload { actual: f64, expected: f64 },

    #[error("download was paused")]
    Paused,

    #[error("{failed} of {total} artifacts failed to upload")]
    ArtifactUploads { failed: usize, total: usize },

    #[error("step {step} timed out after {minutes} minutes")]
    StepTimeout { step: String, minutes: u64 },

    #[error("missing step input: {0}")]
    MissingInput(&'static str),

    #[error("invalid timecode: {0}")]
    Timecode(String),

    #[error("file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    /// Whether another attempt could plausibly succeed without operator
    /// intervention.
    pub fn is_retryable(&self) -> bool {
        match self {
            WorkerError::Platform(e) => e.is_retryable(),
            WorkerError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            WorkerError::Aria2Failed { .. } => true,
            WorkerError::IncompleteDownload { .. } => true,
            _ => false,
        }
    }
}

impl From<relive_models::timestamp::TimecodeError> for WorkerError {
    fn from(e: relive_models::timestamp::TimecodeError) -> Self {
        WorkerError::Timecode(e.to_string())
    }
}
