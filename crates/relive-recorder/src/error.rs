//! Recorder error types.

use thiserror::Error;

pub type RecorderResult<T> = Result<T, RecorderError>;

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("platform error: {0}")]
    Platform(#[from] relive_platform::PlatformError),

    #[error("store error: {0}")]
    Store(#[from] relive_store::StoreError),

    #[error("stream request failed: {0}")]
    Stream(#[from] reqwest::Error),

    #[error("disk write failed: {0}")]
    Disk(#[source] std::io::Error),

    #[error("no acceptable quality tier available")]
    NoQuality,

    #[error("stream disconnected")]
    Disconnected,

    #[error("transport not supported by this client")]
    UnsupportedTransport,

    #[error("shutdown requested")]
    Shutdown,
}

impl RecorderError {
    /// Disk errors fail the current task; everything else is retried.
    pub fn is_disk(&self) -> bool {
        matches!(self, Self::Disk(_))
    }
}
