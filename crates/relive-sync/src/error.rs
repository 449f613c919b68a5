//! Sync worker error types.

use thiserror::Error;

pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("pcs cli not found at {0}")]
    CliNotFound(String),

    #[error("pcs cli failed: {0}")]
    CliFailed(String),

    #[error("not logged in to cloud storage")]
    NotLoggedIn,

    #[error("remote file is empty after upload")]
    EmptyRemoteFile,

    #[error("upload was paused")]
    Paused,

    #[error("store error: {0}")]
    Store(#[from] relive_store::StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
