//! Error types for platform API calls.

use thiserror::Error;

pub type PlatformResult<T> = Result<T, PlatformError>;

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("{message} (code: {code})")]
    Api { code: i64, message: String },

    #[error("failed to parse response: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("missing field in response: {0}")]
    MissingField(&'static str),

    #[error("invalid header value")]
    InvalidHeader,

    #[error("not logged in")]
    NotLoggedIn,

    #[error("no playable stream found")]
    NoStream,

    #[error("chunk upload failed with status {status}: part {part_index}")]
    ChunkFailed { part_index: i64, status: u16 },
}

impl PlatformError {
    pub fn api(code: i64, message: impl Into<String>) -> Self {
        Self::Api {
            code,
            message: message.into(),
        }
    }

    /// Whether a retry of the same request could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::ChunkFailed { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}
