//! Sync mirror jobs: one per artifact opted into cloud mirroring.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Mirror job lifecycle, persisted as uppercase wire strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    #[default]
    Pending,
    Uploading,
    Paused,
    Success,
    Failed,
    Cancelled,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "PENDING",
            SyncStatus::Uploading => "UPLOADING",
            SyncStatus::Paused => "PAUSED",
            SyncStatus::Success => "SUCCESS",
            SyncStatus::Failed => "FAILED",
            SyncStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncStatus::Success | SyncStatus::Failed | SyncStatus::Cancelled)
    }
}

impl std::str::FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(SyncStatus::Pending),
            "UPLOADING" => Ok(SyncStatus::Uploading),
            "PAUSED" => Ok(SyncStatus::Paused),
            "SUCCESS" => Ok(SyncStatus::Success),
            "FAILED" => Ok(SyncStatus::Failed),
            "CANCELLED" => Ok(SyncStatus::Cancelled),
            other => Err(format!("unknown sync status: {other}")),
        }
    }
}

/// One mirror job for a (local file, remote directory + name) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncTask {
    pub id: i64,
    pub local_path: String,
    pub remote_dir: String,
    pub remote_name: String,
    pub status: SyncStatus,
    /// Percent complete, 0-100; held at 99 until the remote copy verifies
    pub progress: f64,
    pub retry_count: i64,
    pub max_retries: i64,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SyncTask {
    pub fn new(
        local_path: impl Into<String>,
        remote_dir: impl Into<String>,
        remote_name: impl Into<String>,
        max_retries: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            local_path: local_path.into(),
            remote_dir: remote_dir.into(),
            remote_name: remote_name.into(),
            status: SyncStatus::Pending,
            progress: 0.0,
            retry_count: 0,
            max_retries,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Full remote path for the finished copy.
    pub fn remote_path(&self) -> String {
        format!("{}/{}", self.remote_dir.trim_end_matches('/'), self.remote_name)
    }

    /// Whether an automatic retry should reset the job to PENDING.
    pub fn can_auto_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_strings() {
        for status in [
            SyncStatus::Pending,
            SyncStatus::Uploading,
            SyncStatus::Paused,
            SyncStatus::Success,
            SyncStatus::Failed,
            SyncStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<SyncStatus>().unwrap(), status);
        }
        assert!(SyncStatus::Success.is_terminal());
        assert!(!SyncStatus::Paused.is_terminal());
    }

    #[test]
    fn test_remote_path_join() {
        let task = SyncTask::new("/rec/a.flv", "/录播/", "a.flv", 2);
        assert_eq!(task.remote_path(), "/录播/a.flv");
    }
}
