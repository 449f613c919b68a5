//! Part-download jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// State of a download job.
///
/// The numeric codes are part of the persisted contract; the UI filters on
/// them directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    /// Waiting for a worker slot
    #[default]
    Pending,
    /// Bytes are being fetched
    Downloading,
    /// Fetched and verified complete
    Done,
    /// Terminal failure; retriable only by explicit action
    Failed,
    /// Cooperatively paused with a persisted resume offset
    Paused,
}

impl DownloadStatus {
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => DownloadStatus::Downloading,
            2 => DownloadStatus::Done,
            3 => DownloadStatus::Failed,
            4 => DownloadStatus::Paused,
            _ => DownloadStatus::Pending,
        }
    }

    pub fn as_code(&self) -> i64 {
        match self {
            DownloadStatus::Pending => 0,
            DownloadStatus::Downloading => 1,
            DownloadStatus::Done => 2,
            DownloadStatus::Failed => 3,
            DownloadStatus::Paused => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Pending => "pending",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Done => "done",
            DownloadStatus::Failed => "failed",
            DownloadStatus::Paused => "paused",
        }
    }

    /// Statuses that occupy queue/worker capacity.
    pub fn is_active(&self) -> bool {
        matches!(self, DownloadStatus::Pending | DownloadStatus::Downloading)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DownloadStatus::Done | DownloadStatus::Failed)
    }
}

/// One part-download job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoDownload {
    /// Store row id (0 until persisted)
    pub id: i64,
    /// Source video id on the platform (bvid)
    pub bvid: String,
    /// Numeric source id (aid), when known
    pub aid: Option<i64>,
    /// Part content id on the platform
    pub cid: Option<i64>,
    pub title: String,
    /// Resolved media URL (refreshed on retry; play URLs expire)
    pub url: Option<String>,
    /// Local output path
    pub local_path: String,
    pub status: DownloadStatus,
    /// Bytes fetched so far
    pub progress_done: i64,
    /// Expected total bytes (0 when the server did not report a length)
    pub progress_total: i64,
    /// Selected resolution id
    pub resolution: Option<i64>,
    /// Selected codec (avc1/hev1/...)
    pub codec: Option<String>,
    /// Container format negotiated (dash or durl)
    pub format: Option<String>,
    /// Part index within the source video, 1-based
    pub part_index: i64,
    /// Total parts of the source video
    pub part_count: i64,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VideoDownload {
    pub fn new(
        bvid: impl Into<String>,
        title: impl Into<String>,
        local_path: impl Into<String>,
        part_index: i64,
        part_count: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            bvid: bvid.into(),
            aid: None,
            cid: None,
            title: title.into(),
            url: None,
            local_path: local_path.into(),
            status: DownloadStatus::Pending,
            progress_done: 0,
            progress_total: 0,
            resolution: None,
            codec: None,
            format: None,
            part_index,
            part_count,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Fraction complete in `[0, 1]`, or 0 when the total is unknown.
    pub fn fraction(&self) -> f64 {
        if self.progress_total <= 0 {
            return 0.0;
        }
        (self.progress_done as f64 / self.progress_total as f64).min(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_round_trip() {
        for status in [
            DownloadStatus::Pending,
            DownloadStatus::Downloading,
            DownloadStatus::Done,
            DownloadStatus::Failed,
            DownloadStatus::Paused,
        ] {
            assert_eq!(DownloadStatus::from_code(status.as_code()), status);
        }
    }

    #[test]
    fn test_active_statuses_count_against_queue() {
        assert!(DownloadStatus::Pending.is_active());
        assert!(DownloadStatus::Downloading.is_active());
        assert!(!DownloadStatus::Paused.is_active());
        assert!(!DownloadStatus::Failed.is_active());
    }

    #[test]
    fn test_fraction_handles_unknown_total() {
        let mut dl = VideoDownload::new("BV1xx411c7mD", "title", "/dl/p1.m4s", 1, 1);
        assert_eq!(dl.fraction(), 0.0);
        dl.progress_total = 100;
        dl.progress_done = 40;
        assert!((dl.fraction() - 0.4).abs() < f64::EPSILON);
    }
}
