//! Live recording tasks: one row per continuous recording segment.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// State of one recording segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RecordingStatus {
    /// Frames are being appended to the file
    #[default]
    Recording,
    /// Segment closed cleanly (rotation or stream end)
    Completed,
    /// Segment aborted by an unrecoverable write error
    Failed,
}

impl RecordingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordingStatus::Recording => "recording",
            RecordingStatus::Completed => "completed",
            RecordingStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RecordingStatus::Completed | RecordingStatus::Failed)
    }
}

impl std::str::FromStr for RecordingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "recording" => Ok(RecordingStatus::Recording),
            "completed" => Ok(RecordingStatus::Completed),
            "failed" => Ok(RecordingStatus::Failed),
            other => Err(format!("unknown recording status: {other}")),
        }
    }
}

/// One continuous recording segment for a room.
///
/// `segment_index` is strictly increasing per room; rotation closes the
/// current row and opens the next index without dropping frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveRecordTask {
    /// Store row id (0 until persisted)
    pub id: i64,
    pub room_id: i64,
    pub status: RecordingStatus,
    /// Path of the growing (or finished) media file
    pub file_path: String,
    /// Monotonic per-room segment counter, starting at 1
    pub segment_index: i64,
    /// Room title at the moment the segment opened
    pub title: Option<String>,
    pub started_at: DateTime<Utc>,
    /// Set exactly once, when the segment reaches a terminal status
    pub ended_at: Option<DateTime<Utc>>,
    /// Bytes written so far (final size once terminal)
    pub file_size: i64,
    pub error_message: Option<String>,
}

impl LiveRecordTask {
    /// Open a new segment for a room.
    pub fn open(
        room_id: i64,
        segment_index: i64,
        file_path: impl Into<String>,
        title: Option<String>,
    ) -> Self {
        Self {
            id: 0,
            room_id,
            status: RecordingStatus::Recording,
            file_path: file_path.into(),
            segment_index,
            title,
            started_at: Utc::now(),
            ended_at: None,
            file_size: 0,
            error_message: None,
        }
    }

    /// Close the segment cleanly.
    pub fn complete(mut self, final_size: i64) -> Self {
        self.status = RecordingStatus::Completed;
        self.file_size = final_size;
        self.ended_at = Some(Utc::now());
        self
    }

    /// Abort the segment with an error.
    pub fn fail(mut self, error: impl Into<String>) -> Self {
        self.status = RecordingStatus::Failed;
        self.error_message = Some(error.into());
        self.ended_at = Some(Utc::now());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_lifecycle() {
        let task = LiveRecordTask::open(12345, 1, "/rec/seg-1.flv", Some("title".to_string()));
        assert_eq!(task.status, RecordingStatus::Recording);
        assert!(task.ended_at.is_none());

        let done = task.complete(1024);
        assert_eq!(done.status, RecordingStatus::Completed);
        assert_eq!(done.file_size, 1024);
        assert!(done.ended_at.is_some());
    }

    #[test]
    fn test_failed_segment_keeps_error() {
        let task = LiveRecordTask::open(12345, 2, "/rec/seg-2.flv", None);
        let failed = task.fail("disk full");
        assert_eq!(failed.status, RecordingStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("disk full"));
        assert!(failed.status.is_terminal());
    }
}
