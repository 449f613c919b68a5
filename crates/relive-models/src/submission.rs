//! Submission tasks and the media rows they own.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::upload::UploadState;

/// Lifecycle of a submission task as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    /// Created, waiting for its workflow to run
    #[default]
    Created,
    /// A workflow instance is driving it
    Processing,
    /// Published on the platform
    Published,
    /// Workflow terminally failed
    Failed,
}

impl SubmissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionStatus::Created => "created",
            SubmissionStatus::Processing => "processing",
            SubmissionStatus::Published => "published",
            SubmissionStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for SubmissionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(SubmissionStatus::Created),
            "processing" => Ok(SubmissionStatus::Processing),
            "published" => Ok(SubmissionStatus::Published),
            "failed" => Ok(SubmissionStatus::Failed),
            other => Err(format!("unknown submission status: {other}")),
        }
    }
}

/// Original vs repost classification required by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VideoType {
    #[default]
    Original,
    Repost,
}

impl VideoType {
    /// Platform wire code (1 = original, 2 = repost).
    pub fn as_code(&self) -> i64 {
        match self {
            VideoType::Original => 1,
            VideoType::Repost => 2,
        }
    }

    pub fn from_code(code: i64) -> Self {
        if code == 2 {
            VideoType::Repost
        } else {
            VideoType::Original
        }
    }
}

/// One unit of work destined for the target platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionTask {
    /// Store row id (0 until persisted)
    pub id: i64,
    pub status: SubmissionStatus,
    pub title: String,
    pub description: String,
    /// Platform partition/category id
    pub partition_id: i64,
    /// Comma-separated tag list
    pub tags: String,
    pub video_type: VideoType,
    /// Platform collection to append the published video to
    pub collection_id: Option<i64>,
    /// Remote video id, set at most once on first successful publish
    pub bvid: Option<String>,
    pub aid: Option<i64>,
    /// Platform review state, refreshed after publish
    pub remote_state: Option<i64>,
    pub reject_reason: Option<String>,
    /// Filename prefix for uploaded segments
    pub segment_prefix: String,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SubmissionTask {
    pub fn new(title: impl Into<String>, partition_id: i64) -> Self {
        let title = title.into();
        let now = Utc::now();
        Self {
            id: 0,
            status: SubmissionStatus::Created,
            segment_prefix: crate::template::sanitize_filename(&title),
            title,
            description: String::new(),
            partition_id,
            tags: String::new(),
            video_type: VideoType::Original,
            collection_id: None,
            bvid: None,
            aid: None,
            remote_state: None,
            reject_reason: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the task already has a remote identity to append parts to.
    pub fn is_published(&self) -> bool {
        self.bvid.is_some()
    }
}

/// An ordered input clip reference for a submission task.
///
/// Immutable once the clip step consumes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSourceVideo {
    pub id: i64,
    pub task_id: i64,
    pub file_path: String,
    /// Position within the task, 0-based
    pub sort_order: i64,
    /// Optional trim start, `HH:MM:SS`
    pub start_time: Option<String>,
    /// Optional trim end, `HH:MM:SS`
    pub end_time: Option<String>,
}

/// Output of the merge step, awaiting or undergoing upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergedVideo {
    pub id: i64,
    pub task_id: i64,
    pub file_path: String,
    pub duration_seconds: f64,
    /// pending / uploading / done / failed
    pub status: String,
    pub upload: UploadState,
    pub created_at: DateTime<Utc>,
}

impl MergedVideo {
    pub fn new(task_id: i64, file_path: impl Into<String>, duration_seconds: f64) -> Self {
        Self {
            id: 0,
            task_id,
            file_path: file_path.into(),
            duration_seconds,
            status: "pending".to_string(),
            upload: UploadState::default(),
            created_at: Utc::now(),
        }
    }
}

/// Output of the segmentation step.
///
/// Segments upload independently but `part_order` must be preserved when the
/// remote multi-part video is assembled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutputSegment {
    pub id: i64,
    pub task_id: i64,
    /// Display name of the part on the platform
    pub part_name: String,
    pub file_path: String,
    /// Position within the remote video, 0-based
    pub part_order: i64,
    /// pending / uploading / done / failed
    pub status: String,
    pub upload: UploadState,
}

impl TaskOutputSegment {
    pub fn new(
        task_id: i64,
        part_name: impl Into<String>,
        file_path: impl Into<String>,
        part_order: i64,
    ) -> Self {
        Self {
            id: 0,
            task_id,
            part_name: part_name.into(),
            file_path: file_path.into(),
            part_order,
            status: "pending".to_string(),
            upload: UploadState::default(),
        }
    }
}
