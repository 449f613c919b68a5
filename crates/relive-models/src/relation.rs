//! Links between downloads and submission tasks for the integrated
//! download-and-submit flow.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Workflow gating state carried by a relation.
///
/// Persisted as the uppercase wire strings the UI filters on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationStatus {
    /// Waiting for the linked download to finish
    #[default]
    PendingDownload,
    /// All linked downloads are done; workflow can start
    Ready,
    /// The workflow instance has been created
    WorkflowStarted,
    /// The linked download terminally failed
    DownloadFailed,
}

impl RelationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationStatus::PendingDownload => "PENDING_DOWNLOAD",
            RelationStatus::Ready => "READY",
            RelationStatus::WorkflowStarted => "WORKFLOW_STARTED",
            RelationStatus::DownloadFailed => "DOWNLOAD_FAILED",
        }
    }
}

impl std::str::FromStr for RelationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING_DOWNLOAD" => Ok(RelationStatus::PendingDownload),
            "READY" => Ok(RelationStatus::Ready),
            "WORKFLOW_STARTED" => Ok(RelationStatus::WorkflowStarted),
            "DOWNLOAD_FAILED" => Ok(RelationStatus::DownloadFailed),
            other => Err(format!("unknown relation status: {other}")),
        }
    }
}

/// Join entity: one user action fans out into a download job and a
/// dependent workflow instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRelation {
    pub id: i64,
    pub download_id: i64,
    pub task_id: i64,
    /// Relation kind; currently always "INTEGRATED"
    pub relation_type: String,
    pub workflow_status: RelationStatus,
    /// Instance id once the workflow starts
    pub instance_id: Option<String>,
    pub retry_count: i64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TaskRelation {
    pub fn integrated(download_id: i64, task_id: i64) -> Self {
        Self {
            id: 0,
            download_id,
            task_id,
            relation_type: "INTEGRATED".to_string(),
            workflow_status: RelationStatus::PendingDownload,
            instance_id: None,
            retry_count: 0,
            last_error: None,
            created_at: Utc::now(),
        }
    }
}
