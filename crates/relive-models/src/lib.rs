//! Shared data models for the relive backend.
//!
//! This crate provides Serde-serializable types for:
//! - Subscribed live rooms and per-room recording tasks
//! - Part downloads and submission tasks with their source/output media
//! - Workflow instances, steps and typed step payloads
//! - Resumable upload state blocks
//! - Sync mirror jobs and download/submission task relations

pub mod anchor;
pub mod download;
pub mod recording;
pub mod relation;
pub mod submission;
pub mod sync;
pub mod template;
pub mod timestamp;
pub mod upload;
pub mod workflow;

// Re-export common types
pub use anchor::{Anchor, LiveStatus};
pub use download::{DownloadStatus, VideoDownload};
pub use recording::{LiveRecordTask, RecordingStatus};
pub use relation::{RelationStatus, TaskRelation};
pub use submission::{MergedVideo, SubmissionTask, TaskOutputSegment, TaskSourceVideo};
pub use sync::{SyncStatus, SyncTask};
pub use template::{render_template, sanitize_filename};
pub use timestamp::{format_seconds, parse_timecode};
pub use upload::UploadState;
pub use workflow::{
    ClipSource, InstanceId, StepInput, StepOutput, StepStatus, StepType, WorkflowConfig, WorkflowConfiguration,
    WorkflowInstance, WorkflowStatus, WorkflowStep,
};
