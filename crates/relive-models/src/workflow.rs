//! Workflow instances, steps and typed step payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a workflow instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub String);

impl InstanceId {
    /// Generate a new random instance ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Instance-level status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowStatus::Completed | WorkflowStatus::Failed)
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(WorkflowStatus::Pending),
            "running" => Ok(WorkflowStatus::Running),
            "completed" => Ok(WorkflowStatus::Completed),
            "failed" => Ok(WorkflowStatus::Failed),
            other => Err(format!("unknown workflow status: {other}")),
        }
    }
}

/// Step-level status. Shares the instance vocabulary; a failed step under
/// its retry budget goes back to `Pending` for the next attempt.
pub type StepStatus = WorkflowStatus;

/// The fixed, ordered set of pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepType {
    /// Apply per-source start/end trims
    Clip,
    /// Concatenate ordered sources into one artifact
    Merge,
    /// Split the merged artifact into duration-bounded parts
    Segment,
    /// Push artifacts to the target platform
    Upload,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::Clip => "CLIP",
            StepType::Merge => "MERGE",
            StepType::Segment => "SEGMENT",
            StepType::Upload => "UPLOAD",
        }
    }

    /// Canonical pipeline order.
    pub fn all() -> [StepType; 4] {
        [StepType::Clip, StepType::Merge, StepType::Segment, StepType::Upload]
    }
}

impl std::str::FromStr for StepType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CLIP" => Ok(StepType::Clip),
            "MERGE" => Ok(StepType::Merge),
            "SEGMENT" => Ok(StepType::Segment),
            "UPLOAD" => Ok(StepType::Upload),
            other => Err(format!("unknown step type: {other}")),
        }
    }
}

/// A trim spec consumed by the clip step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipSource {
    pub file_path: String,
    pub sort_order: i64,
    /// `HH:MM:SS`; empty or `00:00:00` means "from the start"
    pub start_time: Option<String>,
    /// `HH:MM:SS`; empty means "to the end"
    pub end_time: Option<String>,
}

/// Typed step input, tagged by step type so each stage can evolve its
/// payload shape independently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepInput {
    Clip { sources: Vec<ClipSource> },
    Merge { inputs: Vec<String> },
    Segment { input: String, segment_seconds: u32 },
    Upload { merged_id: Option<i64>, segment_ids: Vec<i64> },
}

/// Typed step output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepOutput {
    Clip {
        outputs: Vec<String>,
    },
    Merge {
        output: String,
        duration_seconds: f64,
    },
    Segment {
        parts: Vec<String>,
        /// Set when segmentation produced no parts and the merged artifact
        /// is uploaded directly instead
        merged_fallback: bool,
    },
    Upload {
        bvid: Option<String>,
        aid: Option<i64>,
        cids: Vec<i64>,
    },
}

/// One execution of the pipeline for a submission task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: InstanceId,
    pub task_id: i64,
    /// Workflow type tag; currently always "submission"
    pub workflow_type: String,
    pub status: WorkflowStatus,
    /// Name of the step currently running or next eligible
    pub current_step: Option<String>,
    /// Completed enabled steps / total enabled steps, 0-1
    pub progress: f64,
    /// Name of the bound configuration
    pub config_name: String,
    pub config_version: i64,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowInstance {
    pub fn new(task_id: i64, config_name: impl Into<String>, config_version: i64) -> Self {
        Self {
            id: InstanceId::new(),
            task_id,
            workflow_type: "submission".to_string(),
            status: WorkflowStatus::Pending,
            current_step: None,
            progress: 0.0,
            config_name: config_name.into(),
            config_version,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

/// One stage within an instance. Steps are strictly ordered by
/// `step_order`; a step may not start until its predecessor completed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: i64,
    pub instance_id: InstanceId,
    pub step_type: StepType,
    /// Unique within the instance, 0-based
    pub step_order: i64,
    pub status: StepStatus,
    pub progress: f64,
    pub input: Option<StepInput>,
    pub output: Option<StepOutput>,
    pub error_message: Option<String>,
    pub retry_count: i64,
    pub max_retries: i64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowStep {
    pub fn new(instance_id: InstanceId, step_type: StepType, step_order: i64, max_retries: i64) -> Self {
        Self {
            id: 0,
            instance_id,
            step_type,
            step_order,
            status: StepStatus::Pending,
            progress: 0.0,
            input: None,
            output: None,
            error_message: None,
            retry_count: 0,
            max_retries,
            started_at: None,
            completed_at: None,
        }
    }

    /// Whether another automatic attempt is allowed after a failure.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

/// Pipeline toggles bound to an instance at scheduling time.
///
/// Field names match the persisted JSON document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowConfig {
    pub enable_clipping: bool,
    pub enable_merging: bool,
    pub enable_segmentation: bool,
    /// Only steps gated behind a completed download start when true
    #[serde(default)]
    pub enable_direct_submission: bool,
    pub segment_duration_seconds: u32,
    pub max_retries: i64,
    pub timeout_minutes: u64,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            enable_clipping: true,
            enable_merging: true,
            enable_segmentation: true,
            enable_direct_submission: false,
            segment_duration_seconds: 300,
            max_retries: 3,
            timeout_minutes: 60,
        }
    }
}

impl WorkflowConfig {
    /// The ordered step types this configuration schedules.
    ///
    /// MERGE always runs (a single source still needs a normalized
    /// artifact); CLIP and SEGMENT are optional. UPLOAD always runs.
    pub fn enabled_steps(&self) -> Vec<StepType> {
        let mut steps = Vec::with_capacity(4);
        if self.enable_clipping {
            steps.push(StepType::Clip);
        }
        if self.enable_merging {
            steps.push(StepType::Merge);
        }
        if self.enable_segmentation {
            steps.push(StepType::Segment);
        }
        steps.push(StepType::Upload);
        steps
    }
}

/// A named, versioned configuration document. Immutable once referenced by
/// a running instance; edits create a new version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfiguration {
    pub id: i64,
    pub name: String,
    pub version: i64,
    pub config: WorkflowConfig,
    pub is_system_default: bool,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_type_round_trip() {
        for step in StepType::all() {
            assert_eq!(step.as_str().parse::<StepType>().unwrap(), step);
        }
    }

    #[test]
    fn test_config_json_round_trip() {
        let config = WorkflowConfig {
            enable_segmentation: false,
            segment_duration_seconds: 133,
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"enableSegmentation\":false"));
        let back: WorkflowConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
        assert!(!back.enabled_steps().contains(&StepType::Segment));
    }

    #[test]
    fn test_enabled_steps_order() {
        let config = WorkflowConfig::default();
        assert_eq!(
            config.enabled_steps(),
            vec![StepType::Clip, StepType::Merge, StepType::Segment, StepType::Upload]
        );

        let no_clip = WorkflowConfig {
            enable_clipping: false,
            enable_segmentation: false,
            ..Default::default()
        };
        assert_eq!(no_clip.enabled_steps(), vec![StepType::Merge, StepType::Upload]);
    }

    #[test]
    fn test_step_payload_tagging() {
        let input = StepInput::Segment {
            input: "/tmp/merged.mp4".to_string(),
            segment_seconds: 300,
        };
        let json = serde_json::to_string(&input).unwrap();
        assert!(json.contains("\"type\":\"SEGMENT\""));
        let back: StepInput = serde_json::from_str(&json).unwrap();
        assert_eq!(back, input);
    }

    #[test]
    fn test_step_retry_budget() {
        let mut step = WorkflowStep::new(InstanceId::new(), StepType::Merge, 1, 2);
        assert!(step.can_retry());
        step.retry_count = 2;
        assert!(!step.can_retry());
    }
}
