//! Structured step logging.
//!
//! Consistent lifecycle logging for workflow step execution, keyed by
//! instance id and step type.

use relive_models::InstanceId;
use tracing::{error, info, warn, Span};

/// Logger bound to one workflow step execution.
#[derive(Debug, Clone)]
pub struct StepLogger {
    instance_id: String,
    step: String,
}

impl StepLogger {
    pub fn new(instance_id: &InstanceId, step: &str) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            step: step.to_string(),
        }
    }

    pub fn log_start(&self, message: &str) {
        info!(
            instance_id = %self.instance_id,
            step = %self.step,
            "step started: {}", message
        );
    }

    pub fn log_progress(&self, message: &str) {
        info!(
            instance_id = %self.instance_id,
            step = %self.step,
            "step progress: {}", message
        );
    }

    pub fn log_warning(&self, message: &str) {
        warn!(
            instance_id = %self.instance_id,
            step = %self.step,
            "step warning: {}", message
        );
    }

    pub fn log_error(&self, message: &str) {
        error!(
            instance_id = %self.instance_id,
            step = %self.step,
            "step error: {}", message
        );
    }

    pub fn log_completion(&self, message: &str) {
        info!(
            instance_id = %self.instance_id,
            step = %self.step,
            "step completed: {}", message
        );
    }

    /// Span for attaching further structured fields to a step execution.
    pub fn create_span(&self) -> Span {
        tracing::info_span!(
            "workflow_step",
            instance_id = %self.instance_id,
            step = %self.step
        )
    }
}
