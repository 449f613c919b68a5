//! Workflow instance, step and configuration queries.

use chrono::{DateTime, Utc};
use relive_models::{
    InstanceId, StepInput, StepOutput, StepStatus, StepType, WorkflowConfig, WorkflowConfiguration,
    WorkflowInstance, WorkflowStatus, WorkflowStep,
};

use crate::{Store, StoreError, StoreResult};

#[derive(sqlx::FromRow)]
struct InstanceRow {
    id: String,
    task_id: i64,
    workflow_type: String,
    status: String,
    current_step: Option<String>,
    progress: f64,
    config_name: String,
    config_version: i64,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<InstanceRow> for WorkflowInstance {
    type Error = StoreError;

    fn try_from(row: InstanceRow) -> Result<Self, Self::Error> {
        Ok(WorkflowInstance {
            id: InstanceId::from_string(row.id),
            task_id: row.task_id,
            workflow_type: row.workflow_type,
            status: row.status.parse::<WorkflowStatus>().map_err(StoreError::invalid_value)?,
            current_step: row.current_step,
            progress: row.progress,
            config_name: row.config_name,
            config_version: row.config_version,
            error_message: row.error_message,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct StepRow {
    id: i64,
    instance_id: String,
    step_type: String,
    step_order: i64,
    status: String,
    progress: f64,
    input: Option<String>,
    output: Option<String>,
    error_message: Option<String>,
    retry_count: i64,
    max_retries: i64,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<StepRow> for WorkflowStep {
    type Error = StoreError;

    fn try_from(row: StepRow) -> Result<Self, Self::Error> {
        let input: Option<StepInput> = row.input.as_deref().map(serde_json::from_str).transpose()?;
        let output: Option<StepOutput> = row.output.as_deref().map(serde_json::from_str).transpose()?;
        Ok(WorkflowStep {
            id: row.id,
            instance_id: InstanceId::from_string(row.instance_id),
            step_type: row.step_type.parse::<StepType>().map_err(StoreError::invalid_value)?,
            step_order: row.step_order,
            status: row.status.parse::<StepStatus>().map_err(StoreError::invalid_value)?,
            progress: row.progress,
            input,
            output,
            error_message: row.error_message,
            retry_count: row.retry_count,
            max_retries: row.max_retries,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ConfigRow {
    id: i64,
    name: String,
    version: i64,
    config: String,
    is_system_default: i64,
    created_at: DateTime<Utc>,
}

impl TryFrom<ConfigRow> for WorkflowConfiguration {
    type Error = StoreError;

    fn try_from(row: ConfigRow) -> Result<Self, Self::Error> {
        Ok(WorkflowConfiguration {
            id: row.id,
            name: row.name,
            version: row.version,
            config: serde_json::from_str(&row.config)?,
            is_system_default: row.is_system_default != 0,
            created_at: row.created_at,
        })
    }
}

impl Store {
    /// Seed the system-default configurations once at schema creation.
    pub(crate) async fn seed_default_configurations(&self) -> StoreResult<()> {
        let existing: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM workflow_configuration WHERE is_system_default = 1",
        )
        .fetch_one(self.pool())
        .await?;
        if existing > 0 {
            return Ok(());
        }

        let defaults = [
            ("default", WorkflowConfig::default()),
            (
                "merge-only",
                WorkflowConfig {
                    enable_clipping: false,
                    enable_segmentation: false,
                    ..Default::default()
                },
            ),
        ];
        for (name, config) in defaults {
            self.insert_configuration(name, &config, true).await?;
        }
        Ok(())
    }

    /// Insert a new configuration version. Existing versions are immutable;
    /// an edit writes `max(version) + 1`.
    pub async fn insert_configuration(
        &self,
        name: &str,
        config: &WorkflowConfig,
        is_system_default: bool,
    ) -> StoreResult<i64> {
        let next: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM workflow_configuration WHERE name = ?",
        )
        .bind(name)
        .fetch_one(self.pool())
        .await?;

        sqlx::query(
            "INSERT INTO workflow_configuration (name, version, config, is_system_default, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(name)
        .bind(next)
        .bind(serde_json::to_string(config)?)
        .bind(is_system_default as i64)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(next)
    }

    /// Latest version of a named configuration.
    pub async fn get_configuration(&self, name: &str) -> StoreResult<WorkflowConfiguration> {
        let row: ConfigRow = sqlx::query_as(
            "SELECT * FROM workflow_configuration WHERE name = ? ORDER BY version DESC LIMIT 1",
        )
        .bind(name)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| StoreError::not_found("workflow configuration", name))?;
        row.try_into()
    }

    /// The exact version an instance was bound to at scheduling time.
    pub async fn get_configuration_version(
        &self,
        name: &str,
        version: i64,
    ) -> StoreResult<WorkflowConfiguration> {
        let row: ConfigRow = sqlx::query_as(
            "SELECT * FROM workflow_configuration WHERE name = ? AND version = ?",
        )
        .bind(name)
        .bind(version)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| StoreError::not_found("workflow configuration", format!("{name} v{version}")))?;
        row.try_into()
    }

    // --- instances ---

    pub async fn insert_instance(&self, instance: &WorkflowInstance) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO workflow_instance
               (id, task_id, workflow_type, status, current_step, progress, config_name, config_version,
                error_message, created_at, started_at, completed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(instance.id.as_str())
        .bind(instance.task_id)
        .bind(&instance.workflow_type)
        .bind(instance.status.as_str())
        .bind(&instance.current_step)
        .bind(instance.progress)
        .bind(&instance.config_name)
        .bind(instance.config_version)
        .bind(&instance.error_message)
        .bind(instance.created_at)
        .bind(instance.started_at)
        .bind(instance.completed_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn get_instance(&self, id: &InstanceId) -> StoreResult<WorkflowInstance> {
        let row: InstanceRow = sqlx::query_as("SELECT * FROM workflow_instance WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| StoreError::not_found("workflow instance", id))?;
        row.try_into()
    }

    /// Instances the orchestrator should be driving.
    pub async fn list_runnable_instances(&self) -> StoreResult<Vec<WorkflowInstance>> {
        let rows: Vec<InstanceRow> = sqlx::query_as(
            "SELECT * FROM workflow_instance WHERE status IN ('pending', 'running') ORDER BY created_at",
        )
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    pub async fn list_instances_for_task(&self, task_id: i64) -> StoreResult<Vec<WorkflowInstance>> {
        let rows: Vec<InstanceRow> = sqlx::query_as(
            "SELECT * FROM workflow_instance WHERE task_id = ? ORDER BY created_at",
        )
        .bind(task_id)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    pub async fn mark_instance_running(&self, id: &InstanceId) -> StoreResult<()> {
        sqlx::query(
            "UPDATE workflow_instance SET status = 'running', started_at = COALESCE(started_at, ?) WHERE id = ?",
        )
        .bind(Utc::now())
        .bind(id.as_str())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn update_instance_progress(
        &self,
        id: &InstanceId,
        current_step: Option<&str>,
        progress: f64,
    ) -> StoreResult<()> {
        sqlx::query("UPDATE workflow_instance SET current_step = ?, progress = ? WHERE id = ?")
            .bind(current_step)
            .bind(progress)
            .bind(id.as_str())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn complete_instance(&self, id: &InstanceId) -> StoreResult<()> {
        sqlx::query(
            "UPDATE workflow_instance SET status = 'completed', progress = 1.0, current_step = NULL, completed_at = ? WHERE id = ?",
        )
        .bind(Utc::now())
        .bind(id.as_str())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn fail_instance(&self, id: &InstanceId, error: &str) -> StoreResult<()> {
        sqlx::query(
            "UPDATE workflow_instance SET status = 'failed', error_message = ?, completed_at = ? WHERE id = ?",
        )
        .bind(error)
        .bind(Utc::now())
        .bind(id.as_str())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    // --- steps ---

    pub async fn insert_step(&self, step: &WorkflowStep) -> StoreResult<i64> {
        let input = step.input.as_ref().map(serde_json::to_string).transpose()?;
        let output = step.output.as_ref().map(serde_json::to_string).transpose()?;
        let result = sqlx::query(
            r#"INSERT INTO workflow_step
               (instance_id, step_type, step_order, status, progress, input, output,
                error_message, retry_count, max_retries, started_at, completed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(step.instance_id.as_str())
        .bind(step.step_type.as_str())
        .bind(step.step_order)
        .bind(step.status.as_str())
        .bind(step.progress)
        .bind(input)
        .bind(output)
        .bind(&step.error_message)
        .bind(step.retry_count)
        .bind(step.max_retries)
        .bind(step.started_at)
        .bind(step.completed_at)
        .execute(self.pool())
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn get_step(&self, id: i64) -> StoreResult<WorkflowStep> {
        let row: StepRow = sqlx::query_as("SELECT * FROM workflow_step WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| StoreError::not_found("workflow step", id))?;
        row.try_into()
    }

    pub async fn list_steps(&self, instance_id: &InstanceId) -> StoreResult<Vec<WorkflowStep>> {
        let rows: Vec<StepRow> = sqlx::query_as(
            "SELECT * FROM workflow_step WHERE instance_id = ? ORDER BY step_order",
        )
        .bind(instance_id.as_str())
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// The next step eligible to run: the lowest-order non-completed step,
    /// and only if every predecessor has completed. Returns `None` when the
    /// instance is finished or blocked on a terminally failed step.
    pub async fn next_eligible_step(&self, instance_id: &InstanceId) -> StoreResult<Option<WorkflowStep>> {
        let steps = self.list_steps(instance_id).await?;
        for step in steps {
            match step.status {
                WorkflowStatus::Completed => continue,
                WorkflowStatus::Pending => return Ok(Some(step)),
                // Running (claimed elsewhere) or Failed (terminal) both
                // block the successor steps.
                _ => return Ok(None),
            }
        }
        Ok(None)
    }

    pub async fn mark_step_running(&self, id: i64, input: &StepInput) -> StoreResult<()> {
        sqlx::query(
            "UPDATE workflow_step SET status = 'running', input = ?, started_at = COALESCE(started_at, ?) WHERE id = ?",
        )
        .bind(serde_json::to_string(input)?)
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn update_step_progress(&self, id: i64, progress: f64) -> StoreResult<()> {
        sqlx::query("UPDATE workflow_step SET progress = ? WHERE id = ?")
            .bind(progress)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn complete_step(&self, id: i64, output: &StepOutput) -> StoreResult<()> {
        sqlx::query(
            "UPDATE workflow_step SET status = 'completed', progress = 1.0, output = ?, completed_at = ? WHERE id = ?",
        )
        .bind(serde_json::to_string(output)?)
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Record a failed attempt. Under the retry budget the step goes back
    /// to `pending` for a fresh attempt; otherwise it is terminally failed.
    /// Returns the updated step.
    pub async fn record_step_failure(&self, id: i64, error: &str) -> StoreResult<WorkflowStep> {
        let step = self.get_step(id).await?;
        let retry_count = step.retry_count + 1;
        let status = if retry_count < step.max_retries {
            WorkflowStatus::Pending
        } else {
            WorkflowStatus::Failed
        };

        sqlx::query(
            "UPDATE workflow_step SET status = ?, retry_count = ?, error_message = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(retry_count)
        .bind(error)
        .bind(id)
        .execute(self.pool())
        .await?;
        self.get_step(id).await
    }

    /// User-triggered retry of a failed instance: reset the failed step's
    /// counters and re-enter the state machine from that step. Outputs of
    /// prior succeeded steps are kept and reused.
    pub async fn reset_instance_from_failed_step(&self, instance_id: &InstanceId) -> StoreResult<()> {
        let mut tx = self.pool().begin().await?;

        sqlx::query(
            r#"UPDATE workflow_step
               SET status = 'pending', retry_count = 0, error_message = NULL, progress = 0.0
               WHERE instance_id = ? AND status = 'failed'"#,
        )
        .bind(instance_id.as_str())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE workflow_instance SET status = 'running', error_message = NULL, completed_at = NULL WHERE id = ?",
        )
        .bind(instance_id.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    // --- execution log ---

    /// Append a diagnostic event keyed by instance/step. The log is for
    /// diagnosis, not replay.
    pub async fn append_execution_log(
        &self,
        instance_id: &InstanceId,
        step_id: Option<i64>,
        event: &str,
        detail: Option<&str>,
    ) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO execution_log (instance_id, step_id, event, detail, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(instance_id.as_str())
        .bind(step_id)
        .bind(event)
        .bind(detail)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn list_execution_log(&self, instance_id: &InstanceId) -> StoreResult<Vec<(String, Option<String>)>> {
        let rows: Vec<(String, Option<String>)> = sqlx::query_as(
            "SELECT event, detail FROM execution_log WHERE instance_id = ? ORDER BY id",
        )
        .bind(instance_id.as_str())
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seed_instance(store: &Store, max_retries: i64) -> (InstanceId, Vec<i64>) {
        let instance = WorkflowInstance::new(1, "default", 1);
        store.insert_instance(&instance).await.unwrap();

        let mut step_ids = Vec::new();
        for (order, step_type) in StepType::all().into_iter().enumerate() {
            let step = WorkflowStep::new(instance.id.clone(), step_type, order as i64, max_retries);
            step_ids.push(store.insert_step(&step).await.unwrap());
        }
        (instance.id, step_ids)
    }

    #[tokio::test]
    async fn test_default_configurations_seeded_once() {
        let store = Store::open_in_memory().await.unwrap();
        let config = store.get_configuration("default").await.unwrap();
        assert!(config.is_system_default);
        assert_eq!(config.version, 1);
        assert!(config.config.enable_segmentation);

        let merge_only = store.get_configuration("merge-only").await.unwrap();
        assert!(!merge_only.config.enable_segmentation);
    }

    #[tokio::test]
    async fn test_configuration_edits_create_new_versions() {
        let store = Store::open_in_memory().await.unwrap();
        let edited = WorkflowConfig {
            segment_duration_seconds: 133,
            ..Default::default()
        };
        let version = store.insert_configuration("default", &edited, false).await.unwrap();
        assert_eq!(version, 2);

        let latest = store.get_configuration("default").await.unwrap();
        assert_eq!(latest.config.segment_duration_seconds, 133);

        // The originally bound version is still reachable.
        let original = store.get_configuration_version("default", 1).await.unwrap();
        assert_eq!(original.config.segment_duration_seconds, 300);
    }

    #[tokio::test]
    async fn test_steps_execute_strictly_in_order() {
        let store = Store::open_in_memory().await.unwrap();
        let (instance_id, step_ids) = seed_instance(&store, 3).await;

        let first = store.next_eligible_step(&instance_id).await.unwrap().unwrap();
        assert_eq!(first.step_order, 0);
        assert_eq!(first.step_type, StepType::Clip);

        // While step 0 is running, nothing is eligible.
        let input = StepInput::Clip { sources: vec![] };
        store.mark_step_running(step_ids[0], &input).await.unwrap();
        assert!(store.next_eligible_step(&instance_id).await.unwrap().is_none());

        store
            .complete_step(step_ids[0], &StepOutput::Clip { outputs: vec!["/c0.mp4".into()] })
            .await
            .unwrap();
        let second = store.next_eligible_step(&instance_id).await.unwrap().unwrap();
        assert_eq!(second.step_order, 1);
        assert_eq!(second.step_type, StepType::Merge);
    }

    #[tokio::test]
    async fn test_step_failure_respects_retry_budget() {
        let store = Store::open_in_memory().await.unwrap();
        let (instance_id, step_ids) = seed_instance(&store, 2).await;

        let after_first = store.record_step_failure(step_ids[0], "503").await.unwrap();
        assert_eq!(after_first.status, WorkflowStatus::Pending);
        assert_eq!(after_first.retry_count, 1);

        // Still eligible for another attempt.
        assert!(store.next_eligible_step(&instance_id).await.unwrap().is_some());

        let after_second = store.record_step_failure(step_ids[0], "503 again").await.unwrap();
        assert_eq!(after_second.status, WorkflowStatus::Failed);
        assert_eq!(after_second.error_message.as_deref(), Some("503 again"));

        // A terminally failed step blocks its successors.
        assert!(store.next_eligible_step(&instance_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reset_from_failed_step_keeps_prior_outputs() {
        let store = Store::open_in_memory().await.unwrap();
        let (instance_id, step_ids) = seed_instance(&store, 1).await;

        store
            .complete_step(step_ids[0], &StepOutput::Clip { outputs: vec!["/c0.mp4".into()] })
            .await
            .unwrap();
        store.record_step_failure(step_ids[1], "merge exploded").await.unwrap();
        store.fail_instance(&instance_id, "merge exploded").await.unwrap();

        store.reset_instance_from_failed_step(&instance_id).await.unwrap();

        let next = store.next_eligible_step(&instance_id).await.unwrap().unwrap();
        assert_eq!(next.step_type, StepType::Merge);
        assert_eq!(next.retry_count, 0);

        // The CLIP output is untouched for reuse.
        let clip = store.get_step(step_ids[0]).await.unwrap();
        assert_eq!(clip.status, WorkflowStatus::Completed);
        assert!(clip.output.is_some());

        let instance = store.get_instance(&instance_id).await.unwrap();
        assert_eq!(instance.status, WorkflowStatus::Running);
        assert!(instance.error_message.is_none());
    }

    #[tokio::test]
    async fn test_step_payload_round_trip() {
        let store = Store::open_in_memory().await.unwrap();
        let (instance_id, step_ids) = seed_instance(&store, 3).await;

        let input = StepInput::Segment {
            input: "/out/merged.mp4".to_string(),
            segment_seconds: 300,
        };
        store.mark_step_running(step_ids[2], &input).await.unwrap();
        let output = StepOutput::Segment {
            parts: vec!["/out/part_000.mp4".into(), "/out/part_001.mp4".into()],
            merged_fallback: false,
        };
        store.complete_step(step_ids[2], &output).await.unwrap();

        let steps = store.list_steps(&instance_id).await.unwrap();
        assert_eq!(steps[2].input.as_ref(), Some(&input));
        assert_eq!(steps[2].output.as_ref(), Some(&output));
    }

    #[tokio::test]
    async fn test_execution_log_appends_in_order() {
        let store = Store::open_in_memory().await.unwrap();
        let (instance_id, step_ids) = seed_instance(&store, 3).await;

        store
            .append_execution_log(&instance_id, Some(step_ids[0]), "step_started", None)
            .await
            .unwrap();
        store
            .append_execution_log(&instance_id, Some(step_ids[0]), "step_completed", Some("2 outputs"))
            .await
            .unwrap();

        let log = store.list_execution_log(&instance_id).await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].0, "step_started");
        assert_eq!(log[1].1.as_deref(), Some("2 outputs"));
    }
}
