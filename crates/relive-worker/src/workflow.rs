//! Workflow orchestrator.
//!
//! Drives submission tasks through the fixed CLIP, MERGE, SEGMENT, UPLOAD
//! pipeline. Steps run strictly in `step_order`; every transition is
//! persisted before and after execution so a restarted process picks up
//! exactly where the store says it left off. Tasks created through the
//! integrated download flow are gated on their relations: the workflow is
//! scheduled only once every linked download has finished.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use relive_media::{clip_source, merge_files, segment_file, MediaError, TranscodeProfile};
use relive_models::submission::SubmissionStatus;
use relive_models::{
    parse_timecode, ClipSource, DownloadStatus, InstanceId, MergedVideo, RelationStatus, StepInput,
    StepOutput, StepType, SubmissionTask, TaskOutputSegment, TaskSourceVideo, UploadState,
    WorkflowInstance, WorkflowStatus, WorkflowStep,
};
use relive_platform::{ApiClient, AuthInfo, PlatformError};
use relive_store::Store;
use tokio::sync::{watch, Semaphore};
use tracing::{info, warn, Instrument};

use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::logging::StepLogger;
use crate::upload::{publish_task, upload_artifact, ArtifactRef};

/// Everything a spawned step execution needs.
#[derive(Clone)]
struct StepContext {
    store: Store,
    client: ApiClient,
    auth: Option<AuthInfo>,
    config: WorkerConfig,
    profile: TranscodeProfile,
}

/// Scans the store and drives runnable workflow instances.
pub struct Orchestrator {
    ctx: StepContext,
    shutdown: watch::Receiver<bool>,
    /// Step ids currently executing, so a scan never double-claims a step
    /// whose running status has not landed in the store yet
    in_flight: Arc<Mutex<HashSet<i64>>>,
}

impl Orchestrator {
    pub fn new(
        store: Store,
        client: ApiClient,
        auth: Option<AuthInfo>,
        config: WorkerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            ctx: StepContext {
                store,
                client,
                auth,
                config,
                profile: TranscodeProfile::default(),
            },
            shutdown,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Scan loop until shutdown.
    pub async fn run(mut self) {
        info!("workflow orchestrator started");

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            if let Err(e) = self.promote_ready_tasks().await {
                warn!(error = %e, "relation promotion scan failed");
            }
            if let Err(e) = self.drive_instances().await {
                warn!(error = %e, "instance scan failed");
            }

            tokio::select! {
                _ = tokio::time::sleep(self.ctx.config.scan_interval) => {}
                _ = self.shutdown.changed() => {}
            }
        }

        info!("workflow orchestrator stopped");
    }

    /// Move relations forward as their downloads finish and schedule the
    /// workflow once every relation of a task is ready.
    async fn promote_ready_tasks(&self) -> WorkerResult<()> {
        for task_id in self.ctx.store.list_tasks_awaiting_workflow().await? {
            let relations = self.ctx.store.list_relations_for_task(task_id).await?;
            let mut all_ready = true;
            let mut any_failed = false;

            for relation in &relations {
                match relation.workflow_status {
                    RelationStatus::Ready => {}
                    RelationStatus::WorkflowStarted => {}
                    RelationStatus::DownloadFailed => any_failed = true,
                    RelationStatus::PendingDownload => {
                        let dl = self.ctx.store.get_download(relation.download_id).await?;
                        match dl.status {
                            DownloadStatus::Done => {
                                self.ctx
                                    .store
                                    .set_relation_status(relation.id, RelationStatus::Ready, None)
                                    .await?;
                            }
                            DownloadStatus::Failed => {
                                let reason =
                                    dl.error_message.unwrap_or_else(|| "download failed".to_string());
                                self.ctx.store.record_relation_failure(relation.id, &reason).await?;
                                any_failed = true;
                            }
                            _ => all_ready = false,
                        }
                    }
                }
            }

            if any_failed {
                self.ctx
                    .store
                    .set_task_status(task_id, SubmissionStatus::Failed, Some("source download failed"))
                    .await?;
                continue;
            }
            if all_ready {
                self.schedule_task(task_id).await?;
            }
        }
        Ok(())
    }

    /// Create the workflow instance and its ordered steps for a task.
    ///
    /// For integrated tasks whose source list is still empty, sources are
    /// materialized from the finished downloads first.
    pub async fn schedule_task(&self, task_id: i64) -> WorkerResult<InstanceId> {
        let configuration = self
            .ctx
            .store
            .get_configuration(&self.ctx.config.workflow_config)
            .await?;

        if self.ctx.store.list_sources(task_id).await?.is_empty() {
            let relations = self.ctx.store.list_relations_for_task(task_id).await?;
            let mut downloads = Vec::with_capacity(relations.len());
            for relation in &relations {
                downloads.push(self.ctx.store.get_download(relation.download_id).await?);
            }
            downloads.sort_by_key(|dl| dl.part_index);
            for (order, dl) in downloads.iter().enumerate() {
                let source = TaskSourceVideo {
                    id: 0,
                    task_id,
                    file_path: dl.local_path.clone(),
                    sort_order: order as i64,
                    start_time: None,
                    end_time: None,
                };
                self.ctx.store.insert_source(&source).await?;
            }
        }

        let instance = WorkflowInstance::new(task_id, &configuration.name, configuration.version);
        self.ctx.store.insert_instance(&instance).await?;
        for (order, step_type) in configuration.config.enabled_steps().into_iter().enumerate() {
            let step = WorkflowStep::new(
                instance.id.clone(),
                step_type,
                order as i64,
                configuration.config.max_retries,
            );
            self.ctx.store.insert_step(&step).await?;
        }

        self.ctx
            .store
            .mark_relations_workflow_started(task_id, instance.id.as_str())
            .await?;
        self.ctx
            .store
            .set_task_status(task_id, SubmissionStatus::Processing, None)
            .await?;
        self.ctx
            .store
            .append_execution_log(
                &instance.id,
                None,
                "workflow_scheduled",
                Some(&format!("{} v{}", configuration.name, configuration.version)),
            )
            .await?;

        info!(task_id, instance_id = %instance.id, "workflow scheduled");
        Ok(instance.id)
    }

    /// User-triggered retry of a failed instance: the failed step is reset
    /// and the pipeline re-enters from there, reusing prior step outputs.
    pub async fn retry_instance(&self, instance_id: &InstanceId) -> WorkerResult<()> {
        self.ctx.store.reset_instance_from_failed_step(instance_id).await?;
        let instance = self.ctx.store.get_instance(instance_id).await?;
        self.ctx
            .store
            .set_task_status(instance.task_id, SubmissionStatus::Processing, None)
            .await?;
        self.ctx
            .store
            .append_execution_log(instance_id, None, "workflow_retried", None)
            .await?;
        Ok(())
    }

    /// Launch the next eligible step of every runnable instance. A step
    /// marked running blocks its instance until the spawned execution
    /// lands, so re-scanning is harmless.
    async fn drive_instances(&self) -> WorkerResult<()> {
        for instance in self.ctx.store.list_runnable_instances().await? {
            if instance.status == WorkflowStatus::Pending {
                self.ctx.store.mark_instance_running(&instance.id).await?;
                self.ctx
                    .store
                    .append_execution_log(&instance.id, None, "workflow_started", None)
                    .await?;
            }

            match self.ctx.store.next_eligible_step(&instance.id).await? {
                Some(step) => {
                    let claimed = self
                        .in_flight
                        .lock()
                        .map(|mut set| set.insert(step.id))
                        .unwrap_or(false);
                    if !claimed {
                        continue;
                    }
                    let ctx = self.ctx.clone();
                    let in_flight = Arc::clone(&self.in_flight);
                    tokio::spawn(async move {
                        let step_id = step.id;
                        execute_step(ctx, instance, step).await;
                        if let Ok(mut set) = in_flight.lock() {
                            set.remove(&step_id);
                        }
                    });
                }
                None => self.finalize_if_done(&instance).await?,
            }
        }
        Ok(())
    }

    /// Settle an instance whose step chain is either finished or blocked.
    async fn finalize_if_done(&self, instance: &WorkflowInstance) -> WorkerResult<()> {
        let steps = self.ctx.store.list_steps(&instance.id).await?;

        if steps.iter().all(|s| s.status == WorkflowStatus::Completed) {
            self.ctx.store.complete_instance(&instance.id).await?;
            self.ctx
                .store
                .append_execution_log(&instance.id, None, "workflow_completed", None)
                .await?;
            info!(instance_id = %instance.id, "workflow completed");
            return Ok(());
        }

        if let Some(failed) = steps.iter().find(|s| s.status == WorkflowStatus::Failed) {
            let error = failed
                .error_message
                .clone()
                .unwrap_or_else(|| format!("{} failed", failed.step_type.as_str()));
            self.ctx.store.fail_instance(&instance.id, &error).await?;
            self.ctx
                .store
                .set_task_status(instance.task_id, SubmissionStatus::Failed, Some(&error))
                .await?;
            for relation in self.ctx.store.list_relations_for_task(instance.task_id).await? {
                self.ctx
                    .store
                    .set_relation_status(relation.id, relation.workflow_status, Some(&error))
                    .await?;
            }
            self.ctx
                .store
                .append_execution_log(&instance.id, Some(failed.id), "workflow_failed", Some(&error))
                .await?;
            warn!(instance_id = %instance.id, error, "workflow failed");
        }
        // Otherwise a step is still running; nothing to do this scan.
        Ok(())
    }
}

/// Execute one step to a terminal or retryable state.
async fn execute_step(ctx: StepContext, instance: WorkflowInstance, step: WorkflowStep) {
    let logger = StepLogger::new(&instance.id, step.step_type.as_str());
    let span = logger.create_span();

    if let Err(e) = run_step(&ctx, &instance, &step, &logger).instrument(span).await {
        logger.log_error(&e.to_string());
        let updated = match ctx.store.record_step_failure(step.id, &e.to_string()).await {
            Ok(updated) => updated,
            Err(store_err) => {
                warn!(step_id = step.id, error = %store_err, "failed to record step failure");
                return;
            }
        };
        let event = if updated.status == WorkflowStatus::Failed {
            "step_failed"
        } else {
            "step_retry_scheduled"
        };
        let _ = ctx
            .store
            .append_execution_log(&instance.id, Some(step.id), event, Some(&e.to_string()))
            .await;
    }
}

async fn run_step(
    ctx: &StepContext,
    instance: &WorkflowInstance,
    step: &WorkflowStep,
    logger: &StepLogger,
) -> WorkerResult<()> {
    let configuration = ctx
        .store
        .get_configuration_version(&instance.config_name, instance.config_version)
        .await?;
    let wf_config = configuration.config;
    let task = ctx.store.get_task(instance.task_id).await?;

    let input = build_input(ctx, instance, step, &task, wf_config.segment_duration_seconds).await?;
    ctx.store.mark_step_running(step.id, &input).await?;

    let steps = ctx.store.list_steps(&instance.id).await?;
    let completed = steps.iter().filter(|s| s.status == WorkflowStatus::Completed).count();
    ctx.store
        .update_instance_progress(
            &instance.id,
            Some(step.step_type.as_str()),
            completed as f64 / steps.len().max(1) as f64,
        )
        .await?;
    ctx.store
        .append_execution_log(&instance.id, Some(step.id), "step_started", None)
        .await?;
    logger.log_start(&format!("attempt {}", step.retry_count + 1));

    let deadline = Duration::from_secs(wf_config.timeout_minutes.max(1) * 60);
    let handler = handle_step(ctx, instance, step, &task, &input);
    let output = match tokio::time::timeout(deadline, handler).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(WorkerError::StepTimeout {
                step: step.step_type.as_str().to_string(),
                minutes: wf_config.timeout_minutes,
            })
        }
    };

    ctx.store.complete_step(step.id, &output).await?;
    let completed = completed + 1;
    ctx.store
        .update_instance_progress(
            &instance.id,
            Some(step.step_type.as_str()),
            completed as f64 / steps.len().max(1) as f64,
        )
        .await?;
    ctx.store
        .append_execution_log(&instance.id, Some(step.id), "step_completed", None)
        .await?;
    logger.log_completion("output recorded");
    Ok(())
}

/// Assemble the typed input for a step from store state and the outputs
/// of its predecessors.
async fn build_input(
    ctx: &StepContext,
    instance: &WorkflowInstance,
    step: &WorkflowStep,
    task: &SubmissionTask,
    segment_seconds: u32,
) -> WorkerResult<StepInput> {
    match step.step_type {
        StepType::Clip => {
            let sources = ctx.store.list_sources(task.id).await?;
            if sources.is_empty() {
                return Err(WorkerError::MissingInput("task has no source videos"));
            }
            Ok(StepInput::Clip {
                sources: sources
                    .into_iter()
                    .map(|s| ClipSource {
                        file_path: s.file_path,
                        sort_order: s.sort_order,
                        start_time: s.start_time,
                        end_time: s.end_time,
                    })
                    .collect(),
            })
        }
        StepType::Merge => {
            let inputs = match completed_output(ctx, instance, StepType::Clip).await? {
                Some(StepOutput::Clip { outputs }) => outputs,
                _ => {
                    let sources = ctx.store.list_sources(task.id).await?;
                    if sources.is_empty() {
                        return Err(WorkerError::MissingInput("task has no source videos"));
                    }
                    sources.into_iter().map(|s| s.file_path).collect()
                }
            };
            Ok(StepInput::Merge { inputs })
        }
        StepType::Segment => {
            let input = match completed_output(ctx, instance, StepType::Merge).await? {
                Some(StepOutput::Merge { output, .. }) => output,
                _ => return Err(WorkerError::MissingInput("merge output")),
            };
            Ok(StepInput::Segment {
                input,
                segment_seconds,
            })
        }
        StepType::Upload => {
            let merged_id = ctx.store.list_merged(task.id).await?.last().map(|m| m.id);
            let segment_ids = ctx
                .store
                .list_segments(task.id)
                .await?
                .iter()
                .map(|s| s.id)
                .collect();
            Ok(StepInput::Upload {
                merged_id,
                segment_ids,
            })
        }
    }
}

async fn completed_output(
    ctx: &StepContext,
    instance: &WorkflowInstance,
    step_type: StepType,
) -> WorkerResult<Option<StepOutput>> {
    let steps = ctx.store.list_steps(&instance.id).await?;
    Ok(steps
        .into_iter()
        .find(|s| s.step_type == step_type && s.status == WorkflowStatus::Completed)
        .and_then(|s| s.output))
}

async fn handle_step(
    ctx: &StepContext,
    instance: &WorkflowInstance,
    step: &WorkflowStep,
    task: &SubmissionTask,
    input: &StepInput,
) -> WorkerResult<StepOutput> {
    match input {
        StepInput::Clip { sources } => run_clip(ctx, step.id, task.id, sources).await,
        StepInput::Merge { inputs } => run_merge(ctx, task.id, inputs).await,
        StepInput::Segment {
            input,
            segment_seconds,
        } => run_segment(ctx, task, input, *segment_seconds).await,
        StepInput::Upload { .. } => run_upload(ctx, instance, step.id, task.id).await,
    }
}

fn task_dir(ctx: &StepContext, task_id: i64) -> PathBuf {
    Path::new(&ctx.config.work_dir).join(format!("task_{task_id}"))
}

/// CLIP: apply per-source trims, producing one intermediate per source.
async fn run_clip(
    ctx: &StepContext,
    step_id: i64,
    task_id: i64,
    sources: &[ClipSource],
) -> WorkerResult<StepOutput> {
    let dir = task_dir(ctx, task_id);
    tokio::fs::create_dir_all(&dir).await?;

    let mut outputs = Vec::with_capacity(sources.len());
    for (done, source) in sources.iter().enumerate() {
        let start = parse_timecode(source.start_time.as_deref().unwrap_or(""))?;
        let end = parse_timecode(source.end_time.as_deref().unwrap_or(""))?;
        let output = dir.join(format!("clip_{:03}.mp4", source.sort_order));

        let mode = clip_source(&source.file_path, &output, start, end, &ctx.profile, None).await?;
        info!(input = %source.file_path, ?mode, "source clipped");
        outputs.push(output.to_string_lossy().to_string());

        ctx.store
            .update_step_progress(step_id, (done + 1) as f64 / sources.len() as f64)
            .await?;
    }

    Ok(StepOutput::Clip { outputs })
}

/// MERGE: concatenate the ordered inputs into a single artifact and
/// register it as the task's merged video.
async fn run_merge(ctx: &StepContext, task_id: i64, inputs: &[String]) -> WorkerResult<StepOutput> {
    let dir = task_dir(ctx, task_id);
    tokio::fs::create_dir_all(&dir).await?;
    let output = dir.join("merged.mp4");

    let duration_seconds = merge_files(inputs, &output, None).await?;
    let size = tokio::fs::metadata(&output).await?.len() as i64;

    let mut merged = MergedVideo::new(task_id, output.to_string_lossy().to_string(), duration_seconds);
    merged.upload = UploadState::new(size);
    ctx.store.insert_merged(&merged).await?;

    Ok(StepOutput::Merge {
        output: output.to_string_lossy().to_string(),
        duration_seconds,
    })
}

/// SEGMENT: split the merged artifact into duration-bounded parts. A
/// source shorter than the segment duration produces no parts; the merged
/// artifact is then uploaded directly instead.
async fn run_segment(
    ctx: &StepContext,
    task: &SubmissionTask,
    input: &str,
    segment_seconds: u32,
) -> WorkerResult<StepOutput> {
    let out_dir = task_dir(ctx, task.id).join("segments");

    let parts = match segment_file(input, &out_dir, &task.segment_prefix, segment_seconds, None).await
    {
        Ok(parts) => parts,
        Err(MediaError::NoSegments(_)) => {
            info!(task_id = task.id, "no segments produced, falling back to the merged artifact");
            return Ok(StepOutput::Segment {
                parts: Vec::new(),
                merged_fallback: true,
            });
        }
        Err(e) => return Err(e.into()),
    };

    let mut part_paths = Vec::with_capacity(parts.len());
    for (order, path) in parts.iter().enumerate() {
        let size = tokio::fs::metadata(path).await?.len() as i64;
        let mut segment = TaskOutputSegment::new(
            task.id,
            format!("{} P{}", task.segment_prefix, order + 1),
            path.to_string_lossy().to_string(),
            order as i64,
        );
        segment.upload = UploadState::new(size);
        ctx.store.insert_segment(&segment).await?;
        part_paths.push(path.to_string_lossy().to_string());
    }

    Ok(StepOutput::Segment {
        parts: part_paths,
        merged_fallback: false,
    })
}

/// UPLOAD: push every pending artifact, then publish. One failed artifact
/// never aborts the others; the step fails afterwards so the retry only
/// re-sends what is still missing a content id.
async fn run_upload(
    ctx: &StepContext,
    instance: &WorkflowInstance,
    step_id: i64,
    task_id: i64,
) -> WorkerResult<StepOutput> {
    let auth = ctx
        .auth
        .clone()
        .ok_or(WorkerError::Platform(PlatformError::NotLoggedIn))?;

    let segments = ctx.store.list_segments(task_id).await?;
    let mut artifacts: Vec<(ArtifactRef, String, UploadState)> = Vec::new();

    if segments.is_empty() {
        if let Some(merged) = ctx.store.list_merged(task_id).await?.into_iter().last() {
            if merged.upload.cid.is_none() {
                artifacts.push((ArtifactRef::Merged(merged.id), merged.file_path, merged.upload));
            }
        } else {
            return Err(WorkerError::MissingInput("no artifacts to upload"));
        }
    } else {
        for segment in segments {
            if segment.upload.cid.is_none() {
                artifacts.push((
                    ArtifactRef::Segment(segment.id),
                    segment.file_path,
                    segment.upload,
                ));
            }
        }
    }

    let total = artifacts.len();
    let semaphore = Arc::new(Semaphore::new(ctx.config.upload_concurrency));
    let completed = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::with_capacity(total);

    for (artifact, file_path, mut state) in artifacts {
        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| WorkerError::MissingInput("upload semaphore closed"))?;
        let store = ctx.store.clone();
        let client = ctx.client.clone();
        let auth = auth.clone();
        let completed = Arc::clone(&completed);
        let instance_id = instance.id.clone();

        handles.push(tokio::spawn(async move {
            let _permit = permit;
            let _ = artifact.set_status(&store, "uploading").await;
            let result =
                upload_artifact(&store, &client, &auth, artifact, &file_path, &mut state).await;
            match &result {
                Ok(_) => {
                    let _ = artifact.set_status(&store, "done").await;
                    completed.fetch_add(1, Ordering::SeqCst);
                }
                Err(e) => {
                    warn!(?artifact, error = %e, "artifact upload failed");
                    let _ = artifact.set_status(&store, "failed").await;
                    let _ = store
                        .append_execution_log(
                            &instance_id,
                            Some(step_id),
                            "artifact_upload_failed",
                            Some(&e.to_string()),
                        )
                        .await;
                }
            }
            result.is_ok()
        }));
    }

    let mut failed = 0usize;
    for handle in handles {
        match handle.await {
            Ok(true) => {}
            _ => failed += 1,
        }
        let done = completed.load(Ordering::SeqCst);
        if total > 0 {
            ctx.store
                .update_step_progress(step_id, done as f64 / total as f64)
                .await?;
        }
    }

    if failed > 0 {
        return Err(WorkerError::ArtifactUploads { failed, total });
    }

    let output = publish_task(&ctx.store, &ctx.client, &auth, task_id).await?;
    ctx.store
        .set_task_status(task_id, SubmissionStatus::Published, None)
        .await?;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use relive_models::TaskRelation;
    use relive_platform::ApiConfig;

    fn test_orchestrator(store: Store) -> Orchestrator {
        let client = ApiClient::new(ApiConfig::default()).unwrap();
        let (_tx, rx) = watch::channel(false);
        Orchestrator::new(store, client, None, WorkerConfig::default(), rx)
    }

    #[tokio::test]
    async fn test_schedule_creates_ordered_steps() {
        let store = Store::open_in_memory().await.unwrap();
        let task_id = store.insert_task(&SubmissionTask::new("vod", 17)).await.unwrap();
        store
            .insert_source(&TaskSourceVideo {
                id: 0,
                task_id,
                file_path: "/src/a.flv".to_string(),
                sort_order: 0,
                start_time: None,
                end_time: None,
            })
            .await
            .unwrap();

        let orchestrator = test_orchestrator(store.clone());
        let instance_id = orchestrator.schedule_task(task_id).await.unwrap();

        let steps = store.list_steps(&instance_id).await.unwrap();
        let types: Vec<StepType> = steps.iter().map(|s| s.step_type).collect();
        assert_eq!(
            types,
            vec![StepType::Clip, StepType::Merge, StepType::Segment, StepType::Upload]
        );
        let orders: Vec<i64> = steps.iter().map(|s| s.step_order).collect();
        assert_eq!(orders, vec![0, 1, 2, 3]);

        let task = store.get_task(task_id).await.unwrap();
        assert_eq!(task.status, SubmissionStatus::Processing);
    }

    #[tokio::test]
    async fn test_schedule_materializes_sources_from_downloads() {
        let store = Store::open_in_memory().await.unwrap();
        let task_id = store.insert_task(&SubmissionTask::new("vod", 17)).await.unwrap();

        // Two finished downloads linked in reverse insertion order.
        for part in [2i64, 1] {
            let dl = relive_models::VideoDownload::new(
                "BV1xx",
                format!("part {part}"),
                format!("/dl/p{part}.mp4"),
                part,
                2,
            );
            let dl_id = store.insert_download(&dl).await.unwrap();
            store
                .insert_relation(&TaskRelation::integrated(dl_id, task_id))
                .await
                .unwrap();
        }

        let orchestrator = test_orchestrator(store.clone());
        orchestrator.schedule_task(task_id).await.unwrap();

        let sources = store.list_sources(task_id).await.unwrap();
        assert_eq!(sources.len(), 2);
        // Ordered by part index, not insertion order.
        assert_eq!(sources[0].file_path, "/dl/p1.mp4");
        assert_eq!(sources[1].file_path, "/dl/p2.mp4");
    }

    #[tokio::test]
    async fn test_promotion_waits_for_all_downloads() {
        let store = Store::open_in_memory().await.unwrap();
        let task_id = store.insert_task(&SubmissionTask::new("vod", 17)).await.unwrap();

        let mut ids = Vec::new();
        for part in [1i64, 2] {
            let dl = relive_models::VideoDownload::new(
                "BV1xx",
                format!("part {part}"),
                format!("/dl/p{part}.mp4"),
                part,
                2,
            );
            let dl_id = store.insert_download(&dl).await.unwrap();
            store
                .insert_relation(&TaskRelation::integrated(dl_id, task_id))
                .await
                .unwrap();
            ids.push(dl_id);
        }

        let orchestrator = test_orchestrator(store.clone());

        // Only one download done: nothing is scheduled yet.
        store.set_download_status(ids[0], DownloadStatus::Done).await.unwrap();
        orchestrator.promote_ready_tasks().await.unwrap();
        assert!(store.list_instances_for_task(task_id).await.unwrap().is_empty());

        // Second one done: the workflow starts.
        store.set_download_status(ids[1], DownloadStatus::Done).await.unwrap();
        orchestrator.promote_ready_tasks().await.unwrap();
        let instances = store.list_instances_for_task(task_id).await.unwrap();
        assert_eq!(instances.len(), 1);

        let relations = store.list_relations_for_task(task_id).await.unwrap();
        assert!(relations
            .iter()
            .all(|r| r.workflow_status == RelationStatus::WorkflowStarted));
    }

    #[tokio::test]
    async fn test_failed_download_fails_the_task() {
        let store = Store::open_in_memory().await.unwrap();
        let task_id = store.insert_task(&SubmissionTask::new("vod", 17)).await.unwrap();

        let dl = relive_models::VideoDownload::new("BV1xx", "part 1", "/dl/p1.mp4", 1, 1);
        let dl_id = store.insert_download(&dl).await.unwrap();
        store
            .insert_relation(&TaskRelation::integrated(dl_id, task_id))
            .await
            .unwrap();
        store.fail_download(dl_id, "403 from every mirror").await.unwrap();

        let orchestrator = test_orchestrator(store.clone());
        orchestrator.promote_ready_tasks().await.unwrap();

        let task = store.get_task(task_id).await.unwrap();
        assert_eq!(task.status, SubmissionStatus::Failed);
        assert!(store.list_instances_for_task(task_id).await.unwrap().is_empty());

        let relations = store.list_relations_for_task(task_id).await.unwrap();
        assert_eq!(relations[0].workflow_status, RelationStatus::DownloadFailed);
        assert_eq!(relations[0].retry_count, 1);
    }

    #[tokio::test]
    async fn test_merge_input_prefers_clip_outputs() {
        let store = Store::open_in_memory().await.unwrap();
        let task_id = store.insert_task(&SubmissionTask::new("vod", 17)).await.unwrap();
        store
            .insert_source(&TaskSourceVideo {
                id: 0,
                task_id,
                file_path: "/src/a.flv".to_string(),
                sort_order: 0,
                start_time: None,
                end_time: None,
            })
            .await
            .unwrap();

        let orchestrator = test_orchestrator(store.clone());
        let instance_id = orchestrator.schedule_task(task_id).await.unwrap();
        let instance = store.get_instance(&instance_id).await.unwrap();
        let steps = store.list_steps(&instance_id).await.unwrap();

        // Without a completed CLIP step, MERGE reads the raw sources.
        let task = store.get_task(task_id).await.unwrap();
        let input = build_input(&orchestrator.ctx, &instance, &steps[1], &task, 300)
            .await
            .unwrap();
        assert_eq!(
            input,
            StepInput::Merge {
                inputs: vec!["/src/a.flv".to_string()]
            }
        );

        // After CLIP completes, MERGE consumes its outputs.
        store
            .complete_step(
                steps[0].id,
                &StepOutput::Clip {
                    outputs: vec!["/work/task_1/clip_000.mp4".to_string()],
                },
            )
            .await
            .unwrap();
        let input = build_input(&orchestrator.ctx, &instance, &steps[1], &task, 300)
            .await
            .unwrap();
        assert_eq!(
            input,
            StepInput::Merge {
                inputs: vec!["/work/task_1/clip_000.mp4".to_string()]
            }
        );
    }

    #[tokio::test]
    async fn test_segment_input_requires_merge_output() {
        let store = Store::open_in_memory().await.unwrap();
        let task_id = store.insert_task(&SubmissionTask::new("vod", 17)).await.unwrap();
        store
            .insert_source(&TaskSourceVideo {
                id: 0,
                task_id,
                file_path: "/src/a.flv".to_string(),
                sort_order: 0,
                start_time: None,
                end_time: None,
            })
            .await
            .unwrap();

        let orchestrator = test_orchestrator(store.clone());
        let instance_id = orchestrator.schedule_task(task_id).await.unwrap();
        let instance = store.get_instance(&instance_id).await.unwrap();
        let steps = store.list_steps(&instance_id).await.unwrap();
        let task = store.get_task(task_id).await.unwrap();

        let result = build_input(&orchestrator.ctx, &instance, &steps[2], &task, 300).await;
        assert!(matches!(result, Err(WorkerError::MissingInput(_))));
    }

    #[tokio::test]
    async fn test_finalize_failure_propagates_to_task() {
        let store = Store::open_in_memory().await.unwrap();
        let task_id = store.insert_task(&SubmissionTask::new("vod", 17)).await.unwrap();
        store
            .insert_source(&TaskSourceVideo {
                id: 0,
                task_id,
                file_path: "/src/a.flv".to_string(),
                sort_order: 0,
                start_time: None,
                end_time: None,
            })
            .await
            .unwrap();

        let orchestrator = test_orchestrator(store.clone());
        let instance_id = orchestrator.schedule_task(task_id).await.unwrap();
        let steps = store.list_steps(&instance_id).await.unwrap();

        // Exhaust the retry budget of the first step.
        for _ in 0..3 {
            store.record_step_failure(steps[0].id, "ffmpeg exploded").await.unwrap();
        }
        let instance = store.get_instance(&instance_id).await.unwrap();
        orchestrator.finalize_if_done(&instance).await.unwrap();

        let instance = store.get_instance(&instance_id).await.unwrap();
        assert_eq!(instance.status, WorkflowStatus::Failed);
        let task = store.get_task(task_id).await.unwrap();
        assert_eq!(task.status, SubmissionStatus::Failed);
    }

    #[tokio::test]
    async fn test_retry_instance_resets_failed_step() {
        let store = Store::open_in_memory().await.unwrap();
        let task_id = store.insert_task(&SubmissionTask::new("vod", 17)).await.unwrap();
        store
            .insert_source(&TaskSourceVideo {
                id: 0,
                task_id,
                file_path: "/src/a.flv".to_string(),
                sort_order: 0,
                start_time: None,
                end_time: None,
            })
            .await
            .unwrap();

        let orchestrator = test_orchestrator(store.clone());
        let instance_id = orchestrator.schedule_task(task_id).await.unwrap();
        let steps = store.list_steps(&instance_id).await.unwrap();

        store
            .complete_step(steps[0].id, &StepOutput::Clip { outputs: vec!["/c0.mp4".into()] })
            .await
            .unwrap();
        for _ in 0..3 {
            store.record_step_failure(steps[1].id, "merge exploded").await.unwrap();
        }
        store.fail_instance(&instance_id, "merge exploded").await.unwrap();

        orchestrator.retry_instance(&instance_id).await.unwrap();

        let next = store.next_eligible_step(&instance_id).await.unwrap().unwrap();
        assert_eq!(next.step_type, StepType::Merge);
        assert_eq!(next.retry_count, 0);
        // The CLIP output survives for reuse.
        let clip = store.get_step(steps[0].id).await.unwrap();
        assert!(clip.output.is_some());
    }
}
