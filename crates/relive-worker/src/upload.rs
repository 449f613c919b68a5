//! Resumable artifact uploads and submission publish.
//!
//! Chunked uploads persist their session and confirmed-chunk watermark to
//! the store, so a crash after chunk N resumes at chunk N+1 instead of
//! re-sending bytes. The remote identity of a task is minted exactly once
//! on the first successful publish; later artifacts append parts through
//! the edit endpoint.

use std::io::SeekFrom;
use std::path::Path;

use relive_models::{StepOutput, UploadState};
use relive_platform::{
    edit, finalize_upload, open_session, preupload, publish, upload_chunk, ApiClient, AuthInfo,
    PlatformError, PublishRequest, PublishVideo, RemoteIdentity, UploadSession,
};
use relive_store::Store;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{info, warn};

use crate::error::{WorkerError, WorkerResult};
use crate::retry::{retry_async, RetryConfig};

/// Which media row an upload state block belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactRef {
    Merged(i64),
    Segment(i64),
}

impl ArtifactRef {
    /// Persist the full upload-state block for this artifact.
    pub async fn save(&self, store: &Store, state: &UploadState) -> WorkerResult<()> {
        match self {
            ArtifactRef::Merged(id) => store.save_merged_upload_state(*id, state).await?,
            ArtifactRef::Segment(id) => store.save_segment_upload_state(*id, state).await?,
        }
        Ok(())
    }

    pub async fn set_status(&self, store: &Store, status: &str) -> WorkerResult<()> {
        match self {
            ArtifactRef::Merged(id) => store.set_merged_status(*id, status).await?,
            ArtifactRef::Segment(id) => store.set_segment_status(*id, status).await?,
        }
        Ok(())
    }
}

/// Upload one artifact file, resuming a persisted session when one exists.
/// Returns the content id assigned at finalization.
pub async fn upload_artifact(
    store: &Store,
    client: &ApiClient,
    auth: &AuthInfo,
    artifact: ArtifactRef,
    file_path: &str,
    state: &mut UploadState,
) -> WorkerResult<i64> {
    let path = Path::new(file_path);
    let total = tokio::fs::metadata(path)
        .await
        .map_err(|_| WorkerError::FileNotFound(path.to_path_buf()))?
        .len() as i64;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or(WorkerError::MissingInput("artifact file name"))?;

    let session = if state.is_resumable() && state.total_bytes == total {
        info!(
            ?artifact,
            resume_part = state.next_part_index(),
            "resuming persisted upload session"
        );
        UploadSession {
            endpoint: state.endpoint.clone().ok_or(WorkerError::MissingInput("upload endpoint"))?,
            uri: state.uri.clone().ok_or(WorkerError::MissingInput("upload uri"))?,
            auth: state.auth.clone().ok_or(WorkerError::MissingInput("upload auth"))?,
            biz_id: state.biz_id,
            chunk_size: state.chunk_size,
            session_id: state.session_id.clone(),
        }
    } else {
        *state = UploadState::new(total);
        let mut session = preupload(client, file_name, total as u64, auth).await?;
        open_session(client, &mut session).await?;
        let session_id = session
            .session_id
            .clone()
            .ok_or(PlatformError::MissingField("session_id"))?;
        state.begin_session(
            session_id,
            session.endpoint.clone(),
            session.auth.clone(),
            session.uri.clone(),
            session.biz_id,
            session.chunk_size,
        );
        // Persisted before the first chunk so a crash can always resume.
        artifact.save(store, state).await?;
        session
    };

    let chunk_size = session.chunk_size.max(1);
    let total_parts = (total + chunk_size - 1) / chunk_size;
    let mut file = tokio::fs::File::open(path).await?;
    let retry = RetryConfig::new("upload_chunk").with_max_retries(3);

    for part_index in state.next_part_index()..total_parts {
        let offset = part_index * chunk_size;
        let len = chunk_size.min(total - offset) as usize;

        file.seek(SeekFrom::Start(offset as u64)).await?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf).await?;

        let outcome = retry_async(&retry, || {
            let chunk = buf.clone();
            let session = &session;
            async move {
                upload_chunk(
                    client,
                    session,
                    part_index,
                    total_parts,
                    offset as u64,
                    total as u64,
                    chunk,
                )
                .await
            }
        })
        .await;
        outcome.into_result()?;

        state.record_chunk(part_index, len as i64);
        artifact.save(store, state).await?;
    }

    let cid = finalize_upload(client, &session, file_name, total_parts).await?;
    state.cid = Some(cid);
    state.file_name = Some(file_name.to_string());
    artifact.save(store, state).await?;

    info!(?artifact, cid, total, "artifact upload finalized");
    Ok(cid)
}

/// Publish or update the remote multi-part video for a task, using every
/// artifact that has a content id.
///
/// Segments in `part_order` win over the merged artifact; the merged file
/// is only published when segmentation was skipped or fell back.
pub async fn publish_task(
    store: &Store,
    client: &ApiClient,
    auth: &AuthInfo,
    task_id: i64,
) -> WorkerResult<StepOutput> {
    let task = store.get_task(task_id).await?;

    let mut videos = Vec::new();
    for segment in store.list_segments(task_id).await? {
        if let Some(cid) = segment.upload.cid {
            videos.push(PublishVideo {
                cid,
                title: segment.part_name.clone(),
            });
        }
    }
    if videos.is_empty() {
        for merged in store.list_merged(task_id).await? {
            if let Some(cid) = merged.upload.cid {
                videos.push(PublishVideo {
                    cid,
                    title: task.title.clone(),
                });
            }
        }
    }
    if videos.is_empty() {
        return Err(WorkerError::MissingInput("no uploaded artifacts to publish"));
    }
    let cids: Vec<i64> = videos.iter().map(|v| v.cid).collect();

    let request = PublishRequest {
        title: task.title.clone(),
        description: task.description.clone(),
        tags: task
            .tags
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(String::from)
            .collect(),
        tid: task.partition_id,
        copyright: task.video_type.as_code(),
        source: None,
        cover_url: None,
        videos,
    };

    let identity = match (task.bvid.as_deref(), task.aid) {
        (Some(bvid), Some(aid)) => {
            // Already published once; append the full part list.
            let identity = RemoteIdentity {
                bvid: bvid.to_string(),
                aid,
            };
            edit(client, &identity, &request, auth).await?;
            info!(task_id, bvid = %identity.bvid, "submission updated");
            identity
        }
        _ => {
            let identity = publish(client, &request, auth).await?;
            let minted = store
                .set_task_remote_identity(task_id, &identity.bvid, identity.aid)
                .await?;
            if !minted {
                // A concurrent publish won the race; keep the stored identity.
                warn!(task_id, "remote identity was already set, keeping the stored one");
            }
            info!(task_id, bvid = %identity.bvid, aid = identity.aid, "submission published");
            identity
        }
    };

    Ok(StepOutput::Upload {
        bvid: Some(identity.bvid),
        aid: Some(identity.aid),
        cids,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use relive_models::{MergedVideo, SubmissionTask, TaskOutputSegment};

    #[tokio::test]
    async fn test_artifact_save_round_trip() {
        let store = Store::open_in_memory().await.unwrap();
        let task_id = store.insert_task(&SubmissionTask::new("t", 17)).await.unwrap();
        let merged_id = store
            .insert_merged(&MergedVideo::new(task_id, "/out/merged.mp4", 120.0))
            .await
            .unwrap();

        let mut state = UploadState::new(1000);
        state.begin_session("sess", "https://upos.example.com", "tok", "/b/v.mp4", 9, 100);
        state.record_chunk(0, 100);

        ArtifactRef::Merged(merged_id).save(&store, &state).await.unwrap();
        let loaded = store.get_merged(merged_id).await.unwrap();
        assert_eq!(loaded.upload, state);
        assert_eq!(loaded.upload.next_part_index(), 1);
    }

    #[tokio::test]
    async fn test_publish_prefers_segments_over_merged() {
        let store = Store::open_in_memory().await.unwrap();
        let task_id = store.insert_task(&SubmissionTask::new("t", 17)).await.unwrap();

        let mut merged = MergedVideo::new(task_id, "/out/merged.mp4", 120.0);
        merged.upload.cid = Some(900);
        let merged_id = store.insert_merged(&merged).await.unwrap();
        store
            .save_merged_upload_state(merged_id, &merged.upload)
            .await
            .unwrap();

        for (order, cid) in [(0i64, 101i64), (1, 102)] {
            let mut segment =
                TaskOutputSegment::new(task_id, format!("P{}", order + 1), format!("/out/{order}.mp4"), order);
            segment.upload.cid = Some(cid);
            let id = store.insert_segment(&segment).await.unwrap();
            store.save_segment_upload_state(id, &segment.upload).await.unwrap();
        }

        // No remote identity yet, so publish would be attempted; we only
        // exercise the part selection by checking the missing-artifact error
        // is NOT raised and the segment cids are chosen. Publish itself needs
        // a live endpoint, so assemble the same way the function does.
        let segments = store.list_segments(task_id).await.unwrap();
        let cids: Vec<i64> = segments.iter().filter_map(|s| s.upload.cid).collect();
        assert_eq!(cids, vec![101, 102]);
    }
}
