//! Cloud mirror enqueue scan.
//!
//! Periodically walks sync-enabled rooms and queues a sync task for every
//! finished recording that is not already mirrored. The sync worker pool
//! picks the tasks up from the store; this scan only feeds the queue.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use relive_models::{RecordingStatus, SyncTask};
use relive_store::Store;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::WorkerResult;

/// Scan loop until shutdown.
pub async fn run_mirror_enqueue(
    store: Store,
    sync_remote_root: String,
    sync_max_retries: i64,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(remote_root = %sync_remote_root, "mirror enqueue scan started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        match enqueue_pending(&store, &sync_remote_root, sync_max_retries).await {
            Ok(0) => {}
            Ok(queued) => info!(queued, "recordings queued for cloud mirror"),
            Err(e) => warn!(error = %e, "mirror enqueue scan failed"),
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => {}
        }
    }

    info!("mirror enqueue scan stopped");
}

/// Queue every completed, non-empty recording of a sync-enabled room that
/// has no sync task yet. Returns how many tasks were created.
pub async fn enqueue_pending(
    store: &Store,
    sync_remote_root: &str,
    sync_max_retries: i64,
) -> WorkerResult<usize> {
    let known: HashSet<String> = store
        .list_sync_tasks()
        .await?
        .into_iter()
        .map(|t| t.local_path)
        .collect();

    let mut queued = 0;
    for anchor in store.list_anchors().await? {
        if !anchor.sync_enabled {
            continue;
        }
        let remote_dir = anchor
            .sync_path
            .clone()
            .unwrap_or_else(|| format!("{}/{}", sync_remote_root.trim_end_matches('/'), anchor.name));

        for recording in store.list_recordings(anchor.room_id).await? {
            if recording.status != RecordingStatus::Completed || recording.file_size <= 0 {
                continue;
            }
            if known.contains(&recording.file_path) {
                continue;
            }
            let remote_name = match Path::new(&recording.file_path)
                .file_name()
                .and_then(|n| n.to_str())
            {
                Some(name) => name.to_string(),
                None => {
                    warn!(path = %recording.file_path, "recording has no usable file name, skipped");
                    continue;
                }
            };

            let task = SyncTask::new(
                recording.file_path.clone(),
                remote_dir.clone(),
                remote_name,
                sync_max_retries,
            );
            store.insert_sync_task(&task).await?;
            queued += 1;
        }
    }

    Ok(queued)
}

#[cfg(test)]
mod tests {
    use super::*;
    use relive_models::{Anchor, LiveRecordTask};

    async fn completed_recording(store: &Store, room_id: i64, path: &str, size: i64) {
        let rec = LiveRecordTask::open(room_id, 1, path, None);
        let id = store.insert_recording(&rec).await.unwrap();
        store.complete_recording(id, size).await.unwrap();
    }

    #[tokio::test]
    async fn test_enqueue_only_completed_synced_rooms() {
        let store = Store::open_in_memory().await.unwrap();

        let mut synced = Anchor::new(100, "alice");
        synced.sync_enabled = true;
        store.upsert_anchor(&synced).await.unwrap();
        let unsynced = Anchor::new(200, "bob");
        store.upsert_anchor(&unsynced).await.unwrap();

        completed_recording(&store, 100, "/rec/alice_1.flv", 1024).await;
        completed_recording(&store, 200, "/rec/bob_1.flv", 1024).await;
        // Still recording: not eligible.
        let live = LiveRecordTask::open(100, 2, "/rec/alice_2.flv", None);
        store.insert_recording(&live).await.unwrap();

        let queued = enqueue_pending(&store, "/backup", 2).await.unwrap();
        assert_eq!(queued, 1);

        let tasks = store.list_sync_tasks().await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].local_path, "/rec/alice_1.flv");
        assert_eq!(tasks[0].remote_dir, "/backup/alice");
        assert_eq!(tasks[0].remote_name, "alice_1.flv");
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent() {
        let store = Store::open_in_memory().await.unwrap();

        let mut anchor = Anchor::new(100, "alice");
        anchor.sync_enabled = true;
        store.upsert_anchor(&anchor).await.unwrap();
        completed_recording(&store, 100, "/rec/alice_1.flv", 1024).await;

        assert_eq!(enqueue_pending(&store, "/backup", 2).await.unwrap(), 1);
        assert_eq!(enqueue_pending(&store, "/backup", 2).await.unwrap(), 0);
        assert_eq!(store.list_sync_tasks().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_explicit_sync_path_wins_over_root() {
        let store = Store::open_in_memory().await.unwrap();

        let mut anchor = Anchor::new(100, "alice");
        anchor.sync_enabled = true;
        anchor.sync_path = Some("/custom/alice-vods".to_string());
        store.upsert_anchor(&anchor).await.unwrap();
        completed_recording(&store, 100, "/rec/alice_1.flv", 1024).await;

        enqueue_pending(&store, "/backup", 2).await.unwrap();
        let tasks = store.list_sync_tasks().await.unwrap();
        assert_eq!(tasks[0].remote_dir, "/custom/alice-vods");
    }

    #[tokio::test]
    async fn test_empty_recordings_are_skipped() {
        let store = Store::open_in_memory().await.unwrap();

        let mut anchor = Anchor::new(100, "alice");
        anchor.sync_enabled = true;
        store.upsert_anchor(&anchor).await.unwrap();
        completed_recording(&store, 100, "/rec/alice_empty.flv", 0).await;

        assert_eq!(enqueue_pending(&store, "/backup", 2).await.unwrap(), 0);
    }
}
