//! Sync mirror worker pool.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use relive_models::{SyncStatus, SyncTask};
use relive_store::Store;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::pcs::{is_auth_expired, join_remote_path, should_attempt_relogin, PcsCli, UploadPolicy};

/// Sync worker tunables.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Concurrent uploads
    pub concurrency: usize,
    /// Poll interval for pending jobs
    pub scan_interval_secs: u64,
    pub policy: UploadPolicy,
    /// Login token for automatic relogin when the session expires
    pub bduss: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            scan_interval_secs: 5,
            policy: UploadPolicy::Overwrite,
            bduss: None,
        }
    }
}

/// Timestamp of the last automatic relogin attempt, shared across
/// in-flight uploads so expiry failures do not stampede the login.
type ReloginClock = Arc<Mutex<Option<DateTime<Utc>>>>;

/// Bounded pool draining PENDING sync jobs from the store.
pub struct SyncWorkerPool {
    store: Store,
    cli: PcsCli,
    config: SyncConfig,
    shutdown: watch::Receiver<bool>,
    /// Cancel handles for in-flight uploads, keyed by task id
    running: Arc<Mutex<HashMap<i64, watch::Sender<bool>>>>,
    last_relogin: ReloginClock,
}

impl SyncWorkerPool {
    pub fn new(
        store: Store,
        cli: PcsCli,
        config: SyncConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            cli,
            config,
            shutdown,
            running: Arc::new(Mutex::new(HashMap::new())),
            last_relogin: Arc::new(Mutex::new(None)),
        }
    }

    /// Pause an in-flight or pending job. The CLI keeps its own resume
    /// state, so killing the child loses no progress.
    pub async fn pause(&self, task_id: i64) -> SyncResult<()> {
        self.store.pause_sync_task(task_id).await?;
        if let Some(cancel) = self.running.lock().ok().and_then(|mut m| m.remove(&task_id)) {
            let _ = cancel.send(true);
        }
        Ok(())
    }

    /// Cancel a job that has not succeeded.
    pub async fn cancel(&self, task_id: i64) -> SyncResult<()> {
        self.store.cancel_sync_task(task_id).await?;
        if let Some(cancel) = self.running.lock().ok().and_then(|mut m| m.remove(&task_id)) {
            let _ = cancel.send(true);
        }
        Ok(())
    }

    /// Claim-and-run loop until shutdown.
    pub async fn run(mut self) {
        info!(concurrency = self.config.concurrency, "sync worker pool started");
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = self.shutdown.changed() => continue,
            };

            let task = match self.store.claim_next_pending_sync().await {
                Ok(Some(task)) => task,
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(self.config.scan_interval_secs)) => {}
                        _ = self.shutdown.changed() => {}
                    }
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "sync claim failed");
                    drop(permit);
                    tokio::time::sleep(Duration::from_secs(self.config.scan_interval_secs)).await;
                    continue;
                }
            };

            let (cancel_tx, cancel_rx) = watch::channel(false);
            if let Ok(mut running) = self.running.lock() {
                running.insert(task.id, cancel_tx);
            }

            let store = self.store.clone();
            let cli = self.cli.clone();
            let config = self.config.clone();
            let running = Arc::clone(&self.running);
            let last_relogin = Arc::clone(&self.last_relogin);
            tokio::spawn(async move {
                let task_id = task.id;
                let outcome =
                    run_sync_task(&store, &cli, task, &config, cancel_rx, &last_relogin).await;
                if let Ok(mut map) = running.lock() {
                    map.remove(&task_id);
                }
                if let Err(e) = outcome {
                    warn!(task_id, error = %e, "sync task errored");
                }
                drop(permit);
            });
        }

        info!("sync worker pool stopped");
    }
}

/// Drive one claimed job to a terminal or retryable state.
async fn run_sync_task(
    store: &Store,
    cli: &PcsCli,
    task: SyncTask,
    config: &SyncConfig,
    cancel_rx: watch::Receiver<bool>,
    last_relogin: &ReloginClock,
) -> SyncResult<()> {
    info!(
        task_id = task.id,
        local = %task.local_path,
        remote = %task.remote_path(),
        "sync upload starting"
    );

    // The CLI does not create missing remote directories on upload
    if let Err(e) = cli.mkdir(&task.remote_dir).await {
        debug!(task_id = task.id, error = %e, "remote mkdir failed, may already exist");
    }

    let (progress_tx, mut progress_rx) = mpsc::channel::<f64>(16);
    let progress_store = store.clone();
    let progress_task_id = task.id;
    let progress_handle = tokio::spawn(async move {
        let mut last = -1.0f64;
        while let Some(progress) = progress_rx.recv().await {
            // Progress never regresses within one attempt
            if progress > last {
                last = progress;
                let _ = progress_store
                    .update_sync_progress(progress_task_id, progress)
                    .await;
            }
        }
    });

    let upload = cli
        .upload(
            &task.local_path,
            &task.remote_dir,
            config.policy,
            progress_tx,
            cancel_rx,
        )
        .await;
    let _ = progress_handle.await;

    match upload {
        Ok(_) => finish_upload(store, cli, &task).await,
        Err(SyncError::Paused) => {
            // Status was already moved to PAUSED by the pause call
            info!(task_id = task.id, "sync upload paused");
            Ok(())
        }
        Err(e) => {
            let auth_expired = is_auth_expired(&e);
            let status = store.record_sync_failure(task.id, &e.to_string()).await?;
            warn!(task_id = task.id, ?status, error = %e, "sync upload failed");

            if auth_expired
                && relogin_after_expiry(cli, config.bduss.as_deref(), last_relogin).await
            {
                // Failures so far were the session's fault, not the
                // transfer's, so the retry budget starts over
                store.retry_sync_task(task.id).await?;
                info!(task_id = task.id, "sync task requeued after relogin");
            }
            Ok(())
        }
    }
}

/// Throttled relogin after an auth-expired failure. Returns true when
/// a new session was established.
async fn relogin_after_expiry(
    cli: &PcsCli,
    bduss: Option<&str>,
    last_relogin: &ReloginClock,
) -> bool {
    let Some(bduss) = bduss else {
        warn!("cloud session expired and no BDUSS is configured for relogin");
        return false;
    };

    let now = Utc::now();
    {
        let Ok(mut last) = last_relogin.lock() else {
            return false;
        };
        if !should_attempt_relogin(*last, now) {
            debug!("relogin throttled, skipping");
            return false;
        }
        *last = Some(now);
    }

    match cli.login_with_bduss(bduss).await {
        Ok(()) => {
            info!("cloud relogin succeeded");
            true
        }
        Err(e) => {
            warn!(error = %e, "cloud relogin failed");
            false
        }
    }
}

/// Rename to the requested remote name and verify the copy is non-empty.
async fn finish_upload(store: &Store, cli: &PcsCli, task: &SyncTask) -> SyncResult<()> {
    let local_name = std::path::Path::new(&task.local_path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();

    let mut remote_path = join_remote_path(&task.remote_dir, local_name);
    if task.remote_name != local_name {
        let target = task.remote_path();
        if let Err(e) = cli.rename(&remote_path, &target).await {
            warn!(task_id = task.id, error = %e, "remote rename failed");
        } else {
            remote_path = target;
        }
    }

    match cli.remote_size(&remote_path).await {
        Ok(0) => {
            let err = SyncError::EmptyRemoteFile;
            let status = store.record_sync_failure(task.id, &err.to_string()).await?;
            warn!(task_id = task.id, ?status, "remote copy is empty");
        }
        Ok(size) => {
            store.update_sync_progress(task.id, 100.0).await?;
            store
                .set_sync_status(task.id, SyncStatus::Success, None)
                .await?;
            info!(task_id = task.id, size, remote = %remote_path, "sync upload verified");
        }
        Err(e) => {
            let status = store.record_sync_failure(task.id, &e.to_string()).await?;
            warn!(task_id = task.id, ?status, error = %e, "remote verification failed");
        }
    }
    Ok(())
}
