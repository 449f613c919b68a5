//! Download worker pool.
//!
//! Drains pending part-download jobs from the store on a bounded number
//! of workers. Each job resolves fresh play URLs, fetches through aria2c
//! (falling back to a plain streaming GET), muxes DASH streams, verifies
//! the result against the expected duration and flips any task relations
//! waiting on it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::StreamExt;
use relive_models::{DownloadStatus, RelationStatus, VideoDownload};
use relive_platform::{
    get_video_view, resolve_play_selection, ApiClient, AuthInfo, PlaySelection, PlayUrlRequest,
};
use relive_store::Store;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::retry::FailureTracker;

const REFERER: &str = "https://www.bilibili.com";
const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";

/// Minimum slack before a short file counts as incomplete.
const COMPLETENESS_SLACK_SECS: f64 = 10.0;
/// Files at least this fraction of the expected duration pass.
const COMPLETENESS_RATIO: f64 = 0.9;

/// Bounded pool draining pending downloads from the store.
pub struct DownloadWorkerPool {
    store: Store,
    client: ApiClient,
    auth: Option<AuthInfo>,
    config: WorkerConfig,
    shutdown: watch::Receiver<bool>,
    /// Cancel handles for in-flight jobs, keyed by download id
    running: Arc<Mutex<HashMap<i64, watch::Sender<bool>>>>,
}

impl DownloadWorkerPool {
    pub fn new(
        store: Store,
        client: ApiClient,
        auth: Option<AuthInfo>,
        config: WorkerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            client,
            auth,
            config,
            shutdown,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Enqueue a new job, applying queue backpressure.
    pub async fn submit(&self, dl: &VideoDownload) -> WorkerResult<i64> {
        let active = self.store.count_active_downloads().await?;
        if active >= self.config.download_queue_limit {
            return Err(WorkerError::QueueFull {
                active,
                limit: self.config.download_queue_limit,
            });
        }
        Ok(self.store.insert_download(dl).await?)
    }

    /// Cooperative pause: the persisted byte offset survives for resume.
    pub async fn pause(&self, id: i64) -> WorkerResult<()> {
        self.store.pause_download(id).await?;
        if let Some(cancel) = self.running.lock().ok().and_then(|mut m| m.remove(&id)) {
            let _ = cancel.send(true);
        }
        Ok(())
    }

    /// Re-queue a paused job; the worker reopens from the saved offset.
    pub async fn resume(&self, id: i64) -> WorkerResult<()> {
        self.store.resume_download(id).await?;
        Ok(())
    }

    /// Explicit retry of a failed job, restarting from zero.
    pub async fn retry(&self, id: i64) -> WorkerResult<()> {
        self.store.retry_download(id).await?;
        Ok(())
    }

    /// Claim-and-run loop until shutdown.
    pub async fn run(mut self) {
        info!(threads = self.config.download_threads, "download pool started");
        let semaphore = Arc::new(Semaphore::new(self.config.download_threads));
        let mut claim_failures = FailureTracker::new(3);

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

            let dl = match self.store.claim_next_pending_download().await {
                Ok(Some(dl)) => {
                    claim_failures.record_success();
                    dl
                }
                Ok(None) => {
                    claim_failures.record_success();
                    drop(permit);
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.scan_interval) => {}
                        _ = self.shutdown.changed() => {}
                    }
                    continue;
                }
                Err(e) => {
                    if claim_failures.record_failure() {
                        warn!(error = %e, "download claim failed");
                    }
                    drop(permit);
                    tokio::time::sleep(self.config.scan_interval).await;
                    continue;
                }
            };

            let (cancel_tx, cancel_rx) = watch::channel(false);
            if let Ok(mut running) = self.running.lock() {
                running.insert(dl.id, cancel_tx);
            }

            let store = self.store.clone();
            let client = self.client.clone();
            let auth = self.auth.clone();
            let config = self.config.clone();
            let running = Arc::clone(&self.running);
            tokio::spawn(async move {
                let id = dl.id;
                let outcome = run_download_job(&store, &client, auth.as_ref(), &config, dl, cancel_rx).await;
                if let Ok(mut map) = running.lock() {
                    map.remove(&id);
                }
                match outcome {
                    Ok(()) => {}
                    Err(WorkerError::Paused) => info!(download_id = id, "download paused"),
                    Err(e) => {
                        warn!(download_id = id, error = %e, "download failed");
                        if let Err(e) = record_failure(&store, id, &e).await {
                            warn!(download_id = id, error = %e, "failed to record download failure");
                        }
                    }
                }
                drop(permit);
            });
        }

        info!("download pool stopped");
    }
}

/// Drive one claimed job from URL resolution to a verified local file.
async fn run_download_job(
    store: &Store,
    client: &ApiClient,
    auth: Option<&AuthInfo>,
    config: &WorkerConfig,
    dl: VideoDownload,
    cancel_rx: watch::Receiver<bool>,
) -> WorkerResult<()> {
    info!(download_id = dl.id, bvid = %dl.bvid, part = dl.part_index, "download starting");

    let out_path = PathBuf::from(&dl.local_path);
    if let Some(parent) = out_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    // Play URLs expire, so each attempt resolves afresh.
    let view = get_video_view(client, Some(&dl.bvid), dl.aid, auth).await?;
    let page = view
        .pages
        .iter()
        .find(|p| p.page == dl.part_index)
        .or_else(|| view.pages.first())
        .ok_or(WorkerError::MissingInput("video has no pages"))?;
    let expected_secs = page.duration_secs as f64;

    let request = PlayUrlRequest {
        bvid: Some(dl.bvid.clone()),
        aid: dl.aid,
        cid: dl.cid.unwrap_or(page.cid),
        resolution: dl.resolution.map(|r| r.to_string()),
        codec: dl.codec.clone(),
    };
    let selection = resolve_play_selection(client, &request, auth, config.block_pcdn).await?;

    // Progress drain with a bounded write rate against the store.
    let (progress_tx, mut progress_rx) = mpsc::channel::<(i64, i64)>(32);
    let progress_store = store.clone();
    let progress_id = dl.id;
    let progress_handle = tokio::spawn(async move {
        let mut last_write = Instant::now() - Duration::from_secs(2);
        while let Some((done, total)) = progress_rx.recv().await {
            if last_write.elapsed() >= Duration::from_secs(1) {
                last_write = Instant::now();
                let _ = progress_store
                    .update_download_progress(progress_id, done, total)
                    .await;
            }
        }
    });

    let fetch = match &selection {
        PlaySelection::Progressive { urls } => {
            store
                .update_download_selection(
                    dl.id,
                    urls.first().map(String::as_str).unwrap_or_default(),
                    dl.resolution,
                    dl.codec.as_deref(),
                    "durl",
                )
                .await?;
            fetch_to_file(
                urls,
                &out_path,
                dl.progress_done.max(0) as u64,
                config.aria2c_connections,
                progress_tx.clone(),
                cancel_rx.clone(),
            )
            .await
        }
        PlaySelection::Dash { video, audio } => {
            store
                .update_download_selection(
                    dl.id,
                    video.urls.first().map(String::as_str).unwrap_or_default(),
                    video.id,
                    video.codec.as_deref(),
                    "dash",
                )
                .await?;
            fetch_dash(
                video.urls.as_slice(),
                audio.urls.as_slice(),
                &out_path,
                config.aria2c_connections,
                progress_tx.clone(),
                cancel_rx.clone(),
            )
            .await
        }
    };
    drop(progress_tx);
    let _ = progress_handle.await;
    fetch?;

    let size = tokio::fs::metadata(&out_path).await?.len() as i64;
    store.update_download_progress(dl.id, size, size).await?;

    let actual_secs = relive_media::probe_duration(&out_path).await?;
    if !looks_complete(actual_secs, expected_secs) {
        return Err(WorkerError::IncompleteDownload {
            actual: actual_secs,
            expected: expected_secs,
        });
    }

    store.set_download_status(dl.id, DownloadStatus::Done).await?;
    for relation in store.list_relations_for_download(dl.id).await? {
        if relation.workflow_status == RelationStatus::PendingDownload {
            store
                .set_relation_status(relation.id, RelationStatus::Ready, None)
                .await?;
        }
    }

    info!(download_id = dl.id, size, duration = actual_secs, "download verified");
    Ok(())
}

async fn record_failure(store: &Store, id: i64, error: &WorkerError) -> WorkerResult<()> {
    store.fail_download(id, &error.to_string()).await?;
    for relation in store.list_relations_for_download(id).await? {
        store.record_relation_failure(relation.id, &error.to_string()).await?;
    }
    Ok(())
}

/// Duration-based completeness check. The platform occasionally closes a
/// stream early; a small absolute slack and a ratio floor avoid failing
/// files that are effectively whole.
pub fn looks_complete(actual_secs: f64, expected_secs: f64) -> bool {
    if actual_secs <= 0.0 {
        return false;
    }
    if expected_secs <= 0.0 {
        return true;
    }
    !(actual_secs + COMPLETENESS_SLACK_SECS < expected_secs
        && actual_secs / expected_secs < COMPLETENESS_RATIO)
}

/// Fetch a DASH selection: video and audio separately, then a copy mux.
async fn fetch_dash(
    video_urls: &[String],
    audio_urls: &[String],
    out_path: &Path,
    connections: u32,
    progress_tx: mpsc::Sender<(i64, i64)>,
    cancel_rx: watch::Receiver<bool>,
) -> WorkerResult<()> {
    let video_tmp = out_path.with_extension("video.m4s");
    let audio_tmp = out_path.with_extension("audio.m4s");

    fetch_to_file(video_urls, &video_tmp, 0, connections, progress_tx.clone(), cancel_rx.clone())
        .await?;
    fetch_to_file(audio_urls, &audio_tmp, 0, connections, progress_tx, cancel_rx.clone()).await?;

    mux_dash(&video_tmp, &audio_tmp, out_path, cancel_rx).await?;
    let _ = tokio::fs::remove_file(&video_tmp).await;
    let _ = tokio::fs::remove_file(&audio_tmp).await;
    Ok(())
}

/// Combine separate video and audio streams without re-encoding.
async fn mux_dash(
    video: &Path,
    audio: &Path,
    output: &Path,
    cancel_rx: watch::Receiver<bool>,
) -> WorkerResult<()> {
    let cmd = relive_media::FfmpegCommand::new(video, output)
        .output_arg("-i")
        .output_arg(audio.to_string_lossy().to_string())
        .codec_copy();
    relive_media::FfmpegRunner::new()
        .with_cancel(cancel_rx)
        .run(&cmd)
        .await?;
    Ok(())
}

/// Fetch one media file, trying each mirror URL in order. aria2c carries
/// the transfer when available; otherwise a plain streaming GET with a
/// Range resume.
async fn fetch_to_file(
    urls: &[String],
    out_path: &Path,
    resume_offset: u64,
    connections: u32,
    progress_tx: mpsc::Sender<(i64, i64)>,
    cancel_rx: watch::Receiver<bool>,
) -> WorkerResult<()> {
    if urls.is_empty() {
        return Err(WorkerError::MissingInput("no stream urls"));
    }

    let use_aria2 = which::which("aria2c").is_ok();
    let mut last_err = WorkerError::MissingInput("no stream urls");

    for url in urls {
        let attempt = if use_aria2 {
            fetch_with_aria2(url, out_path, connections, progress_tx.clone(), cancel_rx.clone())
                .await
        } else {
            http_download(url, out_path, resume_offset, progress_tx.clone(), cancel_rx.clone())
                .await
        };
        match attempt {
            Ok(()) => return Ok(()),
            Err(WorkerError::Paused) => return Err(WorkerError::Paused),
            Err(e) => {
                warn!(url, error = %e, "mirror failed, trying next");
                last_err = e;
            }
        }
    }
    Err(last_err)
}

/// Drive aria2c as a subprocess, scraping byte progress from its console
/// summary lines.
async fn fetch_with_aria2(
    url: &str,
    out_path: &Path,
    connections: u32,
    progress_tx: mpsc::Sender<(i64, i64)>,
    mut cancel_rx: watch::Receiver<bool>,
) -> WorkerResult<()> {
    let dir = out_path.parent().unwrap_or_else(|| Path::new("."));
    let name = out_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or(WorkerError::MissingInput("download file name"))?;

    let mut child = Command::new("aria2c")
        .arg(format!("--max-connection-per-server={connections}"))
        .arg(format!("--split={connections}"))
        .arg("--min-split-size=1M")
        .arg("--continue=true")
        .arg("--auto-file-renaming=false")
        .arg("--allow-overwrite=true")
        .arg("--console-log-level=warn")
        .arg("--summary-interval=1")
        .arg(format!("--dir={}", dir.display()))
        .arg(format!("--out={name}"))
        .arg(format!("--referer={REFERER}"))
        .arg(format!("--user-agent={USER_AGENT}"))
        .arg(url)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|_| WorkerError::Aria2NotFound)?;

    let stdout = child.stdout.take();
    let reader_handle = tokio::spawn(async move {
        let Some(stdout) = stdout else { return };
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some((done, total)) = parse_aria2_progress(&line) {
                let _ = progress_tx.try_send((done as i64, total as i64));
            }
        }
    });

    let status = tokio::select! {
        status = child.wait() => status?,
        _ = cancel_rx.changed() => {
            let _ = child.kill().await;
            let _ = reader_handle.await;
            return Err(WorkerError::Paused);
        }
    };
    let _ = reader_handle.await;

    if status.success() {
        Ok(())
    } else {
        Err(WorkerError::Aria2Failed {
            code: status.code().unwrap_or(-1),
        })
    }
}

/// Plain streaming GET fallback with Range-based resume.
async fn http_download(
    url: &str,
    out_path: &Path,
    resume_offset: u64,
    progress_tx: mpsc::Sender<(i64, i64)>,
    mut cancel_rx: watch::Receiver<bool>,
) -> WorkerResult<()> {
    let http = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(Duration::from_secs(30))
        .build()?;

    let on_disk = tokio::fs::metadata(out_path).await.map(|m| m.len()).unwrap_or(0);
    let offset = resume_offset.min(on_disk);

    let mut request = http.get(url).header("Referer", REFERER);
    if offset > 0 {
        request = request.header("Range", format!("bytes={offset}-"));
    }
    let response = request.send().await?.error_for_status()?;

    let resumed = offset > 0 && response.status() == reqwest::StatusCode::PARTIAL_CONTENT;
    let total = response.content_length().unwrap_or(0) + if resumed { offset } else { 0 };

    let mut file = if resumed {
        let mut f = tokio::fs::OpenOptions::new().write(true).open(out_path).await?;
        f.seek(std::io::SeekFrom::Start(offset)).await?;
        f
    } else {
        tokio::fs::File::create(out_path).await?
    };

    let mut written = if resumed { offset } else { 0 };
    let mut stream = response.bytes_stream();

    loop {
        tokio::select! {
            chunk = stream.next() => match chunk {
                Some(chunk) => {
                    let chunk = chunk?;
                    file.write_all(&chunk).await?;
                    written += chunk.len() as u64;
                    let _ = progress_tx.try_send((written as i64, total as i64));
                }
                None => break,
            },
            _ = cancel_rx.changed() => {
                file.flush().await?;
                return Err(WorkerError::Paused);
            }
        }
    }

    file.flush().await?;
    debug!(url, written, "http download finished");
    Ok(())
}

/// Parse one aria2c console summary line, e.g.
/// `[#1a2b3c 24MiB/128MiB(18%) CN:4 DL:8.1MiB ETA:12s]`.
pub fn parse_aria2_progress(line: &str) -> Option<(u64, u64)> {
    let line = line.trim();
    if !line.starts_with("[#") {
        return None;
    }
    let body = line.trim_start_matches('[').trim_end_matches(']');
    let pair = body.split_whitespace().find(|t| t.contains('/'))?;
    let (done_str, rest) = pair.split_once('/')?;
    let total_str = rest.split('(').next()?;
    let done = parse_binary_size(done_str)?;
    let total = parse_binary_size(total_str)?;
    Some((done, total))
}

/// Parse an aria2c size token like `24MiB` or `981KiB` into bytes.
fn parse_binary_size(token: &str) -> Option<u64> {
    let token = token.trim();
    let units: [(&str, f64); 5] = [
        ("TiB", 1024f64.powi(4)),
        ("GiB", 1024f64.powi(3)),
        ("MiB", 1024f64.powi(2)),
        ("KiB", 1024.0),
        ("B", 1.0),
    ];
    for (suffix, factor) in units {
        if let Some(number) = token.strip_suffix(suffix) {
            let value: f64 = number.trim().parse().ok()?;
            return Some((value * factor) as u64);
        }
    }
    token.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use relive_platform::ApiConfig;

    #[test]
    fn test_parse_aria2_progress_line() {
        let line = "[#1a2b3c 24MiB/128MiB(18%) CN:4 DL:8.1MiB ETA:12s]";
        let (done, total) = parse_aria2_progress(line).unwrap();
        assert_eq!(done, 24 * 1024 * 1024);
        assert_eq!(total, 128 * 1024 * 1024);
    }

    #[test]
    fn test_parse_aria2_ignores_unrelated_lines() {
        assert!(parse_aria2_progress("Download complete: /dl/p1.mp4").is_none());
        assert!(parse_aria2_progress("").is_none());
        assert!(parse_aria2_progress("[WARN] something").is_none());
    }

    #[test]
    fn test_parse_binary_sizes() {
        assert_eq!(parse_binary_size("981KiB"), Some(981 * 1024));
        assert_eq!(parse_binary_size("1.5GiB"), Some((1.5 * 1024.0 * 1024.0 * 1024.0) as u64));
        assert_eq!(parse_binary_size("0B"), Some(0));
        assert_eq!(parse_binary_size("12345"), Some(12345));
        assert_eq!(parse_binary_size("abc"), None);
    }

    #[test]
    fn test_completeness_thresholds() {
        // Exact and near-exact durations pass.
        assert!(looks_complete(600.0, 600.0));
        assert!(looks_complete(595.0, 600.0));
        // Within the absolute slack.
        assert!(looks_complete(55.0, 60.0));
        // Whole-enough ratio passes even beyond the slack.
        assert!(looks_complete(560.0, 600.0));
        // Clearly truncated files fail.
        assert!(!looks_complete(60.0, 600.0));
        assert!(!looks_complete(0.0, 600.0));
        // Unknown expected duration cannot fail the check.
        assert!(looks_complete(42.0, 0.0));
    }

    #[tokio::test]
    async fn test_submit_applies_backpressure() {
        let store = Store::open_in_memory().await.unwrap();
        let client = ApiClient::new(ApiConfig::default()).unwrap();
        let config = WorkerConfig {
            download_queue_limit: 2,
            ..Default::default()
        };
        let (_tx, rx) = watch::channel(false);
        let pool = DownloadWorkerPool::new(store, client, None, config, rx);

        for i in 0..2 {
            let dl = VideoDownload::new("BV1xx", format!("part {i}"), format!("/dl/p{i}.mp4"), 1, 1);
            pool.submit(&dl).await.unwrap();
        }

        let overflow = VideoDownload::new("BV1xx", "part 2", "/dl/p2.mp4", 1, 1);
        match pool.submit(&overflow).await {
            Err(WorkerError::QueueFull { active, limit }) => {
                assert_eq!(active, 2);
                assert_eq!(limit, 2);
            }
            other => panic!("expected QueueFull, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_http_download_with_resume() {
        use wiremock::matchers::{header, method};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("Range", "bytes=5-"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("Content-Range", "bytes 5-9/10")
                    .set_body_bytes(b"world".to_vec()),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.bin");
        tokio::fs::write(&path, b"hello").await.unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        http_download(&server.uri(), &path, 5, tx, cancel_rx).await.unwrap();

        let content = tokio::fs::read(&path).await.unwrap();
        assert_eq!(content, b"helloworld");

        // Progress reports include the resumed prefix.
        let (done, total) = rx.recv().await.unwrap();
        assert_eq!(done, 10);
        assert_eq!(total, 10);
    }
}
