//! Per-room recording state machine.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use relive_models::{render_template, LiveRecordTask, LiveStatus};
use relive_platform::{get_live_streams, get_room_info, ApiClient, LiveStream};
use relive_store::Store;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::{CutPolicy, RecorderConfig};
use crate::danmaku::{record_danmaku, DanmakuSource};
use crate::error::{RecorderError, RecorderResult};
use crate::flv::FlvScanner;

/// Observable state of one room's monitor loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomState {
    Idle,
    Connecting,
    Recording,
    Reconnecting,
    SegmentRotating,
    Stopped,
}

/// Why the stream read loop returned.
enum SessionEnd {
    /// Transport dropped; reconnect after the retry interval
    Disconnected,
    /// A cutting policy fired; reconnect immediately into a new segment
    Rotate(&'static str),
    /// Shutdown was requested
    Shutdown,
}

/// One open recording file with its task row.
struct OpenSegment {
    task: LiveRecordTask,
    file: tokio::fs::File,
    path: PathBuf,
    bytes_written: u64,
    started_at: tokio::time::Instant,
    scanner: FlvScanner,
    /// Sidecar chat session; aborted when the segment closes
    danmaku: Option<tokio::task::JoinHandle<()>>,
}

impl OpenSegment {
    fn stop_danmaku(&mut self) {
        if let Some(handle) = self.danmaku.take() {
            handle.abort();
        }
    }
}

/// Drives recording for a single room until shutdown.
pub struct RoomMonitor {
    room_id: i64,
    room_name: String,
    store: Store,
    client: ApiClient,
    config: RecorderConfig,
    shutdown: watch::Receiver<bool>,
    state: RoomState,
    current_title: String,
    danmaku_source: Option<Arc<dyn DanmakuSource>>,
}

impl RoomMonitor {
    pub fn new(
        room_id: i64,
        room_name: String,
        store: Store,
        client: ApiClient,
        config: RecorderConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            room_id,
            room_name,
            store,
            client,
            config,
            shutdown,
            state: RoomState::Idle,
            current_title: String::new(),
            danmaku_source: None,
        }
    }

    /// Attach a chat transport; capture still only runs when
    /// `danmaku.enabled` is set.
    pub fn with_danmaku_source(mut self, source: Arc<dyn DanmakuSource>) -> Self {
        self.danmaku_source = Some(source);
        self
    }

    pub fn state(&self) -> RoomState {
        self.state
    }

    /// Main loop: poll while idle, record while live, stop on shutdown.
    pub async fn run(mut self) {
        info!(room_id = self.room_id, "room monitor started");

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            match get_room_info(&self.client, self.room_id).await {
                Ok(info) => {
                    self.current_title = info.title.clone().unwrap_or_default();
                    if let Err(e) = self
                        .store
                        .update_anchor_status(
                            self.room_id,
                            LiveStatus::from_code(info.live_status),
                            info.title.as_deref(),
                        )
                        .await
                    {
                        warn!(room_id = self.room_id, error = %e, "anchor status update failed");
                    }

                    if info.is_live() {
                        if let Err(e) = self.record_live_session().await {
                            if !matches!(e, RecorderError::Shutdown) {
                                warn!(room_id = self.room_id, error = %e, "recording session ended with error");
                            }
                        }
                        continue;
                    }
                }
                Err(e) => {
                    warn!(room_id = self.room_id, error = %e, "live status poll failed");
                }
            }

            self.state = RoomState::Idle;
            if self
                .sleep(Duration::from_secs(self.config.check_interval_secs))
                .await
                .is_err()
            {
                break;
            }
        }

        self.state = RoomState::Stopped;
        info!(room_id = self.room_id, "room monitor stopped");
    }

    /// Record until the room goes offline or shutdown is requested.
    async fn record_live_session(&mut self) -> RecorderResult<()> {
        let mut segment: Option<OpenSegment> = None;

        let result = loop {
            self.state = RoomState::Connecting;

            let stream = match self.pick_stream().await {
                Ok(stream) => stream,
                Err(RecorderError::NoQuality) => {
                    debug!(room_id = self.room_id, "no acceptable quality tier, waiting");
                    self.sleep(Duration::from_secs(self.config.no_quality_wait_secs))
                        .await?;
                    if !self.still_live().await {
                        break Ok(());
                    }
                    continue;
                }
                Err(e) => {
                    warn!(room_id = self.room_id, error = %e, "stream resolution failed");
                    self.state = RoomState::Reconnecting;
                    self.sleep(Duration::from_millis(self.config.stream_retry_ms))
                        .await?;
                    if !self.still_live().await {
                        break Ok(());
                    }
                    continue;
                }
            };

            if segment.is_none() {
                segment = Some(match self.open_segment().await {
                    Ok(segment) => segment,
                    Err(e) if e.is_disk() => {
                        error!(room_id = self.room_id, error = %e, "could not open segment file");
                        self.sleep(Duration::from_millis(self.config.stream_retry_ms))
                            .await?;
                        continue;
                    }
                    Err(e) => break Err(e),
                });
            }

            let open = segment.as_mut().ok_or(RecorderError::Disconnected)?;
            open.scanner.restart_stream();

            match self.pump_stream(open, &stream).await {
                Ok(SessionEnd::Shutdown) => {
                    break Ok(());
                }
                Ok(SessionEnd::Rotate(reason)) => {
                    self.state = RoomState::SegmentRotating;
                    info!(room_id = self.room_id, reason, "rotating segment");
                    if let Some(open) = segment.take() {
                        self.close_segment(open).await?;
                    }
                    // Reconnect immediately so the new file gets a clean header
                    continue;
                }
                Ok(SessionEnd::Disconnected) | Err(RecorderError::Disconnected) => {
                    self.state = RoomState::Reconnecting;
                    // Appending across a gap corrupts the container, so
                    // with fix enabled a reconnect starts a new segment
                    if self.config.flv_fix && !self.config.flv_fix_skip_annexb {
                        if let Some(open) = segment.take() {
                            self.close_segment(open).await?;
                        }
                    }
                    self.sleep(Duration::from_millis(self.config.stream_retry_ms))
                        .await?;
                    if !self.still_live().await {
                        break Ok(());
                    }
                }
                Err(e) if e.is_disk() => {
                    if let Some(mut open) = segment.take() {
                        open.stop_danmaku();
                        let message = e.to_string();
                        self.store.fail_recording(open.task.id, &message).await?;
                    }
                    self.sleep(Duration::from_millis(self.config.stream_retry_ms))
                        .await?;
                    if !self.still_live().await {
                        break Ok(());
                    }
                }
                Err(e) => break Err(e),
            }
        };

        if let Some(open) = segment.take() {
            self.close_segment(open).await?;
        }
        result
    }

    /// Resolve streams and pick by format then codec preference.
    async fn pick_stream(&self) -> RecorderResult<LiveStream> {
        let streams =
            get_live_streams(&self.client, self.room_id, self.config.quality, None).await?;

        streams
            .iter()
            .find(|s| s.format == "flv" && s.codec == "avc")
            .or_else(|| streams.iter().find(|s| s.format == "flv"))
            .or_else(|| streams.first())
            .cloned()
            .ok_or(RecorderError::NoQuality)
    }

    async fn still_live(&self) -> bool {
        get_room_info(&self.client, self.room_id)
            .await
            .map(|info| info.is_live())
            .unwrap_or(true)
    }

    /// Create the next segment file and its task row.
    async fn open_segment(&mut self) -> RecorderResult<OpenSegment> {
        let index = self.store.next_segment_index(self.room_id).await?;
        let now = Utc::now();

        let values = std::collections::HashMap::from([
            ("name", self.room_name.clone()),
            ("title", self.current_title.clone()),
            ("date", now.format("%Y%m%d").to_string()),
            ("time", now.format("%H%M%S").to_string()),
            ("index", index.to_string()),
        ]);

        let relative = render_template(&self.config.file_template, &values);
        let path = PathBuf::from(&self.config.output_dir).join(relative);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(RecorderError::Disk)?;
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(RecorderError::Disk)?;

        let title = (!self.current_title.is_empty()).then(|| self.current_title.clone());
        let mut task = LiveRecordTask::open(
            self.room_id,
            index,
            path.to_string_lossy().to_string(),
            title,
        );
        task.id = self.store.insert_recording(&task).await?;

        info!(
            room_id = self.room_id,
            segment_index = index,
            path = %path.display(),
            "segment opened"
        );

        let danmaku = self.spawn_danmaku(&path);

        Ok(OpenSegment {
            task,
            file,
            path,
            bytes_written: 0,
            started_at: tokio::time::Instant::now(),
            scanner: FlvScanner::new(),
            danmaku,
        })
    }

    /// Start the sidecar chat session for a freshly opened segment.
    /// It runs in its own task; a chat failure never touches the
    /// video capture.
    fn spawn_danmaku(&self, recording_path: &Path) -> Option<tokio::task::JoinHandle<()>> {
        if !self.config.danmaku.enabled {
            return None;
        }
        let source = Arc::clone(self.danmaku_source.as_ref()?);
        let options = self.config.danmaku.clone();
        let room_id = self.room_id;
        let path = recording_path.to_path_buf();
        Some(tokio::spawn(async move {
            match record_danmaku(source.as_ref(), room_id, &path, &options).await {
                Ok(events) => debug!(room_id, events, "danmaku session closed"),
                Err(e) => warn!(room_id, error = %e, "danmaku capture failed"),
            }
        }))
    }

    async fn close_segment(&mut self, mut open: OpenSegment) -> RecorderResult<()> {
        open.stop_danmaku();
        open.file.flush().await.map_err(RecorderError::Disk)?;
        self.store
            .complete_recording(open.task.id, open.bytes_written as i64)
            .await?;
        info!(
            room_id = self.room_id,
            segment_index = open.task.segment_index,
            bytes = open.bytes_written,
            path = %open.path.display(),
            "segment closed"
        );
        Ok(())
    }

    /// Connect to the stream URL, bounding the wait for response
    /// headers by `connect_timeout_ms`. A hung connect becomes a
    /// plain disconnect so the session falls into the reconnect path.
    async fn connect_stream(&self, url: &str) -> RecorderResult<reqwest::Response> {
        let request = self
            .client
            .http()
            .get(url)
            .timeout(Duration::from_secs(86400))
            .header(reqwest::header::REFERER, "https://live.bilibili.com/")
            .send();

        let response =
            tokio::time::timeout(Duration::from_millis(self.config.connect_timeout_ms), request)
                .await
                .map_err(|_| RecorderError::Disconnected)??;

        if !response.status().is_success() {
            return Err(RecorderError::Disconnected);
        }
        Ok(response)
    }

    /// Stream bytes into the open segment until something ends it.
    async fn pump_stream(
        &mut self,
        open: &mut OpenSegment,
        stream: &LiveStream,
    ) -> RecorderResult<SessionEnd> {
        let response = self.connect_stream(&stream.url).await?;

        self.state = RoomState::Recording;
        info!(room_id = self.room_id, url = %stream.url, qn = stream.qn, "recording");

        let mut body = response.bytes_stream();
        let mut progress_tick = tokio::time::interval(Duration::from_secs(5));
        progress_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut title_tick = tokio::time::interval(Duration::from_secs(60));
        title_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                chunk = body.next() => {
                    let Some(chunk) = chunk else {
                        return Ok(SessionEnd::Disconnected);
                    };
                    let bytes = chunk.map_err(|_| RecorderError::Disconnected)?;

                    let discontinuity = open.scanner.feed(&bytes);

                    open.file
                        .write_all(&bytes)
                        .await
                        .map_err(RecorderError::Disk)?;
                    open.bytes_written += bytes.len() as u64;

                    if discontinuity.is_some()
                        && self.config.flv_fix
                        && !self.config.flv_fix_skip_annexb
                    {
                        warn!(room_id = self.room_id, ?discontinuity, "stream gap detected");
                        return Ok(SessionEnd::Rotate("stream gap"));
                    }

                    if let Some(reason) = self.rotation_due(open) {
                        return Ok(SessionEnd::Rotate(reason));
                    }
                }
                _ = progress_tick.tick() => {
                    self.store
                        .update_recording_size(open.task.id, open.bytes_written as i64)
                        .await?;
                }
                _ = title_tick.tick() => {
                    if let Ok(info) = get_room_info(&self.client, self.room_id).await {
                        if let Some(title) = info.title {
                            if !title.is_empty() && title != self.current_title {
                                let elapsed = open.started_at.elapsed().as_secs();
                                self.current_title = title;
                                if matches!(self.config.cut_policy, CutPolicy::TitleChange)
                                    && elapsed >= self.config.title_split_min_secs
                                {
                                    return Ok(SessionEnd::Rotate("title change"));
                                }
                            }
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(SessionEnd::Shutdown);
                    }
                }
            }
        }
    }

    fn rotation_due(&self, open: &OpenSegment) -> Option<&'static str> {
        match self.config.cut_policy {
            CutPolicy::Duration { seconds } => {
                (open.started_at.elapsed().as_secs() >= seconds).then_some("duration limit")
            }
            CutPolicy::Size { bytes } => (open.bytes_written >= bytes).then_some("size limit"),
            CutPolicy::None | CutPolicy::TitleChange => None,
        }
    }

    /// Sleep, waking early on shutdown.
    async fn sleep(&mut self, duration: Duration) -> RecorderResult<()> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.shutdown.changed() => {
                if *self.shutdown.borrow() {
                    Err(RecorderError::Shutdown)
                } else {
                    Ok(())
                }
            }
        }
    }
}

/// Close segment rows a crashed process left in `recording`. Each row
/// is completed with the size its file actually has on disk; a missing
/// file fails the row instead. Runs once at startup, before any
/// monitor opens new segments.
pub async fn finalize_dangling_recordings(store: &Store) -> RecorderResult<usize> {
    let open = store.list_open_recordings().await?;
    let count = open.len();

    for task in open {
        match tokio::fs::metadata(&task.file_path).await {
            Ok(meta) => {
                store
                    .complete_recording(task.id, meta.len() as i64)
                    .await?;
                info!(
                    recording_id = task.id,
                    room_id = task.room_id,
                    bytes = meta.len(),
                    "finalized recording left open by previous run"
                );
            }
            Err(_) => {
                store
                    .fail_recording(task.id, "recording file missing after restart")
                    .await?;
                warn!(
                    recording_id = task.id,
                    room_id = task.room_id,
                    path = %task.file_path,
                    "open recording has no file on disk"
                );
            }
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DanmakuOptions, DanmakuTransport};
    use crate::danmaku::{sidecar_path, DanmakuEvent};
    use relive_models::RecordingStatus;
    use relive_platform::ApiConfig;
    use tempfile::tempdir;
    use tokio::sync::mpsc;

    struct ChatOnlySource;

    impl DanmakuSource for ChatOnlySource {
        fn connect(
            &self,
            _room_id: i64,
            _transport: DanmakuTransport,
        ) -> RecorderResult<mpsc::Receiver<DanmakuEvent>> {
            let (tx, rx) = mpsc::channel(4);
            tokio::spawn(async move {
                let _ = tx
                    .send(DanmakuEvent::Chat {
                        user: "alice".to_string(),
                        text: "hello".to_string(),
                    })
                    .await;
            });
            Ok(rx)
        }
    }

    struct DeadSource;

    impl DanmakuSource for DeadSource {
        fn connect(
            &self,
            _room_id: i64,
            _transport: DanmakuTransport,
        ) -> RecorderResult<mpsc::Receiver<DanmakuEvent>> {
            Err(RecorderError::Disconnected)
        }
    }

    async fn monitor_for(output_dir: &std::path::Path, danmaku: DanmakuOptions) -> RoomMonitor {
        let store = Store::open_in_memory().await.unwrap();
        let client = ApiClient::new(ApiConfig::default()).unwrap();
        let config = RecorderConfig {
            output_dir: output_dir.to_string_lossy().to_string(),
            file_template: "seg_{{ index }}.flv".to_string(),
            danmaku,
            ..RecorderConfig::default()
        };
        let (_tx, rx) = tokio::sync::watch::channel(false);
        RoomMonitor::new(9025, "room".to_string(), store, client, config, rx)
    }

    #[tokio::test]
    async fn test_segment_records_danmaku_sidecar() {
        let dir = tempdir().unwrap();
        let options = DanmakuOptions {
            enabled: true,
            transport: DanmakuTransport::Tcp,
            ..DanmakuOptions::default()
        };
        let mut monitor = monitor_for(dir.path(), options)
            .await
            .with_danmaku_source(Arc::new(ChatOnlySource));

        let open = monitor.open_segment().await.unwrap();
        assert!(open.danmaku.is_some());
        let sidecar = sidecar_path(&open.path);

        // The session runs on its own task; wait for the line to land
        let mut content = String::new();
        for _ in 0..100 {
            content = tokio::fs::read_to_string(&sidecar).await.unwrap_or_default();
            if content.contains("hello") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(content.contains("hello"));
        assert!(content.contains("alice"));

        monitor.close_segment(open).await.unwrap();
    }

    #[tokio::test]
    async fn test_danmaku_failure_leaves_recording_intact() {
        let dir = tempdir().unwrap();
        let options = DanmakuOptions {
            enabled: true,
            transport: DanmakuTransport::Tcp,
            ..DanmakuOptions::default()
        };
        let mut monitor = monitor_for(dir.path(), options)
            .await
            .with_danmaku_source(Arc::new(DeadSource));
        let store = monitor.store.clone();

        let open = monitor.open_segment().await.unwrap();
        let task_id = open.task.id;
        monitor.close_segment(open).await.unwrap();

        let task = store.get_recording(task_id).await.unwrap();
        assert_eq!(task.status, RecordingStatus::Completed);
    }

    #[tokio::test]
    async fn test_disabled_danmaku_spawns_nothing() {
        let dir = tempdir().unwrap();
        let mut monitor = monitor_for(dir.path(), DanmakuOptions::default())
            .await
            .with_danmaku_source(Arc::new(ChatOnlySource));

        let open = monitor.open_segment().await.unwrap();
        assert!(open.danmaku.is_none());
        monitor.close_segment(open).await.unwrap();
    }

    #[tokio::test]
    async fn test_slow_connect_times_out_into_disconnect() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let mut monitor = monitor_for(dir.path(), DanmakuOptions::default()).await;
        monitor.config.connect_timeout_ms = 50;

        let err = monitor.connect_stream(&server.uri()).await.unwrap_err();
        assert!(matches!(err, RecorderError::Disconnected));
    }

    #[tokio::test]
    async fn test_fast_connect_succeeds_within_timeout() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"FLV".to_vec()))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let monitor = monitor_for(dir.path(), DanmakuOptions::default()).await;
        let response = monitor.connect_stream(&server.uri()).await.unwrap();
        assert!(response.status().is_success());
    }

    #[tokio::test]
    async fn test_finalize_dangling_recordings_uses_disk_size() {
        let dir = tempdir().unwrap();
        let store = Store::open_in_memory().await.unwrap();

        let on_disk = dir.path().join("seg_1.flv");
        tokio::fs::write(&on_disk, vec![0u8; 2048]).await.unwrap();
        let with_file =
            LiveRecordTask::open(1, 1, on_disk.to_string_lossy().to_string(), None);
        let with_file_id = store.insert_recording(&with_file).await.unwrap();

        let gone = LiveRecordTask::open(1, 2, "/nonexistent/seg_2.flv".to_string(), None);
        let gone_id = store.insert_recording(&gone).await.unwrap();

        let finalized = finalize_dangling_recordings(&store).await.unwrap();
        assert_eq!(finalized, 2);

        let completed = store.get_recording(with_file_id).await.unwrap();
        assert_eq!(completed.status, RecordingStatus::Completed);
        assert_eq!(completed.file_size, 2048);
        assert!(completed.ended_at.is_some());

        let failed = store.get_recording(gone_id).await.unwrap();
        assert_eq!(failed.status, RecordingStatus::Failed);

        // Nothing left open for the next pass
        assert_eq!(finalize_dangling_recordings(&store).await.unwrap(), 0);
    }
}
