//! Recording and submission worker binary.

use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use std::sync::Arc;

use relive_platform::{ApiClient, ApiConfig, AuthInfo};
use relive_recorder::{
    finalize_dangling_recordings, DanmakuSource, RecorderConfig, RoomMonitor, TcpDanmakuSource,
};
use relive_store::Store;
use relive_sync::{PcsCli, SyncConfig, SyncWorkerPool};
use relive_worker::{mirror, DownloadWorkerPool, Orchestrator, WorkerConfig};

#[tokio::main]
async fn main() {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Colored output for dev, JSON for production
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::from_default_env()
        .add_directive("relive=info".parse().expect("valid directive"))
        .add_directive("sqlx=warn".parse().expect("valid directive"));

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }

    info!("Starting relive-worker");

    let config = WorkerConfig::from_env();
    info!("Worker config: {:?}", config);

    let store = match Store::open(&config.db_path).await {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to open task store: {}", e);
            std::process::exit(1);
        }
    };
    // Reset everything that was in flight when the previous process died.
    if let Err(e) = store.recover().await {
        error!("Crash recovery failed: {}", e);
        std::process::exit(1);
    }

    let client = match ApiClient::new(ApiConfig::default()) {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to create API client: {}", e);
            std::process::exit(1);
        }
    };

    let auth = config
        .cookie
        .as_deref()
        .map(AuthInfo::from_cookie)
        .filter(AuthInfo::is_usable);
    if auth.is_none() {
        warn!("no usable cookie configured, running anonymously; uploads are disabled");
    }

    // Segments left open by a crashed run are closed with their on-disk
    // size so the mirror can pick them up.
    match finalize_dangling_recordings(&store).await {
        Ok(count) if count > 0 => info!("Finalized {} dangling recordings", count),
        Ok(_) => {}
        Err(e) => {
            error!("Failed to finalize dangling recordings: {}", e);
            std::process::exit(1);
        }
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut handles = Vec::new();

    // One monitor per auto-record room.
    match store.list_auto_record_anchors().await {
        Ok(anchors) => {
            let mut recorder_config = RecorderConfig::default();
            if let Ok(dir) = std::env::var("RELIVE_RECORD_DIR") {
                if !dir.is_empty() {
                    recorder_config.output_dir = dir;
                }
            }
            if let Ok(flag) = std::env::var("RELIVE_DANMAKU") {
                recorder_config.danmaku.enabled = flag.parse().unwrap_or(false);
            }
            let danmaku_source: Arc<dyn DanmakuSource> =
                Arc::new(TcpDanmakuSource::new(client.clone(), auth.clone()));
            for anchor in anchors {
                let monitor = RoomMonitor::new(
                    anchor.room_id,
                    anchor.name.clone(),
                    store.clone(),
                    client.clone(),
                    recorder_config.clone(),
                    shutdown_rx.clone(),
                )
                .with_danmaku_source(danmaku_source.clone());
                handles.push(tokio::spawn(monitor.run()));
            }
        }
        Err(e) => {
            error!("Failed to list auto-record rooms: {}", e);
            std::process::exit(1);
        }
    }

    let downloads = DownloadWorkerPool::new(
        store.clone(),
        client.clone(),
        auth.clone(),
        config.clone(),
        shutdown_rx.clone(),
    );
    handles.push(tokio::spawn(downloads.run()));

    let orchestrator = Orchestrator::new(
        store.clone(),
        client.clone(),
        auth.clone(),
        config.clone(),
        shutdown_rx.clone(),
    );
    handles.push(tokio::spawn(orchestrator.run()));

    // The mirror only runs when the PCS CLI is installed.
    match PcsCli::resolve(std::env::var("RELIVE_PCS_PATH").ok().as_deref()) {
        Ok(cli) => {
            handles.push(tokio::spawn(mirror::run_mirror_enqueue(
                store.clone(),
                config.sync_remote_root.clone(),
                config.sync_max_retries,
                config.mirror_scan_interval,
                shutdown_rx.clone(),
            )));
            let sync_config = SyncConfig {
                bduss: config.bduss.clone(),
                ..SyncConfig::default()
            };
            let sync_pool =
                SyncWorkerPool::new(store.clone(), cli, sync_config, shutdown_rx.clone());
            handles.push(tokio::spawn(sync_pool.run()));
        }
        Err(e) => {
            warn!("PCS CLI not available, cloud mirror disabled: {}", e);
        }
    }

    tokio::signal::ctrl_c().await.ok();
    info!("Received shutdown signal");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        handle.await.ok();
    }

    info!("Worker shutdown complete");
}
