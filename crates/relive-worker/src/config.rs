//! Worker configuration.

use std::time::Duration;

/// Engine-wide tunables. Every field can be overridden through an
/// environment variable; defaults suit a single-box deployment.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// SQLite task store path
    pub db_path: String,
    /// Scratch directory for workflow artifacts
    pub work_dir: String,
    /// Directory finished part downloads land in
    pub download_dir: String,
    /// Raw login cookie; unset means anonymous access
    pub cookie: Option<String>,
    /// Concurrent download workers
    pub download_threads: usize,
    /// Active (pending + downloading) jobs accepted before backpressure
    pub download_queue_limit: i64,
    /// Connections per server handed to aria2c, clamped to 1..=32
    pub aria2c_connections: u32,
    /// Drop PCDN hosts from resolved stream URLs
    pub block_pcdn: bool,
    /// Concurrent artifact uploads within one UPLOAD step
    pub upload_concurrency: usize,
    /// Orchestrator and download pool poll interval
    pub scan_interval: Duration,
    /// Named workflow configuration bound to new instances
    pub workflow_config: String,
    /// Remote root for mirrored recordings when the anchor has no
    /// explicit sync path
    pub sync_remote_root: String,
    /// Automatic retries for a failed mirror upload
    pub sync_max_retries: i64,
    /// Cloud login token used for automatic relogin on session expiry
    pub bduss: Option<String>,
    /// How often finished recordings are scanned for mirroring
    pub mirror_scan_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            db_path: "relive.db".to_string(),
            work_dir: "work".to_string(),
            download_dir: "downloads".to_string(),
            cookie: None,
            download_threads: 3,
            download_queue_limit: 10,
            aria2c_connections: 4,
            block_pcdn: true,
            upload_concurrency: 3,
            scan_interval: Duration::from_secs(5),
            workflow_config: "default".to_string(),
            sync_remote_root: "/录播".to_string(),
            sync_max_retries: 2,
            bduss: None,
            mirror_scan_interval: Duration::from_secs(60),
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            db_path: std::env::var("RELIVE_DB_PATH").unwrap_or_else(|_| "relive.db".to_string()),
            work_dir: std::env::var("RELIVE_WORK_DIR").unwrap_or_else(|_| "work".to_string()),
            download_dir: std::env::var("RELIVE_DOWNLOAD_DIR")
                .unwrap_or_else(|_| "downloads".to_string()),
            cookie: std::env::var("RELIVE_COOKIE").ok().filter(|s| !s.is_empty()),
            download_threads: std::env::var("RELIVE_DOWNLOAD_THREADS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(3),
            download_queue_limit: std::env::var("RELIVE_DOWNLOAD_QUEUE_LIMIT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),
            aria2c_connections: std::env::var("RELIVE_ARIA2C_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(4u32)
                .clamp(1, 32),
            block_pcdn: std::env::var("RELIVE_BLOCK_PCDN")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(true),
            upload_concurrency: std::env::var("RELIVE_UPLOAD_CONCURRENCY")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(3usize)
                .clamp(1, 5),
            scan_interval: Duration::from_secs(
                std::env::var("RELIVE_SCAN_INTERVAL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(5),
            ),
            workflow_config: std::env::var("RELIVE_WORKFLOW_CONFIG")
                .unwrap_or_else(|_| "default".to_string()),
            sync_remote_root: std::env::var("RELIVE_SYNC_REMOTE_ROOT")
                .unwrap_or_else(|_| "/录播".to_string()),
            sync_max_retries: std::env::var("RELIVE_SYNC_MAX_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(2),
            bduss: std::env::var("RELIVE_BDUSS").ok().filter(|s| !s.is_empty()),
            mirror_scan_interval: Duration::from_secs(
                std::env::var("RELIVE_MIRROR_SCAN_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(60),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_bounded() {
        let config = WorkerConfig::default();
        assert_eq!(config.download_threads, 3);
        assert_eq!(config.download_queue_limit, 10);
        assert!(config.aria2c_connections >= 1 && config.aria2c_connections <= 32);
        assert!(config.upload_concurrency <= 5);
    }
}
