//! Cloud mirror worker.
//!
//! Uploads finished local artifacts to the secondary storage backend
//! through the PCS command-line client, on its own concurrency budget,
//! fully decoupled from the submission workflow.

pub mod error;
pub mod pcs;
pub mod worker;

pub use error::{SyncError, SyncResult};
pub use pcs::{is_auth_expired, join_remote_path, should_attempt_relogin, PcsCli, UploadPolicy};
pub use worker::{SyncConfig, SyncWorkerPool};
