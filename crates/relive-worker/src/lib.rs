//! Recording and submission worker engine.
//!
//! This crate provides:
//! - Download worker pool with queue backpressure and pause/resume
//! - Workflow orchestrator for the CLIP/MERGE/SEGMENT/UPLOAD pipeline
//! - Resumable chunked artifact uploads and publish
//! - Cloud mirror enqueue scan
//! - Retry and failure-suppression utilities

pub mod config;
pub mod download;
pub mod error;
pub mod logging;
pub mod mirror;
pub mod retry;
pub mod upload;
pub mod workflow;

pub use config::WorkerConfig;
pub use download::DownloadWorkerPool;
pub use error::{WorkerError, WorkerResult};
pub use logging::StepLogger;
pub use workflow::Orchestrator;
