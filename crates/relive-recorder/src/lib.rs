//! Live stream recorder.
//!
//! One [`RoomMonitor`] per subscribed room drives the recording state
//! machine: poll while idle, stream to disk while live, reconnect on
//! transport drops, rotate segments per the configured cutting policy,
//! and optionally capture danmaku on an independent transport.

pub mod config;
pub mod danmaku;
pub mod error;
pub mod flv;
pub mod monitor;

pub use config::{CutPolicy, DanmakuOptions, DanmakuTransport, RecorderConfig};
pub use danmaku::{
    record_danmaku, sidecar_path, transport_order, DanmakuEvent, DanmakuSource, TcpDanmakuSource,
    TimedEvent,
};
pub use error::{RecorderError, RecorderResult};
pub use flv::{Discontinuity, FlvScanner};
pub use monitor::{finalize_dangling_recordings, RoomMonitor, RoomState};
