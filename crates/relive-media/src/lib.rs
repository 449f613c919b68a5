//! External media tool boundary.
//!
//! Wraps ffmpeg/ffprobe subprocesses for the pipeline's media operations:
//! - Clip: per-source trims with a copy-vs-transcode decision
//! - Merge: concat-demuxer concatenation of ordered inputs
//! - Segment: duration-bounded splitting with short-tail merging
//! - Remux: container changes without re-encoding
//!
//! The engine passes file paths and timecodes; this crate only reports
//! success/failure and where the outputs landed.

pub mod anomaly;
pub mod clip;
pub mod command;
pub mod error;
pub mod fs_utils;
pub mod merge;
pub mod probe;
pub mod progress;
pub mod remux;
pub mod segment;

pub use anomaly::{choose_clip_mode, scan_for_timestamp_anomalies, ClipMode, TimestampAnomaly};
pub use clip::{clip_source, TranscodeProfile};
pub use command::{check_ffmpeg, check_ffprobe, FfmpegCommand, FfmpegRunner};
pub use error::{MediaError, MediaResult};
pub use fs_utils::{move_file, total_size};
pub use merge::merge_files;
pub use probe::{probe_duration, probe_packet_timestamps, probe_video, PacketTimestamp, VideoInfo};
pub use progress::FfmpegProgress;
pub use remux::remux;
pub use segment::segment_file;
