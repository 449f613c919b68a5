//! Resumable upload state carried by merged videos and output segments.

use serde::{Deserialize, Serialize};

/// Persisted resumable-upload block.
///
/// The session fields (`session_id`, `endpoint`, `auth`, `uri`, `chunk_size`)
/// are written before the first chunk is transmitted, so that a crash after
/// chunk N always resumes at chunk N+1. `uploaded_bytes` never exceeds
/// `total_bytes` and only regresses on an explicit [`UploadState::reset`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UploadState {
    /// Fraction complete in percent, 0-100
    pub progress: f64,
    pub uploaded_bytes: i64,
    pub total_bytes: i64,
    /// Content id assigned by the platform once the file is accepted
    pub cid: Option<i64>,
    /// Remote filename assigned on completion
    pub file_name: Option<String>,
    /// Resumable session id negotiated at preupload
    pub session_id: Option<String>,
    /// Platform business id from preupload
    pub biz_id: i64,
    /// Upload endpoint host
    pub endpoint: Option<String>,
    /// Session auth token
    pub auth: Option<String>,
    /// Target object URI
    pub uri: Option<String>,
    /// Negotiated chunk size in bytes
    pub chunk_size: i64,
    /// Highest chunk index confirmed by the server, -1 before the first
    pub last_part_index: i64,
}

impl UploadState {
    /// Fresh state for a file of `total_bytes`.
    pub fn new(total_bytes: i64) -> Self {
        Self {
            total_bytes,
            last_part_index: -1,
            ..Default::default()
        }
    }

    /// Whether a persisted session exists to resume from.
    pub fn is_resumable(&self) -> bool {
        self.session_id.is_some() && self.uri.is_some() && self.chunk_size > 0
    }

    /// Whether every byte has been confirmed.
    pub fn is_complete(&self) -> bool {
        self.total_bytes > 0 && self.uploaded_bytes >= self.total_bytes
    }

    /// Install a freshly negotiated session.
    pub fn begin_session(
        &mut self,
        session_id: impl Into<String>,
        endpoint: impl Into<String>,
        auth: impl Into<String>,
        uri: impl Into<String>,
        biz_id: i64,
        chunk_size: i64,
    ) {
        self.session_id = Some(session_id.into());
        self.endpoint = Some(endpoint.into());
        self.auth = Some(auth.into());
        self.uri = Some(uri.into());
        self.biz_id = biz_id;
        self.chunk_size = chunk_size;
        self.last_part_index = -1;
        self.uploaded_bytes = 0;
        self.progress = 0.0;
    }

    /// Record a confirmed chunk. Bytes are clamped so `uploaded_bytes` never
    /// exceeds `total_bytes`; the part index must advance monotonically.
    pub fn record_chunk(&mut self, part_index: i64, chunk_bytes: i64) {
        debug_assert!(part_index > self.last_part_index);
        self.last_part_index = part_index;
        self.uploaded_bytes = (self.uploaded_bytes + chunk_bytes).min(self.total_bytes);
        self.progress = if self.total_bytes > 0 {
            (self.uploaded_bytes as f64 / self.total_bytes as f64 * 100.0).min(100.0)
        } else {
            0.0
        };
    }

    /// First chunk index to send when resuming.
    pub fn next_part_index(&self) -> i64 {
        self.last_part_index + 1
    }

    /// Byte offset of the next chunk.
    pub fn resume_offset(&self) -> i64 {
        if self.chunk_size > 0 {
            self.next_part_index() * self.chunk_size
        } else {
            0
        }
    }

    /// Explicit retry-from-zero: drops the session and all progress.
    pub fn reset(&mut self) {
        let total = self.total_bytes;
        *self = Self::new(total);
    }
}
