//! Subscribed live rooms.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Live status of a room as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LiveStatus {
    /// Room is offline
    #[default]
    Offline,
    /// Room is currently streaming
    Live,
    /// Room is replaying recorded content (round-robin)
    Round,
}

impl LiveStatus {
    /// Platform wire value (0 = offline, 1 = live, 2 = round).
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => LiveStatus::Live,
            2 => LiveStatus::Round,
            _ => LiveStatus::Offline,
        }
    }

    pub fn as_code(&self) -> i64 {
        match self {
            LiveStatus::Offline => 0,
            LiveStatus::Live => 1,
            LiveStatus::Round => 2,
        }
    }

    /// Whether this status should trigger auto-recording.
    pub fn is_live(&self) -> bool {
        matches!(self, LiveStatus::Live)
    }
}

/// A subscribed live room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anchor {
    /// Platform room id (unique per anchor)
    pub room_id: i64,
    /// Display name of the streamer
    pub name: String,
    /// Last polled live status
    pub live_status: LiveStatus,
    /// Room title snapshot from the last poll
    pub title: Option<String>,
    /// When the room was last polled
    pub last_checked_at: Option<DateTime<Utc>>,
    /// Whether a live signal should start recording automatically
    pub auto_record: bool,
    /// Whether finished recordings are mirrored to cloud storage
    pub sync_enabled: bool,
    /// Remote directory for mirrored recordings
    pub sync_path: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Anchor {
    /// Create a newly subscribed room.
    pub fn new(room_id: i64, name: impl Into<String>) -> Self {
        Self {
            room_id,
            name: name.into(),
            live_status: LiveStatus::Offline,
            title: None,
            last_checked_at: None,
            auto_record: false,
            sync_enabled: false,
            sync_path: None,
            created_at: Utc::now(),
        }
    }

    /// Apply a fresh status poll result.
    pub fn observe(&mut self, status: LiveStatus, title: Option<String>) {
        self.live_status = status;
        if title.is_some() {
            self.title = title;
        }
        self.last_checked_at = Some(Utc::now());
    }
}
