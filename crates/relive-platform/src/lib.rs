//! HTTP client for the streaming platform.
//!
//! Covers the four API surfaces the engine needs: live room polling
//! and stream resolution, on-demand play-url selection for downloads,
//! resumable chunked uploads, and submission publish/edit.

pub mod auth;
pub mod client;
pub mod error;
pub mod live;
pub mod playurl;
pub mod upload;
pub mod video;

pub use auth::AuthInfo;
pub use client::{parse_response, ApiClient, ApiConfig};
pub use error::{PlatformError, PlatformResult};
pub use live::{
    get_danmaku_info, get_live_streams, get_room_info, DanmakuHost, DanmakuInfo, LiveStream,
    RoomInfo,
};
pub use playurl::{resolve_play_selection, PlaySelection, PlayUrlRequest, StreamCandidate};
pub use upload::{
    edit, finalize_upload, open_session, preupload, publish, upload_chunk, PublishRequest,
    PublishVideo, RemoteIdentity, UploadSession,
};
pub use video::{get_video_view, VideoPage, VideoView};
