//! Live room APIs: status polling, stream resolution, danmaku info.

use serde_json::Value;

use crate::auth::AuthInfo;
use crate::client::ApiClient;
use crate::error::{PlatformError, PlatformResult};

/// Snapshot of a live room as the status poller sees it.
#[derive(Debug, Clone)]
pub struct RoomInfo {
    pub room_id: i64,
    pub uid: i64,
    /// 0 offline, 1 live, 2 carousel
    pub live_status: i64,
    pub title: Option<String>,
    pub area: Option<String>,
}

impl RoomInfo {
    pub fn is_live(&self) -> bool {
        self.live_status == 1
    }
}

/// One playable live stream endpoint.
#[derive(Debug, Clone)]
pub struct LiveStream {
    pub url: String,
    /// Container hint, "flv" or "ts"
    pub format: String,
    /// Quality number of this stream
    pub qn: i64,
    pub codec: String,
}

/// One endpoint from the danmaku host list.
#[derive(Debug, Clone)]
pub struct DanmakuHost {
    pub host: String,
    /// Raw TCP port
    pub port: u16,
    /// TLS websocket port
    pub wss_port: u16,
}

/// Connection details for the danmaku broadcast service.
#[derive(Debug, Clone)]
pub struct DanmakuInfo {
    pub token: String,
    pub hosts: Vec<DanmakuHost>,
}

/// Fetch current room status.
pub async fn get_room_info(client: &ApiClient, room_id: i64) -> PlatformResult<RoomInfo> {
    let url = format!("{}/room/v1/Room/get_info", client.config().live_base);
    let data = client
        .get_json(&url, &[("room_id", room_id.to_string())], None)
        .await?;

    Ok(RoomInfo {
        room_id: data
            .get("room_id")
            .and_then(Value::as_i64)
            .unwrap_or(room_id),
        uid: data.get("uid").and_then(Value::as_i64).unwrap_or(0),
        live_status: data.get("live_status").and_then(Value::as_i64).unwrap_or(0),
        title: data.get("title").and_then(Value::as_str).map(String::from),
        area: data
            .get("area_name")
            .and_then(Value::as_str)
            .map(String::from),
    })
}

/// Fetch the streamer's display name for a room.
pub async fn get_anchor_name(client: &ApiClient, uid: i64) -> PlatformResult<Option<String>> {
    let url = format!(
        "{}/live_user/v1/Master/info",
        client.config().live_base
    );
    let data = client
        .get_json(&url, &[("uid", uid.to_string())], None)
        .await?;
    Ok(data
        .pointer("/info/uname")
        .and_then(Value::as_str)
        .map(String::from))
}

/// Resolve playable streams for a live room at the given quality.
///
/// Returns every advertised stream; the caller picks by codec and
/// format preference and falls back across hosts.
pub async fn get_live_streams(
    client: &ApiClient,
    room_id: i64,
    qn: i64,
    auth: Option<&AuthInfo>,
) -> PlatformResult<Vec<LiveStream>> {
    let url = format!(
        "{}/xlive/web-room/v2/index/getRoomPlayInfo",
        client.config().live_base
    );
    let params = [
        ("room_id", room_id.to_string()),
        ("protocol", "0,1".to_string()),
        ("format", "0,1,2".to_string()),
        ("codec", "0,1".to_string()),
        ("qn", qn.to_string()),
        ("platform", "web".to_string()),
        ("ptype", "8".to_string()),
    ];
    let data = client.get_json(&url, &params, auth).await?;

    let streams = parse_live_streams(&data);
    if streams.is_empty() {
        return Err(PlatformError::NoStream);
    }
    Ok(streams)
}

fn parse_live_streams(data: &Value) -> Vec<LiveStream> {
    let mut result = Vec::new();
    let Some(streams) = data.pointer("/playurl_info/playurl/stream").and_then(Value::as_array) else {
        return result;
    };

    for stream in streams {
        let Some(formats) = stream.get("format").and_then(Value::as_array) else {
            continue;
        };
        for format in formats {
            let format_name = format
                .get("format_name")
                .and_then(Value::as_str)
                .unwrap_or("flv");
            let Some(codecs) = format.get("codec").and_then(Value::as_array) else {
                continue;
            };
            for codec in codecs {
                let codec_name = codec
                    .get("codec_name")
                    .and_then(Value::as_str)
                    .unwrap_or("avc");
                let current_qn = codec.get("current_qn").and_then(Value::as_i64).unwrap_or(0);
                let base_url = codec.get("base_url").and_then(Value::as_str).unwrap_or("");
                let Some(url_infos) = codec.get("url_info").and_then(Value::as_array) else {
                    continue;
                };
                for info in url_infos {
                    let host = info.get("host").and_then(Value::as_str).unwrap_or("");
                    let extra = info.get("extra").and_then(Value::as_str).unwrap_or("");
                    if host.is_empty() || base_url.is_empty() {
                        continue;
                    }
                    result.push(LiveStream {
                        url: format!("{}{}{}", host, base_url, extra),
                        format: format_name.to_string(),
                        qn: current_qn,
                        codec: codec_name.to_string(),
                    });
                }
            }
        }
    }
    result
}

/// Fetch the danmaku token and host list for a room.
pub async fn get_danmaku_info(
    client: &ApiClient,
    room_id: i64,
    auth: Option<&AuthInfo>,
) -> PlatformResult<DanmakuInfo> {
    let url = format!(
        "{}/xlive/web-room/v1/index/getDanmuInfo",
        client.config().live_base
    );
    let data = client
        .get_json(&url, &[("id", room_id.to_string())], auth)
        .await?;

    let token = data
        .get("token")
        .and_then(Value::as_str)
        .ok_or(PlatformError::MissingField("token"))?
        .to_string();
    let hosts = data
        .get("host_list")
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(|h| {
                    let host = h.get("host").and_then(Value::as_str)?.to_string();
                    let port = h.get("port").and_then(Value::as_i64).unwrap_or(2243) as u16;
                    let wss_port = h.get("wss_port").and_then(Value::as_i64).unwrap_or(443) as u16;
                    Some(DanmakuHost { host, port, wss_port })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(DanmakuInfo { token, hosts })
}
