//! Play-url resolution and stream candidate selection.

use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::auth::AuthInfo;
use crate::client::ApiClient;
use crate::error::{PlatformError, PlatformResult};

/// Codec preference when no explicit codec was requested.
const CODEC_PRIORITY: [&str; 5] = ["avc1", "hev1", "hvc1", "vp09", "av01"];

/// fnval tiers tried in order: full DASH, basic DASH, single mp4, flv.
const FNVAL_TIERS: [&str; 4] = ["4048", "16", "1", "0"];

/// One downloadable stream with its ranked mirror URLs.
#[derive(Debug, Clone)]
pub struct StreamCandidate {
    pub id: Option<i64>,
    pub bandwidth: i64,
    pub codec: Option<String>,
    pub urls: Vec<String>,
}

/// The resolved streams for one video.
#[derive(Debug, Clone)]
pub enum PlaySelection {
    /// Separate video and audio streams to be muxed after download
    Dash {
        video: StreamCandidate,
        audio: StreamCandidate,
    },
    /// A single progressive file
    Progressive { urls: Vec<String> },
}

/// Identifies the video to resolve.
#[derive(Debug, Clone, Default)]
pub struct PlayUrlRequest {
    pub bvid: Option<String>,
    pub aid: Option<i64>,
    pub cid: i64,
    pub resolution: Option<String>,
    pub codec: Option<String>,
}

/// Resolve streams for a video, walking down the fnval tiers until one
/// yields a playable selection.
pub async fn resolve_play_selection(
    client: &ApiClient,
    request: &PlayUrlRequest,
    auth: Option<&AuthInfo>,
    block_pcdn: bool,
) -> PlatformResult<PlaySelection> {
    let mut last_err = PlatformError::NoStream;

    for fnval in FNVAL_TIERS {
        let play_info = match fetch_play_info(client, request, fnval, auth).await {
            Ok(info) => info,
            Err(e) => {
                warn!(fnval, error = %e, "play-url request failed, trying next tier");
                last_err = e;
                continue;
            }
        };

        if let Some(dash) = play_info.get("dash") {
            let videos = select_video_candidates(
                dash,
                request.resolution.as_deref(),
                request.codec.as_deref(),
                block_pcdn,
            );
            let audios = select_audio_candidates(dash, block_pcdn);
            match (videos, audios) {
                (Ok(mut videos), Ok(mut audios)) => {
                    return Ok(PlaySelection::Dash {
                        video: videos.remove(0),
                        audio: audios.remove(0),
                    });
                }
                (Err(e), _) | (_, Err(e)) => {
                    warn!(fnval, error = %e, "dash selection failed, trying next tier");
                    last_err = e;
                    continue;
                }
            }
        }

        match collect_durl_urls(&play_info, block_pcdn) {
            Ok(urls) => return Ok(PlaySelection::Progressive { urls }),
            Err(e) => {
                debug!(fnval, error = %e, "no progressive urls at this tier");
                last_err = e;
            }
        }
    }

    Err(last_err)
}

async fn fetch_play_info(
    client: &ApiClient,
    request: &PlayUrlRequest,
    fnval: &str,
    auth: Option<&AuthInfo>,
) -> PlatformResult<Value> {
    let is_logged_in = auth.is_some();
    let qn = request
        .resolution
        .clone()
        .unwrap_or_else(|| if is_logged_in { "127".to_string() } else { "64".to_string() });

    let mut params = vec![
        ("cid", request.cid.to_string()),
        ("qn", qn),
        ("fnval", fnval.to_string()),
        ("fnver", "0".to_string()),
        ("fourk", "1".to_string()),
    ];
    if let Some(bvid) = &request.bvid {
        params.push(("bvid", bvid.clone()));
    }
    if let Some(aid) = request.aid {
        params.push(("avid", aid.to_string()));
    }

    let url = format!("{}/x/player/wbi/playurl", client.config().api_base);
    client.get_json(&url, &params, auth).await
}

/// Pull the progressive urls out of a durl-style response.
pub fn collect_durl_urls(play_info: &Value, block_pcdn: bool) -> PlatformResult<Vec<String>> {
    let durl = play_info
        .get("durl")
        .and_then(Value::as_array)
        .and_then(|list| list.first())
        .ok_or(PlatformError::MissingField("durl"))?;

    let mut urls = Vec::new();
    if let Some(url) = durl.get("url").and_then(Value::as_str) {
        urls.push(url.to_string());
    }
    if let Some(list) = durl.get("backup_url").and_then(Value::as_array) {
        urls.extend(list.iter().filter_map(Value::as_str).map(String::from));
    }

    let urls = normalize_stream_urls(urls, block_pcdn);
    if urls.is_empty() {
        return Err(PlatformError::NoStream);
    }
    Ok(urls)
}

/// Rank the DASH video streams best-first.
///
/// Preference: requested resolution and codec together, then resolution
/// alone, then codec alone, then bandwidth.
pub fn select_video_candidates(
    dash: &Value,
    resolution: Option<&str>,
    codec: Option<&str>,
    block_pcdn: bool,
) -> PlatformResult<Vec<StreamCandidate>> {
    let videos = dash
        .get("video")
        .and_then(Value::as_array)
        .ok_or(PlatformError::MissingField("dash.video"))?;

    let mut candidates: Vec<StreamCandidate> = videos
        .iter()
        .filter_map(|item| {
            let urls = stream_urls_from_item(item, block_pcdn);
            if urls.is_empty() {
                return None;
            }
            Some(StreamCandidate {
                id: item.get("id").and_then(Value::as_i64),
                bandwidth: item.get("bandwidth").and_then(Value::as_i64).unwrap_or(0),
                codec: item.get("codecs").and_then(Value::as_str).map(String::from),
                urls,
            })
        })
        .collect();

    if candidates.is_empty() {
        return Err(PlatformError::NoStream);
    }

    let target_resolution = choose_target_resolution(&candidates, resolution);
    let target_codec = choose_target_codec(&candidates, target_resolution, codec);

    candidates.sort_by(|a, b| {
        let rank = |c: &StreamCandidate| {
            let res = target_resolution.map(|r| c.id == Some(r)).unwrap_or(false);
            let cod = target_codec
                .as_deref()
                .map(|t| codec_matches(c, t))
                .unwrap_or(false);
            match (res, cod) {
                (true, true) => 0,
                (true, false) => 1,
                (false, true) => 2,
                (false, false) => 3,
            }
        };
        rank(a)
            .cmp(&rank(b))
            .then_with(|| b.bandwidth.cmp(&a.bandwidth))
    });

    Ok(candidates)
}

/// Rank the DASH audio streams by bandwidth, best-first.
pub fn select_audio_candidates(
    dash: &Value,
    block_pcdn: bool,
) -> PlatformResult<Vec<StreamCandidate>> {
    let audios = dash
        .get("audio")
        .and_then(Value::as_array)
        .ok_or(PlatformError::MissingField("dash.audio"))?;

    let mut candidates: Vec<StreamCandidate> = audios
        .iter()
        .filter_map(|item| {
            let urls = stream_urls_from_item(item, block_pcdn);
            if urls.is_empty() {
                return None;
            }
            Some(StreamCandidate {
                id: item.get("id").and_then(Value::as_i64),
                bandwidth: item.get("bandwidth").and_then(Value::as_i64).unwrap_or(0),
                codec: None,
                urls,
            })
        })
        .collect();

    if candidates.is_empty() {
        return Err(PlatformError::NoStream);
    }
    candidates.sort_by(|a, b| b.bandwidth.cmp(&a.bandwidth));
    Ok(candidates)
}

fn codec_matches(candidate: &StreamCandidate, codec: &str) -> bool {
    candidate
        .codec
        .as_deref()
        .map(|c| c.contains(codec))
        .unwrap_or(false)
}

fn choose_target_resolution(candidates: &[StreamCandidate], resolution: Option<&str>) -> Option<i64> {
    let mut ids: Vec<i64> = candidates.iter().filter_map(|c| c.id).collect();
    if ids.is_empty() {
        return None;
    }
    if let Some(requested) = resolution.and_then(|r| r.parse::<i64>().ok()) {
        if ids.contains(&requested) {
            return Some(requested);
        }
    }
    ids.sort_unstable();
    ids.pop()
}

fn choose_target_codec(
    candidates: &[StreamCandidate],
    target_resolution: Option<i64>,
    codec: Option<&str>,
) -> Option<String> {
    let filtered: Vec<&StreamCandidate> = candidates
        .iter()
        .filter(|c| target_resolution.map(|r| c.id == Some(r)).unwrap_or(true))
        .collect();
    if filtered.is_empty() {
        return None;
    }
    if let Some(codec) = codec {
        if filtered.iter().any(|c| codec_matches(c, codec)) {
            return Some(codec.to_string());
        }
    }
    for codec in CODEC_PRIORITY {
        if filtered.iter().any(|c| codec_matches(c, codec)) {
            return Some(codec.to_string());
        }
    }
    filtered.iter().find_map(|c| c.codec.clone())
}

fn stream_urls_from_item(item: &Value, block_pcdn: bool) -> Vec<String> {
    let mut urls = Vec::new();
    if let Some(url) = item
        .get("base_url")
        .or_else(|| item.get("baseUrl"))
        .and_then(Value::as_str)
    {
        urls.push(url.to_string());
    }
    if let Some(list) = item
        .get("backup_url")
        .or_else(|| item.get("backupUrl"))
        .and_then(Value::as_array)
    {
        urls.extend(list.iter().filter_map(Value::as_str).map(String::from));
    }
    normalize_stream_urls(urls, block_pcdn)
}

fn normalize_stream_urls(urls: Vec<String>, block_pcdn: bool) -> Vec<String> {
    let urls = dedup_urls(urls);
    let urls = if block_pcdn { filter_pcdn_urls(urls) } else { urls };
    dedup_urls(urls)
}

fn dedup_urls(urls: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    urls.into_iter().filter(|u| seen.insert(u.clone())).collect()
}

/// Drop peer-CDN hosts, which throttle or corrupt large transfers.
///
/// Preference order: mirror hosts, then upos, then cn-prefixed bcache
/// hosts rewritten onto known-good mirrors. Unparseable urls pass
/// through untouched.
fn filter_pcdn_urls(urls: Vec<String>) -> Vec<String> {
    let mut mirror = Vec::new();
    let mut upos = Vec::new();
    let mut bcache = Vec::new();
    let mut others = Vec::new();

    for raw in urls {
        match Url::parse(&raw) {
            Ok(url) => {
                let host = url.host_str().unwrap_or("");
                let os = url
                    .query_pairs()
                    .find(|(key, _)| key == "os")
                    .map(|(_, value)| value.to_string())
                    .unwrap_or_default();
                if host.contains("mirror") && os.ends_with("bv") {
                    mirror.push(url);
                } else if os == "upos" {
                    upos.push(url);
                } else if host.starts_with("cn") && os == "bcache" {
                    bcache.push(url);
                } else {
                    others.push(url.to_string());
                }
            }
            Err(_) => others.push(raw),
        }
    }

    if !mirror.is_empty() {
        let combined = if mirror.len() < 2 {
            mirror.into_iter().chain(upos).collect::<Vec<_>>()
        } else {
            mirror
        };
        return combined.into_iter().map(|u| u.to_string()).collect();
    }

    if !upos.is_empty() || !bcache.is_empty() {
        let mut results = if !upos.is_empty() { upos } else { bcache };
        let mirror_hosts = [
            "upos-sz-mirrorali.bilivideo.com",
            "upos-sz-mirrorcos.bilivideo.com",
        ];
        for (index, url) in results.iter_mut().enumerate() {
            if let Some(host) = mirror_hosts.get(index) {
                let _ = url.set_host(Some(host));
            }
        }
        return results.into_iter().map(|u| u.to_string()).collect();
    }

    others
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dash_fixture() -> Value {
        json!({
            "video": [
                {"id": 80, "bandwidth": 2000, "codecs": "avc1.640032", "base_url": "https://upos-a.example.com/v80avc?os=upos"},
                {"id": 80, "bandwidth": 1500, "codecs": "hev1.1.6", "base_url": "https://upos-b.example.com/v80hev?os=upos"},
                {"id": 32, "bandwidth": 800, "codecs": "avc1.64001F", "base_url": "https://upos-c.example.com/v32avc?os=upos"}
            ],
            "audio": [
                {"id": 30280, "bandwidth": 320000, "base_url": "https://upos-d.example.com/a-hi?os=upos"},
                {"id": 30216, "bandwidth": 64000, "base_url": "https://upos-e.example.com/a-lo?os=upos"}
            ]
        })
    }

    #[test]
    fn test_video_selection_prefers_avc_at_top_resolution() {
        let dash = dash_fixture();
        let candidates = select_video_candidates(&dash, None, None, false).unwrap();
        assert_eq!(candidates[0].id, Some(80));
        assert!(candidates[0].codec.as_deref().unwrap().starts_with("avc1"));
    }

    #[test]
    fn test_video_selection_honors_requested_codec() {
        let dash = dash_fixture();
        let candidates = select_video_candidates(&dash, None, Some("hev1"), false).unwrap();
        assert!(candidates[0].codec.as_deref().unwrap().starts_with("hev1"));
    }

    #[test]
    fn test_video_selection_honors_requested_resolution() {
        let dash = dash_fixture();
        let candidates = select_video_candidates(&dash, Some("32"), None, false).unwrap();
        assert_eq!(candidates[0].id, Some(32));
    }

    #[test]
    fn test_audio_selection_highest_bandwidth_first() {
        let dash = dash_fixture();
        let candidates = select_audio_candidates(&dash, false).unwrap();
        assert_eq!(candidates[0].bandwidth, 320000);
    }

    #[test]
    fn test_durl_fallback() {
        let play_info = json!({
            "durl": [{"url": "https://upos-f.example.com/full.mp4?os=upos", "backup_url": ["https://upos-g.example.com/full2.mp4?os=upos"]}]
        });
        let urls = collect_durl_urls(&play_info, false).unwrap();
        assert_eq!(urls.len(), 2);
    }

    #[test]
    fn test_pcdn_filter_prefers_mirror() {
        let urls = vec![
            "https://xy123.mcdn.example.com/seg.m4s?os=mcdnbv".to_string(),
            "https://upos-sz-mirrorali.bilivideo.com/seg.m4s?os=alibv".to_string(),
        ];
        let filtered = filter_pcdn_urls(urls);
        assert!(filtered.iter().all(|u| u.contains("mirror")));
    }

    #[test]
    fn test_pcdn_filter_rewrites_bcache_hosts() {
        let urls = vec!["https://cn-gd-dx-v-01.bilivideo.com/seg.m4s?os=bcache".to_string()];
        let filtered = filter_pcdn_urls(urls);
        assert!(filtered[0].contains("upos-sz-mirrorali"));
    }

    #[test]
    fn test_dedup_keeps_order() {
        let urls = vec!["a".to_string(), "b".to_string(), "a".to_string()];
        assert_eq!(dedup_urls(urls), vec!["a".to_string(), "b".to_string()]);
    }
}
