//! Video metadata lookup.

use serde_json::Value;

use crate::auth::AuthInfo;
use crate::client::ApiClient;
use crate::error::{PlatformError, PlatformResult};

/// One part of a published video.
#[derive(Debug, Clone)]
pub struct VideoPage {
    pub cid: i64,
    pub page: i64,
    pub title: String,
    pub duration_secs: i64,
}

/// Metadata for a published video.
#[derive(Debug, Clone)]
pub struct VideoView {
    pub bvid: String,
    pub aid: i64,
    pub title: String,
    pub pages: Vec<VideoPage>,
}

/// Fetch title and part list for a video by bvid or aid.
pub async fn get_video_view(
    client: &ApiClient,
    bvid: Option<&str>,
    aid: Option<i64>,
    auth: Option<&AuthInfo>,
) -> PlatformResult<VideoView> {
    let mut params = Vec::new();
    if let Some(bvid) = bvid {
        params.push(("bvid", bvid.to_string()));
    }
    if let Some(aid) = aid {
        params.push(("aid", aid.to_string()));
    }

    let url = format!("{}/x/web-interface/view", client.config().api_base);
    let data = client.get_json(&url, &params, auth).await?;

    let pages = data
        .get("pages")
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(|p| {
                    Some(VideoPage {
                        cid: p.get("cid").and_then(Value::as_i64)?,
                        page: p.get("page").and_then(Value::as_i64).unwrap_or(1),
                        title: p
                            .get("part")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        duration_secs: p.get("duration").and_then(Value::as_i64).unwrap_or(0),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(VideoView {
        bvid: data
            .get("bvid")
            .and_then(Value::as_str)
            .ok_or(PlatformError::MissingField("bvid"))?
            .to_string(),
        aid: data
            .get("aid")
            .and_then(Value::as_i64)
            .ok_or(PlatformError::MissingField("aid"))?,
        title: data
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        pages,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_get_video_view() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/x/web-interface/view"))
            .and(query_param("bvid", "BV1xx411c7mD"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 0, "message": "0",
                "data": {
                    "bvid": "BV1xx411c7mD", "aid": 170001, "title": "rec 2026-08-01",
                    "pages": [
                        {"cid": 1001, "page": 1, "part": "p1", "duration": 300},
                        {"cid": 1002, "page": 2, "part": "p2", "duration": 250}
                    ]
                }
            })))
            .mount(&server)
            .await;

        let mut config = crate::client::ApiConfig::default();
        config.api_base = server.uri();
        let client = ApiClient::new(config).unwrap();

        let view = get_video_view(&client, Some("BV1xx411c7mD"), None, None)
            .await
            .unwrap();
        assert_eq!(view.aid, 170001);
        assert_eq!(view.pages.len(), 2);
        assert_eq!(view.pages[1].cid, 1002);
    }
}
