//! Resumable chunked uploads and submission publishing.
//!
//! Upload protocol:
//! 1. `preupload` negotiates an endpoint, a storage uri, an auth token
//!    and the server-chosen chunk size.
//! 2. A session POST yields the upload id that every chunk references.
//! 3. Chunks go up as PUTs carrying part number and byte range.
//! 4. Finalize stitches the parts; the negotiated `biz_id` becomes the
//!    content id used when publishing.

use serde_json::{json, Value};
use tracing::debug;

use crate::auth::AuthInfo;
use crate::client::ApiClient;
use crate::error::{PlatformError, PlatformResult};

/// Everything needed to resume an interrupted upload.
#[derive(Debug, Clone)]
pub struct UploadSession {
    /// Upload host, e.g. `https://upos-cs-upcdn.example.com`
    pub endpoint: String,
    /// Storage path on the endpoint
    pub uri: String,
    /// Auth token sent as `X-Upos-Auth` on every request
    pub auth: String,
    /// Content id assigned at negotiation
    pub biz_id: i64,
    /// Server-chosen chunk size in bytes
    pub chunk_size: i64,
    /// Upload id, set once the session POST succeeds
    pub session_id: Option<String>,
}

impl UploadSession {
    fn object_url(&self) -> String {
        // upos://bucket/key -> https://endpoint/bucket/key
        let path = self.uri.trim_start_matches("upos:/").trim_start_matches('/');
        format!("{}/{}", self.endpoint.trim_end_matches('/'), path)
    }
}

/// Video metadata for publish and edit calls.
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    /// Partition id
    pub tid: i64,
    /// 1 original, 2 repost
    pub copyright: i64,
    pub source: Option<String>,
    pub cover_url: Option<String>,
    /// Parts in presentation order
    pub videos: Vec<PublishVideo>,
}

#[derive(Debug, Clone)]
pub struct PublishVideo {
    pub cid: i64,
    pub title: String,
}

/// Identity assigned by the platform at publish time.
#[derive(Debug, Clone)]
pub struct RemoteIdentity {
    pub bvid: String,
    pub aid: i64,
}

/// Negotiate a new upload for a file.
pub async fn preupload(
    client: &ApiClient,
    file_name: &str,
    size: u64,
    auth: &AuthInfo,
) -> PlatformResult<UploadSession> {
    let url = format!("{}/preupload", client.config().upload_base);
    let params = [
        ("name", file_name.to_string()),
        ("size", size.to_string()),
        ("r", "upos".to_string()),
        ("profile", "ugcfx/bup".to_string()),
        ("ssl", "0".to_string()),
        ("version", "2.14.0".to_string()),
    ];

    let body = client
        .http()
        .get(&url)
        .query(&params)
        .header("Cookie", &auth.cookie)
        .send()
        .await?
        .text()
        .await?;
    let data: Value = serde_json::from_str(&body)?;

    if data.get("OK").and_then(Value::as_i64) != Some(1) {
        let message = data
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("preupload rejected");
        return Err(PlatformError::api(-1, message));
    }

    let endpoint = data
        .get("endpoint")
        .and_then(Value::as_str)
        .ok_or(PlatformError::MissingField("endpoint"))?;
    // Endpoint comes back scheme-less, like "//upos-cs-upcdn.example.com"
    let endpoint = if endpoint.starts_with("//") {
        format!("https:{}", endpoint)
    } else {
        endpoint.to_string()
    };

    Ok(UploadSession {
        endpoint,
        uri: data
            .get("upos_uri")
            .and_then(Value::as_str)
            .ok_or(PlatformError::MissingField("upos_uri"))?
            .to_string(),
        auth: data
            .get("auth")
            .and_then(Value::as_str)
            .ok_or(PlatformError::MissingField("auth"))?
            .to_string(),
        biz_id: data
            .get("biz_id")
            .and_then(Value::as_i64)
            .ok_or(PlatformError::MissingField("biz_id"))?,
        chunk_size: data
            .get("chunk_size")
            .and_then(Value::as_i64)
            .unwrap_or(10 * 1024 * 1024),
        session_id: None,
    })
}

/// Open the multipart session, filling in `session_id`.
pub async fn open_session(
    client: &ApiClient,
    session: &mut UploadSession,
) -> PlatformResult<()> {
    let url = format!("{}?uploads&output=json", session.object_url());
    let body = client
        .http()
        .post(&url)
        .header("X-Upos-Auth", &session.auth)
        .send()
        .await?
        .text()
        .await?;
    let data: Value = serde_json::from_str(&body)?;

    let upload_id = data
        .get("upload_id")
        .and_then(Value::as_str)
        .ok_or(PlatformError::MissingField("upload_id"))?;
    session.session_id = Some(upload_id.to_string());
    Ok(())
}

/// Upload one chunk. `part_index` is zero-based; the wire protocol
/// numbers parts from one.
pub async fn upload_chunk(
    client: &ApiClient,
    session: &UploadSession,
    part_index: i64,
    total_parts: i64,
    offset: u64,
    total_size: u64,
    chunk: Vec<u8>,
) -> PlatformResult<()> {
    let session_id = session
        .session_id
        .as_deref()
        .ok_or(PlatformError::MissingField("session_id"))?;

    let end = offset + chunk.len() as u64;
    let url = format!(
        "{}?partNumber={}&uploadId={}&chunk={}&chunks={}&size={}&start={}&end={}&total={}",
        session.object_url(),
        part_index + 1,
        session_id,
        part_index,
        total_parts,
        chunk.len(),
        offset,
        end,
        total_size,
    );

    debug!(part_index, offset, size = chunk.len(), "uploading chunk");

    let response = client
        .http()
        .put(&url)
        .header("X-Upos-Auth", &session.auth)
        .body(chunk)
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(PlatformError::ChunkFailed {
            part_index,
            status: response.status().as_u16(),
        });
    }
    Ok(())
}

/// Stitch the uploaded parts. Returns the content id for publishing.
pub async fn finalize_upload(
    client: &ApiClient,
    session: &UploadSession,
    file_name: &str,
    total_parts: i64,
) -> PlatformResult<i64> {
    let session_id = session
        .session_id
        .as_deref()
        .ok_or(PlatformError::MissingField("session_id"))?;

    let url = format!(
        "{}?output=json&name={}&profile=ugcfx%2Fbup&uploadId={}&biz_id={}",
        session.object_url(),
        urlencode(file_name),
        session_id,
        session.biz_id,
    );

    let parts: Vec<Value> = (1..=total_parts)
        .map(|n| json!({"partNumber": n, "eTag": "etag"}))
        .collect();

    let body = client
        .http()
        .post(&url)
        .header("X-Upos-Auth", &session.auth)
        .json(&json!({"parts": parts}))
        .send()
        .await?
        .text()
        .await?;
    let data: Value = serde_json::from_str(&body)?;

    if data.get("OK").and_then(Value::as_i64) != Some(1) {
        return Err(PlatformError::api(-1, "finalize rejected"));
    }
    Ok(session.biz_id)
}

/// Publish a new submission from uploaded parts.
pub async fn publish(
    client: &ApiClient,
    request: &PublishRequest,
    auth: &AuthInfo,
) -> PlatformResult<RemoteIdentity> {
    let url = format!("{}/x/vu/web/add/v3", client.config().api_base);
    let body = publish_body(request);
    let data = client
        .post_json(&url, &[("csrf", auth.csrf.clone())], &body, Some(auth))
        .await?;

    Ok(RemoteIdentity {
        bvid: data
            .get("bvid")
            .and_then(Value::as_str)
            .ok_or(PlatformError::MissingField("bvid"))?
            .to_string(),
        aid: data
            .get("aid")
            .and_then(Value::as_i64)
            .ok_or(PlatformError::MissingField("aid"))?,
    })
}

/// Append parts to an already-published submission.
pub async fn edit(
    client: &ApiClient,
    identity: &RemoteIdentity,
    request: &PublishRequest,
    auth: &AuthInfo,
) -> PlatformResult<()> {
    let url = format!("{}/x/vu/web/edit", client.config().api_base);
    let mut body = publish_body(request);
    body["aid"] = json!(identity.aid);
    body["bvid"] = json!(identity.bvid);

    client
        .post_json(&url, &[("csrf", auth.csrf.clone())], &body, Some(auth))
        .await?;
    Ok(())
}

fn publish_body(request: &PublishRequest) -> Value {
    json!({
        "title": request.title,
        "desc": request.description,
        "tag": request.tags.join(","),
        "tid": request.tid,
        "copyright": request.copyright,
        "source": request.source.clone().unwrap_or_default(),
        "cover": request.cover_url.clone().unwrap_or_default(),
        "videos": request.videos.iter().map(|v| json!({
            "cid": v.cid,
            "title": v.title,
            "filename": format!("n_{}", v.cid),
        })).collect::<Vec<_>>(),
    })
}

/// List available submission partitions.
pub async fn list_partitions(client: &ApiClient, auth: &AuthInfo) -> PlatformResult<Value> {
    let url = format!("{}/x/vu/web/archive/pre", client.config().api_base);
    let data = client.get_json(&url, &[], Some(auth)).await?;
    data.get("typelist")
        .cloned()
        .ok_or(PlatformError::MissingField("typelist"))
}

fn urlencode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn session_for(server_uri: &str) -> UploadSession {
        UploadSession {
            endpoint: server_uri.to_string(),
            uri: "upos://ugcfx/n_12345.mp4".to_string(),
            auth: "token".to_string(),
            biz_id: 12345,
            chunk_size: 4,
            session_id: Some("sess-1".to_string()),
        }
    }

    #[test]
    fn test_object_url() {
        let session = session_for("https://upos.example.com");
        assert_eq!(
            session.object_url(),
            "https://upos.example.com/ugcfx/n_12345.mp4"
        );
    }

    #[tokio::test]
    async fn test_preupload_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/preupload"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "OK": 0, "message": "file too large"
            })))
            .mount(&server)
            .await;

        let mut config = crate::client::ApiConfig::default();
        config.upload_base = server.uri();
        let client = ApiClient::new(config).unwrap();
        let auth = AuthInfo::from_cookie("SESSDATA=x; bili_jct=y");

        let err = preupload(&client, "a.mp4", 100, &auth).await.unwrap_err();
        assert!(err.to_string().contains("file too large"));
    }

    #[tokio::test]
    async fn test_upload_chunk_numbers_parts_from_one() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/ugcfx/n_12345.mp4"))
            .and(query_param("partNumber", "1"))
            .and(query_param("uploadId", "sess-1"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = ApiClient::new(crate::client::ApiConfig::default()).unwrap();
        let session = session_for(&server.uri());

        upload_chunk(&client, &session, 0, 3, 0, 12, vec![0u8; 4])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_upload_chunk_server_error_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = ApiClient::new(crate::client::ApiConfig::default()).unwrap();
        let session = session_for(&server.uri());

        let err = upload_chunk(&client, &session, 2, 3, 8, 12, vec![0u8; 4])
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(err, PlatformError::ChunkFailed { part_index: 2, .. }));
    }
}
