//! Base HTTP client for the platform's JSON API.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, REFERER, USER_AGENT};
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use crate::auth::AuthInfo;
use crate::error::{PlatformError, PlatformResult};

const DESKTOP_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.0.0 Safari/537.36";

/// Endpoint configuration, overridable for tests.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub api_base: String,
    pub live_base: String,
    pub upload_base: String,
    pub timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.bilibili.com".to_string(),
            live_base: "https://api.live.bilibili.com".to_string(),
            upload_base: "https://member.bilibili.com".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// JSON API client with the platform's response envelope handling.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: Client,
    config: ApiConfig,
}

impl ApiClient {
    pub fn new(config: ApiConfig) -> PlatformResult<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .default_headers(default_headers())
            .build()?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    pub fn http(&self) -> &Client {
        &self.http
    }

    /// GET a JSON endpoint and unwrap the `data` envelope.
    pub async fn get_json(
        &self,
        url: &str,
        params: &[(&str, String)],
        auth: Option<&AuthInfo>,
    ) -> PlatformResult<Value> {
        debug!(url, "GET");
        let mut request = self.http.get(url).query(params);
        request = apply_auth(request, url, auth)?;
        let body = request.send().await?.text().await?;
        parse_response(&body)
    }

    /// POST a form body and unwrap the `data` envelope.
    pub async fn post_form(
        &self,
        url: &str,
        form: &[(&str, String)],
        auth: Option<&AuthInfo>,
    ) -> PlatformResult<Value> {
        debug!(url, "POST form");
        let mut request = self.http.post(url).form(form);
        request = apply_auth(request, url, auth)?;
        let body = request.send().await?.text().await?;
        parse_response(&body)
    }

    /// POST a JSON body and unwrap the `data` envelope.
    pub async fn post_json(
        &self,
        url: &str,
        params: &[(&str, String)],
        body: &Value,
        auth: Option<&AuthInfo>,
    ) -> PlatformResult<Value> {
        debug!(url, "POST json");
        let mut request = self.http.post(url).query(params).json(body);
        request = apply_auth(request, url, auth)?;
        let text = request.send().await?.text().await?;
        parse_response(&text)
    }
}

fn apply_auth(
    request: reqwest::RequestBuilder,
    url: &str,
    auth: Option<&AuthInfo>,
) -> PlatformResult<reqwest::RequestBuilder> {
    let mut request = request;
    if let Some(auth) = auth {
        let cookie =
            HeaderValue::from_str(&auth.cookie).map_err(|_| PlatformError::InvalidHeader)?;
        request = request.header("Cookie", cookie);
    }
    // Live endpoints reject requests without a matching referer
    if url.contains("live.bilibili.com") {
        request = request
            .header(REFERER, "https://live.bilibili.com/")
            .header("Origin", "https://live.bilibili.com");
    }
    Ok(request)
}

/// Unwrap the `{code, message, data}` envelope the platform uses.
///
/// A non-zero `code` is an API error regardless of HTTP status.
pub fn parse_response(body: &str) -> PlatformResult<Value> {
    let value: Value = serde_json::from_str(body)?;

    if let Some(code) = value.get("code").and_then(Value::as_i64) {
        if code != 0 {
            let message = value
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("platform returned an error");
            return Err(PlatformError::api(code, message));
        }
    }

    if let Some(data) = value.get("data") {
        return Ok(data.clone());
    }
    Ok(value)
}

fn default_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(DESKTOP_UA));
    headers.insert(
        ACCEPT,
        HeaderValue::from_static("application/json, text/javascript, */*; q=0.01"),
    );
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("zh-CN"));
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_response_unwraps_data() {
        let data = parse_response(r#"{"code": 0, "message": "0", "data": {"title": "x"}}"#).unwrap();
        assert_eq!(data["title"], "x");
    }

    #[test]
    fn test_parse_response_nonzero_code() {
        let err = parse_response(r#"{"code": -101, "message": "not logged in"}"#).unwrap_err();
        assert_eq!(err.to_string(), "not logged in (code: -101)");
    }

    #[test]
    fn test_parse_response_without_envelope() {
        let data = parse_response(r#"{"title": "bare"}"#).unwrap();
        assert_eq!(data["title"], "bare");
    }

    #[tokio::test]
    async fn test_get_json_against_mock() {
        use wiremock::matchers::{method, path, query_param};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/x/test"))
            .and(query_param("id", "7"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "code": 0, "message": "0", "data": {"ok": true}
            })))
            .mount(&server)
            .await;

        let client = ApiClient::new(ApiConfig::default()).unwrap();
        let url = format!("{}/x/test", server.uri());
        let data = client
            .get_json(&url, &[("id", "7".to_string())], None)
            .await
            .unwrap();
        assert_eq!(data["ok"], true);
    }
}
