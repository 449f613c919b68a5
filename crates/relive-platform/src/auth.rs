//! Login credentials.

use serde::{Deserialize, Serialize};

/// Stored login state: the full cookie jar plus the CSRF token most
/// write endpoints require.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthInfo {
    pub cookie: String,
    pub csrf: String,
    pub uid: Option<i64>,
}

impl AuthInfo {
    /// Build from a raw cookie string, extracting the CSRF token.
    pub fn from_cookie(cookie: impl Into<String>) -> Self {
        let cookie = cookie.into();
        let csrf = cookie_value(&cookie, "bili_jct").unwrap_or_default();
        let uid = cookie_value(&cookie, "DedeUserID").and_then(|v| v.parse().ok());
        Self { cookie, csrf, uid }
    }

    pub fn is_usable(&self) -> bool {
        !self.cookie.is_empty() && !self.csrf.is_empty()
    }
}

fn cookie_value(cookie: &str, key: &str) -> Option<String> {
    cookie.split(';').find_map(|part| {
        let (k, v) = part.trim().split_once('=')?;
        (k == key).then(|| v.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_cookie() {
        let auth = AuthInfo::from_cookie("SESSDATA=abc; bili_jct=tok123; DedeUserID=42");
        assert_eq!(auth.csrf, "tok123");
        assert_eq!(auth.uid, Some(42));
        assert!(auth.is_usable());
    }

    #[test]
    fn test_missing_csrf() {
        let auth = AuthInfo::from_cookie("SESSDATA=abc");
        assert!(!auth.is_usable());
    }
}
