//! Content security checks run on behalf of an authorized mini program.
//!
//! Both calls take the authorizer's access token explicitly; fetching it is
//! the caller's job (usually [`TokenManager::get_authorizer_access_token`]).
//!
//! [`TokenManager::get_authorizer_access_token`]: crate::token::TokenManager::get_authorizer_access_token

use crate::config::ConfigHandle;
use crate::remote::{check_errcode, PlatformApi};
use crate::token::TokenError;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// Scene value for text checks: user-generated content.
const SCENE_UGC: u8 = 2;
const MSG_SEC_CHECK_VERSION: u8 = 2;

/// Kind of media submitted for asynchronous review.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    Audio = 1,
    Image = 2,
}

impl MediaType {
    /// Parses the platform's numeric code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Audio),
            2 => Some(Self::Image),
            _ => None,
        }
    }
}

/// Text check request. `title`, `nickname` and `signature` give the platform
/// extra context and are omitted when empty.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TextCheck {
    pub content: String,
    pub openid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

#[derive(Serialize)]
struct TextCheckBody<'a> {
    #[serde(flatten)]
    check: &'a TextCheck,
    version: u8,
    scene: u8,
}

#[derive(Serialize)]
struct MediaCheckBody<'a> {
    media_url: &'a str,
    media_type: u8,
    version: u8,
    scene: u8,
    openid: &'a str,
}

/// Client for the `/wxa` security endpoints.
#[derive(Clone)]
pub struct ContentSecurity {
    config: ConfigHandle,
    api: Arc<dyn PlatformApi>,
}

impl ContentSecurity {
    pub fn new(config: ConfigHandle, api: Arc<dyn PlatformApi>) -> Self {
        Self { config, api }
    }

    /// Synchronous text check. The verdict is in the returned `result`
    /// object (`suggest`, `label`).
    pub async fn msg_sec_check(
        &self,
        access_token: &str,
        check: &TextCheck,
    ) -> Result<Value, TokenError> {
        if access_token.is_empty() {
            return Err(TokenError::MissingParameter("access_token"));
        }
        if check.content.is_empty() {
            return Err(TokenError::MissingParameter("content"));
        }
        if check.openid.is_empty() {
            return Err(TokenError::MissingParameter("openid"));
        }

        let body = TextCheckBody {
            check,
            version: MSG_SEC_CHECK_VERSION,
            scene: SCENE_UGC,
        };
        self.post("msg_sec_check", "/wxa/msg_sec_check", access_token, &body)
            .await
    }

    /// Submits media for review. The verdict arrives later as a
    /// `wxa_media_check` event keyed by the returned `trace_id`.
    pub async fn media_check_async(
        &self,
        access_token: &str,
        media_url: &str,
        media_type: MediaType,
        openid: &str,
    ) -> Result<Value, TokenError> {
        if access_token.is_empty() {
            return Err(TokenError::MissingParameter("access_token"));
        }
        if media_url.is_empty() {
            return Err(TokenError::MissingParameter("media_url"));
        }
        if openid.is_empty() {
            return Err(TokenError::MissingParameter("openid"));
        }

        let body = MediaCheckBody {
            media_url,
            media_type: media_type as u8,
            version: MSG_SEC_CHECK_VERSION,
            scene: SCENE_UGC,
            openid,
        };
        let data = self
            .post("media_check_async", "/wxa/media_check_async", access_token, &body)
            .await?;
        debug!(
            trace_id = data
                .get("trace_id")
                .and_then(serde_json::Value::as_str)
                .unwrap_or(""),
            "Media submitted for review"
        );
        Ok(data)
    }

    async fn post<B: Serialize>(
        &self,
        operation: &'static str,
        path: &str,
        access_token: &str,
        body: &B,
    ) -> Result<Value, TokenError> {
        let cfg = self.config.snapshot();
        let url = format!(
            "{}{}?access_token={}",
            cfg.api_base_url,
            path,
            urlencoding::encode(access_token)
        );
        let body = serde_json::to_value(body).map_err(|_| TokenError::MissingField {
            operation,
            field: "body",
        })?;

        let response = self.api.post(&url, &body).await?;
        check_errcode(response).map_err(|failure| {
            warn!(operation, errcode = failure.errcode, "Security check rejected");
            TokenError::RemoteApi {
                operation,
                errcode: failure.errcode,
                errmsg: failure.errmsg,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WechatConfig;
    use crate::remote::HttpPlatformApi;
    use mockito::Matcher;
    use serde_json::json;

    fn security(base: &str) -> ContentSecurity {
        let config = ConfigHandle::new(WechatConfig {
            api_base_url: base.to_string(),
            ..WechatConfig::default()
        });
        ContentSecurity::new(config, Arc::new(HttpPlatformApi::new().unwrap()))
    }

    #[test]
    fn test_media_type_codes() {
        assert_eq!(MediaType::from_code(1), Some(MediaType::Audio));
        assert_eq!(MediaType::from_code(2), Some(MediaType::Image));
        assert_eq!(MediaType::from_code(3), None);
    }

    #[tokio::test]
    async fn test_msg_sec_check_validates_inputs() {
        let client = security("http://unused");
        let check = TextCheck {
            content: "hello".to_string(),
            ..TextCheck::default()
        };

        let err = client.msg_sec_check("", &check).await.unwrap_err();
        assert!(matches!(err, TokenError::MissingParameter("access_token")));

        let err = client.msg_sec_check("tok", &check).await.unwrap_err();
        assert!(matches!(err, TokenError::MissingParameter("openid")));
    }

    #[tokio::test]
    async fn test_msg_sec_check_body() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/wxa/msg_sec_check")
            .match_query(Matcher::UrlEncoded("access_token".into(), "atoken".into()))
            .match_body(Matcher::Json(json!({
                "content": "hello",
                "openid": "o1",
                "nickname": "nick",
                "version": 2,
                "scene": 2,
            })))
            .with_status(200)
            .with_body(r#"{"errcode":0,"result":{"suggest":"pass","label":100}}"#)
            .create_async()
            .await;

        let check = TextCheck {
            content: "hello".to_string(),
            openid: "o1".to_string(),
            nickname: Some("nick".to_string()),
            ..TextCheck::default()
        };
        let result = security(&server.url())
            .msg_sec_check("atoken", &check)
            .await
            .unwrap();

        assert_eq!(result["result"]["suggest"], "pass");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_media_check_async() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/wxa/media_check_async")
            .match_query(Matcher::Any)
            .match_body(Matcher::PartialJson(json!({
                "media_url": "https://cdn.example.com/a.png",
                "media_type": 2,
                "openid": "o1",
            })))
            .with_status(200)
            .with_body(r#"{"errcode":0,"trace_id":"trace_1"}"#)
            .create_async()
            .await;

        let result = security(&server.url())
            .media_check_async("atoken", "https://cdn.example.com/a.png", MediaType::Image, "o1")
            .await
            .unwrap();

        assert_eq!(result["trace_id"], "trace_1");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_media_check_remote_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/wxa/media_check_async")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"errcode":40001,"errmsg":"invalid credential"}"#)
            .create_async()
            .await;

        let err = security(&server.url())
            .media_check_async("bad", "https://cdn.example.com/a.mp3", MediaType::Audio, "o1")
            .await
            .unwrap_err();
        assert!(matches!(err, TokenError::RemoteApi { errcode: 40001, .. }));
    }
}
