//! Outbound platform API calls.
//!
//! Every platform endpoint answers JSON with the same envelope: a non-zero
//! `errcode` means failure and `errmsg` explains it. Transport concerns stay
//! behind [`PlatformApi`]; interpreting the envelope is [`check_errcode`].

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Transport-level failure talking to the platform.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("request to {url} failed: {message}")]
    Request { url: String, message: String },
    #[error("platform returned HTTP {status} for {url}")]
    Status { url: String, status: u16 },
    #[error("invalid JSON from {url}: {message}")]
    InvalidBody { url: String, message: String },
}

/// Platform-reported failure extracted from a response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiFailure {
    pub errcode: i64,
    pub errmsg: String,
}

/// Capability to POST JSON to the platform.
#[async_trait]
pub trait PlatformApi: Send + Sync {
    /// POSTs `body` to `url` and returns the decoded JSON response.
    async fn post(&self, url: &str, body: &Value) -> Result<Value, RemoteError>;
}

/// `reqwest`-backed platform client.
#[derive(Clone)]
pub struct HttpPlatformApi {
    client: reqwest::Client,
}

impl HttpPlatformApi {
    pub fn new() -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| RemoteError::Request {
                url: String::new(),
                message: e.to_string(),
            })?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PlatformApi for HttpPlatformApi {
    async fn post(&self, url: &str, body: &Value) -> Result<Value, RemoteError> {
        let response = self
            .client
            .post(url)
            .header("Accept", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| RemoteError::Request {
                url: redact_url(url),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(RemoteError::Status {
                url: redact_url(url),
                status: status.as_u16(),
            });
        }

        // The platform sometimes labels JSON as text/plain
        let text = response.text().await.map_err(|e| RemoteError::Request {
            url: redact_url(url),
            message: e.to_string(),
        })?;

        serde_json::from_str(&text).map_err(|e| RemoteError::InvalidBody {
            url: redact_url(url),
            message: e.to_string(),
        })
    }
}

/// Splits a response into success or [`ApiFailure`].
pub fn check_errcode(body: Value) -> Result<Value, ApiFailure> {
    let errcode = body.get("errcode").and_then(Value::as_i64).unwrap_or(0);
    if errcode == 0 {
        return Ok(body);
    }

    let errmsg = body
        .get("errmsg")
        .and_then(Value::as_str)
        .unwrap_or("unknown error")
        .to_string();
    Err(ApiFailure { errcode, errmsg })
}

/// Strips the query string so access tokens never reach logs or errors.
pub fn redact_url(url: &str) -> String {
    match url.split_once('?') {
        Some((base, _)) => format!("{}?<redacted>", base),
        None => url.to_string(),
    }
}
