//! HTTP surface of the component.
//!
//! - `GET|POST /api/v1/wechat/component/:appid/callback` message callback
//! - `GET|POST /api/v1/wechat/component/notify` component notify URL
//! - `GET /api/v1/wechat/component/auth_url` authorization link
//! - `GET /api/v1/wechat/component/auth_callback` authorization return
//! - `GET /api/v1/wechat/component/mock_authorize` offline authorization

mod authorization;
mod callback;

use crate::auth_flow::AuthFlow;
use crate::webhook::WebhookHandler;
use axum::{
    http::{header, HeaderMap},
    routing::get,
    Router,
};
use std::sync::Arc;

/// Shared application state for the component API
#[derive(Clone)]
pub struct WechatAppState {
    pub webhook: WebhookHandler,
    pub auth_flow: AuthFlow,
}

/// Create the component API router
pub fn create_wechat_router(state: WechatAppState) -> Router {
    Router::new()
        .route(
            "/api/v1/wechat/component/:appid/callback",
            get(callback::verify_url).post(callback::receive_message),
        )
        .route(
            "/api/v1/wechat/component/notify",
            get(callback::notify_reachability).post(callback::receive_notify),
        )
        .route(
            "/api/v1/wechat/component/auth_url",
            get(authorization::auth_url),
        )
        .route(
            "/api/v1/wechat/component/auth_callback",
            get(authorization::auth_callback),
        )
        .route(
            "/api/v1/wechat/component/mock_authorize",
            get(authorization::mock_authorize),
        )
        .with_state(Arc::new(state))
}

/// `Host` header, preferring `X-Forwarded-Host` behind a proxy.
fn request_host(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-host")
        .or_else(|| headers.get(header::HOST))
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// `scheme://host` of the incoming request.
fn request_origin(headers: &HeaderMap) -> Option<String> {
    let host = request_host(headers)?;
    let proto = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| v == "http" || v == "https")
        .unwrap_or_else(|| "http".to_string());
    Some(format!("{}://{}", proto, host))
}
