//! Webhook endpoints. Every answer is a [`WebhookResponse`]; nothing here
//! produces a JSON error.

use super::WechatAppState;
use crate::webhook::{CallbackQuery, InboundBody, WebhookResponse};
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
};
use std::sync::Arc;
use tracing::debug;

/// GET /api/v1/wechat/component/:appid/callback
pub(super) async fn verify_url(
    State(state): State<Arc<WechatAppState>>,
    Path(appid): Path<String>,
    Query(query): Query<CallbackQuery>,
) -> WebhookResponse {
    debug!(appid = %appid, "Callback URL verification");
    state.webhook.verify_url(&appid, &query).await
}

/// POST /api/v1/wechat/component/:appid/callback
pub(super) async fn receive_message(
    State(state): State<Arc<WechatAppState>>,
    Path(appid): Path<String>,
    Query(query): Query<CallbackQuery>,
    body: Bytes,
) -> WebhookResponse {
    state
        .webhook
        .handle_callback(&appid, &query, InboundBody::from_bytes(&body))
        .await
}

/// GET /api/v1/wechat/component/notify
///
/// Reachability check from the platform console.
pub(super) async fn notify_reachability(
    State(state): State<Arc<WechatAppState>>,
    Query(query): Query<CallbackQuery>,
) -> WebhookResponse {
    state.webhook.handle_notify(&query, InboundBody::Empty).await
}

/// POST /api/v1/wechat/component/notify
pub(super) async fn receive_notify(
    State(state): State<Arc<WechatAppState>>,
    Query(query): Query<CallbackQuery>,
    body: Bytes,
) -> WebhookResponse {
    state
        .webhook
        .handle_notify(&query, InboundBody::from_bytes(&body))
        .await
}
