//! Authorization endpoints.

use super::{request_host, request_origin, WechatAppState};
use crate::auth_flow::{resolve_tenant, AuthFlowError, AuthUrlResponse, TenantContext};
use axum::{
    extract::{Extension, Query, State},
    http::HeaderMap,
    response::{Html, Json, Redirect},
};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Query parameters of the mock authorization page
#[derive(Deserialize)]
pub(super) struct MockAuthorizeQuery {
    redirect_uri: Option<String>,
    auth_type: Option<String>,
}

/// GET /api/v1/wechat/component/auth_url
pub(super) async fn auth_url(
    State(state): State<Arc<WechatAppState>>,
    Query(query): Query<HashMap<String, String>>,
    tenant_context: Option<Extension<TenantContext>>,
    headers: HeaderMap,
) -> Result<Json<AuthUrlResponse>, AuthFlowError> {
    let cfg = state.auth_flow.config();
    let tenant = resolve_tenant(&cfg, &query, tenant_context.as_ref().map(|Extension(c)| c));
    let origin = request_origin(&headers);

    let urls = state
        .auth_flow
        .build_auth_url(tenant.as_deref(), origin.as_deref())
        .await?;
    Ok(Json(urls))
}

/// GET /api/v1/wechat/component/auth_callback
pub(super) async fn auth_callback(
    State(state): State<Arc<WechatAppState>>,
    Query(query): Query<HashMap<String, String>>,
    tenant_context: Option<Extension<TenantContext>>,
) -> Result<Html<String>, AuthFlowError> {
    let cfg = state.auth_flow.config();
    let tenant = resolve_tenant(&cfg, &query, tenant_context.as_ref().map(|Extension(c)| c));

    let page = state
        .auth_flow
        .complete_auth_callback(
            query.get("auth_code").map(String::as_str),
            tenant.as_deref(),
        )
        .await?;
    Ok(Html(page))
}

/// GET /api/v1/wechat/component/mock_authorize
pub(super) async fn mock_authorize(
    State(state): State<Arc<WechatAppState>>,
    Query(query): Query<MockAuthorizeQuery>,
    headers: HeaderMap,
) -> Result<Redirect, AuthFlowError> {
    let host = request_host(&headers);
    let target = state.auth_flow.mock_authorize(
        query.redirect_uri.as_deref(),
        query.auth_type.as_deref(),
        host.as_deref(),
    )?;

    debug!(target = %target, "Redirecting to auth callback");
    Ok(Redirect::temporary(&target))
}
