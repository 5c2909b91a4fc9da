//! Authorization flow for tenants granting the component access.
//!
//! 1. Admin opens `auth_url` → gets the platform authorization page link
//! 2. Admin authorizes on the platform
//! 3. Platform redirects to `auth_callback` with `auth_code` and the tenant
//! 4. The host persists the authorization, the admin sees a result page
//!
//! In mock mode step 2 is replaced by `mock_authorize`, which issues a fake
//! auth code and redirects straight back to the callback.

mod pages;

pub use pages::{failure_page, success_page};

use crate::config::WechatConfig;
use crate::credentials::mask;
use crate::host::HostHandlers;
use crate::token::{TokenError, TokenManager};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use reqwest::Url;
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Path of the authorization callback route.
pub const AUTH_CALLBACK_PATH: &str = "/api/v1/wechat/component/auth_callback";

/// Path of the offline authorization page.
pub const MOCK_AUTHORIZE_PATH: &str = "/api/v1/wechat/component/mock_authorize";

/// Official accounts and mini programs.
const AUTH_TYPE_ALL: u8 = 3;

const MOCK_AUTH_CODE_EXPIRES_IN: &str = "3600";

/// Tenant id supplied by the host's own request context, used when the
/// query string carries none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantContext(pub String);

#[derive(Debug, Error)]
pub enum AuthFlowError {
    #[error("Missing tenant id ({0})")]
    MissingTenant(String),

    #[error("Missing {0}")]
    MissingParameter(String),

    #[error("Mock authorization is disabled")]
    MockModeDisabled,

    #[error("Invalid redirect_uri: {0}")]
    InvalidRedirect(&'static str),

    #[error("No authorization handler registered by the host")]
    MissingHostHandler,

    #[error("Failed to determine public base URL (public_base_url or request origin)")]
    BaseUrlUnresolved,

    #[error(transparent)]
    Token(#[from] TokenError),
}

/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for AuthFlowError {
    fn into_response(self) -> Response {
        let status = match &self {
            AuthFlowError::MissingTenant(_)
            | AuthFlowError::MissingParameter(_)
            | AuthFlowError::InvalidRedirect(_) => StatusCode::BAD_REQUEST,
            AuthFlowError::MockModeDisabled => StatusCode::NOT_FOUND,
            AuthFlowError::MissingHostHandler
            | AuthFlowError::BaseUrlUnresolved
            | AuthFlowError::Token(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(ErrorResponse {
            error: self.to_string(),
        });

        (status, body).into_response()
    }
}

/// Authorization page links handed to the admin UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthUrlResponse {
    pub url: String,
    #[serde(rename = "mobileUrl", skip_serializing_if = "Option::is_none")]
    pub mobile_url: Option<String>,
}

/// First non-empty tenant id among the configured query keys, then the host
/// context.
pub fn resolve_tenant(
    cfg: &WechatConfig,
    query: &HashMap<String, String>,
    context: Option<&TenantContext>,
) -> Option<String> {
    cfg.tenant_query_keys()
        .iter()
        .filter_map(|key| query.get(key))
        .map(|value| value.trim())
        .find(|value| !value.is_empty())
        .or_else(|| {
            context
                .map(|c| c.0.trim())
                .filter(|value| !value.is_empty())
        })
        .map(str::to_string)
}

/// Scheme and host of `raw`, defaulting to https. `None` when blank.
pub fn normalize_base_url(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let lower = raw.to_ascii_lowercase();
    let with_scheme = if lower.starts_with("http://") || lower.starts_with("https://") {
        raw.to_string()
    } else {
        format!("https://{}", raw)
    };

    match Url::parse(&with_scheme) {
        Ok(url) if url.has_host() => Some(url.origin().ascii_serialization()),
        _ => Some(with_scheme.trim_end_matches('/').to_string()),
    }
}

/// Base URL embedded into generated callback links.
///
/// The request origin wins normally; mock mode prefers the configured value
/// so local ports don't leak into the links.
pub fn resolve_public_base_url(
    cfg: &WechatConfig,
    request_origin: Option<&str>,
) -> Result<String, AuthFlowError> {
    let configured = cfg.public_base_url.as_deref().and_then(normalize_base_url);
    let from_request = request_origin.and_then(normalize_base_url);

    let resolved = if cfg.mock_mode {
        configured.or(from_request)
    } else {
        from_request.or(configured)
    };
    resolved.ok_or(AuthFlowError::BaseUrlUnresolved)
}

/// Drives the authorization endpoints.
#[derive(Clone)]
pub struct AuthFlow {
    tokens: TokenManager,
    hosts: HostHandlers,
}

impl AuthFlow {
    pub fn new(tokens: TokenManager, hosts: HostHandlers) -> Self {
        Self { tokens, hosts }
    }

    pub fn config(&self) -> std::sync::Arc<WechatConfig> {
        self.tokens.config().snapshot()
    }

    /// Authorization link whose callback carries `tenant`.
    ///
    /// # Errors
    /// - `MissingTenant` before any I/O when `tenant` is empty
    /// - `BaseUrlUnresolved` when neither origin nor config give a base URL
    /// - `Token` when the pre-auth code cannot be obtained
    pub async fn build_auth_url(
        &self,
        tenant: Option<&str>,
        request_origin: Option<&str>,
    ) -> Result<AuthUrlResponse, AuthFlowError> {
        let cfg = self.config();
        let param = cfg.tenant_param_name();

        let tenant = tenant
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AuthFlowError::MissingTenant(param.to_string()))?;

        let base = resolve_public_base_url(&cfg, request_origin)?;
        let callback_url = format!(
            "{}{}?{}={}",
            base,
            AUTH_CALLBACK_PATH,
            urlencoding::encode(param),
            urlencoding::encode(tenant)
        );

        debug!(tenant, base = %base, mock_mode = cfg.mock_mode, "Building auth URL");

        if cfg.mock_mode {
            let url = format!(
                "{}{}?redirect_uri={}&auth_type={}",
                base,
                MOCK_AUTHORIZE_PATH,
                urlencoding::encode(&callback_url),
                AUTH_TYPE_ALL
            );
            let mobile_url = cfg.auth_url_return_object.then(|| url.clone());
            return Ok(AuthUrlResponse { url, mobile_url });
        }

        let urls = self.tokens.get_auth_url(&callback_url, AUTH_TYPE_ALL).await?;
        info!(tenant, "Auth URL generated");
        Ok(AuthUrlResponse {
            url: urls.pc,
            mobile_url: urls.mobile,
        })
    }

    /// Hands the auth code to the host and renders the result page.
    ///
    /// A host failure is not an error: the admin gets a failure page.
    pub async fn complete_auth_callback(
        &self,
        auth_code: Option<&str>,
        tenant: Option<&str>,
    ) -> Result<String, AuthFlowError> {
        let cfg = self.config();
        let param = cfg.tenant_param_name();

        let auth_code = auth_code.map(str::trim).filter(|c| !c.is_empty());
        let tenant = tenant.map(str::trim).filter(|t| !t.is_empty());
        let (Some(auth_code), Some(tenant)) = (auth_code, tenant) else {
            return Err(AuthFlowError::MissingParameter(format!(
                "auth_code or {}",
                param
            )));
        };

        let handler = self.hosts.auth_completion.as_ref().ok_or_else(|| {
            error!("Auth callback received but no completion handler is registered");
            AuthFlowError::MissingHostHandler
        })?;

        info!(tenant, auth_code = %mask(auth_code), "Auth callback received");

        match handler.handle_auth_callback(auth_code, tenant).await {
            Ok(()) => {
                info!(tenant, "Authorization completed");
                Ok(success_page())
            }
            Err(e) => {
                warn!(tenant, error = %e, "Host rejected authorization");
                Ok(failure_page(&e.to_string()))
            }
        }
    }

    /// Relative redirect target for the offline authorization page.
    ///
    /// `request_host` is the `Host` header and is the only allowed redirect
    /// host when none are configured.
    pub fn mock_authorize(
        &self,
        redirect_uri: Option<&str>,
        auth_type: Option<&str>,
        request_host: Option<&str>,
    ) -> Result<String, AuthFlowError> {
        let cfg = self.config();
        if !cfg.mock_mode {
            return Err(AuthFlowError::MockModeDisabled);
        }

        let redirect_uri = redirect_uri
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .ok_or_else(|| AuthFlowError::MissingParameter("redirect_uri".to_string()))?;

        let mut url =
            Url::parse(redirect_uri).map_err(|_| AuthFlowError::InvalidRedirect("unparsable"))?;

        let mut allowed: Vec<String> = cfg
            .mock_authorize_allowed_hosts
            .iter()
            .map(|h| h.trim().to_ascii_lowercase())
            .filter(|h| !h.is_empty())
            .collect();
        if allowed.is_empty() {
            if let Some(host) = request_host.map(host_without_port).filter(|h| !h.is_empty()) {
                allowed.push(host);
            }
        }

        let redirect_host = url.host_str().unwrap_or_default().to_ascii_lowercase();
        if !allowed.iter().any(|h| *h == redirect_host) {
            warn!(host = %redirect_host, "Mock authorize redirect host not allowed");
            return Err(AuthFlowError::InvalidRedirect("host not allowed"));
        }
        if !matches!(url.scheme(), "http" | "https") {
            return Err(AuthFlowError::InvalidRedirect("scheme must be http or https"));
        }
        if url.path() != AUTH_CALLBACK_PATH {
            return Err(AuthFlowError::InvalidRedirect("path must be the auth callback"));
        }

        let auth_code = format!("mock_auth_code_{}", chrono::Utc::now().timestamp_millis());
        let auth_type = auth_type.map(str::trim).filter(|t| !t.is_empty());

        let replaced: &[&str] = if auth_type.is_some() {
            &["auth_code", "expires_in", "auth_type"]
        } else {
            &["auth_code", "expires_in"]
        };
        let kept: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(k, _)| !replaced.iter().any(|r| *r == *k))
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        {
            let mut pairs = url.query_pairs_mut();
            pairs.clear();
            pairs.extend_pairs(kept);
            pairs.append_pair("auth_code", &auth_code);
            pairs.append_pair("expires_in", MOCK_AUTH_CODE_EXPIRES_IN);
            if let Some(auth_type) = auth_type {
                pairs.append_pair("auth_type", auth_type);
            }
        }

        let target = format!("{}?{}", url.path(), url.query().unwrap_or_default());
        info!(auth_code = %mask(&auth_code), "Mock authorization issued");
        Ok(target)
    }
}

fn host_without_port(host: &str) -> String {
    let host = host.trim().to_ascii_lowercase();
    // Bracketed IPv6 literals keep their brackets in Url::host_str
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => host[..=end].to_string(),
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name.to_string(),
        _ => host,
    }
}
