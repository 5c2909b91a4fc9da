//! Component token chain.
//!
//! ```text
//! verify ticket (pushed) → component token → pre-auth code
//!                                 ↓
//!                      authorizer token (per tenant)
//! ```
//!
//! Every getter follows the same shape: read the cache with fallback keys,
//! and on a miss fetch the prerequisite, call the platform, validate the
//! envelope, cache under both strategies' keys, return. Refresh is pull-only;
//! concurrent misses may both reach the platform and the last write wins.

use crate::cache::CacheError;
use crate::config::{ConfigHandle, WechatConfig};
use crate::credentials::{cache_ttl, mask, Credential, CredentialKind, CredentialStore};
use crate::keys::{key_set, ResourceKind};
use crate::remote::{check_errcode, PlatformApi, RemoteError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};


/// Verify tickets are pushed roughly every 10 minutes and live 12 hours.
pub const VERIFY_TICKET_TTL_SECONDS: u64 = 12 * 3600;

const COMPONENT_TOKEN_DEFAULT_TTL: u64 = 7200;
const COMPONENT_TOKEN_MARGIN: u64 = 300;
const PRE_AUTH_CODE_DEFAULT_TTL: u64 = 600;
const PRE_AUTH_CODE_MARGIN: u64 = 30;
const AUTHORIZER_TOKEN_DEFAULT_TTL: u64 = 7200;
const AUTHORIZER_TOKEN_MARGIN: u64 = 300;

/// Prefix shared by every offline placeholder value.
pub const MOCK_PREFIX: &str = "mock_";

const OAUTH_AUTHORIZE_URL: &str = "https://open.weixin.qq.com/connect/oauth2/authorize";

/// Token chain failures.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("component configuration missing: {0}")]
    ConfigurationMissing(&'static str),

    /// The platform has not pushed a ticket yet; retry later
    #[error("component verify ticket not available yet, wait for the platform push")]
    TicketNotAvailable,

    #[error("cached verify ticket is a mock placeholder, refusing a real platform call")]
    PlaceholderTicket,

    #[error("platform rejected {operation}: {errmsg} (errcode {errcode})")]
    RemoteApi {
        operation: &'static str,
        errcode: i64,
        errmsg: String,
    },

    #[error("{0} is required")]
    MissingParameter(&'static str),

    #[error("platform response to {operation} has no {field}")]
    MissingField {
        operation: &'static str,
        field: &'static str,
    },

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Transport(#[from] RemoteError),
}

/// An authorizer access token and where it came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthorizerToken {
    pub authorizer_access_token: String,
    /// Present only on a fresh fetch; the platform may rotate it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorizer_refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    pub from_cache: bool,
}

/// Authorization granted by a tenant, as returned by the auth-code exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationInfo {
    pub authorizer_appid: String,
    pub authorizer_access_token: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
    pub authorizer_refresh_token: String,
    #[serde(default)]
    pub func_info: Vec<Value>,
}

/// Authorization page links.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthUrl {
    pub pc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mobile: Option<String>,
}

/// Orchestrates the credential chain over the cache and the platform API.
#[derive(Clone)]
pub struct TokenManager {
    config: ConfigHandle,
    store: CredentialStore,
    api: Arc<dyn PlatformApi>,
}

impl TokenManager {
    pub fn new(config: ConfigHandle, store: CredentialStore, api: Arc<dyn PlatformApi>) -> Self {
        Self { config, store, api }
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    /// Latest pushed verify ticket.
    ///
    /// # Errors
    /// [`TokenError::TicketNotAvailable`] until the platform's first push
    /// lands. This is a wait state, not a fault.
    pub async fn get_component_verify_ticket(&self) -> Result<String, TokenError> {
        let cfg = self.config.snapshot();
        assert_component_config(&cfg)?;

        let keys = key_set(cfg.key_strategy, &cfg.component_app_id, ResourceKind::VerifyTicket);
        self.store
            .get(&keys)
            .await?
            .ok_or(TokenError::TicketNotAvailable)
    }

    /// Caches a ticket pushed by the platform. A no-op without a component
    /// app id, since there is no key to file it under.
    pub async fn save_component_verify_ticket(&self, ticket: &str) -> Result<(), TokenError> {
        let cfg = self.config.snapshot();
        if cfg.component_app_id.is_empty() {
            warn!("Dropping verify ticket: component_app_id not configured");
            return Ok(());
        }
        if ticket.is_empty() {
            return Err(TokenError::MissingParameter("ticket"));
        }

        let keys = key_set(cfg.key_strategy, &cfg.component_app_id, ResourceKind::VerifyTicket);
        let credential = Credential::new(
            CredentialKind::VerifyTicket,
            &cfg.component_app_id,
            ticket,
            VERIFY_TICKET_TTL_SECONDS,
        );
        self.store.put(&keys, &credential).await?;

        info!(
            component_app_id = %cfg.component_app_id,
            ticket = %mask(ticket),
            "Component verify ticket saved"
        );
        Ok(())
    }

    /// Component access token, fetched with the verify ticket on a miss.
    pub async fn get_component_access_token(&self) -> Result<String, TokenError> {
        let cfg = self.config.snapshot();
        assert_component_config(&cfg)?;

        if cfg.mock_mode {
            return Ok(mock_component_token(&cfg.component_app_id));
        }

        let keys = key_set(cfg.key_strategy, &cfg.component_app_id, ResourceKind::ComponentToken);
        if let Some(token) = self.store.get(&keys).await? {
            return Ok(token);
        }

        let ticket = self.get_component_verify_ticket().await?;
        if ticket.starts_with(MOCK_PREFIX) {
            warn!(ticket = %mask(&ticket), "Placeholder verify ticket in cache outside mock mode");
            return Err(TokenError::PlaceholderTicket);
        }

        const OPERATION: &str = "api_component_token";
        let url = format!("{}/cgi-bin/component/api_component_token", cfg.api_base_url);
        let data = self
            .call(
                OPERATION,
                &url,
                json!({
                    "component_appid": cfg.component_app_id,
                    "component_appsecret": cfg.component_app_secret,
                    "component_verify_ticket": ticket,
                }),
            )
            .await?;

        let token = required_str(&data, OPERATION, "component_access_token")?;
        let ttl = cache_ttl(
            expires_in(&data).unwrap_or(COMPONENT_TOKEN_DEFAULT_TTL),
            COMPONENT_TOKEN_MARGIN,
        );

        let credential = Credential::new(
            CredentialKind::ComponentToken,
            &cfg.component_app_id,
            &token,
            ttl,
        );
        self.store.put(&keys, &credential).await?;

        info!(component_app_id = %cfg.component_app_id, ttl, "Component access token refreshed");
        Ok(token)
    }

    /// Pre-auth code for the authorization page.
    pub async fn get_pre_auth_code(&self) -> Result<String, TokenError> {
        let cfg = self.config.snapshot();
        assert_component_config(&cfg)?;

        if cfg.mock_mode {
            return Ok(format!("{}pre_auth_code", MOCK_PREFIX));
        }

        let keys = key_set(cfg.key_strategy, &cfg.component_app_id, ResourceKind::PreAuthCode);
        if let Some(code) = self.store.get(&keys).await? {
            return Ok(code);
        }

        let token = self.get_component_access_token().await?;

        const OPERATION: &str = "api_create_preauthcode";
        let url = with_token(
            &format!("{}/cgi-bin/component/api_create_preauthcode", cfg.api_base_url),
            "component_access_token",
            &token,
        );
        let data = self
            .call(OPERATION, &url, json!({ "component_appid": cfg.component_app_id }))
            .await?;

        let code = required_str(&data, OPERATION, "pre_auth_code")?;
        let ttl = cache_ttl(
            expires_in(&data).unwrap_or(PRE_AUTH_CODE_DEFAULT_TTL),
            PRE_AUTH_CODE_MARGIN,
        );

        let credential =
            Credential::new(CredentialKind::PreAuthCode, &cfg.component_app_id, &code, ttl);
        self.store.put(&keys, &credential).await?;

        debug!(pre_auth_code = %mask(&code), ttl, "Pre-auth code created");
        Ok(code)
    }

    /// Authorizer access token for one tenant.
    ///
    /// Both inputs are required and checked before any I/O. The result
    /// reports whether it came from the cache.
    pub async fn get_authorizer_access_token(
        &self,
        authorizer_app_id: &str,
        authorizer_refresh_token: &str,
    ) -> Result<AuthorizerToken, TokenError> {
        let cfg = self.config.snapshot();
        assert_component_config(&cfg)?;

        if authorizer_app_id.is_empty() {
            return Err(TokenError::MissingParameter("authorizer_app_id"));
        }
        if authorizer_refresh_token.is_empty() {
            return Err(TokenError::MissingParameter("authorizer_refresh_token"));
        }

        if cfg.mock_mode {
            return Ok(AuthorizerToken {
                authorizer_access_token: mock_authorizer_token(authorizer_app_id),
                authorizer_refresh_token: Some(authorizer_refresh_token.to_string()),
                expires_in: Some(AUTHORIZER_TOKEN_DEFAULT_TTL),
                from_cache: false,
            });
        }

        let keys = key_set(cfg.key_strategy, authorizer_app_id, ResourceKind::AuthorizerToken);
        if let Some(token) = self.store.get(&keys).await? {
            return Ok(AuthorizerToken {
                authorizer_access_token: token,
                authorizer_refresh_token: None,
                expires_in: None,
                from_cache: true,
            });
        }

        let component_token = self.get_component_access_token().await?;

        const OPERATION: &str = "api_authorizer_token";
        let url = with_token(
            &format!("{}/cgi-bin/component/api_authorizer_token", cfg.api_base_url),
            "component_access_token",
            &component_token,
        );
        let data = self
            .call(
                OPERATION,
                &url,
                json!({
                    "component_appid": cfg.component_app_id,
                    "authorizer_appid": authorizer_app_id,
                    "authorizer_refresh_token": authorizer_refresh_token,
                }),
            )
            .await?;

        let token = required_str(&data, OPERATION, "authorizer_access_token")?;
        let remote_ttl = expires_in(&data).unwrap_or(AUTHORIZER_TOKEN_DEFAULT_TTL);
        self.cache_authorizer_token(&cfg, authorizer_app_id, &token, remote_ttl)
            .await?;

        Ok(AuthorizerToken {
            authorizer_access_token: token,
            authorizer_refresh_token: data
                .get("authorizer_refresh_token")
                .and_then(Value::as_str)
                .map(str::to_string),
            expires_in: Some(remote_ttl),
            from_cache: false,
        })
    }

    /// Exchanges an auth code from the authorization callback.
    ///
    /// The returned authorizer access token is cached like a refreshed one.
    pub async fn query_auth(&self, auth_code: &str) -> Result<AuthorizationInfo, TokenError> {
        let cfg = self.config.snapshot();
        assert_component_config(&cfg)?;

        if auth_code.is_empty() {
            return Err(TokenError::MissingParameter("auth_code"));
        }

        if cfg.mock_mode {
            let appid = format!("{}authorizer_appid", MOCK_PREFIX);
            return Ok(AuthorizationInfo {
                authorizer_access_token: mock_authorizer_token(&appid),
                authorizer_appid: appid,
                expires_in: Some(AUTHORIZER_TOKEN_DEFAULT_TTL),
                authorizer_refresh_token: format!("{}authorizer_refresh_token", MOCK_PREFIX),
                func_info: Vec::new(),
            });
        }

        let token = self.get_component_access_token().await?;

        const OPERATION: &str = "api_query_auth";
        let url = with_token(
            &format!("{}/cgi-bin/component/api_query_auth", cfg.api_base_url),
            "component_access_token",
            &token,
        );
        let data = self
            .call(
                OPERATION,
                &url,
                json!({
                    "component_appid": cfg.component_app_id,
                    "authorization_code": auth_code,
                }),
            )
            .await?;

        let info_value = data
            .get("authorization_info")
            .cloned()
            .ok_or(TokenError::MissingField {
                operation: OPERATION,
                field: "authorization_info",
            })?;
        let info: AuthorizationInfo =
            serde_json::from_value(info_value).map_err(|_| TokenError::MissingField {
                operation: OPERATION,
                field: "authorization_info",
            })?;

        self.cache_authorizer_token(
            &cfg,
            &info.authorizer_appid,
            &info.authorizer_access_token,
            info.expires_in.unwrap_or(AUTHORIZER_TOKEN_DEFAULT_TTL),
        )
        .await?;

        info!(authorizer_appid = %info.authorizer_appid, "Authorization code exchanged");
        Ok(info)
    }

    /// Basic account information of an authorizer.
    pub async fn get_authorizer_info(&self, authorizer_app_id: &str) -> Result<Value, TokenError> {
        let cfg = self.config.snapshot();
        if authorizer_app_id.is_empty() {
            return Err(TokenError::MissingParameter("authorizer_app_id"));
        }

        let token = self.get_component_access_token().await?;
        let url = with_token(
            &format!("{}/cgi-bin/component/api_get_authorizer_info", cfg.api_base_url),
            "component_access_token",
            &token,
        );
        self.call(
            "api_get_authorizer_info",
            &url,
            json!({
                "component_appid": cfg.component_app_id,
                "authorizer_appid": authorizer_app_id,
            }),
        )
        .await
    }

    /// Sends a text customer-service message on behalf of an authorizer.
    pub async fn send_custom_message(
        &self,
        access_token: &str,
        to_user: &str,
        content: &str,
    ) -> Result<Value, TokenError> {
        if access_token.is_empty() {
            return Err(TokenError::MissingParameter("access_token"));
        }
        if to_user.is_empty() {
            return Err(TokenError::MissingParameter("to_user"));
        }

        let cfg = self.config.snapshot();
        let url = with_token(
            &format!("{}/cgi-bin/message/custom/send", cfg.api_base_url),
            "access_token",
            access_token,
        );
        self.call(
            "message_custom_send",
            &url,
            json!({
                "touser": to_user,
                "msgtype": "text",
                "text": { "content": content },
            }),
        )
        .await
    }

    /// Web OAuth link issued on behalf of an authorizer.
    pub fn oauth_domain_url(
        &self,
        appid: &str,
        redirect_uri: &str,
        scope: Option<&str>,
        state: Option<&str>,
    ) -> String {
        let cfg = self.config.snapshot();
        format!(
            "{}?appid={}&redirect_uri={}&response_type=code&scope={}&state={}&component_appid={}#wechat_redirect",
            OAUTH_AUTHORIZE_URL,
            urlencoding::encode(appid),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(scope.unwrap_or("snsapi_userinfo")),
            urlencoding::encode(state.unwrap_or("STATE")),
            urlencoding::encode(&cfg.component_app_id),
        )
    }

    /// Authorization page link embedding a fresh pre-auth code.
    ///
    /// `auth_type`: 1 official accounts, 2 mini programs, 3 both.
    pub async fn get_auth_url(&self, redirect_uri: &str, auth_type: u8) -> Result<AuthUrl, TokenError> {
        let cfg = self.config.snapshot();
        let pre_auth_code = self.get_pre_auth_code().await?;

        let url = format!(
            "{}?component_appid={}&pre_auth_code={}&redirect_uri={}&auth_type={}",
            cfg.auth_page_url,
            urlencoding::encode(&cfg.component_app_id),
            urlencoding::encode(&pre_auth_code),
            urlencoding::encode(redirect_uri),
            auth_type
        );

        let mobile = cfg.auth_url_return_object.then(|| url.clone());
        Ok(AuthUrl { pc: url, mobile })
    }

    async fn cache_authorizer_token(
        &self,
        cfg: &WechatConfig,
        authorizer_app_id: &str,
        token: &str,
        remote_ttl: u64,
    ) -> Result<(), TokenError> {
        let keys = key_set(cfg.key_strategy, authorizer_app_id, ResourceKind::AuthorizerToken);
        let credential = Credential::new(
            CredentialKind::AuthorizerToken,
            authorizer_app_id,
            token,
            cache_ttl(remote_ttl, AUTHORIZER_TOKEN_MARGIN),
        );
        self.store.put(&keys, &credential).await?;
        Ok(())
    }

    async fn call(&self, operation: &'static str, url: &str, body: Value) -> Result<Value, TokenError> {
        debug!(operation, "Calling platform API");
        let response = self.api.post(url, &body).await?;
        check_errcode(response).map_err(|failure| {
            warn!(
                operation,
                errcode = failure.errcode,
                errmsg = %failure.errmsg,
                "Platform API rejected request"
            );
            TokenError::RemoteApi {
                operation,
                errcode: failure.errcode,
                errmsg: failure.errmsg,
            }
        })
    }
}

fn assert_component_config(cfg: &WechatConfig) -> Result<(), TokenError> {
    if cfg.component_app_id.is_empty() {
        return Err(TokenError::ConfigurationMissing("component_app_id"));
    }
    if cfg.component_app_secret.is_empty() {
        return Err(TokenError::ConfigurationMissing("component_app_secret"));
    }
    Ok(())
}

fn mock_component_token(component_app_id: &str) -> String {
    format!("{}component_access_token_{}", MOCK_PREFIX, component_app_id)
}

fn mock_authorizer_token(authorizer_app_id: &str) -> String {
    format!("{}authorizer_access_token_{}", MOCK_PREFIX, authorizer_app_id)
}

fn with_token(url: &str, param: &str, token: &str) -> String {
    format!("{}?{}={}", url, param, urlencoding::encode(token))
}

fn required_str(
    data: &Value,
    operation: &'static str,
    field: &'static str,
) -> Result<String, TokenError> {
    data.get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or(TokenError::MissingField { operation, field })
}

/// `expires_in` as a number, accepting numeric strings.
fn expires_in(data: &Value) -> Option<u64> {
    match data.get("expires_in")? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
