//! Platform webhook protocol.
//!
//! Three entry points, all transport-agnostic:
//! - `verify_url`: GET on the message callback, echoes `echostr`
//! - `handle_callback`: POST on the message callback, classifies and replies
//! - `handle_notify`: POST on the component notify URL, stores tickets
//!
//! None of them return errors. Every outcome is a [`WebhookResponse`]; the
//! platform retries anything other than a timely 200, so failures past the
//! signature check are logged and acknowledged with `success`.

mod command;

pub use command::{TestCommand, RELEASE_TEST_REPLY};

use crate::config::WechatConfig;
use crate::credentials::mask;
use crate::crypto::{plain_signature, random_nonce, signatures_match, CryptoError, MsgCrypt};
use crate::host::HostHandlers;
use crate::message::{envelope_xml, DecodedMessage, MessageError, ReplyMessage};
use crate::token::{TokenError, TokenManager};
use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};


/// Acknowledgement body the platform expects.
pub const SUCCESS: &str = "success";

const INFO_TYPE_VERIFY_TICKET: &str = "component_verify_ticket";
const EVENT_MEDIA_CHECK: &str = "wxa_media_check";

/// Query string of callback and notify requests.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackQuery {
    pub signature: Option<String>,
    pub msg_signature: Option<String>,
    pub timestamp: Option<String>,
    pub nonce: Option<String>,
    pub echostr: Option<String>,
    pub encrypt_type: Option<String>,
}

impl CallbackQuery {
    fn param(value: &Option<String>) -> Option<&str> {
        value.as_deref().filter(|s| !s.is_empty())
    }

    fn aes_requested(&self) -> bool {
        Self::param(&self.encrypt_type).is_some_and(|t| t.eq_ignore_ascii_case("aes"))
    }

    /// `(msg_signature, timestamp, nonce)` when all three are present.
    fn envelope_params(&self) -> Option<(&str, &str, &str)> {
        Some((
            Self::param(&self.msg_signature)?,
            Self::param(&self.timestamp)?,
            Self::param(&self.nonce)?,
        ))
    }

    /// `(signature, timestamp, nonce)` when all three are present.
    fn plain_params(&self) -> Option<(&str, &str, &str)> {
        Some((
            Self::param(&self.signature)?,
            Self::param(&self.timestamp)?,
            Self::param(&self.nonce)?,
        ))
    }
}

/// Request body as received by the transport.
#[derive(Debug, Clone)]
pub enum InboundBody {
    /// Raw XML text
    Xml(String),
    /// Body already parsed by an upstream layer
    Structured(Value),
    Empty,
}

impl InboundBody {
    /// Classifies raw bytes: JSON objects become `Structured`, anything else
    /// non-blank is treated as XML.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let text = String::from_utf8_lossy(bytes);
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Self::Empty;
        }
        if trimmed.starts_with('{') {
            if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
                return Self::Structured(value);
            }
        }
        Self::Xml(trimmed.to_string())
    }

    fn parsed_xml(&self) -> Option<DecodedMessage> {
        match self {
            Self::Xml(xml) => DecodedMessage::parse(xml).ok(),
            _ => None,
        }
    }

    fn structured(&self) -> Option<DecodedMessage> {
        match self {
            Self::Structured(value) => DecodedMessage::from_value(value),
            _ => None,
        }
    }
}

/// Status, body and content type of a webhook answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookResponse {
    pub status: StatusCode,
    pub body: String,
    pub content_type: &'static str,
}

impl WebhookResponse {
    fn new(status: StatusCode, body: impl Into<String>, content_type: &'static str) -> Self {
        Self {
            status,
            body: body.into(),
            content_type,
        }
    }

    pub fn success() -> Self {
        Self::new(StatusCode::OK, SUCCESS, "text/plain; charset=utf-8")
    }

    pub fn empty(status: StatusCode) -> Self {
        Self::new(status, "", "text/plain; charset=utf-8")
    }

    pub fn text(body: impl Into<String>) -> Self {
        Self::new(StatusCode::OK, body, "text/plain; charset=utf-8")
    }

    pub fn xml(body: impl Into<String>) -> Self {
        Self::new(StatusCode::OK, body, "application/xml")
    }
}

impl IntoResponse for WebhookResponse {
    fn into_response(self) -> Response {
        (
            self.status,
            [(header::CONTENT_TYPE, self.content_type)],
            self.body,
        )
            .into_response()
    }
}

/// Failures inside callback processing. Never leaves this module.
#[derive(Debug, Error)]
enum WebhookError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error("host handler failed: {0}")]
    Host(String),
}

/// Inbound message plus the crypto context its reply must use.
struct Inbound {
    message: DecodedMessage,
    /// Set when the request was encrypted; replies are encrypted too
    crypt: Option<MsgCrypt>,
}

/// Processes webhook traffic for one component.
#[derive(Clone)]
pub struct WebhookHandler {
    tokens: TokenManager,
    hosts: HostHandlers,
}

impl WebhookHandler {
    pub fn new(tokens: TokenManager, hosts: HostHandlers) -> Self {
        Self { tokens, hosts }
    }

    async fn crypto_config(&self) -> Arc<WechatConfig> {
        self.tokens
            .config()
            .ensure(WechatConfig::has_crypto_config)
            .await
    }

    fn crypt(cfg: &WechatConfig) -> Result<MsgCrypt, CryptoError> {
        MsgCrypt::new(
            &cfg.component_token,
            &cfg.component_encoding_aes_key,
            &cfg.component_app_id,
        )
    }

    /// URL verification (GET on the message callback).
    pub async fn verify_url(&self, appid: &str, query: &CallbackQuery) -> WebhookResponse {
        let Some(echostr) = CallbackQuery::param(&query.echostr) else {
            return WebhookResponse::empty(StatusCode::OK);
        };

        let cfg = self.crypto_config().await;
        let encrypted = query.aes_requested() || CallbackQuery::param(&query.msg_signature).is_some();

        if !encrypted {
            if let Some((signature, timestamp, nonce)) = query.plain_params() {
                let expected = plain_signature(&cfg.component_token, timestamp, nonce);
                if !signatures_match(&expected, signature) {
                    warn!(appid, "URL verification signature mismatch (plain)");
                    return WebhookResponse::empty(StatusCode::FORBIDDEN);
                }
            }
            return WebhookResponse::text(echostr);
        }

        let result = Self::crypt(&cfg).and_then(|crypt| {
            if let Some((signature, timestamp, nonce)) = query.envelope_params() {
                if !crypt.verify(signature, timestamp, nonce, echostr) {
                    return Ok(None);
                }
            }
            crypt.decrypt(echostr).map(Some)
        });

        match result {
            Ok(Some(decrypted)) => {
                debug!(appid, "URL verification succeeded");
                WebhookResponse::text(decrypted.message)
            }
            Ok(None) => {
                warn!(appid, "URL verification signature mismatch (aes)");
                WebhookResponse::empty(StatusCode::FORBIDDEN)
            }
            Err(e) => {
                error!(appid, error = %e, "URL verification failed");
                WebhookResponse::empty(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }

    /// Message or event delivered to an authorizer's callback (POST).
    pub async fn handle_callback(
        &self,
        appid: &str,
        query: &CallbackQuery,
        body: InboundBody,
    ) -> WebhookResponse {
        let cfg = self.crypto_config().await;

        let inbound = match self.decode_callback(appid, &cfg, query, &body) {
            Ok(Ok(Some(inbound))) => inbound,
            Ok(Ok(None)) => return WebhookResponse::success(),
            Ok(Err(rejection)) => return rejection,
            Err(e) => {
                error!(appid, error = %e, "Callback decoding failed");
                return WebhookResponse::success();
            }
        };

        debug!(
            appid,
            msg_type = inbound.message.msg_type().unwrap_or(""),
            event = inbound.message.event().unwrap_or(""),
            info_type = inbound.message.info_type().unwrap_or(""),
            "Callback received"
        );

        match self.dispatch(appid, inbound).await {
            Ok(response) => response,
            Err(e) => {
                error!(appid, error = %e, "Callback processing failed");
                WebhookResponse::success()
            }
        }
    }

    /// Authenticates and decodes a callback body.
    ///
    /// The outer `Result` carries processing failures (acknowledged with
    /// `success`), the inner one carries protocol rejections (400/403).
    /// `None` means there is nothing to process.
    fn decode_callback(
        &self,
        appid: &str,
        cfg: &WechatConfig,
        query: &CallbackQuery,
        body: &InboundBody,
    ) -> Result<Result<Option<Inbound>, WebhookResponse>, WebhookError> {
        let structured = body.structured();
        let parsed_xml = body.parsed_xml();

        let encrypt = structured
            .as_ref()
            .and_then(|m| m.encrypt())
            .or_else(|| parsed_xml.as_ref().and_then(|m| m.encrypt()));

        if query.aes_requested() || encrypt.is_some() {
            let Some(encrypt) = encrypt else {
                warn!(appid, "Encrypted callback without Encrypt field");
                return Ok(Err(WebhookResponse::empty(StatusCode::BAD_REQUEST)));
            };

            let crypt = Self::crypt(cfg)?;
            if let Some((signature, timestamp, nonce)) = query.envelope_params() {
                if !crypt.verify(signature, timestamp, nonce, encrypt) {
                    warn!(appid, "Callback signature mismatch (aes)");
                    return Ok(Err(WebhookResponse::empty(StatusCode::FORBIDDEN)));
                }
            }

            let decrypted = crypt.decrypt(encrypt)?;
            if decrypted.app_id != crypt.app_id() {
                debug!(appid, sender = %decrypted.app_id, "Envelope app id differs from component app id");
            }
            let message = DecodedMessage::parse(&decrypted.message)?;
            return Ok(Ok(Some(Inbound {
                message,
                crypt: Some(crypt),
            })));
        }

        if let Some((signature, timestamp, nonce)) = query.plain_params() {
            let expected = plain_signature(&cfg.component_token, timestamp, nonce);
            if !signatures_match(&expected, signature) {
                warn!(appid, "Callback signature mismatch (plain)");
                return Ok(Err(WebhookResponse::empty(StatusCode::FORBIDDEN)));
            }
        }

        let message = structured.filter(DecodedMessage::is_message).or(parsed_xml);
        Ok(Ok(message.map(|message| Inbound {
            message,
            crypt: None,
        })))
    }

    async fn dispatch(&self, appid: &str, inbound: Inbound) -> Result<WebhookResponse, WebhookError> {
        let message = &inbound.message;

        if message.info_type() == Some(INFO_TYPE_VERIFY_TICKET) {
            self.store_ticket(message).await?;
            return Ok(WebhookResponse::success());
        }

        if message.msg_type() == Some("event")
            && message
                .event()
                .is_some_and(|e| e.eq_ignore_ascii_case(EVENT_MEDIA_CHECK))
        {
            if let Some(handler) = &self.hosts.media_review {
                handler
                    .handle_media_check(appid, message)
                    .await
                    .map_err(|e| WebhookError::Host(e.to_string()))?;
                return Ok(WebhookResponse::success());
            }
        }

        match TestCommand::parse(message) {
            Some(TestCommand::ReleaseTestText) => {
                info!(appid, "Answering release test text message");
                let reply = ReplyMessage::text(RELEASE_TEST_REPLY);
                return self.reply(&inbound, &reply);
            }
            Some(TestCommand::QueryAuthCode(code)) => {
                info!(appid, auth_code = %mask(code), "Release test auth code received");
                self.spawn_test_auth_code(code, message.from_user().unwrap_or_default());
                return Ok(WebhookResponse::empty(StatusCode::OK));
            }
            None => {}
        }

        let Some(handler) = &self.hosts.message else {
            return Ok(WebhookResponse::success());
        };

        let reply = handler
            .handle_message(appid, message)
            .await
            .map_err(|e| WebhookError::Host(e.to_string()))?;

        match reply {
            Some(reply) => self.reply(&inbound, &reply),
            None => Ok(WebhookResponse::success()),
        }
    }

    /// Reply XML, encrypted and wrapped when the inbound message was.
    fn reply(&self, inbound: &Inbound, reply: &ReplyMessage) -> Result<WebhookResponse, WebhookError> {
        let now = chrono::Utc::now().timestamp();
        let xml = reply.to_xml(&inbound.message, now);

        let Some(crypt) = &inbound.crypt else {
            return Ok(WebhookResponse::xml(xml));
        };

        let timestamp = now.to_string();
        let nonce = random_nonce();
        let encrypted = crypt.encrypt(&xml)?;
        let signature = crypt.signature(&timestamp, &nonce, &encrypted);
        Ok(WebhookResponse::xml(envelope_xml(
            &encrypted, &signature, &timestamp, &nonce,
        )))
    }

    /// Runs the test-auth-code hook after the response is sent.
    fn spawn_test_auth_code(&self, code: &str, from_user: &str) {
        let Some(handler) = self.hosts.test_auth_code.clone() else {
            debug!("No test auth code handler registered");
            return;
        };

        let code = code.to_string();
        let from_user = from_user.to_string();
        tokio::spawn(async move {
            if let Err(e) = handler.handle_test_auth_code(&code, &from_user).await {
                error!(error = %e, "Test auth code handler failed");
            }
        });
    }

    async fn store_ticket(&self, message: &DecodedMessage) -> Result<(), WebhookError> {
        let ticket = message.get("ComponentVerifyTicket").unwrap_or_default();
        if ticket.is_empty() {
            warn!("Verify ticket push without ComponentVerifyTicket");
            return Ok(());
        }

        match &self.hosts.ticket {
            Some(handler) => handler
                .save_component_verify_ticket(ticket)
                .await
                .map_err(|e| WebhookError::Host(e.to_string())),
            None => Ok(self.tokens.save_component_verify_ticket(ticket).await?),
        }
    }

    /// Component notify push (POST). Always acknowledged with `success`.
    pub async fn handle_notify(&self, query: &CallbackQuery, body: InboundBody) -> WebhookResponse {
        let cfg = self.crypto_config().await;

        if let Err(e) = self.process_notify(&cfg, query, &body).await {
            error!(error = %e, "Component notify processing failed");
        }
        WebhookResponse::success()
    }

    async fn process_notify(
        &self,
        cfg: &WechatConfig,
        query: &CallbackQuery,
        body: &InboundBody,
    ) -> Result<(), WebhookError> {
        if matches!(body, InboundBody::Empty) {
            debug!("Component notify with empty body");
            return Ok(());
        }

        let encrypt = body
            .structured()
            .and_then(|m| m.encrypt().map(str::to_string))
            .or_else(|| {
                body.parsed_xml()
                    .and_then(|m| m.encrypt().map(str::to_string))
            });
        let Some(encrypt) = encrypt else {
            warn!("Component notify without Encrypt field");
            return Ok(());
        };

        let crypt = Self::crypt(cfg)?;
        if let Some((signature, timestamp, nonce)) = query.envelope_params() {
            if !crypt.verify(signature, timestamp, nonce, &encrypt) {
                warn!("Component notify signature mismatch");
                return Ok(());
            }
        }

        let decrypted = crypt.decrypt(&encrypt)?;
        let info = DecodedMessage::parse(&decrypted.message)?;

        match info.info_type() {
            Some(INFO_TYPE_VERIFY_TICKET) => self.store_ticket(&info).await,
            Some(other) => {
                info!(
                    info_type = other,
                    authorizer_appid = info.get("AuthorizerAppid").unwrap_or(""),
                    "Component notify received"
                );
                Ok(())
            }
            None => {
                debug!("Component notify without InfoType");
                Ok(())
            }
        }
    }
}
