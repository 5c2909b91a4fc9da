//! Capabilities supplied by the embedding application.
//!
//! Only [`AuthCompletionHandler`] is needed for the authorization flow to
//! succeed; every other hook is optional and its absence has a defined
//! fallback in the webhook handler.

use crate::message::{DecodedMessage, ReplyMessage};
use async_trait::async_trait;
use std::sync::Arc;

/// Error type returned by host hooks. Its message is shown to the admin on
/// the authorization failure page.
pub type HostError = Box<dyn std::error::Error + Send + Sync>;

/// Persists a completed authorization for a tenant.
#[async_trait]
pub trait AuthCompletionHandler: Send + Sync {
    async fn handle_auth_callback(&self, auth_code: &str, tenant_id: &str) -> Result<(), HostError>;
}

/// Handles ordinary messages and events for an authorizer.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Returns a passive reply, or `None` to acknowledge with `success`.
    async fn handle_message(
        &self,
        appid: &str,
        message: &DecodedMessage,
    ) -> Result<Option<ReplyMessage>, HostError>;
}

/// Receives `wxa_media_check` review results.
#[async_trait]
pub trait MediaReviewHandler: Send + Sync {
    async fn handle_media_check(&self, appid: &str, message: &DecodedMessage) -> Result<(), HostError>;
}

/// Handles the `QUERY_AUTH_CODE:` step of the platform's release test.
#[async_trait]
pub trait TestAuthCodeHandler: Send + Sync {
    async fn handle_test_auth_code(&self, auth_code: &str, from_user: &str) -> Result<(), HostError>;
}

/// Takes over verify-ticket persistence from the built-in token manager.
#[async_trait]
pub trait TicketHandler: Send + Sync {
    async fn save_component_verify_ticket(&self, ticket: &str) -> Result<(), HostError>;
}

/// The set of hooks registered by the host.
#[derive(Clone, Default)]
pub struct HostHandlers {
    pub auth_completion: Option<Arc<dyn AuthCompletionHandler>>,
    pub message: Option<Arc<dyn MessageHandler>>,
    pub media_review: Option<Arc<dyn MediaReviewHandler>>,
    pub test_auth_code: Option<Arc<dyn TestAuthCodeHandler>>,
    pub ticket: Option<Arc<dyn TicketHandler>>,
}

impl HostHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_auth_completion(mut self, handler: Arc<dyn AuthCompletionHandler>) -> Self {
        self.auth_completion = Some(handler);
        self
    }

    pub fn with_message(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.message = Some(handler);
        self
    }

    pub fn with_media_review(mut self, handler: Arc<dyn MediaReviewHandler>) -> Self {
        self.media_review = Some(handler);
        self
    }

    pub fn with_test_auth_code(mut self, handler: Arc<dyn TestAuthCodeHandler>) -> Self {
        self.test_auth_code = Some(handler);
        self
    }

    pub fn with_ticket(mut self, handler: Arc<dyn TicketHandler>) -> Self {
        self.ticket = Some(handler);
        self
    }
}
