//! C11 — Notification adapter (spec §4.11).
//!
//! `ChatClient` mirrors the teacher's `ZitadelClient` shape
//! (`directory/client.rs`: a config struct, a cached `reqwest::Client`,
//! one typed async method per operation) generalized from an
//! identity-provider REST client to a chat webhook client. Message
//! composition is kept pure (`compose::*`) so the "never block state
//! transitions" rule in spec §7 stays trivially testable: only the send
//! step performs I/O, and its failures are logged, never propagated to the
//! caller's state machine (spec §7 "Notification failures: never block
//! state transitions; logged").

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("chat webhook error: {0}")]
    Webhook(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub text: String,
    #[serde(default)]
    pub thread_ref: Option<String>,
    #[serde(default)]
    pub warning_banner: Option<String>,
}

#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn send_message(&self, message: ChatMessage) -> Result<(), NotifyError>;
    async fn send_dm(&self, user_email: &str, message: ChatMessage) -> Result<(), NotifyError>;
}

/// Send a message but never let a notification failure propagate past this
/// boundary (spec §7). Call sites use this instead of `ChatClient` methods
/// directly so the "logged, not blocking" rule can't be forgotten at a call
/// site.
pub async fn notify_best_effort(client: &dyn ChatClient, message: ChatMessage) {
    if let Err(e) = client.send_message(message).await {
        tracing::warn!(error = %e, "notification send failed, continuing");
    }
}

/// Notify a requester about their own request (spec §4.11: "Direct-
/// messages a requester when they are not in the main chat channel (if
/// configured)"). Always posts to the main channel; additionally DMs the
/// requester when `send_dm_if_user_not_in_channel` is set. Detecting
/// actual channel membership belongs to the chat front-end, which is out
/// of this engine's scope (spec §1), so the configured flag is the sole
/// trigger rather than a live membership check.
pub async fn notify_requester_best_effort(
    client: &dyn ChatClient,
    send_dm_if_user_not_in_channel: bool,
    requester_email: &str,
    message: ChatMessage,
) {
    notify_best_effort(client, message.clone()).await;
    if send_dm_if_user_not_in_channel {
        if let Err(e) = client.send_dm(requester_email, message).await {
            tracing::warn!(error = %e, requester_email, "requester DM send failed, continuing");
        }
    }
}

pub struct ReqwestChatClient {
    http: reqwest::Client,
    webhook_url: String,
    dm_webhook_url_template: Option<String>,
    /// Shared secret the chat front-end verifies outbound posts with, using
    /// the same scheme `crate::webhook` enforces on inbound ones. `None`
    /// leaves outbound calls unsigned (e.g. local/dev webhook receivers).
    signing_secret: Option<String>,
}

impl ReqwestChatClient {
    pub fn new(webhook_url: impl Into<String>, dm_webhook_url_template: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            webhook_url: webhook_url.into(),
            dm_webhook_url_template,
            signing_secret: None,
        }
    }

    pub fn with_signing_secret(mut self, secret: impl Into<String>) -> Self {
        self.signing_secret = Some(secret.into());
        self
    }

    async fn post_signed(&self, url: String, message: &ChatMessage) -> Result<(), NotifyError> {
        let body = serde_json::to_vec(message).map_err(|e| NotifyError::Webhook(e.to_string()))?;
        let mut request = self.http.post(url).header("Content-Type", "application/json");
        if let Some(secret) = &self.signing_secret {
            let timestamp = chrono::Utc::now().timestamp();
            let signature = crate::webhook::sign_body(secret, timestamp, &body);
            request = request
                .header(crate::webhook::SIGNATURE_HEADER, signature)
                .header("X-SSO-Elevator-Timestamp", timestamp.to_string());
        }
        request
            .body(body)
            .send()
            .await
            .map_err(|e| NotifyError::Webhook(e.to_string()))?
            .error_for_status()
            .map_err(|e| NotifyError::Webhook(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl ChatClient for ReqwestChatClient {
    async fn send_message(&self, message: ChatMessage) -> Result<(), NotifyError> {
        self.post_signed(self.webhook_url.clone(), &message).await
    }

    async fn send_dm(&self, user_email: &str, message: ChatMessage) -> Result<(), NotifyError> {
        let url = self
            .dm_webhook_url_template
            .as_ref()
            .map(|t| t.replace("{email}", user_email))
            .unwrap_or_else(|| self.webhook_url.clone());
        self.post_signed(url, &message).await
    }
}

/// Recording fake for tests: never performs I/O, just appends.
#[derive(Clone, Default)]
pub struct RecordingChatClient {
    pub sent: Arc<RwLock<Vec<ChatMessage>>>,
    pub dms: Arc<RwLock<Vec<(String, ChatMessage)>>>,
}

impl RecordingChatClient {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChatClient for RecordingChatClient {
    async fn send_message(&self, message: ChatMessage) -> Result<(), NotifyError> {
        self.sent.write().await.push(message);
        Ok(())
    }

    async fn send_dm(&self, user_email: &str, message: ChatMessage) -> Result<(), NotifyError> {
        self.dms.write().await.push((user_email.to_string(), message));
        Ok(())
    }
}

/// Prominent banner attached whenever a fallback domain resolved the
/// requester (spec §9, property 12 "fallback-domain warning").
pub const SECONDARY_DOMAIN_WARNING: &str =
    "⚠ Requester was resolved via a secondary fallback email domain. Verify identity before approving.";

pub mod compose {
    use super::ChatMessage;

    fn banner(secondary_domain_was_used: bool) -> Option<String> {
        secondary_domain_was_used.then(|| super::SECONDARY_DOMAIN_WARNING.to_string())
    }

    pub fn new_request(request_id: &str, requester_email: &str, resource: &str, approvers: &[String], secondary_domain_was_used: bool) -> ChatMessage {
        ChatMessage {
            text: format!(
                "New access request {request_id} from {requester_email} for {resource}. Approvers: {}",
                approvers.join(", ")
            ),
            thread_ref: None,
            warning_banner: banner(secondary_domain_was_used),
        }
    }

    pub fn renotify(request_id: &str, attempt: u32) -> ChatMessage {
        ChatMessage {
            text: format!("Reminder #{attempt}: request {request_id} is still awaiting approval."),
            thread_ref: None,
            warning_banner: None,
        }
    }

    pub fn decided(request_id: &str, approved: bool, approver_email: &str) -> ChatMessage {
        ChatMessage {
            text: format!(
                "Request {request_id} was {} by {approver_email}.",
                if approved { "approved" } else { "denied" }
            ),
            thread_ref: None,
            warning_banner: None,
        }
    }

    pub fn grant_result(request_id: &str, succeeded: bool, secondary_domain_was_used: bool) -> ChatMessage {
        ChatMessage {
            text: format!(
                "Request {request_id}: access grant {}.",
                if succeeded { "succeeded" } else { "failed" }
            ),
            thread_ref: None,
            warning_banner: banner(secondary_domain_was_used),
        }
    }

    pub fn scheduled_revocation(request_id: &str, fire_time: chrono::DateTime<chrono::Utc>) -> ChatMessage {
        ChatMessage {
            text: format!("Request {request_id}: revocation scheduled for {}.", fire_time.to_rfc3339()),
            thread_ref: None,
            warning_banner: None,
        }
    }

    pub fn manual_revocation(request_id: &str) -> ChatMessage {
        ChatMessage {
            text: format!("Request {request_id}: access has been revoked."),
            thread_ref: None,
            warning_banner: None,
        }
    }

    pub fn reconciler_warning(orphaned_count: usize, sample: &[String]) -> ChatMessage {
        ChatMessage {
            text: format!(
                "Reconciler warn sweep found {orphaned_count} orphaned assignment(s) lacking a revocation schedule: {}",
                sample.join(", ")
            ),
            thread_ref: None,
            warning_banner: None,
        }
    }

    pub fn sync_summary(added: usize, removed: usize, warned: usize, first_errors: &[String]) -> ChatMessage {
        let errors = if first_errors.is_empty() {
            String::new()
        } else {
            format!(" Errors: {}", first_errors.join("; "))
        };
        ChatMessage {
            text: format!("Attribute sync: {added} added, {removed} removed, {warned} manual assignment(s) flagged.{errors}"),
            thread_ref: None,
            warning_banner: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recording_client_never_fails() {
        let client = RecordingChatClient::new();
        notify_best_effort(&client, compose::manual_revocation("req-1")).await;
        assert_eq!(client.sent.read().await.len(), 1);
    }

    #[tokio::test]
    async fn notify_requester_dms_only_when_configured() {
        let client = RecordingChatClient::new();
        notify_requester_best_effort(&client, false, "a@x", compose::manual_revocation("req-1")).await;
        assert_eq!(client.sent.read().await.len(), 1);
        assert_eq!(client.dms.read().await.len(), 0);

        notify_requester_best_effort(&client, true, "a@x", compose::manual_revocation("req-1")).await;
        assert_eq!(client.sent.read().await.len(), 2);
        let dms = client.dms.read().await;
        assert_eq!(dms.len(), 1);
        assert_eq!(dms[0].0, "a@x");
    }

    #[test]
    fn secondary_domain_adds_banner() {
        let msg = compose::new_request("req-1", "a@x", "111", &["b@x".to_string()], true);
        assert_eq!(msg.warning_banner.as_deref(), Some(SECONDARY_DOMAIN_WARNING));
        let msg2 = compose::new_request("req-1", "a@x", "111", &["b@x".to_string()], false);
        assert!(msg2.warning_banner.is_none());
    }

    #[tokio::test]
    async fn reqwest_client_posts_to_the_configured_webhook() {
        let mut server = mockito::Server::new_async().await;
        let mock = server.mock("POST", "/hook").with_status(200).create_async().await;

        let client = ReqwestChatClient::new(format!("{}/hook", server.url()), None);
        client.send_message(compose::manual_revocation("req-1")).await.unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn reqwest_client_surfaces_non_2xx_as_notify_error() {
        let mut server = mockito::Server::new_async().await;
        server.mock("POST", "/hook").with_status(500).create_async().await;

        let client = ReqwestChatClient::new(format!("{}/hook", server.url()), None);
        let err = client.send_message(compose::manual_revocation("req-1")).await;
        assert!(matches!(err, Err(NotifyError::Webhook(_))));
    }

    #[tokio::test]
    async fn reqwest_client_dm_substitutes_the_email_template() {
        let mut server = mockito::Server::new_async().await;
        let mock = server.mock("POST", "/dm/alice@x").with_status(200).create_async().await;

        let client = ReqwestChatClient::new(format!("{}/hook", server.url()), Some(format!("{}/dm/{{email}}", server.url())));
        client.send_dm("alice@x", compose::manual_revocation("req-1")).await.unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn reqwest_client_signs_outbound_requests_when_a_secret_is_configured() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/hook")
            .match_header(crate::webhook::SIGNATURE_HEADER, mockito::Matcher::Any)
            .match_header("X-SSO-Elevator-Timestamp", mockito::Matcher::Any)
            .with_status(200)
            .create_async()
            .await;

        let client = ReqwestChatClient::new(format!("{}/hook", server.url()), None).with_signing_secret("shh");
        client.send_message(compose::manual_revocation("req-1")).await.unwrap();

        mock.assert_async().await;
    }
}
