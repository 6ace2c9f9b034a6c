//! Outbound delivery for playbook messages and reminders.
//!
//! With a webhook configured, every message is POSTed as JSON to the delivery gateway.
//! Without one, messages are only logged.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tracing::{debug, info};

use dealflow_core::capabilities::{
    CapabilityError, Channel, NotificationSender, OutboundMessage, Recipient,
};
use dealflow_core::config::NotificationConfig;

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    tenant_id: &'a str,
    channel: Channel,
    recipient: &'a Recipient,
    subject: Option<&'a str>,
    body: &'a str,
    sent_at: String,
}

pub struct WebhookNotificationSender {
    client: Client,
    url: String,
    api_token: Option<SecretString>,
}

impl WebhookNotificationSender {
    pub fn new(
        url: impl Into<String>,
        api_token: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url: url.into(), api_token })
    }
}

#[async_trait]
impl NotificationSender for WebhookNotificationSender {
    async fn send(&self, message: OutboundMessage) -> Result<(), CapabilityError> {
        let payload = WebhookPayload {
            tenant_id: &message.tenant_id.0,
            channel: message.channel,
            recipient: &message.recipient,
            subject: message.subject.as_deref(),
            body: &message.body,
            sent_at: Utc::now().to_rfc3339(),
        };

        let mut request = self.client.post(&self.url).json(&payload);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request
            .send()
            .await
            .map_err(|error| CapabilityError::Delivery(format!("webhook request failed: {error}")))?;
        if !response.status().is_success() {
            return Err(CapabilityError::Delivery(format!(
                "webhook returned {}",
                response.status()
            )));
        }

        debug!(
            event_name = "workflow.notifier.delivered",
            tenant_id = %message.tenant_id.0,
            channel = message.channel.as_str(),
            "message delivered to webhook"
        );
        Ok(())
    }
}

/// Logs each message instead of delivering it.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogNotificationSender;

#[async_trait]
impl NotificationSender for LogNotificationSender {
    async fn send(&self, message: OutboundMessage) -> Result<(), CapabilityError> {
        let recipient = match &message.recipient {
            Recipient::User(user) => format!("user:{}", user.0),
            Recipient::Address(address) => address.clone(),
        };
        info!(
            event_name = "workflow.notifier.logged",
            tenant_id = %message.tenant_id.0,
            channel = message.channel.as_str(),
            recipient = %recipient,
            subject = message.subject.as_deref().unwrap_or_default(),
            "outbound message (no webhook configured)"
        );
        Ok(())
    }
}

pub fn sender_from_config(
    config: &NotificationConfig,
) -> Result<Arc<dyn NotificationSender>, reqwest::Error> {
    match &config.webhook_url {
        Some(url) => Ok(Arc::new(WebhookNotificationSender::new(
            url.clone(),
            config.api_token.clone(),
            Duration::from_secs(config.timeout_secs),
        )?)),
        None => Ok(Arc::new(LogNotificationSender)),
    }
}
