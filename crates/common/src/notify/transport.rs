//! Delivery transports
//!
//! One implementation per channel, all over reqwest. A transport reports
//! success or a `TransportFailure`; retry bookkeeping lives in the
//! dispatcher, not here.

use crate::db::models::{Channel, Notification};
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

#[async_trait]
pub trait Transport: Send + Sync {
    fn channel(&self) -> Channel;

    async fn deliver(&self, notification: &Notification) -> Result<()>;
}

fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(Into::into)
}

fn check_status(channel: Channel, status: reqwest::StatusCode) -> Result<()> {
    if status.is_success() {
        Ok(())
    } else {
        Err(AppError::TransportFailure {
            channel: channel.as_str().to_string(),
            message: format!("endpoint returned {}", status),
        })
    }
}

/// Email delivery via an HTTP relay service
pub struct EmailRelayTransport {
    client: reqwest::Client,
    relay_url: String,
}

impl EmailRelayTransport {
    pub fn new(relay_url: String, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            relay_url,
        })
    }
}

#[async_trait]
impl Transport for EmailRelayTransport {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    async fn deliver(&self, notification: &Notification) -> Result<()> {
        let response = self
            .client
            .post(&self.relay_url)
            .json(&json!({
                "to": notification.recipient,
                "subject": notification.subject,
                "body": notification.body,
            }))
            .send()
            .await?;

        check_status(Channel::Email, response.status())
    }
}

/// Webhook delivery: the recipient field holds the target URL
pub struct WebhookTransport {
    client: reqwest::Client,
}

impl WebhookTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
        })
    }
}

#[async_trait]
impl Transport for WebhookTransport {
    fn channel(&self) -> Channel {
        Channel::Webhook
    }

    async fn deliver(&self, notification: &Notification) -> Result<()> {
        let response = self
            .client
            .post(&notification.recipient)
            .json(&json!({
                "subject": notification.subject,
                "body": notification.body,
                "evaluation_id": notification.evaluation_id,
            }))
            .send()
            .await?;

        check_status(Channel::Webhook, response.status())
    }
}

/// Slack incoming-webhook delivery
pub struct SlackTransport {
    client: reqwest::Client,
}

impl SlackTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
        })
    }
}

#[async_trait]
impl Transport for SlackTransport {
    fn channel(&self) -> Channel {
        Channel::Slack
    }

    async fn deliver(&self, notification: &Notification) -> Result<()> {
        let response = self
            .client
            .post(&notification.recipient)
            .json(&json!({
                "text": format!("*{}*\n{}", notification.subject, notification.body),
            }))
            .send()
            .await?;

        check_status(Channel::Slack, response.status())
    }
}
