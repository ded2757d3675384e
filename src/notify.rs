//! End-of-run notifications to the operator channel.
//!
//! Delivery failures are the notifier's problem, not the pipeline's: callers
//! go through [`send_report`], which logs a failed send and moves on.

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::{error, info};

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str) -> Result<()>;
}

/// Picks the webhook notifier when a URL is configured, otherwise the local
/// log.
pub fn for_channel(webhook_url: Option<String>, mention: Option<String>) -> Box<dyn Notifier> {
    match webhook_url {
        Some(url) => Box::new(WebhookNotifier::new(url, mention)),
        None => Box::new(LogNotifier),
    }
}

/// Sends one message, logging instead of failing the run when delivery
/// breaks.
pub async fn send_report(notifier: &dyn Notifier, message: &str) {
    if let Err(e) = notifier.notify(message).await {
        error!(error = %e, "Failed to deliver operator notification");
    }
}

#[derive(Serialize)]
struct WebhookPayload {
    content: String,
}

/// Posts to a chat webhook taking a JSON `content` body, optionally
/// prefixing a mention so the message pings someone.
pub struct WebhookNotifier {
    webhook_url: String,
    mention: Option<String>,
}

impl WebhookNotifier {
    pub fn new(webhook_url: String, mention: Option<String>) -> Self {
        WebhookNotifier {
            webhook_url,
            mention,
        }
    }

    fn compose(&self, message: &str) -> String {
        match &self.mention {
            Some(mention) => format!("{mention}\n{message}"),
            None => message.to_string(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, message: &str) -> Result<()> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        let payload = WebhookPayload {
            content: self.compose(message),
        };

        let response = client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to send webhook message: {}", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!(
                "Webhook returned status {}: {}",
                status,
                body
            ));
        }

        Ok(())
    }
}

/// Used when no webhook is configured; reports land in the local log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, message: &str) -> Result<()> {
        info!(%message, "Operator notification");
        Ok(())
    }
}
