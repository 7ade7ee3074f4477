use async_trait::async_trait;
use serde_json::json;

use draftflow_core::config::NotifierConfig;
use draftflow_core::error::{DraftflowError, Result};
use draftflow_core::outbox::{DeliveryError, NotificationSender};

use crate::http::{build_client, is_retryable_status, is_retryable_transport};

/// Delivers notifications by POSTing `{destination, payload}` to a webhook.
pub struct WebhookSender {
    client: reqwest::Client,
    url: String,
}

impl WebhookSender {
    pub fn new(url: impl Into<String>, timeout: std::time::Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            url: url.into(),
        })
    }

    pub fn from_config(config: &NotifierConfig) -> Result<Self> {
        let url = config
            .webhook_url
            .as_deref()
            .ok_or_else(|| DraftflowError::Config("notifier.webhook_url is not set".into()))?;
        Self::new(url, config.timeout())
    }
}

#[async_trait]
impl NotificationSender for WebhookSender {
    async fn send(
        &self,
        destination: &str,
        payload: &serde_json::Value,
    ) -> std::result::Result<(), DeliveryError> {
        let body = json!({
            "destination": destination,
            "payload": payload,
        });

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if is_retryable_transport(&e) {
                    DeliveryError::Transient(e.to_string())
                } else {
                    DeliveryError::Permanent(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let text = response.text().await.unwrap_or_default();
        let message = format!("webhook returned {}: {}", status, text);
        if is_retryable_status(status) {
            Err(DeliveryError::Transient(message))
        } else {
            Err(DeliveryError::Permanent(message))
        }
    }
}
