use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde_json::json;
use tracing::{info, instrument};

use super::{
    DELIVERY_TIMEOUT, NotificationChannel, NotificationEnvelope, NotificationError, NotificationResult, http_client,
};
use crate::config::Webhook;

pub struct WebhookChannel {
    client: Client,
    webhook: Webhook,
}

impl WebhookChannel {
    pub fn new(webhook: Webhook) -> Self {
        Self::with_timeout(webhook, DELIVERY_TIMEOUT)
    }

    /// Channel whose requests give up after `timeout`
    pub fn with_timeout(webhook: Webhook, timeout: Duration) -> Self {
        Self {
            client: http_client(timeout),
            webhook,
        }
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn name(&self) -> &'static str {
        "webhook"
    }

    #[instrument(skip_all)]
    async fn deliver(&self, envelope: &NotificationEnvelope) -> NotificationResult<()> {
        let payload = json!({
            "subject": envelope.subject,
            "message": envelope.body,
            "priority": envelope.priority.as_str(),
            "timestamp": Utc::now().to_rfc3339(),
            "properties": envelope.properties,
        });

        let mut request = self.client.post(&self.webhook.url).json(&payload);
        for (name, value) in &self.webhook.headers {
            request = request.header(name, value);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotificationError::Status(status.as_u16(), body));
        }

        info!("Successfully sent webhook alert");
        Ok(())
    }
}
