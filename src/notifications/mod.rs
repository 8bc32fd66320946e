//! Alert delivery
//!
//! A [`NotificationEnvelope`] is handed to a [`NotificationGateway`]. The
//! production gateway, [`Notifier`], fans the envelope out to every enabled
//! channel concurrently; a failing channel is logged and never affects the
//! others or the caller.
//!
//! ## Channels
//!
//! - **log**: always enabled, level follows the priority
//! - **webhook**: JSON POST with configurable extra headers
//! - **discord**: webhook embed, coloured by priority
//! - **email**: HTML mail over SMTP

pub mod discord;
pub mod email;
pub mod log;
pub mod webhook;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, error, instrument};

use crate::config::NotificationConfig;

pub type NotificationResult<T> = Result<T, NotificationError>;

/// Upper bound for a single delivery attempt on any channel
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client shared by the webhook style channels
pub(crate) fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .expect("Failed to build HTTP client")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "Low",
            Priority::Normal => "Normal",
            Priority::High => "High",
            Priority::Critical => "Critical",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Alert ready for delivery
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationEnvelope {
    pub subject: String,
    pub body: String,
    pub priority: Priority,
    pub properties: BTreeMap<String, String>,
}

impl NotificationEnvelope {
    pub fn new(subject: impl Into<String>, body: impl Into<String>, priority: Priority) -> Self {
        Self {
            subject: subject.into(),
            body: body.into(),
            priority,
            properties: BTreeMap::new(),
        }
    }

    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug)]
pub enum NotificationError {
    /// Request could not be sent
    Http(reqwest::Error),

    /// Endpoint answered with a non-success status
    Status(u16, String),

    /// Mail could not be built or sent
    Email(String),

    /// Delivery did not finish in time
    Timeout(Duration),
}

impl fmt::Display for NotificationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotificationError::Http(e) => write!(f, "HTTP error: {e}"),
            NotificationError::Status(status, body) => write!(f, "endpoint returned {status}: {body}"),
            NotificationError::Email(e) => write!(f, "email error: {e}"),
            NotificationError::Timeout(after) => write!(f, "delivery timed out after {after:?}"),
        }
    }
}

impl std::error::Error for NotificationError {}

impl From<reqwest::Error> for NotificationError {
    fn from(e: reqwest::Error) -> Self {
        NotificationError::Http(e)
    }
}

/// Fire-and-forget alert sink used by the alert policy
#[async_trait]
pub trait NotificationGateway: Send + Sync {
    async fn send(&self, envelope: &NotificationEnvelope);
}

/// A single delivery channel
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &'static str;

    async fn deliver(&self, envelope: &NotificationEnvelope) -> NotificationResult<()>;
}

/// Gateway delivering to every configured channel concurrently
pub struct Notifier {
    channels: Vec<Arc<dyn NotificationChannel>>,
}

impl Notifier {
    pub fn new(channels: Vec<Arc<dyn NotificationChannel>>) -> Self {
        Self { channels }
    }

    /// Log channel plus every channel enabled in `config`
    pub fn from_config(config: &NotificationConfig) -> Self {
        let mut channels: Vec<Arc<dyn NotificationChannel>> = vec![Arc::new(log::LogChannel)];

        if let Some(webhook) = &config.webhook {
            channels.push(Arc::new(webhook::WebhookChannel::new(webhook.clone())));
        }

        if let Some(discord) = &config.discord {
            channels.push(Arc::new(discord::DiscordChannel::new(discord.clone())));
        }

        if let Some(email) = &config.email {
            if email.recipients.is_empty() {
                debug!("email notifications configured without recipients, skipping");
            } else {
                channels.push(Arc::new(email::EmailChannel::new(email.clone())));
            }
        }

        Self { channels }
    }

    pub fn channel_names(&self) -> Vec<&'static str> {
        self.channels.iter().map(|channel| channel.name()).collect()
    }
}

#[async_trait]
impl NotificationGateway for Notifier {
    #[instrument(skip_all, fields(subject = %envelope.subject, priority = %envelope.priority))]
    async fn send(&self, envelope: &NotificationEnvelope) {
        let deliveries = self.channels.iter().map(|channel| async move {
            if let Err(e) = channel.deliver(envelope).await {
                error!("Failed to deliver notification via {}: {e}", channel.name());
            }
        });

        join_all(deliveries).await;
    }
}
