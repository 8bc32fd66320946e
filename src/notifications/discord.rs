use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Serialize;
use tracing::{info, instrument};

use super::{
    DELIVERY_TIMEOUT, NotificationChannel, NotificationEnvelope, NotificationError, NotificationResult, Priority,
    http_client,
};
use crate::config::Discord;

/// Discord accepts at most 25 fields per embed
const MAX_EMBED_FIELDS: usize = 25;

const DEVICE_ID_PROPERTY: &str = "DeviceId";

#[derive(Debug, Clone, Serialize)]
pub struct Message {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub embeds: Vec<Embed>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Embed {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<EmbedField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub footer: Option<EmbedFooter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub inline: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmbedFooter {
    pub text: String,
}

#[derive(Default)]
pub struct MessageBuilder {
    content: Option<String>,
    embeds: Vec<Embed>,
}

impl MessageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn content(mut self, content: impl ToString) -> Self {
        self.content = Some(content.to_string());
        self
    }

    pub fn add_embed(mut self, embed: Embed) -> Self {
        self.embeds.push(embed);
        self
    }

    pub fn build(self) -> Message {
        Message {
            content: self.content,
            embeds: self.embeds,
        }
    }
}

fn style(priority: Priority) -> (&'static str, u32) {
    match priority {
        Priority::Critical => ("🔴", 15158332), // Red
        Priority::High => ("🟠", 15105570),     // Orange
        Priority::Normal => ("🔵", 5793266),    // Light blue
        Priority::Low => ("⚪", 9807270),       // Grey
    }
}

pub fn build_alert_embed(envelope: &NotificationEnvelope) -> Embed {
    let (emoji, color) = style(envelope.priority);

    let fields = envelope
        .properties
        .iter()
        .take(MAX_EMBED_FIELDS)
        .map(|(name, value)| EmbedField {
            name: name.clone(),
            value: value.clone(),
            inline: true,
        })
        .collect();

    let device = envelope
        .properties
        .get(DEVICE_ID_PROPERTY)
        .map(String::as_str)
        .unwrap_or("unknown");

    Embed {
        title: Some(format!("{emoji} {}", envelope.subject)),
        description: Some(envelope.body.clone()),
        color: Some(color),
        fields,
        footer: Some(EmbedFooter {
            text: format!("Device: {device} | Priority: {}", envelope.priority),
        }),
        timestamp: Some(Utc::now().to_rfc3339()),
    }
}

pub struct DiscordChannel {
    client: Client,
    discord: Discord,
}

impl DiscordChannel {
    pub fn new(discord: Discord) -> Self {
        Self {
            client: http_client(DELIVERY_TIMEOUT),
            discord,
        }
    }

    pub fn build_message(&self, envelope: &NotificationEnvelope) -> Message {
        let mut builder = MessageBuilder::new().add_embed(build_alert_embed(envelope));
        if let Some(user_id) = &self.discord.user_id {
            builder = builder.content(format!("{} <@{user_id}>", envelope.subject));
        }
        builder.build()
    }
}

#[async_trait]
impl NotificationChannel for DiscordChannel {
    fn name(&self) -> &'static str {
        "discord"
    }

    #[instrument(skip_all)]
    async fn deliver(&self, envelope: &NotificationEnvelope) -> NotificationResult<()> {
        let message = self.build_message(envelope);

        let response = self.client.post(&self.discord.url).json(&message).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotificationError::Status(status.as_u16(), body));
        }

        info!("Successfully sent Discord message");
        Ok(())
    }
}
