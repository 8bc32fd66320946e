use async_trait::async_trait;
use chrono::Utc;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::{info, instrument};

use super::{
    DELIVERY_TIMEOUT, NotificationChannel, NotificationEnvelope, NotificationError, NotificationResult, Priority,
};
use crate::config::Email;

pub struct EmailChannel {
    config: Email,
}

impl EmailChannel {
    pub fn new(config: Email) -> Self {
        Self { config }
    }

    pub fn build_message(&self, envelope: &NotificationEnvelope) -> NotificationResult<Message> {
        let sender: Address = self
            .config
            .sender_email
            .parse()
            .map_err(|e| NotificationError::Email(format!("invalid sender address: {e}")))?;

        let mut builder = Message::builder()
            .from(Mailbox::new(Some(self.config.sender_name.clone()), sender))
            .subject(format!("[{}] {}", envelope.priority, envelope.subject))
            .header(ContentType::TEXT_HTML);

        for recipient in &self.config.recipients {
            let mailbox: Mailbox = recipient
                .parse()
                .map_err(|e| NotificationError::Email(format!("invalid recipient {recipient}: {e}")))?;
            builder = builder.to(mailbox);
        }

        builder
            .body(format_html_body(envelope))
            .map_err(|e| NotificationError::Email(e.to_string()))
    }

    fn transport(&self) -> NotificationResult<AsyncSmtpTransport<Tokio1Executor>> {
        let mut builder = if self.config.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.config.smtp_server)
                .map_err(|e| NotificationError::Email(e.to_string()))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&self.config.smtp_server)
        };
        builder = builder.port(self.config.smtp_port).timeout(Some(DELIVERY_TIMEOUT));

        if let (Some(user), Some(pass)) = (&self.config.username, &self.config.password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        Ok(builder.build())
    }
}

#[async_trait]
impl NotificationChannel for EmailChannel {
    fn name(&self) -> &'static str {
        "email"
    }

    #[instrument(skip_all)]
    async fn deliver(&self, envelope: &NotificationEnvelope) -> NotificationResult<()> {
        let message = self.build_message(envelope)?;

        let transport = self.transport()?;
        tokio::time::timeout(DELIVERY_TIMEOUT, transport.send(message))
            .await
            .map_err(|_| NotificationError::Timeout(DELIVERY_TIMEOUT))?
            .map_err(|e| NotificationError::Email(e.to_string()))?;

        info!(
            "Email notification sent to {} recipients",
            self.config.recipients.len()
        );
        Ok(())
    }
}

const STYLE_HEAD: &str = r#"<!DOCTYPE html>
<html>
<head>
  <style>
    body { font-family: Arial, sans-serif; }
    .container { padding: 20px; }
    .message { margin: 20px 0; padding: 15px; border-radius: 5px; }
    .properties { margin-top: 20px; }
    .property { margin: 5px 0; }
    .timestamp { color: #888; font-size: 0.8em; }
"#;

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn background_color(priority: Priority) -> &'static str {
    match priority {
        Priority::Critical => "#ffebee",
        Priority::High => "#fff8e1",
        Priority::Normal => "#e3f2fd",
        Priority::Low => "#f1f8e9",
    }
}

pub fn format_html_body(envelope: &NotificationEnvelope) -> String {
    let mut html = String::from(STYLE_HEAD);
    html.push_str(&format!(
        "    .message {{ background-color: {}; }}\n  </style>\n</head>\n<body>\n",
        background_color(envelope.priority)
    ));
    html.push_str("  <div class=\"container\">\n");
    html.push_str(&format!(
        "    <div class=\"message\">{}</div>\n",
        escape_html(&envelope.body).replace('\n', "<br>")
    ));

    if !envelope.properties.is_empty() {
        html.push_str("    <div class=\"properties\">\n      <h3>Details:</h3>\n");
        for (key, value) in &envelope.properties {
            html.push_str(&format!(
                "      <div class=\"property\"><strong>{}:</strong> {}</div>\n",
                escape_html(key),
                escape_html(value)
            ));
        }
        html.push_str("    </div>\n");
    }

    html.push_str(&format!(
        "    <div class=\"timestamp\">Sent at: {} UTC</div>\n  </div>\n</body>\n</html>\n",
        Utc::now().format("%Y-%m-%d %H:%M:%S")
    ));

    html
}
