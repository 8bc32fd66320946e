use async_trait::async_trait;
use tracing::{error, info, warn};

use super::{NotificationChannel, NotificationEnvelope, NotificationResult, Priority};

/// Writes every notification to the service log
pub struct LogChannel;

/// Headline followed by one `key: value` line per property
fn log_lines(envelope: &NotificationEnvelope) -> Vec<String> {
    let NotificationEnvelope {
        subject,
        body,
        priority,
        properties,
    } = envelope;

    std::iter::once(format!("NOTIFICATION [{priority}]: {subject} - {body}"))
        .chain(properties.iter().map(|(key, value)| format!("  {key}: {value}")))
        .collect()
}

#[async_trait]
impl NotificationChannel for LogChannel {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn deliver(&self, envelope: &NotificationEnvelope) -> NotificationResult<()> {
        for line in log_lines(envelope) {
            match envelope.priority {
                Priority::Critical => error!("{line}"),
                Priority::High => warn!("{line}"),
                Priority::Normal | Priority::Low => info!("{line}"),
            }
        }

        Ok(())
    }
}
