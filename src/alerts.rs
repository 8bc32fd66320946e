//! Verdict persistence and alert policy
//!
//! Every analysis result is written as a `device_analysis` point. Results
//! with issues are turned into a [`NotificationEnvelope`] whose priority
//! follows the device status; `Normal` maps to no alert at all, even when
//! the result carries issues.

use std::sync::Arc;

use tracing::{debug, error, info, instrument};

use crate::analysis::{DeviceAnalysisResult, DeviceStatus};
use crate::notifications::{NotificationEnvelope, NotificationGateway, Priority};
use crate::storage::schema::{DEVICE_ANALYSIS_MEASUREMENT, DEVICE_ID_TAG, STATUS_TAG};
use crate::storage::{Point, TimeSeriesStore};

/// Metric key never copied into alert properties
const ISSUES_KEY: &str = "issues";

/// Separator of the `issues` field of the verdict point
const ISSUE_FIELD_SEPARATOR: &str = "; ";

/// Separator of the issue list in the alert body
const ISSUE_BODY_SEPARATOR: &str = ", ";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Alert priority for a device status, `None` when no alert is due
pub fn priority_for(status: DeviceStatus) -> Option<Priority> {
    match status {
        DeviceStatus::Critical => Some(Priority::Critical),
        DeviceStatus::Warning | DeviceStatus::Offline => Some(Priority::High),
        DeviceStatus::Normal => None,
    }
}

/// Build the alert for `result`, if one is due
pub fn build_alert(result: &DeviceAnalysisResult) -> Option<NotificationEnvelope> {
    if !result.has_issues() {
        return None;
    }

    let priority = priority_for(result.status())?;
    let device_id = result.device_id();

    let subject = format!("IoT Device Alert: {device_id}");
    let body = format!(
        "Issues detected with device {device_id}:\nStatus: {}\nIssues: {}",
        result.status(),
        result.issues().join(ISSUE_BODY_SEPARATOR)
    );

    let mut envelope = NotificationEnvelope::new(subject, body, priority)
        .property("DeviceId", device_id)
        .property("Status", result.status().as_str())
        .property("Timestamp", result.timestamp().format(TIMESTAMP_FORMAT).to_string());

    for (key, value) in result.metrics() {
        if key != ISSUES_KEY {
            envelope = envelope.property(key.clone(), value.to_string());
        }
    }

    Some(envelope)
}

/// Verdict point for `result`
pub fn analysis_point(result: &DeviceAnalysisResult) -> Point {
    let mut point = Point::new(DEVICE_ANALYSIS_MEASUREMENT, result.timestamp())
        .tag(DEVICE_ID_TAG, result.device_id())
        .tag(STATUS_TAG, result.status().as_str())
        .field("issueCount", result.issues().len() as i64)
        .field("hasIssues", result.has_issues());

    if result.has_issues() {
        point = point.field(ISSUES_KEY, result.issues().join(ISSUE_FIELD_SEPARATOR));
    }

    for (key, value) in result.metrics() {
        point = point.field(key.clone(), value);
    }

    point
}

/// Persists verdicts and raises alerts
pub struct AlertManager {
    store: Arc<dyn TimeSeriesStore>,
    gateway: Arc<dyn NotificationGateway>,
}

impl AlertManager {
    pub fn new(store: Arc<dyn TimeSeriesStore>, gateway: Arc<dyn NotificationGateway>) -> Self {
        Self { store, gateway }
    }

    /// Write the verdict point; failures are logged and swallowed
    #[instrument(skip_all, fields(device_id = %result.device_id()))]
    pub async fn save_analysis(&self, result: &DeviceAnalysisResult) -> bool {
        match self.store.write_point(analysis_point(result)).await {
            Ok(()) => {
                debug!("Saved analysis result for device {}", result.device_id());
                true
            }
            Err(e) => {
                error!("Error saving analysis result for device {}: {e}", result.device_id());
                false
            }
        }
    }

    /// Send an alert if the result warrants one; returns whether it was sent
    #[instrument(skip_all, fields(device_id = %result.device_id()))]
    pub async fn send_alert_if_needed(&self, result: &DeviceAnalysisResult) -> bool {
        let Some(envelope) = build_alert(result) else {
            return false;
        };

        info!(
            "Sending {} alert for device {}",
            envelope.priority,
            result.device_id()
        );
        self.gateway.send(&envelope).await;
        true
    }

    /// Persist the verdict, then alert
    pub async fn record(&self, result: &DeviceAnalysisResult) {
        self.save_analysis(result).await;
        self.send_alert_if_needed(result).await;
    }
}
