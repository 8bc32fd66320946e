//! Telemetry analysis
//!
//! Turns one device-data payload into a [`DeviceAnalysisResult`]. Checks run
//! in a fixed order (online, battery, signal, heartbeat, location) and the
//! overall status is the worst `*Status` metric they recorded.
//!
//! Only the heartbeat check touches the store. Its failures become an issue
//! on the result instead of aborting the analysis.

mod result;

use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};
use tracing::{debug, error, instrument};

pub use result::{DeviceAnalysisResult, DeviceStatus, MetricValue, Severity};

use crate::config::{AnalysisConfig, HeartbeatThresholds, LevelThresholds};
use crate::storage::schema::{DEVICE_ID_TAG, DEVICE_STATUS_MEASUREMENT};
use crate::storage::{LatestQuery, TimeSeriesStore};

// payload keys
pub const IS_ONLINE_KEY: &str = "isOnline";
pub const BATTERY_LEVEL_KEY: &str = "batteryLevel";
pub const SIGNAL_STRENGTH_KEY: &str = "signalStrength";
pub const LOCATION_KEY: &str = "location";
pub const LATITUDE_KEY: &str = "latitude";
pub const LONGITUDE_KEY: &str = "longitude";
pub const ADDRESS_KEY: &str = "address";

// derived metric keys
pub const BATTERY_STATUS_METRIC: &str = "batteryStatus";
pub const SIGNAL_STATUS_METRIC: &str = "signalStatus";
pub const MINUTES_SINCE_HEARTBEAT_METRIC: &str = "minutesSinceLastHeartbeat";
pub const HEARTBEAT_STATUS_METRIC: &str = "heartbeatStatus";

/// Suffix marking a metric that takes part in the overall status
const STATUS_METRIC_SUFFIX: &str = "Status";

const UNKNOWN_STATUS: &str = "unknown";

pub const OFFLINE_ISSUE: &str = "Device is currently offline";
pub const NO_HISTORY_ISSUE: &str = "No historical data found for the device";
pub const HEARTBEAT_ERROR_ISSUE: &str = "Error analyzing device heartbeat";

/// Classify a "lower is worse" reading; boundaries are inclusive
pub fn classify_level(thresholds: &LevelThresholds, value: f64) -> Severity {
    if value <= thresholds.critical_level {
        Severity::Critical
    } else if value <= thresholds.warning_level {
        Severity::Warning
    } else {
        Severity::Normal
    }
}

/// Classify heartbeat staleness; boundaries are exclusive
pub fn classify_heartbeat(thresholds: &HeartbeatThresholds, minutes: f64) -> Severity {
    if minutes > thresholds.critical_minutes {
        Severity::Critical
    } else if minutes > thresholds.warning_minutes {
        Severity::Warning
    } else {
        Severity::Normal
    }
}

#[derive(Debug, Clone)]
pub struct AnalysisEngine {
    config: AnalysisConfig,
}

impl AnalysisEngine {
    pub fn new(config: AnalysisConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Analyse one payload received at `received_at`
    ///
    /// The heartbeat lookup only considers points strictly older than
    /// `received_at`, so the raw point of the same message never counts as
    /// history.
    #[instrument(skip(self, payload, store))]
    pub async fn analyze(
        &self,
        device_id: &str,
        payload: Map<String, Value>,
        received_at: DateTime<Utc>,
        store: &dyn TimeSeriesStore,
    ) -> DeviceAnalysisResult {
        let mut result = DeviceAnalysisResult::new(device_id, payload, Utc::now());

        if result.raw_data().get(IS_ONLINE_KEY).and_then(Value::as_bool) == Some(false) {
            result.set_status(DeviceStatus::Offline);
            result.push_issue(OFFLINE_ISSUE);
            return result;
        }

        self.analyze_battery(&mut result);
        self.analyze_signal(&mut result);
        self.analyze_heartbeat(&mut result, received_at, store).await;
        analyze_location(&mut result);
        update_overall_status(&mut result);

        debug!(
            "device {device_id} analysed: {} with {} issue(s)",
            result.status(),
            result.issues().len()
        );

        result
    }

    fn analyze_battery(&self, result: &mut DeviceAnalysisResult) {
        let Some(level) = result.raw_data().get(BATTERY_LEVEL_KEY).and_then(Value::as_f64) else {
            return;
        };

        result.set_metric(BATTERY_LEVEL_KEY, level);
        let severity = classify_level(&self.config.battery, level);
        match severity {
            Severity::Critical => result.push_issue(format!("Battery extremely low: {level}%")),
            Severity::Warning => result.push_issue(format!("Battery low: {level}%")),
            Severity::Normal => {}
        }
        result.set_metric(BATTERY_STATUS_METRIC, severity);
    }

    fn analyze_signal(&self, result: &mut DeviceAnalysisResult) {
        let Some(strength) = result.raw_data().get(SIGNAL_STRENGTH_KEY).and_then(Value::as_f64) else {
            return;
        };

        result.set_metric(SIGNAL_STRENGTH_KEY, strength);
        let severity = classify_level(&self.config.signal, strength);
        match severity {
            Severity::Critical => result.push_issue(format!("Signal very weak: {strength}%")),
            Severity::Warning => result.push_issue(format!("Signal weak: {strength}%")),
            Severity::Normal => {}
        }
        result.set_metric(SIGNAL_STATUS_METRIC, severity);
    }

    async fn analyze_heartbeat(
        &self,
        result: &mut DeviceAnalysisResult,
        received_at: DateTime<Utc>,
        store: &dyn TimeSeriesStore,
    ) {
        let query = LatestQuery::new(
            DEVICE_STATUS_MEASUREMENT,
            received_at,
            Duration::try_hours(self.config.heartbeat_lookback_hours).unwrap_or(Duration::MAX),
        )
        .tag(DEVICE_ID_TAG, result.device_id());

        match store.query_latest(query).await {
            Ok(Some(last)) => {
                let minutes = (received_at - last.timestamp).num_milliseconds() as f64 / 60_000.0;
                result.set_metric(MINUTES_SINCE_HEARTBEAT_METRIC, minutes);

                let severity = classify_heartbeat(&self.config.heartbeat, minutes);
                if severity != Severity::Normal {
                    result.push_issue(format!("No data received for {minutes:.1} minutes"));
                }
                result.set_metric(HEARTBEAT_STATUS_METRIC, severity);
            }
            Ok(None) => {
                result.push_issue(NO_HISTORY_ISSUE);
                result.set_metric(HEARTBEAT_STATUS_METRIC, UNKNOWN_STATUS);
            }
            Err(e) => {
                error!("Error analyzing heartbeat for device {}: {e}", result.device_id());
                result.push_issue(HEARTBEAT_ERROR_ISSUE);
            }
        }
    }
}

fn analyze_location(result: &mut DeviceAnalysisResult) {
    let Some(location) = result.raw_data().get(LOCATION_KEY).and_then(Value::as_object) else {
        return;
    };

    let latitude = location.get(LATITUDE_KEY).and_then(Value::as_f64);
    let longitude = location.get(LONGITUDE_KEY).and_then(Value::as_f64);

    if let (Some(latitude), Some(longitude)) = (latitude, longitude) {
        result.set_metric(LATITUDE_KEY, latitude);
        result.set_metric(LONGITUDE_KEY, longitude);
    }
}

fn update_overall_status(result: &mut DeviceAnalysisResult) {
    let status_values: Vec<&str> = result
        .metrics()
        .iter()
        .filter(|(key, _)| key.ends_with(STATUS_METRIC_SUFFIX))
        .filter_map(|(_, value)| value.as_text())
        .collect();

    let status = if status_values.contains(&Severity::Critical.as_str()) {
        DeviceStatus::Critical
    } else if status_values.contains(&Severity::Warning.as_str()) {
        DeviceStatus::Warning
    } else {
        DeviceStatus::Normal
    };

    result.set_status(status);
}
