//! Device-data ingestion
//!
//! For every `devices/{deviceId}/data` message:
//!
//! 1. parse the payload as a JSON object
//! 2. write the raw `device_status` point
//! 3. analyse the payload
//! 4. persist the verdict and raise an alert if due
//!
//! Nothing here propagates an error: a bad payload or a failing store is
//! logged and the message is done.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::{debug, error, info, instrument, warn};

use crate::alerts::AlertManager;
use crate::analysis::{
    ADDRESS_KEY, AnalysisEngine, BATTERY_LEVEL_KEY, DeviceAnalysisResult, IS_ONLINE_KEY, LATITUDE_KEY,
    LOCATION_KEY, LONGITUDE_KEY, SIGNAL_STRENGTH_KEY,
};
use crate::broker::InboundMessage;
use crate::dispatcher::DeviceDataHandler;
use crate::storage::schema::{DEVICE_ID_TAG, DEVICE_STATUS_MEASUREMENT};
use crate::storage::{Point, TimeSeriesStore};

/// Raw status point for a payload, `None` if it carries no known field
pub fn status_point(device_id: &str, payload: &Map<String, Value>, received_at: DateTime<Utc>) -> Option<Point> {
    let mut point = Point::new(DEVICE_STATUS_MEASUREMENT, received_at).tag(DEVICE_ID_TAG, device_id);

    if let Some(online) = payload.get(IS_ONLINE_KEY).and_then(Value::as_bool) {
        point = point.field(IS_ONLINE_KEY, online);
    }
    if let Some(battery) = payload.get(BATTERY_LEVEL_KEY).and_then(Value::as_f64) {
        point = point.field(BATTERY_LEVEL_KEY, battery);
    }
    if let Some(signal) = payload.get(SIGNAL_STRENGTH_KEY).and_then(Value::as_f64) {
        point = point.field(SIGNAL_STRENGTH_KEY, signal);
    }
    if let Some(location) = payload.get(LOCATION_KEY).and_then(Value::as_object) {
        if let Some(latitude) = location.get(LATITUDE_KEY).and_then(Value::as_f64) {
            point = point.field(LATITUDE_KEY, latitude);
        }
        if let Some(longitude) = location.get(LONGITUDE_KEY).and_then(Value::as_f64) {
            point = point.field(LONGITUDE_KEY, longitude);
        }
    }
    if let Some(address) = payload.get(ADDRESS_KEY).and_then(Value::as_str) {
        point = point.field(ADDRESS_KEY, address);
    }

    point.has_fields().then_some(point)
}

pub struct IngestionPipeline {
    store: Arc<dyn TimeSeriesStore>,
    engine: AnalysisEngine,
    alerts: AlertManager,
}

impl IngestionPipeline {
    pub fn new(store: Arc<dyn TimeSeriesStore>, engine: AnalysisEngine, alerts: AlertManager) -> Self {
        Self { store, engine, alerts }
    }

    /// Run one message through the pipeline
    ///
    /// Returns the verdict, or `None` if the payload was not a JSON object.
    #[instrument(skip(self, message), fields(topic = %message.topic))]
    pub async fn process(&self, device_id: &str, message: &InboundMessage) -> Option<DeviceAnalysisResult> {
        let payload = match serde_json::from_slice::<Value>(&message.payload) {
            Ok(Value::Object(payload)) => payload,
            Ok(other) => {
                warn!("Payload from device {device_id} is not a JSON object: {other}");
                return None;
            }
            Err(e) => {
                error!("Failed to parse JSON payload from device {device_id}: {e}");
                return None;
            }
        };

        self.record_status(device_id, &payload, message.received_at).await;

        let result = self
            .engine
            .analyze(device_id, payload, message.received_at, self.store.as_ref())
            .await;

        self.alerts.record(&result).await;

        info!(
            "Processed data for device {device_id}, status: {}",
            result.status()
        );

        Some(result)
    }

    async fn record_status(&self, device_id: &str, payload: &Map<String, Value>, received_at: DateTime<Utc>) {
        let Some(point) = status_point(device_id, payload, received_at) else {
            warn!("No recognised fields in payload from device {device_id}, skipping status write");
            return;
        };

        match self.store.write_point(point).await {
            Ok(()) => debug!("Stored status for device {device_id}"),
            Err(e) => error!("Error writing status for device {device_id}: {e}"),
        }
    }
}

#[async_trait]
impl DeviceDataHandler for IngestionPipeline {
    async fn handle_device_data(&self, device_id: &str, message: &InboundMessage) {
        self.process(device_id, message).await;
    }
}
