//! Point model for the time-series store
//!
//! A point is one row of a measurement: a set of indexed string tags
//! (`deviceId`, `status`) and a set of typed fields, stamped with a UTC
//! timestamp. The shape mirrors line-protocol stores so backends can map it
//! one-to-one.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Measurement holding the raw per-message device status
pub const DEVICE_STATUS_MEASUREMENT: &str = "device_status";

/// Measurement holding one analysis verdict per message
pub const DEVICE_ANALYSIS_MEASUREMENT: &str = "device_analysis";

/// Tag carrying the device identifier on every point
pub const DEVICE_ID_TAG: &str = "deviceId";

/// Tag carrying the verdict status on analysis points
pub const STATUS_TAG: &str = "status";

/// A typed field value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Boolean(value) => write!(f, "{value}"),
            FieldValue::Integer(value) => write!(f, "{value}"),
            FieldValue::Float(value) => write!(f, "{value}"),
            FieldValue::Text(value) => f.write_str(value),
        }
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Boolean(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

/// A single time-series point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Measurement (table) name
    pub measurement: String,

    /// Indexed string tags
    pub tags: BTreeMap<String, String>,

    /// Field values
    pub fields: BTreeMap<String, FieldValue>,

    /// When the point was recorded (always UTC)
    pub timestamp: DateTime<Utc>,
}

impl Point {
    /// Start a new point for `measurement`, stamped with `timestamp`
    pub fn new(measurement: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            measurement: measurement.into(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            timestamp,
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn has_fields(&self) -> bool {
        !self.fields.is_empty()
    }

    /// Whether every tag in `filter` is present on this point with the same value
    pub fn matches(&self, filter: &BTreeMap<String, String>) -> bool {
        filter
            .iter()
            .all(|(key, value)| self.tags.get(key).is_some_and(|tag| tag == value))
    }
}
