use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::storage::FieldValue;

/// Overall verdict for a device
///
/// Ordered by severity, `Offline` short-circuits every other check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum DeviceStatus {
    Normal,
    Warning,
    Critical,
    Offline,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Normal => "Normal",
            DeviceStatus::Warning => "Warning",
            DeviceStatus::Critical => "Critical",
            DeviceStatus::Offline => "Offline",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a single metric
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Normal,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Normal => "normal",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

/// Value of a derived metric
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetricValue {
    Number(f64),
    Flag(bool),
    Text(String),
}

impl MetricValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            MetricValue::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            MetricValue::Number(number) => Some(*number),
            _ => None,
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Number(number) => write!(f, "{number}"),
            MetricValue::Flag(flag) => write!(f, "{flag}"),
            MetricValue::Text(text) => f.write_str(text),
        }
    }
}

impl From<f64> for MetricValue {
    fn from(value: f64) -> Self {
        MetricValue::Number(value)
    }
}

impl From<bool> for MetricValue {
    fn from(value: bool) -> Self {
        MetricValue::Flag(value)
    }
}

impl From<&str> for MetricValue {
    fn from(value: &str) -> Self {
        MetricValue::Text(value.to_string())
    }
}

impl From<Severity> for MetricValue {
    fn from(value: Severity) -> Self {
        MetricValue::Text(value.as_str().to_string())
    }
}

impl From<&MetricValue> for FieldValue {
    fn from(value: &MetricValue) -> Self {
        match value {
            MetricValue::Number(number) => FieldValue::Float(*number),
            MetricValue::Flag(flag) => FieldValue::Boolean(*flag),
            MetricValue::Text(text) => FieldValue::Text(text.clone()),
        }
    }
}

/// Verdict of analysing one telemetry message
///
/// Issues keep the order in which the checks produced them.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAnalysisResult {
    device_id: String,
    timestamp: DateTime<Utc>,
    raw_data: Map<String, Value>,
    status: DeviceStatus,
    issues: Vec<String>,
    metrics: BTreeMap<String, MetricValue>,
}

impl DeviceAnalysisResult {
    pub fn new(device_id: impl Into<String>, raw_data: Map<String, Value>, timestamp: DateTime<Utc>) -> Self {
        Self {
            device_id: device_id.into(),
            timestamp,
            raw_data,
            status: DeviceStatus::Normal,
            issues: Vec::new(),
            metrics: BTreeMap::new(),
        }
    }

    pub fn with_status(mut self, status: DeviceStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_issue(mut self, issue: impl Into<String>) -> Self {
        self.issues.push(issue.into());
        self
    }

    pub fn with_metric(mut self, key: impl Into<String>, value: impl Into<MetricValue>) -> Self {
        self.metrics.insert(key.into(), value.into());
        self
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn raw_data(&self) -> &Map<String, Value> {
        &self.raw_data
    }

    pub fn status(&self) -> DeviceStatus {
        self.status
    }

    pub fn issues(&self) -> &[String] {
        &self.issues
    }

    pub fn metrics(&self) -> &BTreeMap<String, MetricValue> {
        &self.metrics
    }

    pub fn metric(&self, key: &str) -> Option<&MetricValue> {
        self.metrics.get(key)
    }

    pub fn has_issues(&self) -> bool {
        !self.issues.is_empty()
    }

    pub(crate) fn push_issue(&mut self, issue: impl Into<String>) {
        self.issues.push(issue.into());
    }

    pub(crate) fn set_metric(&mut self, key: &str, value: impl Into<MetricValue>) {
        self.metrics.insert(key.to_string(), value.into());
    }

    pub(crate) fn set_status(&mut self, status: DeviceStatus) {
        self.status = status;
    }
}
