//! Time-series store trait definition
//!
//! This module defines the `TimeSeriesStore` trait that every backend
//! implements. The ingestion core only ever appends points and asks for the
//! most recent point matching a tag filter, so the trait stays that narrow.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use super::error::StorageResult;
use super::schema::Point;

/// Parameters for a "latest matching point" lookup
#[derive(Debug, Clone)]
pub struct LatestQuery {
    /// Measurement to search
    pub measurement: String,

    /// Tags that must all match
    pub tags: BTreeMap<String, String>,

    /// Exclusive upper bound of the window
    pub before: DateTime<Utc>,

    /// How far back from `before` to look
    pub lookback: Duration,
}

impl LatestQuery {
    pub fn new(measurement: impl Into<String>, before: DateTime<Utc>, lookback: Duration) -> Self {
        Self {
            measurement: measurement.into(),
            tags: BTreeMap::new(),
            before,
            lookback,
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Inclusive lower bound of the window, clamped to the earliest
    /// representable instant
    pub fn start(&self) -> DateTime<Utc> {
        self.before
            .checked_sub_signed(self.lookback)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Whether `point` falls into this query
    pub fn accepts(&self, point: &Point) -> bool {
        point.measurement == self.measurement
            && point.timestamp >= self.start()
            && point.timestamp < self.before
            && point.matches(&self.tags)
    }
}

/// Trait for time-series store backends
///
/// Implementations must be `Send + Sync`; the store is treated as an
/// external thread-safe service and the core performs no locking or caching
/// of its state.
#[async_trait]
pub trait TimeSeriesStore: Send + Sync {
    /// Append a single point
    async fn write_point(&self, point: Point) -> StorageResult<()>;

    /// Fetch the most recent point matching `query`, if any
    async fn query_latest(&self, query: LatestQuery) -> StorageResult<Option<Point>>;

    /// Human-readable backend statistics
    async fn get_stats(&self) -> StorageResult<String>;

    /// Close the backend and release resources
    async fn close(&self) -> StorageResult<()>;
}
