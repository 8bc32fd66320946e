//! In-memory time-series store (no persistence)
//!
//! Points are kept per series, one bounded ring buffer for every
//! measurement and `deviceId` tag pair, so a chatty device cannot evict the
//! heartbeat of a quiet one. Useful for:
//! - Testing without database dependencies
//! - Running the service without a storage backend configured
//!
//! ## Limitations
//!
//! - **No persistence**: All data lost on restart
//! - **Limited capacity**: Oldest points are evicted once a series is full
//! - **Unbounded series count**: Every new device adds a buffer

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use super::backend::{LatestQuery, TimeSeriesStore};
use super::error::StorageResult;
use super::schema::{DEVICE_ID_TAG, Point};

/// Maximum points to keep in memory per series
const MAX_POINTS_PER_SERIES: usize = 10_000;

/// Points of one measurement, keyed by `deviceId` (untagged points share `None`)
type Series = HashMap<Option<String>, VecDeque<Point>>;

/// In-memory time-series store
pub struct MemoryStore {
    points: RwLock<HashMap<String, Series>>,
    capacity: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_capacity(MAX_POINTS_PER_SERIES)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            points: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// All points of a measurement across devices, oldest first
    pub async fn points(&self, measurement: &str) -> Vec<Point> {
        let mut points: Vec<Point> = self
            .points
            .read()
            .await
            .get(measurement)
            .map(|series| series.values().flatten().cloned().collect())
            .unwrap_or_default();
        points.sort_by_key(|point| point.timestamp);
        points
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TimeSeriesStore for MemoryStore {
    async fn write_point(&self, point: Point) -> StorageResult<()> {
        trace!("in-memory store: writing point to {}", point.measurement);

        let mut points = self.points.write().await;
        let deque = points
            .entry(point.measurement.clone())
            .or_default()
            .entry(point.tags.get(DEVICE_ID_TAG).cloned())
            .or_default();

        if deque.len() == self.capacity {
            deque.pop_front();
        }
        deque.push_back(point);

        Ok(())
    }

    async fn query_latest(&self, query: LatestQuery) -> StorageResult<Option<Point>> {
        debug!(
            "querying latest {} point in [{}, {})",
            query.measurement,
            query.start(),
            query.before
        );

        let points = self.points.read().await;
        let Some(series) = points.get(&query.measurement) else {
            return Ok(None);
        };

        // a deviceId filter narrows the scan to that device's buffer
        let candidates: Vec<&VecDeque<Point>> = match query.tags.get(DEVICE_ID_TAG) {
            Some(device_id) => series.get(&Some(device_id.clone())).into_iter().collect(),
            None => series.values().collect(),
        };

        let latest = candidates
            .into_iter()
            .flatten()
            .filter(|point| query.accepts(point))
            .max_by_key(|point| point.timestamp)
            .cloned();

        Ok(latest)
    }

    async fn get_stats(&self) -> StorageResult<String> {
        let points = self.points.read().await;
        let total: usize = points.values().flat_map(HashMap::values).map(VecDeque::len).sum();
        let series: usize = points.values().map(HashMap::len).sum();
        Ok(format!(
            "In-Memory: {} points in {} series across {} measurements",
            total,
            series,
            points.len()
        ))
    }

    async fn close(&self) -> StorageResult<()> {
        debug!("closing in-memory store (no-op)");
        Ok(())
    }
}
