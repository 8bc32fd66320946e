//! SQLite persistence across messages

use std::sync::Arc;

use chrono::{Duration, Utc};
use device_monitor::alerts::AlertManager;
use device_monitor::analysis::{AnalysisEngine, DeviceStatus, MINUTES_SINCE_HEARTBEAT_METRIC, NO_HISTORY_ISSUE};
use device_monitor::broker::InboundMessage;
use device_monitor::config::AnalysisConfig;
use device_monitor::pipeline::IngestionPipeline;
use device_monitor::storage::sqlite::SqliteStore;
use device_monitor::storage::{LatestQuery, Point, TimeSeriesStore};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

use crate::helpers::*;

async fn open_store(dir: &TempDir) -> Arc<SqliteStore> {
    Arc::new(SqliteStore::new(dir.path().join("telemetry.db")).await.unwrap())
}

fn latest_status(device_id: &str) -> LatestQuery {
    LatestQuery::new("device_status", Utc::now() + Duration::seconds(1), Duration::hours(24)).tag("deviceId", device_id)
}

#[tokio::test]
async fn test_heartbeat_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let gateway = Arc::new(RecordingGateway::default());

    {
        let store = open_store(&dir).await;
        let pipeline = IngestionPipeline::new(
            store.clone(),
            AnalysisEngine::new(AnalysisConfig::default()),
            AlertManager::new(store.clone(), gateway.clone()),
        );

        let message = InboundMessage::new("devices/abc/data", r#"{"batteryLevel": 70}"#);
        let result = pipeline.process("abc", &message).await.unwrap();
        assert_eq!(result.issues(), [NO_HISTORY_ISSUE]);

        store.close().await.unwrap();
    }

    tokio::time::sleep(std::time::Duration::from_millis(5)).await;

    let store = open_store(&dir).await;
    let pipeline = IngestionPipeline::new(
        store.clone(),
        AnalysisEngine::new(AnalysisConfig::default()),
        AlertManager::new(store.clone(), gateway.clone()),
    );

    let message = InboundMessage::new("devices/abc/data", r#"{"batteryLevel": 69}"#);
    let result = pipeline.process("abc", &message).await.unwrap();

    assert_eq!(result.status(), DeviceStatus::Normal);
    assert!(!result.has_issues());
    assert!(result.metric(MINUTES_SINCE_HEARTBEAT_METRIC).is_some());
    assert!(gateway.sent().is_empty());
}

#[tokio::test]
async fn test_heartbeat_only_matches_same_device() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    store
        .write_point(
            Point::new("device_status", Utc::now() - Duration::minutes(30))
                .tag("deviceId", "other")
                .field("isOnline", true),
        )
        .await
        .unwrap();
    store
        .write_point(
            Point::new("device_status", Utc::now() - Duration::minutes(20))
                .tag("deviceId", "abc")
                .field("isOnline", true),
        )
        .await
        .unwrap();

    let gateway = Arc::new(RecordingGateway::default());
    let pipeline = IngestionPipeline::new(
        store.clone(),
        AnalysisEngine::new(AnalysisConfig::default()),
        AlertManager::new(store.clone(), gateway.clone()),
    );

    let message = InboundMessage::new("devices/abc/data", r#"{"signalStrength": 80}"#);
    let result = pipeline.process("abc", &message).await.unwrap();

    assert_eq!(result.status(), DeviceStatus::Critical);
    let minutes = result.metric(MINUTES_SINCE_HEARTBEAT_METRIC).and_then(|m| m.as_number()).unwrap();
    assert!((19.9..20.5).contains(&minutes), "minutes {minutes}");
    assert_eq!(gateway.sent().len(), 1);
}

#[tokio::test]
async fn test_cleanup_removes_old_points_only() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    for days_ago in [40, 31, 2] {
        store
            .write_point(
                Point::new("device_status", Utc::now() - Duration::days(days_ago))
                    .tag("deviceId", "abc")
                    .field("batteryLevel", 50.0),
            )
            .await
            .unwrap();
    }

    let deleted = store.cleanup_before(Utc::now() - Duration::days(30)).await.unwrap();
    assert_eq!(deleted, 2);

    let latest = store
        .query_latest(LatestQuery::new("device_status", Utc::now(), Duration::days(60)).tag("deviceId", "abc"))
        .await
        .unwrap()
        .unwrap();
    assert!(latest.timestamp > Utc::now() - Duration::days(3));

    let deleted = store.cleanup_before(Utc::now() - Duration::days(30)).await.unwrap();
    assert_eq!(deleted, 0);
}

#[tokio::test]
async fn test_raw_status_fields_round_trip() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;
    let gateway = Arc::new(RecordingGateway::default());
    let pipeline = IngestionPipeline::new(
        store.clone(),
        AnalysisEngine::new(AnalysisConfig::default()),
        AlertManager::new(store.clone(), gateway),
    );

    let message = InboundMessage::new(
        "devices/abc/data",
        r#"{"isOnline": true, "batteryLevel": 55.5, "location": {"latitude": 52.5, "longitude": 13.4}, "address": "Berlin"}"#,
    );
    pipeline.process("abc", &message).await.unwrap();

    let point = store.query_latest(latest_status("abc")).await.unwrap().unwrap();
    assert_eq!(point.fields["isOnline"].to_string(), "true");
    assert_eq!(point.fields["batteryLevel"].to_string(), "55.5");
    assert_eq!(point.fields["latitude"].to_string(), "52.5");
    assert_eq!(point.fields["address"].to_string(), "Berlin");
}
