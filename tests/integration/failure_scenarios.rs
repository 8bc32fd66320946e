//! Failure handling across the ingestion path
//!
//! A broken store, a bad payload or a failing notification channel must
//! never stop the remaining work for a message.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use device_monitor::alerts::AlertManager;
use device_monitor::analysis::{AnalysisEngine, DeviceStatus, HEARTBEAT_ERROR_ISSUE};
use device_monitor::broker::{DisconnectReason, InboundMessage};
use device_monitor::config::{AnalysisConfig, Discord, Webhook};
use device_monitor::dispatcher::{DispatchOutcome, MessageDispatcher};
use device_monitor::notifications::discord::DiscordChannel;
use device_monitor::notifications::webhook::WebhookChannel;
use device_monitor::notifications::{NotificationChannel, NotificationGateway, Notifier, Priority};
use device_monitor::pipeline::IngestionPipeline;
use device_monitor::storage::memory::MemoryStore;
use device_monitor::supervisor::{ConnectionState, ConnectionSupervisor};
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

#[tokio::test]
async fn test_failing_store_still_alerts() {
    let store = Arc::new(FailingStore);
    let gateway = Arc::new(RecordingGateway::default());
    let pipeline = IngestionPipeline::new(
        store.clone(),
        AnalysisEngine::new(AnalysisConfig::default()),
        AlertManager::new(store, gateway.clone()),
    );

    let message = InboundMessage::new("devices/abc/data", r#"{"batteryLevel": 4}"#);
    let result = pipeline.process("abc", &message).await.unwrap();

    assert_eq!(result.status(), DeviceStatus::Critical);
    assert!(result.issues().iter().any(|issue| issue == HEARTBEAT_ERROR_ISSUE));

    let sent = gateway.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].priority, Priority::Critical);
    assert!(sent[0].body.contains(HEARTBEAT_ERROR_ISSUE));
}

#[tokio::test]
async fn test_failing_store_with_healthy_readings_stays_quiet() {
    let store = Arc::new(FailingStore);
    let gateway = Arc::new(RecordingGateway::default());
    let pipeline = IngestionPipeline::new(
        store.clone(),
        AnalysisEngine::new(AnalysisConfig::default()),
        AlertManager::new(store, gateway.clone()),
    );

    let message = InboundMessage::new("devices/abc/data", r#"{"batteryLevel": 80}"#);
    let result = pipeline.process("abc", &message).await.unwrap();

    // the heartbeat error is an issue but carries no status of its own
    assert_eq!(result.status(), DeviceStatus::Normal);
    assert_eq!(result.issues(), [HEARTBEAT_ERROR_ISSUE]);
    assert!(gateway.sent().is_empty());
}

#[tokio::test]
async fn test_non_object_payloads_are_dropped() {
    let store = Arc::new(MemoryStore::new());
    let gateway = Arc::new(RecordingGateway::default());
    let pipeline = IngestionPipeline::new(
        store.clone(),
        AnalysisEngine::new(AnalysisConfig::default()),
        AlertManager::new(store.clone(), gateway.clone()),
    );

    for payload in ["", "null", "42", "\"text\"", "{\"batteryLevel\": 5", "\u{fffd}\u{fffd}"] {
        let message = InboundMessage::new("devices/abc/data", payload);
        assert!(pipeline.process("abc", &message).await.is_none(), "payload {payload:?}");
    }

    assert!(store.points("device_status").await.is_empty());
    assert!(store.points("device_analysis").await.is_empty());
    assert!(gateway.sent().is_empty());
}

#[tokio::test]
async fn test_malformed_topics_never_reach_the_pipeline() {
    let store = Arc::new(MemoryStore::new());
    let gateway = Arc::new(RecordingGateway::default());
    let pipeline = Arc::new(IngestionPipeline::new(
        store.clone(),
        AnalysisEngine::new(AnalysisConfig::default()),
        AlertManager::new(store.clone(), gateway.clone()),
    ));
    let dispatcher = MessageDispatcher::new().with_device_data_handler(pipeline);

    let observed = Arc::new(AtomicUsize::new(0));
    let counter = observed.clone();
    dispatcher.subscribe(move |_message: &InboundMessage| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    for topic in ["devices/data", "devices//data", "sensors/abc/data"] {
        let message = InboundMessage::new(topic, r#"{"batteryLevel": 1}"#);
        assert_eq!(dispatcher.dispatch(message).await, DispatchOutcome::Dropped, "topic {topic}");
    }

    let message = InboundMessage::new("devices/abc/status", r#"{"batteryLevel": 1}"#);
    assert_eq!(dispatcher.dispatch(message).await, DispatchOutcome::Observed);

    assert_eq!(observed.load(Ordering::SeqCst), 1);
    assert!(store.points("device_status").await.is_empty());
    assert!(gateway.sent().is_empty());
}

#[tokio::test]
async fn test_failing_observer_does_not_block_processing() {
    let store = Arc::new(MemoryStore::new());
    let gateway = Arc::new(RecordingGateway::default());
    let pipeline = Arc::new(IngestionPipeline::new(
        store.clone(),
        AnalysisEngine::new(AnalysisConfig::default()),
        AlertManager::new(store.clone(), gateway.clone()),
    ));
    let dispatcher = MessageDispatcher::new().with_device_data_handler(pipeline);

    dispatcher.subscribe(|_message: &InboundMessage| anyhow::bail!("observer broke"));
    dispatcher.subscribe(|_message: &InboundMessage| panic!("observer panicked"));

    let message = InboundMessage::new("devices/abc/data", r#"{"isOnline": false}"#);
    assert_eq!(dispatcher.dispatch(message).await, DispatchOutcome::Processed);

    assert_eq!(gateway.sent().len(), 1);
}

#[tokio::test]
async fn test_failing_webhook_does_not_stop_other_channels() {
    let failing = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream broke"))
        .expect(1)
        .mount(&failing)
        .await;

    let healthy = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/discord"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&healthy)
        .await;

    let webhook: Arc<dyn NotificationChannel> = Arc::new(WebhookChannel::new(Webhook {
        url: format!("{}/hook", failing.uri()),
        headers: HashMap::new(),
    }));
    let discord: Arc<dyn NotificationChannel> = Arc::new(DiscordChannel::new(Discord {
        url: format!("{}/discord", healthy.uri()),
        user_id: None,
    }));

    let notifier = Arc::new(Notifier::new(vec![webhook, discord]));

    let store = Arc::new(MemoryStore::new());
    let alerts = AlertManager::new(store.clone(), notifier.clone());
    let pipeline = IngestionPipeline::new(store.clone(), AnalysisEngine::new(AnalysisConfig::default()), alerts);

    let message = InboundMessage::new("devices/abc/data", r#"{"isOnline": false}"#);
    let result = pipeline.process("abc", &message).await.unwrap();

    assert_eq!(result.status(), DeviceStatus::Offline);
    assert_eq!(store.points("device_analysis").await.len(), 1);
    // expectations on both servers are verified on drop
}

#[tokio::test]
async fn test_unreachable_webhook_is_logged_not_raised() {
    let webhook: Arc<dyn NotificationChannel> = Arc::new(WebhookChannel::new(Webhook {
        url: "http://127.0.0.1:1/hook".to_string(),
        headers: HashMap::new(),
    }));

    let envelope = device_monitor::notifications::NotificationEnvelope::new("subject", "body", Priority::High);
    assert!(webhook.deliver(&envelope).await.is_err());

    let notifier = Notifier::new(vec![webhook]);
    notifier.send(&envelope).await;
}

#[tokio::test]
async fn test_hung_alert_does_not_stall_other_devices_or_reconnects() {
    let store = Arc::new(MemoryStore::new());
    let gateway = Arc::new(HangingGateway::new());
    let pipeline = Arc::new(IngestionPipeline::new(
        store.clone(),
        AnalysisEngine::new(AnalysisConfig::default()),
        AlertManager::new(store.clone(), gateway.clone()),
    ));
    let dispatcher = Arc::new(MessageDispatcher::new().with_device_data_handler(pipeline));

    let broker = Arc::new(FakeBroker::new());
    let supervisor = ConnectionSupervisor::new(broker.clone(), test_broker_config(&["devices/+/data"]), dispatcher);
    assert!(supervisor.start(&CancellationToken::new()).await.is_success());

    // critical reading, its alert never completes
    broker.emit("devices/a/data", r#"{"batteryLevel": 5}"#);
    assert!(wait_until(|| async { gateway.attempts.load(Ordering::SeqCst) == 1 }).await);

    broker.emit("devices/b/data", r#"{"batteryLevel": 80}"#);
    let device_b_analysed = wait_until(|| async {
        store
            .points("device_analysis")
            .await
            .iter()
            .any(|point| point.tags["deviceId"] == "b")
    })
    .await;
    assert!(device_b_analysed, "device b was not processed while device a hung");

    broker.drop_connection(DisconnectReason::ConnectionLost("keep alive timeout".to_string()));
    assert!(wait_until(|| async { broker.connects() == 2 }).await);
    assert!(wait_until(|| async { supervisor.state().await == ConnectionState::Connected }).await);

    tokio::time::timeout(std::time::Duration::from_secs(2), supervisor.shutdown())
        .await
        .expect("shutdown waited for the hung alert");
}
