//! Connection supervisor lifecycle tests
//!
//! Drive the supervisor against the in-process fake broker:
//! - startup, subscription and publishing
//! - concurrent connects
//! - reconnection after unexpected session loss
//! - deliberate disconnect and disposal

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use device_monitor::broker::{DisconnectReason, QoS};
use device_monitor::dispatcher::MessageDispatcher;
use device_monitor::supervisor::{
    CODE_CANCELLED, CODE_CONNECT_IN_PROGRESS, CODE_DISPOSED, CODE_FAILURE, ConnectionState, ConnectionSupervisor,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::helpers::*;

const DATA_TOPIC: &str = "devices/+/data";
const STATUS_TOPIC: &str = "devices/+/status";

fn supervisor(broker: &Arc<FakeBroker>, topics: &[&str]) -> ConnectionSupervisor {
    ConnectionSupervisor::new(
        broker.clone(),
        test_broker_config(topics),
        Arc::new(MessageDispatcher::new()),
    )
}

#[tokio::test]
async fn test_start_connects_and_subscribes() {
    let broker = Arc::new(FakeBroker::new());
    let supervisor = supervisor(&broker, &[DATA_TOPIC, STATUS_TOPIC]);

    let result = supervisor.start(&CancellationToken::new()).await;

    assert!(result.is_success(), "start failed: {result}");
    assert_eq!(supervisor.state().await, ConnectionState::Connected);
    assert_eq!(broker.subscribe_batches(), vec![vec![DATA_TOPIC, STATUS_TOPIC]]);
    assert_eq!(supervisor.session().await.subscriptions, vec![DATA_TOPIC, STATUS_TOPIC]);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_start_fails_when_broker_refuses() {
    let broker = Arc::new(FakeBroker::new());
    broker.set_accept_connections(false);
    let supervisor = supervisor(&broker, &[DATA_TOPIC]);

    let result = supervisor.start(&CancellationToken::new()).await;

    assert_eq!(result.code, CODE_FAILURE);
    assert!(result.message.contains("Failed to connect"));
    assert_eq!(supervisor.state().await, ConnectionState::Disconnected);
    assert!(broker.subscribe_batches().is_empty());

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_connect_is_idempotent_when_connected() {
    let broker = Arc::new(FakeBroker::new());
    let supervisor = supervisor(&broker, &[DATA_TOPIC]);
    let token = CancellationToken::new();

    assert!(supervisor.connect(&token).await.is_success());
    let again = supervisor.connect(&token).await;

    assert!(again.is_success());
    assert_eq!(again.message, "Already connected to broker");
    assert_eq!(broker.connects(), 1);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_connect_reports_attempt_in_progress() {
    let broker = Arc::new(FakeBroker::new());
    broker.set_connect_delay(Duration::from_millis(300));
    let supervisor = Arc::new(supervisor(&broker, &[DATA_TOPIC]));

    let first = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.connect(&CancellationToken::new()).await })
    };
    assert!(wait_until(|| async { broker.connects() == 1 }).await);

    let second = supervisor.connect(&CancellationToken::new()).await;

    assert_eq!(second.code, CODE_CONNECT_IN_PROGRESS);
    assert!(first.await.unwrap().is_success());
    assert_eq!(broker.connects(), 1);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_connect_during_slow_publish_reports_connected() {
    let broker = Arc::new(FakeBroker::new());
    broker.set_publish_delay(Duration::from_millis(500));
    let supervisor = Arc::new(supervisor(&broker, &[DATA_TOPIC]));
    assert!(supervisor.connect(&CancellationToken::new()).await.is_success());

    let publishing = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move {
            supervisor
                .publish("devices/a/command", &json!({ "command": "sync" }), QoS::AtLeastOnce, false, &CancellationToken::new())
                .await
        })
    };
    assert!(wait_until(|| async { broker.publish_calls.load(Ordering::SeqCst) == 1 }).await);

    let result = tokio::time::timeout(Duration::from_millis(200), supervisor.connect(&CancellationToken::new()))
        .await
        .expect("connect waited for the publish");

    assert!(result.is_success(), "connect failed: {result}");
    assert_eq!(result.message, "Already connected to broker");
    assert!(publishing.await.unwrap().is_success());
    assert_eq!(broker.connects(), 1);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_connect_honours_cancellation() {
    let broker = Arc::new(FakeBroker::new());
    broker.set_connect_delay(Duration::from_secs(5));
    let supervisor = supervisor(&broker, &[DATA_TOPIC]);

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let result = tokio::time::timeout(Duration::from_secs(1), supervisor.connect(&token))
        .await
        .expect("connect did not observe cancellation");

    assert_eq!(result.code, CODE_CANCELLED);
    assert_eq!(supervisor.state().await, ConnectionState::Disconnected);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_partial_subscription_keeps_granted_topics() {
    let broker = Arc::new(FakeBroker::new());
    broker.reject_topic(STATUS_TOPIC);
    let supervisor = supervisor(&broker, &[DATA_TOPIC, STATUS_TOPIC]);

    let result = supervisor.start(&CancellationToken::new()).await;

    assert_eq!(result.code, CODE_FAILURE);
    assert_eq!(result.message, "Failed to subscribe to one or more topics");
    assert_eq!(supervisor.state().await, ConnectionState::Connected);
    assert_eq!(supervisor.session().await.subscriptions, vec![DATA_TOPIC]);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_publish_connects_and_serializes() {
    let broker = Arc::new(FakeBroker::new());
    let supervisor = supervisor(&broker, &[DATA_TOPIC]);

    let result = supervisor
        .publish(
            "devices/abc123/command",
            &json!({ "command": "reboot" }),
            QoS::AtLeastOnce,
            false,
            &CancellationToken::new(),
        )
        .await;

    assert!(result.is_success(), "publish failed: {result}");
    let published = broker.published.lock().unwrap().clone();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0, "devices/abc123/command");
    assert_eq!(published[0].1, br#"{"command":"reboot"}"#.to_vec());

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_publish_command_fills_device_topic() {
    let broker = Arc::new(FakeBroker::new());
    let supervisor = supervisor(&broker, &[DATA_TOPIC]);
    let token = CancellationToken::new();
    assert!(supervisor.start(&token).await.is_success());

    let result = supervisor
        .publish_command("sensor-9", &json!({ "command": "ping" }), &token)
        .await;

    assert!(result.is_success(), "publish failed: {result}");
    assert_eq!(broker.published.lock().unwrap()[0].0, "devices/sensor-9/command");

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_messages_reach_dispatcher() {
    let broker = Arc::new(FakeBroker::new());
    let dispatcher = Arc::new(MessageDispatcher::new());
    let received = Arc::new(AtomicUsize::new(0));
    {
        let received = received.clone();
        dispatcher.subscribe(move |message| {
            assert_eq!(message.topic, "devices/abc/status");
            received.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
    }
    let supervisor = ConnectionSupervisor::new(broker.clone(), test_broker_config(&[DATA_TOPIC]), dispatcher);
    assert!(supervisor.start(&CancellationToken::new()).await.is_success());

    broker.emit("devices/abc/status", "{}");
    broker.emit("garbage", "{}");

    assert!(wait_until(|| async { received.load(Ordering::SeqCst) == 1 }).await);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_unexpected_disconnect_reconnects_and_resubscribes() {
    let broker = Arc::new(FakeBroker::new());
    let supervisor = supervisor(&broker, &[DATA_TOPIC, STATUS_TOPIC]);
    assert!(supervisor.start(&CancellationToken::new()).await.is_success());

    broker.set_accept_connections(false);
    broker.drop_connection(DisconnectReason::ConnectionLost("keep alive timeout".to_string()));

    assert!(wait_until(|| async { supervisor.state().await == ConnectionState::Reconnecting }).await);
    // a few failed attempts with the fixed backoff
    assert!(wait_until(|| async { broker.connects() >= 3 }).await);
    assert_eq!(supervisor.state().await, ConnectionState::Reconnecting);

    broker.set_accept_connections(true);

    assert!(wait_until(|| async { supervisor.state().await == ConnectionState::Connected }).await);
    assert!(wait_until(|| async { broker.subscribe_batches().len() == 2 }).await);
    assert_eq!(broker.subscribe_batches()[1], vec![DATA_TOPIC, STATUS_TOPIC]);

    // stays connected, no further attempts
    let connects = broker.connects();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(broker.connects(), connects);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_server_initiated_disconnect_reconnects() {
    let broker = Arc::new(FakeBroker::new());
    let supervisor = supervisor(&broker, &[DATA_TOPIC]);
    assert!(supervisor.start(&CancellationToken::new()).await.is_success());

    broker.drop_connection(DisconnectReason::ServerInitiated("session taken over".to_string()));

    assert!(wait_until(|| async { broker.subscribe_batches().len() == 2 }).await);
    assert_eq!(supervisor.state().await, ConnectionState::Connected);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_deliberate_disconnect_does_not_reconnect() {
    let broker = Arc::new(FakeBroker::new());
    let supervisor = supervisor(&broker, &[DATA_TOPIC]);
    assert!(supervisor.start(&CancellationToken::new()).await.is_success());

    supervisor.disconnect(&CancellationToken::new()).await;

    assert_eq!(supervisor.state().await, ConnectionState::Disconnected);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(broker.connects(), 1);
    assert_eq!(supervisor.state().await, ConnectionState::Disconnected);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_normal_disconnect_event_does_not_reconnect() {
    let broker = Arc::new(FakeBroker::new());
    let supervisor = supervisor(&broker, &[DATA_TOPIC]);
    assert!(supervisor.start(&CancellationToken::new()).await.is_success());

    broker.drop_connection(DisconnectReason::Normal);

    assert!(wait_until(|| async { supervisor.state().await == ConnectionState::Disconnected }).await);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(broker.connects(), 1);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let broker = Arc::new(FakeBroker::new());
    let supervisor = supervisor(&broker, &[DATA_TOPIC]);
    assert!(supervisor.start(&CancellationToken::new()).await.is_success());

    supervisor.shutdown().await;
    supervisor.shutdown().await;

    assert!(supervisor.is_disposed());
    assert_eq!(supervisor.state().await, ConnectionState::Disposed);
    assert_eq!(broker.disconnect_calls.load(Ordering::SeqCst), 1);
    assert_eq!(broker.close_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_disposed_supervisor_rejects_operations() {
    let broker = Arc::new(FakeBroker::new());
    let supervisor = supervisor(&broker, &[DATA_TOPIC]);
    supervisor.shutdown().await;

    let token = CancellationToken::new();
    assert_eq!(supervisor.start(&token).await.code, CODE_DISPOSED);
    assert_eq!(supervisor.connect(&token).await.code, CODE_DISPOSED);
    assert_eq!(supervisor.subscribe_all(&token).await.code, CODE_DISPOSED);
    assert_eq!(
        supervisor
            .publish("devices/a/command", &json!({}), QoS::AtLeastOnce, false, &token)
            .await
            .code,
        CODE_DISPOSED
    );
    supervisor.disconnect(&token).await;

    assert_eq!(broker.connects(), 0);
    assert_eq!(broker.disconnect_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_shutdown_cancels_reconnect_loop_promptly() {
    let broker = Arc::new(FakeBroker::new());
    let mut config = test_broker_config(&[DATA_TOPIC]);
    config.reconnect_delay_ms = 60_000;
    let supervisor = ConnectionSupervisor::new(broker.clone(), config, Arc::new(MessageDispatcher::new()));
    assert!(supervisor.start(&CancellationToken::new()).await.is_success());

    broker.drop_connection(DisconnectReason::ConnectionLost("reset by peer".to_string()));
    assert!(wait_until(|| async { supervisor.state().await == ConnectionState::Reconnecting }).await);

    tokio::time::timeout(Duration::from_secs(2), supervisor.shutdown())
        .await
        .expect("shutdown waited for the reconnect backoff");

    assert_eq!(supervisor.state().await, ConnectionState::Disposed);
    assert_eq!(broker.connects(), 1);
    // never connected at disposal time, so no disconnect
    assert_eq!(broker.disconnect_calls.load(Ordering::SeqCst), 0);
    assert_eq!(broker.close_calls.load(Ordering::SeqCst), 1);
}
