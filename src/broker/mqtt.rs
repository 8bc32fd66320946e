//! MQTT broker backed by `rumqttc`
//!
//! Every `connect` builds a fresh client and spawns a task that polls its
//! event loop. The task answers the CONNACK and SUBACK waiters, forwards
//! publishes as [`BrokerEvent::Message`] and ends on the first transport
//! error after reporting [`BrokerEvent::Disconnected`]. It never reconnects
//! by itself.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet,
    SubscribeFilter, SubscribeReasonCode, Transport,
};
use tokio::sync::{Mutex, broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace, warn};

use super::{
    Broker, BrokerError, BrokerEvent, BrokerResult, ConnectOptions, DisconnectReason, InboundMessage, QoS,
    SubscriptionOutcome,
};
use crate::config::{MQTT_PROTOCOL_LEVEL, Protocol};

/// Capacity of the client request channel
const REQUEST_CHANNEL_CAPACITY: usize = 100;

/// Capacity of the broker event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// How long to wait for a SUBACK
const SUBACK_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a graceful disconnect may take before the task is aborted
const DISCONNECT_GRACE: Duration = Duration::from_secs(5);

/// `rumqttc` refuses keep-alive intervals below five seconds
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);

type SubAckWaiter = Arc<Mutex<Option<oneshot::Sender<Vec<SubscribeReasonCode>>>>>;

/// Aborts the event loop task when dropped
struct EventLoopTask(JoinHandle<()>);

impl Drop for EventLoopTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct MqttSession {
    client: AsyncClient,
    task: EventLoopTask,
}

pub struct MqttBroker {
    events: broadcast::Sender<BrokerEvent>,
    session: Mutex<Option<MqttSession>>,
    pending_suback: SubAckWaiter,
    subscribe_lock: Mutex<()>,
}

impl MqttBroker {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            events,
            session: Mutex::new(None),
            pending_suback: Arc::new(Mutex::new(None)),
            subscribe_lock: Mutex::new(()),
        }
    }

    async fn client(&self) -> BrokerResult<AsyncClient> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|session| session.client.clone())
            .ok_or(BrokerError::NotConnected)
    }
}

impl Default for MqttBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl From<QoS> for rumqttc::QoS {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

impl From<rumqttc::QoS> for QoS {
    fn from(qos: rumqttc::QoS) -> Self {
        match qos {
            rumqttc::QoS::AtMostOnce => QoS::AtMostOnce,
            rumqttc::QoS::AtLeastOnce => QoS::AtLeastOnce,
            rumqttc::QoS::ExactlyOnce => QoS::ExactlyOnce,
        }
    }
}

fn mqtt_options(options: &ConnectOptions) -> BrokerResult<MqttOptions> {
    if options.protocol_version != MQTT_PROTOCOL_LEVEL {
        return Err(BrokerError::Transport(format!(
            "unsupported protocol level {}",
            options.protocol_version
        )));
    }

    let mut mqtt_options = match options.protocol {
        Protocol::Tcp => MqttOptions::new(&options.client_id, &options.host, options.port),
        Protocol::Ws => {
            let scheme = if options.use_tls { "wss" } else { "ws" };
            let url = format!("{scheme}://{}:{}{}", options.host, options.port, options.ws_path);
            MqttOptions::new(&options.client_id, url, options.port)
        }
    };

    mqtt_options.set_keep_alive(options.keep_alive.max(MIN_KEEP_ALIVE));
    mqtt_options.set_clean_session(options.clean_session);

    if let Some(username) = &options.username {
        mqtt_options.set_credentials(username, options.password.clone().unwrap_or_default());
    }

    match (options.protocol, options.use_tls) {
        (Protocol::Tcp, false) => {}
        (Protocol::Tcp, true) => {
            mqtt_options.set_transport(Transport::tls_with_default_config());
        }
        (Protocol::Ws, false) => {
            mqtt_options.set_transport(Transport::Ws);
        }
        (Protocol::Ws, true) => {
            mqtt_options.set_transport(Transport::wss_with_default_config());
        }
    }

    Ok(mqtt_options)
}

fn connection_error(error: ConnectionError) -> BrokerError {
    match error {
        ConnectionError::ConnectionRefused(code) => BrokerError::ConnectionRefused(format!("{code:?}")),
        other => BrokerError::Transport(other.to_string()),
    }
}

/// Poll the event loop until the session ends
async fn drive_event_loop(
    mut event_loop: EventLoop,
    events: broadcast::Sender<BrokerEvent>,
    connack: oneshot::Sender<BrokerResult<()>>,
    pending_suback: SubAckWaiter,
) {
    let mut connack = Some(connack);
    let mut connected = false;

    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                let result = if ack.code == ConnectReturnCode::Success {
                    connected = true;
                    Ok(())
                } else {
                    Err(BrokerError::ConnectionRefused(format!("{:?}", ack.code)))
                };
                let refused = result.is_err();
                if let Some(tx) = connack.take() {
                    let _ = tx.send(result);
                }
                if refused {
                    return;
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                trace!("publish received on {}", publish.topic);
                let message = InboundMessage::new(publish.topic.clone(), publish.payload.to_vec());
                if events.send(BrokerEvent::Message(message)).is_err() {
                    debug!("no listener for broker events, dropping message");
                }
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                if let Some(tx) = pending_suback.lock().await.take() {
                    let _ = tx.send(ack.return_codes);
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                let _ = events.send(BrokerEvent::Disconnected {
                    reason: DisconnectReason::ServerInitiated("broker sent DISCONNECT".to_string()),
                    was_connected: connected,
                });
                return;
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                let _ = events.send(BrokerEvent::Disconnected {
                    reason: DisconnectReason::Normal,
                    was_connected: connected,
                });
                return;
            }
            Ok(_) => {}
            Err(error) => {
                if let Some(tx) = connack.take() {
                    let _ = tx.send(Err(connection_error(error)));
                    return;
                }
                let _ = events.send(BrokerEvent::Disconnected {
                    reason: DisconnectReason::ConnectionLost(error.to_string()),
                    was_connected: connected,
                });
                return;
            }
        }
    }
}

#[async_trait]
impl Broker for MqttBroker {
    #[instrument(skip_all, fields(address = %options.address(), client_id = %options.client_id))]
    async fn connect(&self, options: &ConnectOptions) -> BrokerResult<()> {
        let mqtt_options = mqtt_options(options)?;
        let mut session = self.session.lock().await;

        // drop (and abort) whatever is left of the previous session
        session.take();

        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);
        let (connack_tx, connack_rx) = oneshot::channel();

        let task = EventLoopTask(tokio::spawn(drive_event_loop(
            event_loop,
            self.events.clone(),
            connack_tx,
            self.pending_suback.clone(),
        )));

        match tokio::time::timeout(options.timeout, connack_rx).await {
            Ok(Ok(Ok(()))) => {
                info!("MQTT session established");
                *session = Some(MqttSession { client, task });
                Ok(())
            }
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(BrokerError::Transport(
                "event loop stopped before CONNACK".to_string(),
            )),
            Err(_) => Err(BrokerError::Timeout),
        }
    }

    async fn subscribe(&self, filters: &[String], qos: QoS) -> BrokerResult<Vec<SubscriptionOutcome>> {
        let client = self.client().await?;
        let _guard = self.subscribe_lock.lock().await;

        let (tx, rx) = oneshot::channel();
        *self.pending_suback.lock().await = Some(tx);

        client
            .subscribe_many(
                filters
                    .iter()
                    .map(|filter| SubscribeFilter::new(filter.clone(), qos.into())),
            )
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?;

        let codes = tokio::time::timeout(SUBACK_TIMEOUT, rx)
            .await
            .map_err(|_| BrokerError::Timeout)?
            .map_err(|_| BrokerError::Transport("event loop stopped before SUBACK".to_string()))?;

        let mut codes = codes.into_iter();
        let outcomes = filters
            .iter()
            .map(|topic| match codes.next() {
                Some(SubscribeReasonCode::Success(granted)) => {
                    SubscriptionOutcome::granted(topic.clone(), granted.into())
                }
                Some(SubscribeReasonCode::Failure) => {
                    SubscriptionOutcome::rejected(topic.clone(), "broker rejected subscription")
                }
                None => SubscriptionOutcome::rejected(topic.clone(), "missing return code in SUBACK"),
            })
            .collect();

        Ok(outcomes)
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS, retain: bool) -> BrokerResult<()> {
        self.client()
            .await?
            .publish(topic, qos.into(), retain, payload)
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))
    }

    async fn disconnect(&self, reason: DisconnectReason) -> BrokerResult<()> {
        let Some(mut session) = self.session.lock().await.take() else {
            return Err(BrokerError::NotConnected);
        };

        debug!("disconnecting MQTT session ({reason})");
        let result = session
            .client
            .disconnect()
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()));

        if tokio::time::timeout(DISCONNECT_GRACE, &mut session.task.0).await.is_err() {
            warn!("event loop did not stop within {DISCONNECT_GRACE:?}, aborting");
        }

        result
    }

    fn events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    async fn close(&self) {
        if self.session.lock().await.take().is_some() {
            debug!("MQTT transport closed");
        }
    }
}
