//! Broker connection supervisor
//!
//! Owns the broker session and its lifecycle:
//!
//! ```text
//! Disconnected ──connect──► Connecting ──ok──► Connected
//!      ▲                        │                  │
//!      └────────failed──────────┘                  │ unexpected disconnect
//!                                                  ▼
//!                     Connected ◄──ok── Reconnecting (fixed backoff, forever)
//!
//! any state ──shutdown──► Disposed
//! ```
//!
//! The session is only read or mutated while holding the connect guard, so an
//! explicit `connect` and the reconnect loop never run concurrently. Every
//! operation reports a [`ServiceResult`]; transport errors never escape as
//! panics or errors.
//!
//! The event pump only routes. Disconnects are handled on the pump itself,
//! messages go to one bounded queue per topic whose worker runs the
//! dispatcher, so a slow handler delays its own topic and nothing else.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::broker::{Broker, BrokerEvent, ConnectOptions, DisconnectReason, InboundMessage, QoS};
use crate::config::BrokerConfig;
use crate::dispatcher::MessageDispatcher;
use crate::topic::render;

/// Operation succeeded
pub const CODE_SUCCESS: i32 = 0;

/// Supervisor has been disposed
pub const CODE_DISPOSED: i32 = -1;

/// Another connect attempt holds the connect guard
pub const CODE_CONNECT_IN_PROGRESS: i32 = 409;

/// Operation was cancelled
pub const CODE_CANCELLED: i32 = 499;

/// Transport, subscription or serialization failure
pub const CODE_FAILURE: i32 = 500;

/// How long shutdown waits for in-flight work before forcing the transport closed
const DISPOSE_GRACE: Duration = Duration::from_secs(5);

/// Slack on top of the broker's own handshake timeout
const CONNECT_GRACE: Duration = Duration::from_secs(1);

/// Messages buffered per topic before new ones are dropped
const LANE_CAPACITY: usize = 256;

/// A topic worker with no traffic for this long shuts down
const LANE_IDLE: Duration = Duration::from_secs(60);

/// Outcome of a supervisor operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceResult {
    pub code: i32,
    pub message: String,
}

impl ServiceResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            code: CODE_SUCCESS,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            code: CODE_FAILURE,
            message: message.into(),
        }
    }

    pub fn disposed() -> Self {
        Self {
            code: CODE_DISPOSED,
            message: "Broker supervisor has been disposed".to_string(),
        }
    }

    pub fn connect_in_progress() -> Self {
        Self {
            code: CODE_CONNECT_IN_PROGRESS,
            message: "Connection attempt already in progress".to_string(),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            code: CODE_CANCELLED,
            message: "Operation was cancelled".to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == CODE_SUCCESS
    }
}

impl fmt::Display for ServiceResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Disposed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Disposed => "disposed",
        };
        f.write_str(name)
    }
}

/// Broker session owned by the supervisor
#[derive(Debug, Clone)]
pub struct Session {
    pub state: ConnectionState,
    pub broker_address: String,
    pub client_id: String,
    pub keep_alive: Duration,
    pub protocol_version: u8,

    /// Topic filters granted by the broker in the current session
    pub subscriptions: Vec<String>,
}

impl Session {
    fn new(config: &BrokerConfig) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            broker_address: format!("{}:{}", config.host, config.port),
            client_id: config.client_id.clone(),
            keep_alive: config.keep_alive(),
            protocol_version: config.protocol_version,
            subscriptions: Vec::new(),
        }
    }
}

struct Inner {
    broker: Arc<dyn Broker>,
    config: BrokerConfig,
    dispatcher: Arc<MessageDispatcher>,

    /// Connect guard; the only way to reach the session
    session: Mutex<Session>,

    /// Set while a handshake with the broker is running
    connecting: AtomicBool,

    /// Per-topic delivery queues feeding the dispatcher
    lanes: std::sync::Mutex<HashMap<String, mpsc::Sender<InboundMessage>>>,

    disposed: AtomicBool,
    shutdown: CancellationToken,

    /// Token of the running reconnect loop, cancelled once the loop ends
    reconnect: std::sync::Mutex<Option<CancellationToken>>,

    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

/// Supervises the broker session and feeds received messages to the dispatcher
pub struct ConnectionSupervisor {
    inner: Arc<Inner>,
}

impl ConnectionSupervisor {
    /// Create the supervisor and start pumping broker events
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(broker: Arc<dyn Broker>, config: BrokerConfig, dispatcher: Arc<MessageDispatcher>) -> Self {
        let events = broker.events();
        let inner = Arc::new(Inner {
            session: Mutex::new(Session::new(&config)),
            connecting: AtomicBool::new(false),
            lanes: std::sync::Mutex::new(HashMap::new()),
            broker,
            config,
            dispatcher,
            disposed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            reconnect: std::sync::Mutex::new(None),
            tasks: std::sync::Mutex::new(Vec::new()),
        });

        let pump = tokio::spawn(Inner::pump_events(inner.clone(), events));
        inner.track(pump);

        Self { inner }
    }

    /// Connect and subscribe to every configured topic
    #[instrument(skip_all)]
    pub async fn start(&self, cancellation: &CancellationToken) -> ServiceResult {
        if self.inner.is_disposed() {
            warn!("start requested on a disposed supervisor");
            return ServiceResult::disposed();
        }

        info!("Starting broker supervisor...");

        let result = self.inner.connect(cancellation).await;
        if !result.is_success() {
            error!("Failed to connect during startup: {}", result.message);
            return result;
        }

        self.inner.subscribe_all(cancellation).await
    }

    pub async fn connect(&self, cancellation: &CancellationToken) -> ServiceResult {
        self.inner.connect(cancellation).await
    }

    /// Subscribe to every configured topic with at-least-once delivery
    ///
    /// Succeeds only when every filter was granted. Granted filters stay
    /// subscribed even if others were rejected.
    pub async fn subscribe_all(&self, cancellation: &CancellationToken) -> ServiceResult {
        self.inner.subscribe_all(cancellation).await
    }

    /// Serialize `payload` to JSON and publish it, connecting first if needed
    #[instrument(skip(self, payload, cancellation))]
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        topic: &str,
        payload: &T,
        qos: QoS,
        retain: bool,
        cancellation: &CancellationToken,
    ) -> ServiceResult {
        if self.inner.is_disposed() {
            return ServiceResult::disposed();
        }

        let bytes = match serde_json::to_vec(payload) {
            Ok(bytes) => bytes,
            Err(e) => return ServiceResult::failed(format!("Failed to serialize payload: {e}")),
        };

        {
            let mut session = tokio::select! {
                _ = cancellation.cancelled() => return ServiceResult::cancelled(),
                session = self.inner.session.lock() => session,
            };

            let connected = self.inner.handshake(&mut session, cancellation).await;
            if !connected.is_success() {
                return connected;
            }
        }

        let result = tokio::select! {
            _ = cancellation.cancelled() => return ServiceResult::cancelled(),
            _ = self.inner.shutdown.cancelled() => return ServiceResult::cancelled(),
            result = self.inner.broker.publish(topic, bytes, qos, retain) => result,
        };

        match result {
            Ok(()) => {
                info!("Published message to topic: {topic}");
                ServiceResult::ok(format!("Message published to {topic}"))
            }
            Err(e) => {
                error!("Failed to publish message to topic {topic}: {e}");
                ServiceResult::failed(format!("Failed to publish message: {e}"))
            }
        }
    }

    /// Publish `payload` on the command topic of `device_id`
    pub async fn publish_command<T: Serialize + ?Sized>(
        &self,
        device_id: &str,
        payload: &T,
        cancellation: &CancellationToken,
    ) -> ServiceResult {
        let topic = render(&self.inner.config.command_topic, device_id);
        self.publish(&topic, payload, QoS::AtLeastOnce, false, cancellation)
            .await
    }

    /// Gracefully end the session without triggering a reconnect
    ///
    /// Failures are logged, never returned.
    #[instrument(skip_all)]
    pub async fn disconnect(&self, cancellation: &CancellationToken) {
        if self.inner.is_disposed() {
            debug!("disconnect requested on a disposed supervisor");
            return;
        }

        self.inner.stop_reconnect_loop();

        let mut session = tokio::select! {
            _ = cancellation.cancelled() => {
                warn!("disconnect cancelled while waiting for the connect guard");
                return;
            }
            session = self.inner.session.lock() => session,
        };

        if session.state != ConnectionState::Connected {
            debug!("Client is not connected ({}), nothing to disconnect", session.state);
            if session.state == ConnectionState::Reconnecting {
                session.state = ConnectionState::Disconnected;
            }
            return;
        }

        info!("Disconnecting from broker...");
        match tokio::time::timeout(DISPOSE_GRACE, self.inner.broker.disconnect(DisconnectReason::Normal)).await {
            Ok(Ok(())) => info!("Disconnected from broker"),
            Ok(Err(e)) => error!("Error disconnecting from broker: {e}"),
            Err(_) => warn!("Timed out disconnecting from broker"),
        }

        session.state = ConnectionState::Disconnected;
        session.subscriptions.clear();
    }

    /// Dispose the supervisor
    ///
    /// Cancels the reconnect loop and pending operations, disconnects within a
    /// bounded grace period and closes the transport. Idempotent.
    #[instrument(skip_all)]
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.disposed.swap(true, Ordering::SeqCst) {
            debug!("Broker supervisor already disposed");
            return;
        }

        info!("Disposing broker supervisor...");
        inner.shutdown.cancel();

        match tokio::time::timeout(DISPOSE_GRACE, inner.session.lock()).await {
            Ok(mut session) => {
                if session.state == ConnectionState::Connected {
                    info!("Disconnecting from broker during disposal...");
                    match tokio::time::timeout(DISPOSE_GRACE, inner.broker.disconnect(DisconnectReason::Normal)).await
                    {
                        Ok(Ok(())) => info!("Disconnected from broker during disposal"),
                        Ok(Err(e)) => error!("Error disconnecting during disposal: {e}"),
                        Err(_) => warn!("Timed out disconnecting during disposal"),
                    }
                } else {
                    debug!("Client already disconnected during disposal ({})", session.state);
                }
                session.state = ConnectionState::Disposed;
                session.subscriptions.clear();
            }
            Err(_) => error!("Timed out waiting for the connect guard during disposal, forcing close"),
        }

        inner.broker.close().await;

        let tasks: Vec<JoinHandle<()>> = inner.tasks.lock().map(|mut t| t.drain(..).collect()).unwrap_or_default();
        for mut task in tasks {
            if tokio::time::timeout(DISPOSE_GRACE, &mut task).await.is_err() {
                warn!("background task did not stop within {DISPOSE_GRACE:?}, aborting");
                task.abort();
            }
        }

        info!("Broker supervisor disposed");
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.session.lock().await.state
    }

    /// Snapshot of the current session
    pub async fn session(&self) -> Session {
        self.inner.session.lock().await.clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }
}

impl Drop for ConnectionSupervisor {
    fn drop(&mut self) {
        if !self.inner.is_disposed() {
            warn!("Broker supervisor dropped without shutdown, cancelling background tasks");
            self.inner.shutdown.cancel();
        }
    }
}

/// Marks a handshake as running for as long as it is alive
struct ConnectInFlight<'a>(&'a AtomicBool);

impl<'a> ConnectInFlight<'a> {
    fn enter(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for ConnectInFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Inner {
    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn track(&self, task: JoinHandle<()>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.retain(|t| !t.is_finished());
            tasks.push(task);
        }
    }

    async fn connect(&self, cancellation: &CancellationToken) -> ServiceResult {
        if self.is_disposed() {
            return ServiceResult::disposed();
        }

        if self.connecting.load(Ordering::SeqCst) {
            debug!("connect requested while a handshake is running");
            return ServiceResult::connect_in_progress();
        }

        let mut session = tokio::select! {
            _ = cancellation.cancelled() => return ServiceResult::cancelled(),
            session = self.session.lock() => session,
        };

        self.handshake(&mut session, cancellation).await
    }

    /// Connect unless the session is already up; caller holds the guard
    async fn handshake(&self, session: &mut Session, cancellation: &CancellationToken) -> ServiceResult {
        match session.state {
            ConnectionState::Disposed => return ServiceResult::disposed(),
            ConnectionState::Connected => return ServiceResult::ok("Already connected to broker"),
            _ => {}
        }

        let fallback = if session.state == ConnectionState::Reconnecting {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Disconnected
        };

        let _in_flight = ConnectInFlight::enter(&self.connecting);

        let options = ConnectOptions::from(&self.config);
        info!(
            "Connecting to broker at {} as {}",
            session.broker_address, session.client_id
        );
        session.state = ConnectionState::Connecting;

        let attempt = tokio::time::timeout(options.timeout + CONNECT_GRACE, self.broker.connect(&options));
        let outcome = tokio::select! {
            _ = cancellation.cancelled() => None,
            _ = self.shutdown.cancelled() => None,
            outcome = attempt => Some(outcome),
        };

        match outcome {
            Some(Ok(Ok(()))) => {
                session.state = ConnectionState::Connected;
                session.subscriptions.clear();
                info!("Connected to broker at {}", session.broker_address);
                ServiceResult::ok("Connected to broker successfully")
            }
            Some(Ok(Err(e))) => {
                session.state = fallback;
                error!("Failed to connect to broker: {e}");
                ServiceResult::failed(format!("Failed to connect to broker: {e}"))
            }
            Some(Err(_)) => {
                session.state = fallback;
                error!("Timed out connecting to broker after {:?}", options.timeout);
                ServiceResult::failed("Timed out connecting to broker")
            }
            None => {
                session.state = fallback;
                info!("Connect attempt cancelled");
                ServiceResult::cancelled()
            }
        }
    }

    async fn subscribe_all(&self, cancellation: &CancellationToken) -> ServiceResult {
        if self.is_disposed() {
            return ServiceResult::disposed();
        }

        let mut session = tokio::select! {
            _ = cancellation.cancelled() => return ServiceResult::cancelled(),
            session = self.session.lock() => session,
        };

        let connected = self.handshake(&mut session, cancellation).await;
        if !connected.is_success() {
            return connected;
        }

        let topics = &self.config.subscribe_topics;
        for topic in topics {
            info!("Subscribing to topic: {topic}");
        }

        let result = tokio::select! {
            _ = cancellation.cancelled() => return ServiceResult::cancelled(),
            _ = self.shutdown.cancelled() => return ServiceResult::cancelled(),
            result = self.broker.subscribe(topics, QoS::AtLeastOnce) => result,
        };

        let outcomes = match result {
            Ok(outcomes) => outcomes,
            Err(e) => {
                error!("Failed to subscribe to topics: {e}");
                return ServiceResult::failed(format!("Failed to subscribe to topics: {e}"));
            }
        };

        let mut all_granted = outcomes.len() == topics.len();
        for outcome in outcomes {
            match &outcome.result {
                Ok(qos) => {
                    info!("Subscribed to topic {} with {:?}", outcome.topic, qos);
                    if !session.subscriptions.contains(&outcome.topic) {
                        session.subscriptions.push(outcome.topic);
                    }
                }
                Err(reason) => {
                    warn!("Failed to subscribe to topic {}: {reason}", outcome.topic);
                    all_granted = false;
                }
            }
        }

        if all_granted {
            ServiceResult::ok("Successfully subscribed to all topics")
        } else {
            ServiceResult::failed("Failed to subscribe to one or more topics")
        }
    }

    /// Forward broker events until shutdown
    async fn pump_events(inner: Arc<Inner>, mut events: broadcast::Receiver<BrokerEvent>) {
        loop {
            let event = tokio::select! {
                _ = inner.shutdown.cancelled() => break,
                event = events.recv() => event,
            };

            match event {
                Ok(BrokerEvent::Message(message)) => Inner::enqueue(&inner, message),
                Ok(BrokerEvent::Disconnected { reason, was_connected }) => {
                    Inner::handle_disconnect(&inner, reason, was_connected).await;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("broker event pump lagged, {skipped} events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    warn!("broker event stream closed");
                    break;
                }
            }
        }

        debug!("broker event pump stopped");
    }

    /// Hand `message` to the worker of its topic, starting one if needed
    fn enqueue(inner: &Arc<Inner>, message: InboundMessage) {
        let mut lanes = inner.lanes.lock().unwrap_or_else(PoisonError::into_inner);

        let mut message = message;
        if let Some(lane) = lanes.get(&message.topic) {
            match lane.try_send(message) {
                Ok(()) => return,
                Err(mpsc::error::TrySendError::Full(dropped)) => {
                    warn!("delivery queue for topic {} is full, dropping message", dropped.topic);
                    return;
                }
                // worker went idle; start a new one
                Err(mpsc::error::TrySendError::Closed(returned)) => message = returned,
            }
        }

        let topic = message.topic.clone();
        let (lane, queue) = mpsc::channel(LANE_CAPACITY);
        if lane.try_send(message).is_err() {
            return;
        }
        lanes.insert(topic.clone(), lane);
        drop(lanes);

        debug!("starting delivery worker for topic {topic}");
        let task = tokio::spawn(Inner::drain_lane(inner.clone(), topic, queue));
        inner.track(task);
    }

    /// Dispatch the messages of one topic in arrival order
    async fn drain_lane(inner: Arc<Inner>, topic: String, mut queue: mpsc::Receiver<InboundMessage>) {
        loop {
            let next = tokio::select! {
                _ = inner.shutdown.cancelled() => break,
                next = tokio::time::timeout(LANE_IDLE, queue.recv()) => next,
            };

            match next {
                Ok(Some(message)) => {
                    if !inner.deliver(message).await {
                        break;
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    queue.close();
                    while let Ok(message) = queue.try_recv() {
                        if !inner.deliver(message).await {
                            break;
                        }
                    }
                    break;
                }
            }
        }

        queue.close();
        let mut lanes = inner.lanes.lock().unwrap_or_else(PoisonError::into_inner);
        if lanes.get(&topic).is_some_and(|lane| lane.is_closed()) {
            lanes.remove(&topic);
        }
        debug!("delivery worker for topic {topic} stopped");
    }

    /// Run the dispatcher unless shutdown wins; false once shut down
    async fn deliver(&self, message: InboundMessage) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = self.dispatcher.dispatch(message) => true,
        }
    }

    async fn handle_disconnect(inner: &Arc<Inner>, reason: DisconnectReason, was_connected: bool) {
        if inner.is_disposed() {
            debug!("Disconnected after disposal ({reason})");
            return;
        }

        let mut session = inner.session.lock().await;
        if reason.is_normal() {
            info!("Disconnected from broker ({reason}), reconnection not attempted");
            if session.state == ConnectionState::Connected {
                session.state = ConnectionState::Disconnected;
            }
            return;
        }

        warn!("Disconnected from broker ({reason}), was connected: {was_connected}");
        session.state = ConnectionState::Reconnecting;
        session.subscriptions.clear();
        drop(session);

        Inner::spawn_reconnect_loop(inner);
    }

    fn spawn_reconnect_loop(inner: &Arc<Inner>) {
        let Ok(mut slot) = inner.reconnect.lock() else {
            return;
        };

        if slot.as_ref().is_some_and(|token| !token.is_cancelled()) {
            debug!("reconnect loop already running");
            return;
        }

        let token = inner.shutdown.child_token();
        *slot = Some(token.clone());
        drop(slot);

        let task = tokio::spawn(Inner::reconnect_loop(inner.clone(), token));
        inner.track(task);
    }

    fn stop_reconnect_loop(&self) {
        if let Ok(slot) = self.reconnect.lock() {
            if let Some(token) = slot.as_ref() {
                token.cancel();
            }
        }
    }

    /// Retry with a fixed backoff until connected and resubscribed, or cancelled
    async fn reconnect_loop(inner: Arc<Inner>, token: CancellationToken) {
        let delay = inner.config.reconnect_delay();
        let mut attempt: u64 = 0;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Reconnection loop cancelled");
                    break;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            attempt += 1;
            info!("Attempting to reconnect (attempt {attempt})...");

            let result = inner.subscribe_all(&token).await;
            match result.code {
                CODE_SUCCESS => {
                    info!("Reconnected and resubscribed after {attempt} attempt(s)");
                    break;
                }
                CODE_DISPOSED | CODE_CANCELLED => {
                    info!("Reconnection loop stopped: {}", result.message);
                    break;
                }
                _ => {
                    let connected = inner.session.lock().await.state == ConnectionState::Connected;
                    if connected {
                        warn!("Reconnected but resubscription was incomplete: {}", result.message);
                        break;
                    }
                    warn!("Reconnect attempt {attempt} failed: {}, retrying in {delay:?}", result.message);
                }
            }
        }

        token.cancel();

        // a disconnect that raced with the end of this loop
        if !inner.is_disposed() && inner.session.lock().await.state == ConnectionState::Reconnecting {
            Inner::spawn_reconnect_loop(&inner);
        }
    }
}
