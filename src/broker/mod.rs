//! Message broker abstraction
//!
//! The supervisor only talks to the broker through the [`Broker`] trait:
//! a handshake, a batch subscribe with per-filter results, publish,
//! disconnect, and a broadcast channel of [`BrokerEvent`]s (received
//! messages and session loss).
//!
//! ## Event Flow
//!
//! ```text
//! Broker transport ──► BrokerEvent::Message ──────► supervisor ──► dispatcher
//!                  └─► BrokerEvent::Disconnected ─► supervisor ──► reconnect loop
//! ```

pub mod mqtt;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::config::{BrokerConfig, Protocol};

/// Result type alias for broker operations
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Quality-of-service level of a subscription or publish
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QoS {
    AtMostOnce,
    #[default]
    AtLeastOnce,
    ExactlyOnce,
}

/// A message received from the broker
///
/// Immutable; consumed once by the dispatcher.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }

    /// Payload as text, replacing invalid UTF-8
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Why a broker session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Deliberate, caller-initiated disconnect
    Normal,

    /// The broker closed the session
    ServerInitiated(String),

    /// Network or protocol failure
    ConnectionLost(String),
}

impl DisconnectReason {
    pub fn is_normal(&self) -> bool {
        matches!(self, DisconnectReason::Normal)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Normal => f.write_str("normal disconnection"),
            DisconnectReason::ServerInitiated(reason) => write!(f, "server disconnect: {reason}"),
            DisconnectReason::ConnectionLost(reason) => write!(f, "connection lost: {reason}"),
        }
    }
}

/// Events published by a broker implementation
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    Message(InboundMessage),
    Disconnected {
        reason: DisconnectReason,
        was_connected: bool,
    },
}

/// Outcome of subscribing a single topic filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionOutcome {
    pub topic: String,

    /// Granted QoS, or the broker's rejection reason
    pub result: Result<QoS, String>,
}

impl SubscriptionOutcome {
    pub fn granted(topic: impl Into<String>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            result: Ok(qos),
        }
    }

    pub fn rejected(topic: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            result: Err(reason.into()),
        }
    }

    pub fn is_granted(&self) -> bool {
        self.result.is_ok()
    }
}

/// Handshake parameters derived from the broker configuration
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
    pub ws_path: String,
    pub use_tls: bool,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    pub timeout: Duration,
    pub protocol_version: u8,
    pub clean_session: bool,
}

impl From<&BrokerConfig> for ConnectOptions {
    fn from(config: &BrokerConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            protocol: config.protocol,
            ws_path: config.ws_path.clone(),
            use_tls: config.use_tls,
            client_id: config.client_id.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            keep_alive: config.keep_alive(),
            timeout: config.connection_timeout(),
            protocol_version: config.protocol_version,
            clean_session: true,
        }
    }
}

impl ConnectOptions {
    /// `host:port` for logging
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Errors reported by a broker implementation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Broker rejected the handshake (bad credentials, client id, ...)
    ConnectionRefused(String),

    /// Handshake did not complete within the configured timeout
    Timeout,

    /// Network/protocol level failure
    Transport(String),

    /// Operation requires an established session
    NotConnected,
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerError::ConnectionRefused(reason) => write!(f, "connection refused: {reason}"),
            BrokerError::Timeout => f.write_str("timed out waiting for broker"),
            BrokerError::Transport(reason) => write!(f, "transport error: {reason}"),
            BrokerError::NotConnected => f.write_str("not connected to broker"),
        }
    }
}

impl std::error::Error for BrokerError {}

/// Publish/subscribe message transport
///
/// Implementations must not reconnect on their own: losing a session is
/// reported as [`BrokerEvent::Disconnected`] and recovery is driven by the
/// supervisor.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Perform the handshake
    async fn connect(&self, options: &ConnectOptions) -> BrokerResult<()>;

    /// Subscribe to all `filters` in one request
    async fn subscribe(&self, filters: &[String], qos: QoS) -> BrokerResult<Vec<SubscriptionOutcome>>;

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS, retain: bool) -> BrokerResult<()>;

    async fn disconnect(&self, reason: DisconnectReason) -> BrokerResult<()>;

    /// Register against the event stream
    fn events(&self) -> broadcast::Receiver<BrokerEvent>;

    /// Tear down the transport unconditionally
    async fn close(&self) {}
}
