use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use tracing::trace;

/// MQTT 3.1.1, the only protocol level the broker adapter speaks
pub const MQTT_PROTOCOL_LEVEL: u8 = 4;

/// One year
pub const MAX_HEARTBEAT_LOOKBACK_HOURS: i64 = 24 * 365;

/// Top-level service configuration
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct Config {
    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub analysis: AnalysisConfig,

    /// Storage configuration (defaults to in-memory)
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub notifications: NotificationConfig,
}

impl Config {
    /// Check the threshold invariants
    pub fn validate(&self) -> anyhow::Result<()> {
        self.analysis.battery.validate("battery")?;
        self.analysis.signal.validate("signal")?;
        self.analysis.heartbeat.validate()?;

        if !(1..=MAX_HEARTBEAT_LOOKBACK_HOURS).contains(&self.analysis.heartbeat_lookback_hours) {
            anyhow::bail!(
                "analysis.heartbeat_lookback_hours must be between 1 and {MAX_HEARTBEAT_LOOKBACK_HOURS}, got {}",
                self.analysis.heartbeat_lookback_hours
            );
        }

        if self.broker.protocol_version != MQTT_PROTOCOL_LEVEL {
            anyhow::bail!(
                "broker.protocol_version {} is not supported, only {MQTT_PROTOCOL_LEVEL} (MQTT 3.1.1)",
                self.broker.protocol_version
            );
        }

        if self.broker.subscribe_topics.is_empty() {
            anyhow::bail!("broker.subscribe_topics must not be empty");
        }

        Ok(())
    }
}

/// Transport used to reach the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Ws,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_host")]
    pub host: String,

    #[serde(default = "default_broker_port")]
    pub port: u16,

    #[serde(default)]
    pub protocol: Protocol,

    /// Path of the websocket endpoint (only used with `ws`)
    #[serde(default = "default_ws_path")]
    pub ws_path: String,

    #[serde(default)]
    pub use_tls: bool,

    #[serde(default = "default_client_id")]
    pub client_id: String,

    pub username: Option<String>,
    pub password: Option<String>,

    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,

    #[serde(default = "default_connection_timeout_secs")]
    pub connection_timeout_secs: u64,

    /// MQTT protocol level (4 = v3.1.1)
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u8,

    #[serde(default = "default_subscribe_topics")]
    pub subscribe_topics: Vec<String>,

    /// Template of the per-device command topic
    #[serde(default = "default_command_topic")]
    pub command_topic: String,

    /// Fixed backoff between reconnect attempts
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

impl BrokerConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_broker_host(),
            port: default_broker_port(),
            protocol: Protocol::default(),
            ws_path: default_ws_path(),
            use_tls: false,
            client_id: default_client_id(),
            username: None,
            password: None,
            keep_alive_secs: default_keep_alive_secs(),
            connection_timeout_secs: default_connection_timeout_secs(),
            protocol_version: default_protocol_version(),
            subscribe_topics: default_subscribe_topics(),
            command_topic: default_command_topic(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
        }
    }
}

fn default_broker_host() -> String {
    "localhost".to_string()
}

fn default_broker_port() -> u16 {
    1883
}

fn default_ws_path() -> String {
    "/mqtt".to_string()
}

fn default_client_id() -> String {
    "iot-monitor-client".to_string()
}

fn default_keep_alive_secs() -> u64 {
    60
}

fn default_connection_timeout_secs() -> u64 {
    10
}

fn default_protocol_version() -> u8 {
    MQTT_PROTOCOL_LEVEL
}

fn default_subscribe_topics() -> Vec<String> {
    vec!["devices/+/data".to_string()]
}

fn default_command_topic() -> String {
    "devices/{deviceId}/command".to_string()
}

fn default_reconnect_delay_ms() -> u64 {
    5_000
}

/// Warning/critical boundaries for a "lower is worse" metric
#[derive(Debug, Clone, Copy, PartialEq, serde::Deserialize)]
pub struct LevelThresholds {
    pub warning_level: f64,
    pub critical_level: f64,
}

impl LevelThresholds {
    fn validate(&self, name: &str) -> anyhow::Result<()> {
        if self.critical_level > self.warning_level {
            anyhow::bail!(
                "{name}: critical level ({}) must not exceed warning level ({})",
                self.critical_level,
                self.warning_level
            );
        }
        Ok(())
    }
}

/// Staleness boundaries for the heartbeat, in minutes
#[derive(Debug, Clone, Copy, PartialEq, serde::Deserialize)]
pub struct HeartbeatThresholds {
    pub warning_minutes: f64,
    pub critical_minutes: f64,
}

impl HeartbeatThresholds {
    fn validate(&self) -> anyhow::Result<()> {
        if self.critical_minutes < self.warning_minutes {
            anyhow::bail!(
                "heartbeat: critical minutes ({}) must not be below warning minutes ({})",
                self.critical_minutes,
                self.warning_minutes
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct AnalysisConfig {
    #[serde(default = "default_battery_thresholds")]
    pub battery: LevelThresholds,

    #[serde(default = "default_signal_thresholds")]
    pub signal: LevelThresholds,

    #[serde(default = "default_heartbeat_thresholds")]
    pub heartbeat: HeartbeatThresholds,

    /// How far back the heartbeat lookup searches
    #[serde(default = "default_heartbeat_lookback_hours")]
    pub heartbeat_lookback_hours: i64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            battery: default_battery_thresholds(),
            signal: default_signal_thresholds(),
            heartbeat: default_heartbeat_thresholds(),
            heartbeat_lookback_hours: default_heartbeat_lookback_hours(),
        }
    }
}

fn default_battery_thresholds() -> LevelThresholds {
    LevelThresholds {
        warning_level: 20.0,
        critical_level: 10.0,
    }
}

fn default_signal_thresholds() -> LevelThresholds {
    LevelThresholds {
        warning_level: 30.0,
        critical_level: 15.0,
    }
}

fn default_heartbeat_thresholds() -> HeartbeatThresholds {
    HeartbeatThresholds {
        warning_minutes: 5.0,
        critical_minutes: 15.0,
    }
}

fn default_heartbeat_lookback_hours() -> i64 {
    24
}

/// Storage backend configuration
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory store (no persistence)
    #[default]
    Memory,

    /// SQLite database
    Sqlite {
        #[serde(default = "default_sqlite_path")]
        path: PathBuf,

        /// Points older than this are deleted
        #[serde(default = "default_retention_days")]
        retention_days: u32,
    },
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("./telemetry.db")
}

fn default_retention_days() -> u32 {
    30
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct NotificationConfig {
    pub email: Option<Email>,
    pub webhook: Option<Webhook>,
    pub discord: Option<Discord>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Email {
    #[serde(default = "default_smtp_server")]
    pub smtp_server: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default = "default_true")]
    pub use_tls: bool,
    #[serde(default = "default_sender_name")]
    pub sender_name: String,
    pub sender_email: String,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default)]
    pub recipients: Vec<String>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Webhook {
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Discord {
    pub url: String,
    pub user_id: Option<String>,
}

fn default_smtp_server() -> String {
    "smtp.gmail.com".to_string()
}

fn default_smtp_port() -> u16 {
    587
}

fn default_sender_name() -> String {
    "IoT Monitor".to_string()
}

fn default_true() -> bool {
    true
}

pub fn read_config_file(path: &str) -> anyhow::Result<Config> {
    let file_content = std::fs::read_to_string(path)?;
    parse_config(&file_content)
}

pub fn parse_config(content: &str) -> anyhow::Result<Config> {
    let config: Config = serde_json::from_str(content)
        .map_err(|e| anyhow::anyhow!("Invalid configuration file provided: {e}"))?;
    config.validate()?;
    trace!("loaded config: {config:?}");
    Ok(config)
}
