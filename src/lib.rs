//! Device telemetry monitor
//!
//! Subscribes to device telemetry on an MQTT broker, analyses every message
//! against battery, signal, heartbeat and location checks, persists raw
//! status and verdicts in a time-series store and raises alerts for
//! unhealthy devices.
//!
//! ```text
//! Broker ──► ConnectionSupervisor ──► MessageDispatcher ──► observers
//!                                             │
//!                                             └─► IngestionPipeline ──► AnalysisEngine
//!                                                         │                    │
//!                                                         ▼                    ▼
//!                                                  TimeSeriesStore ◄── AlertManager ──► Notifier
//! ```

pub mod alerts;
pub mod analysis;
pub mod broker;
pub mod config;
pub mod dispatcher;
pub mod notifications;
pub mod pipeline;
pub mod storage;
pub mod supervisor;
pub mod topic;
pub mod util;

pub use broker::InboundMessage;
pub use supervisor::{ConnectionState, ConnectionSupervisor, ServiceResult};
