//! Time-series store backends
//!
//! The ingestion core persists two kinds of points: the raw status reported
//! by a device and the analysis verdict derived from it. Both go through the
//! `TimeSeriesStore` trait so the backend can be swapped.
//!
//! ## Backends
//!
//! - **In-Memory** (default): Bounded ring buffer per device series, for
//!   tests and store-less deployments
//! - **SQLite**: Embedded database with retention cleanup
//!
//! ## Usage
//!
//! ```no_run
//! use device_monitor::storage::{TimeSeriesStore, sqlite::SqliteStore};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = SqliteStore::new("./telemetry.db").await?;
//!     println!("{}", store.get_stats().await?);
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod error;
pub mod memory;
pub mod schema;
#[cfg(feature = "storage-sqlite")]
pub mod sqlite;

pub use backend::{LatestQuery, TimeSeriesStore};
pub use error::{StorageError, StorageResult};
pub use schema::{FieldValue, Point};
