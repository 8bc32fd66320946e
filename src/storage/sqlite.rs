//! SQLite time-series store
//!
//! Points are stored in a single append-only `points` table; tags and
//! fields are kept as JSON text and tag filters are evaluated with
//! `json_extract`, so new measurements need no migration.
//!
//! ## Features
//!
//! - **Embedded**: No separate database server required
//! - **WAL mode**: Reads keep working while the pipeline writes
//! - **Migrations**: Automatic schema versioning with sqlx

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info, instrument};

use super::backend::{LatestQuery, TimeSeriesStore};
use super::error::{StorageError, StorageResult};
use super::schema::Point;

/// SQLite time-series store
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    db_path: String,
}

impl SqliteStore {
    /// Open (or create) the database at `db_path` and run migrations
    ///
    /// ```no_run
    /// # use device_monitor::storage::sqlite::SqliteStore;
    /// # async fn example() -> anyhow::Result<()> {
    /// let store = SqliteStore::new("./telemetry.db").await?;
    /// # Ok(())
    /// # }
    /// ```
    #[instrument(skip_all)]
    pub async fn new(db_path: impl AsRef<Path>) -> StorageResult<Self> {
        let db_path_str = db_path.as_ref().to_string_lossy().to_string();

        info!("initializing SQLite store at: {}", db_path_str);

        let options = SqliteConnectOptions::new()
            .filename(&db_path_str)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        debug!("running database migrations");
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("database migrations complete");

        Ok(Self {
            pool,
            db_path: db_path_str,
        })
    }

    fn timestamp_to_millis(dt: &DateTime<Utc>) -> i64 {
        dt.timestamp_millis()
    }

    fn millis_to_timestamp(millis: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(millis).unwrap_or_else(Utc::now)
    }

    /// Delete points older than `before`, returning how many were removed
    #[instrument(skip(self))]
    pub async fn cleanup_before(&self, before: DateTime<Utc>) -> StorageResult<u64> {
        let result = sqlx::query("DELETE FROM points WHERE timestamp < ?")
            .bind(Self::timestamp_to_millis(&before))
            .execute(&self.pool)
            .await?;

        let deleted = result.rows_affected();
        info!("retention cleanup removed {deleted} points");
        Ok(deleted)
    }
}

#[async_trait]
impl TimeSeriesStore for SqliteStore {
    #[instrument(skip(self, point), fields(measurement = %point.measurement))]
    async fn write_point(&self, point: Point) -> StorageResult<()> {
        let tags = serde_json::to_string(&point.tags)?;
        let fields = serde_json::to_string(&point.fields)?;

        sqlx::query(
            r#"
            INSERT INTO points (measurement, timestamp, tags, fields)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&point.measurement)
        .bind(Self::timestamp_to_millis(&point.timestamp))
        .bind(tags)
        .bind(fields)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self, query), fields(measurement = %query.measurement))]
    async fn query_latest(&self, query: LatestQuery) -> StorageResult<Option<Point>> {
        let tag_clause: String = query
            .tags
            .keys()
            .map(|_| " AND json_extract(tags, ?) = ?")
            .collect();

        let sql = format!(
            r#"
            SELECT measurement, timestamp, tags, fields
            FROM points
            WHERE measurement = ? AND timestamp >= ? AND timestamp < ?{tag_clause}
            ORDER BY timestamp DESC
            LIMIT 1
            "#
        );

        let mut statement = sqlx::query(&sql)
            .bind(&query.measurement)
            .bind(Self::timestamp_to_millis(&query.start()))
            .bind(Self::timestamp_to_millis(&query.before));

        for (key, value) in &query.tags {
            statement = statement.bind(format!("$.\"{key}\"")).bind(value);
        }

        let Some(row) = statement.fetch_optional(&self.pool).await? else {
            return Ok(None);
        };

        let tags: String = row.get("tags");
        let fields: String = row.get("fields");

        Ok(Some(Point {
            measurement: row.get("measurement"),
            tags: serde_json::from_str(&tags)?,
            fields: serde_json::from_str(&fields)?,
            timestamp: Self::millis_to_timestamp(row.get("timestamp")),
        }))
    }

    async fn get_stats(&self) -> StorageResult<String> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM points")
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.get("count");

        let size_bytes = std::fs::metadata(&self.db_path)
            .map(|m| m.len())
            .unwrap_or(0);

        Ok(format!(
            "SQLite: {} rows, {:.2}MB on disk",
            count,
            size_bytes as f64 / (1024.0 * 1024.0)
        ))
    }

    async fn close(&self) -> StorageResult<()> {
        info!("closing SQLite store");
        self.pool.close().await;
        Ok(())
    }
}
