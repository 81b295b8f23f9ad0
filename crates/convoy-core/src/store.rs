//! Shared coordination store.
//!
//! One `SQLite` database holds every mutable coordination record. Independent
//! processes open the same file; all exclusivity comes from primary keys and
//! compare-and-set updates inside transactions whose first statement is a write,
//! so `SQLite` takes the write lock up front instead of upgrading mid-transaction.
//!
//! Timestamps are stored as INTEGER unix milliseconds.

use std::{path::Path, str::FromStr, time::Duration as StdDuration};

use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    Sqlite, SqlitePool, Transaction,
};
use tracing::debug;

use crate::{Error, Result};

const CURRENT_SCHEMA_VERSION: i64 = 1;

/// Database schema as SQL string - executed once on open
const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY
);

CREATE TABLE IF NOT EXISTS events (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp INTEGER NOT NULL,
    source TEXT NOT NULL,
    event_type TEXT NOT NULL,
    payload TEXT NOT NULL,
    correlation_id TEXT,
    priority TEXT NOT NULL DEFAULT 'normal'
);

CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type, seq);
CREATE INDEX IF NOT EXISTS idx_events_correlation ON events(correlation_id);

CREATE TABLE IF NOT EXISTS subscriptions (
    subscriber_id TEXT PRIMARY KEY,
    filter TEXT NOT NULL,
    last_acked_seq INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS locks (
    resource_key TEXT PRIMARY KEY,
    holder TEXT NOT NULL,
    context TEXT,
    reason TEXT,
    acquired_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    ttl_ms INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_locks_holder ON locks(holder);
CREATE INDEX IF NOT EXISTS idx_locks_expires ON locks(expires_at);

CREATE TABLE IF NOT EXISTS lock_requests (
    waiter TEXT NOT NULL,
    resource_key TEXT NOT NULL,
    holder_at_denial TEXT NOT NULL,
    recorded_at INTEGER NOT NULL,
    PRIMARY KEY (waiter, resource_key)
);

CREATE TABLE IF NOT EXISTS participant_priorities (
    owner TEXT PRIMARY KEY,
    priority INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS deadlock_resolutions (
    cycle_key TEXT PRIMARY KEY,
    victim TEXT NOT NULL,
    emitted_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS checkpoints (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    owner TEXT NOT NULL,
    label TEXT NOT NULL,
    snapshot_ref TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    active INTEGER NOT NULL DEFAULT 1,
    deactivated_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_checkpoints_owner ON checkpoints(owner, active, seq);

CREATE TABLE IF NOT EXISTS passing_records (
    work_item_id TEXT PRIMARY KEY,
    commit_id TEXT NOT NULL,
    owner TEXT NOT NULL,
    recorded_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS work_dependencies (
    work_item_id TEXT NOT NULL,
    depends_on TEXT NOT NULL,
    PRIMARY KEY (work_item_id, depends_on)
);

CREATE TABLE IF NOT EXISTS regressions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    work_item_id TEXT NOT NULL,
    blamed_test TEXT NOT NULL,
    blamed_loop TEXT,
    passing_commit TEXT NOT NULL,
    failing_commit TEXT NOT NULL,
    suspects TEXT NOT NULL,
    auto_rolled_back INTEGER NOT NULL DEFAULT 0,
    detected_at INTEGER NOT NULL,
    UNIQUE (blamed_test, passing_commit, failing_commit)
);

CREATE TABLE IF NOT EXISTS component_health (
    component TEXT PRIMARY KEY,
    pid INTEGER,
    last_heartbeat INTEGER NOT NULL,
    announced_status TEXT NOT NULL CHECK(announced_status IN ('healthy', 'degraded', 'dead')),
    started_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS decisions (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    summary TEXT NOT NULL,
    options TEXT NOT NULL,
    default_option TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    timeout_at INTEGER NOT NULL,
    status TEXT NOT NULL CHECK(status IN ('pending', 'resolved', 'timed_out')),
    chosen_option TEXT,
    resolved_by TEXT,
    resolved_at INTEGER,
    correlation_id TEXT,
    source_seq INTEGER UNIQUE
);

CREATE INDEX IF NOT EXISTS idx_decisions_status ON decisions(status, timeout_at);

CREATE TABLE IF NOT EXISTS paused_owners (
    owner TEXT PRIMARY KEY,
    blocked_on TEXT,
    resource_key TEXT,
    reason TEXT NOT NULL,
    paused_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS stuck_reports (
    owner TEXT NOT NULL,
    work_item_id TEXT NOT NULL,
    count INTEGER NOT NULL,
    last_at INTEGER NOT NULL,
    PRIMARY KEY (owner, work_item_id)
);

CREATE TABLE IF NOT EXISTS victim_counts (
    owner TEXT PRIMARY KEY,
    count INTEGER NOT NULL,
    last_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS coordinator_failures (
    seq INTEGER PRIMARY KEY,
    attempts INTEGER NOT NULL,
    last_error TEXT NOT NULL,
    last_at INTEGER NOT NULL
);
";

/// Handle to the shared coordination database.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if needed) the store at `path`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the parent directory cannot be created and
    /// `Error::StoreUnavailable` if the database cannot be opened or initialised.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    Error::Io(format!("Failed to create {}: {e}", parent.display()))
                })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(StdDuration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .acquire_timeout(StdDuration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(|e| {
                Error::StoreUnavailable(format!("Failed to open {}: {e}", path.display()))
            })?;

        let store = Self { pool };
        store.init_schema().await?;
        debug!(path = %path.display(), "Opened coordination store");
        Ok(store)
    }

    /// Open a private in-memory store.
    ///
    /// Backed by a single connection, so callers must not touch the pool while
    /// holding a transaction.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Get the database pool
    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Begin a transaction. The first statement executed should be a write.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        self.pool.begin().await.map_err(Error::from)
    }

    /// Close every pooled connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::StoreUnavailable(format!("Failed to initialize schema: {e}")))?;

        sqlx::query("INSERT OR IGNORE INTO schema_version (version) VALUES (?)")
            .bind(CURRENT_SCHEMA_VERSION)
            .execute(&self.pool)
            .await?;

        let version: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
            .fetch_one(&self.pool)
            .await?;

        match version {
            Some(v) if v > CURRENT_SCHEMA_VERSION => Err(Error::StoreUnavailable(format!(
                "Store schema version {v} is newer than supported version {CURRENT_SCHEMA_VERSION}"
            ))),
            _ => Ok(()),
        }
    }
}

/// Current time as unix milliseconds.
pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Convert stored unix milliseconds back to a timestamp.
pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| Error::Parse(format!("Timestamp out of range: {ms}")))
}

/// Serialize a duration as whole milliseconds.
pub(crate) fn serialize_millis<S: serde::Serializer>(
    duration: &chrono::Duration,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_i64(duration.num_milliseconds())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_store_initialises_schema() -> Result<()> {
        let store = Store::in_memory().await?;
        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(store.pool())
        .await?;
        for expected in ["events", "locks", "lock_requests", "checkpoints", "decisions"] {
            assert!(tables.iter().any(|t| t == expected), "missing table {expected}");
        }
        Ok(())
    }

    #[tokio::test]
    async fn reopening_file_store_is_idempotent() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested/coordination.db");

        let first = Store::open(&path).await?;
        sqlx::query("INSERT INTO participant_priorities (owner, priority, updated_at) VALUES ('loop-1', 2, 0)")
            .execute(first.pool())
            .await?;
        first.close().await;

        let second = Store::open(&path).await?;
        let priority: i64 =
            sqlx::query_scalar("SELECT priority FROM participant_priorities WHERE owner = 'loop-1'")
                .fetch_one(second.pool())
                .await?;
        assert_eq!(priority, 2);
        Ok(())
    }

    #[test]
    fn millis_round_trip() -> Result<()> {
        let ts = from_millis(1_700_000_000_123)?;
        assert_eq!(ts.timestamp_millis(), 1_700_000_000_123);
        Ok(())
    }
}
