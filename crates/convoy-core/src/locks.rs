//! Exclusive resource locks for loop coordination.
//!
//! At most one non-expired lock exists per resource key; the `locks` primary key
//! enforces it. Locks carry a TTL that readers honour lazily: a row past
//! `expires_at` is treated as absent and is replaced by the next acquirer. The
//! orphan cleaner reclaims such rows eagerly.
//!
//! `acquire` never blocks. A denial records a pending request which the deadlock
//! detector turns into a wait edge. Only grants and releases are announced.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::{FromRow, SqliteConnection};
use tracing::{debug, info, warn};

use crate::{
    events::{
        self,
        payloads::{FileLocked, FileUnlocked, UnlockReason},
    },
    store::{from_millis, now_millis, serialize_millis, Store},
    Error, Result,
};

/// Default lock TTL in seconds (5 minutes).
const DEFAULT_TTL_SECS: i64 = 300;

/// An active lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Lock {
    pub resource_key: String,
    pub holder: String,
    /// Reference to the unit of work.
    pub context: Option<String>,
    pub reason: Option<String>,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(rename = "ttl_ms", serialize_with = "serialize_millis")]
    pub ttl: Duration,
}

impl Lock {
    /// Whether the lock has passed its TTL at `now`. A lock is still live at
    /// exactly `expires_at`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Outcome of an acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquisition {
    Granted(Lock),
    Denied {
        holder: String,
        expires_at: DateTime<Utc>,
    },
}

impl Acquisition {
    #[must_use]
    pub const fn is_granted(&self) -> bool {
        matches!(self, Self::Granted(_))
    }
}

/// Parameters of one acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquireRequest {
    pub resource_key: String,
    pub holder: String,
    pub ttl: Option<Duration>,
    pub reason: Option<String>,
    pub context: Option<String>,
}

impl AcquireRequest {
    pub fn new(resource_key: impl Into<String>, holder: impl Into<String>) -> Self {
        Self {
            resource_key: resource_key.into(),
            holder: holder.into(),
            ttl: None,
            reason: None,
            context: None,
        }
    }

    #[must_use]
    pub const fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    #[must_use]
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

/// A denied acquisition that has not been retried, withdrawn, or granted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingRequest {
    pub waiter: String,
    pub resource_key: String,
    /// Holder observed when the request was denied.
    pub holder_at_denial: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(FromRow)]
struct LockRow {
    resource_key: String,
    holder: String,
    context: Option<String>,
    reason: Option<String>,
    acquired_at: i64,
    expires_at: i64,
    ttl_ms: i64,
}

impl TryFrom<LockRow> for Lock {
    type Error = Error;

    fn try_from(row: LockRow) -> Result<Self> {
        Ok(Self {
            resource_key: row.resource_key,
            holder: row.holder,
            context: row.context,
            reason: row.reason,
            acquired_at: from_millis(row.acquired_at)?,
            expires_at: from_millis(row.expires_at)?,
            ttl: Duration::milliseconds(row.ttl_ms),
        })
    }
}

const LOCK_COLUMNS: &str = "resource_key, holder, context, reason, acquired_at, expires_at, ttl_ms";

fn into_locks(rows: Vec<LockRow>) -> Result<Vec<Lock>> {
    rows.into_iter().map(Lock::try_from).collect()
}

fn unlocked(lock: &Lock, reason: UnlockReason, released_by: Option<&str>) -> FileUnlocked {
    FileUnlocked {
        resource_key: lock.resource_key.clone(),
        holder: lock.holder.clone(),
        held_ms: (Utc::now() - lock.acquired_at).num_milliseconds().max(0),
        reason,
        forced: matches!(reason, UnlockReason::Forced),
        released_by: released_by.map(ToString::to_string),
    }
}

/// Delete every lock row of `holder`, expired or not, and its pending requests.
pub(crate) async fn delete_held(conn: &mut SqliteConnection, holder: &str) -> Result<Vec<Lock>> {
    let rows: Vec<LockRow> = sqlx::query_as(&format!(
        "DELETE FROM locks WHERE holder = ? RETURNING {LOCK_COLUMNS}"
    ))
    .bind(holder)
    .fetch_all(&mut *conn)
    .await?;

    sqlx::query("DELETE FROM lock_requests WHERE waiter = ?")
        .bind(holder)
        .execute(&mut *conn)
        .await?;

    into_locks(rows)
}

/// Publish `file_unlocked` for each lock on the caller's connection.
pub(crate) async fn announce_unlocked(
    conn: &mut SqliteConnection,
    source: &str,
    locks: &[Lock],
    reason: UnlockReason,
) -> Result<()> {
    for lock in locks {
        events::append_typed(conn, source, &unlocked(lock, reason, Some(source))).await?;
    }
    Ok(())
}

/// Manages exclusive resource locks backed by `SQLite`.
#[derive(Debug, Clone)]
pub struct LockManager {
    store: Store,
    ttl: Duration,
}

impl LockManager {
    /// Create a new `LockManager` with default TTL.
    #[must_use]
    pub const fn new(store: Store) -> Self {
        Self {
            store,
            ttl: Duration::seconds(DEFAULT_TTL_SECS),
        }
    }

    /// Create a new `LockManager` with a custom default TTL.
    #[must_use]
    pub const fn with_ttl(store: Store, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Default TTL applied when a request carries none.
    #[must_use]
    pub const fn default_ttl(&self) -> Duration {
        self.ttl
    }

    /// Try to take an exclusive lock.
    ///
    /// Returns `Acquisition::Denied` with the current holder when another owner
    /// holds a live lock; the denial is remembered as a pending request.
    /// Re-acquiring a lock already held refreshes its TTL.
    pub async fn acquire(&self, request: &AcquireRequest) -> Result<Acquisition> {
        if request.resource_key.trim().is_empty() || request.holder.trim().is_empty() {
            return Err(Error::InvalidInput(
                "resource key and holder cannot be empty".into(),
            ));
        }
        let ttl = request.ttl.unwrap_or(self.ttl);
        if ttl <= Duration::zero() {
            return Err(Error::InvalidInput("lock ttl must be positive".into()));
        }

        let now = now_millis();
        let expires_at = now.saturating_add(ttl.num_milliseconds());
        let mut tx = self.store.begin().await?;

        // Lazy TTL: an expired row is replaced by whoever asks next.
        let expired: Option<LockRow> = sqlx::query_as(&format!(
            "DELETE FROM locks WHERE resource_key = ? AND expires_at < ? RETURNING {LOCK_COLUMNS}"
        ))
        .bind(&request.resource_key)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(row) = expired {
            let lock = Lock::try_from(row)?;
            debug!(resource = %lock.resource_key, holder = %lock.holder, "Replacing expired lock");
            events::append_typed(&mut tx, &request.holder, &unlocked(&lock, UnlockReason::TtlExpired, None))
                .await?;
        }

        let refreshed = sqlx::query(
            "UPDATE locks SET expires_at = ?, ttl_ms = ?, reason = COALESCE(?, reason), context = COALESCE(?, context)
             WHERE resource_key = ? AND holder = ?",
        )
        .bind(expires_at)
        .bind(ttl.num_milliseconds())
        .bind(&request.reason)
        .bind(&request.context)
        .bind(&request.resource_key)
        .bind(&request.holder)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let inserted = if refreshed == 0 {
            sqlx::query(
                "INSERT OR IGNORE INTO locks (resource_key, holder, context, reason, acquired_at, expires_at, ttl_ms)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&request.resource_key)
            .bind(&request.holder)
            .bind(&request.context)
            .bind(&request.reason)
            .bind(now)
            .bind(expires_at)
            .bind(ttl.num_milliseconds())
            .execute(&mut *tx)
            .await?
            .rows_affected()
        } else {
            0
        };

        let current: LockRow = sqlx::query_as(&format!(
            "SELECT {LOCK_COLUMNS} FROM locks WHERE resource_key = ?"
        ))
        .bind(&request.resource_key)
        .fetch_one(&mut *tx)
        .await?;
        let lock = Lock::try_from(current)?;

        if refreshed > 0 || inserted > 0 {
            sqlx::query("DELETE FROM lock_requests WHERE waiter = ? AND resource_key = ?")
                .bind(&request.holder)
                .bind(&request.resource_key)
                .execute(&mut *tx)
                .await?;

            if inserted > 0 {
                let payload = FileLocked {
                    resource_key: lock.resource_key.clone(),
                    holder: lock.holder.clone(),
                    reason: lock.reason.clone(),
                    context: lock.context.clone(),
                    expires_at: lock.expires_at,
                };
                let mut event = events::NewEvent::typed(&request.holder, &payload)?;
                if let Some(context) = &lock.context {
                    event = event.with_correlation(context.clone());
                }
                events::append(&mut tx, &event).await?;
            }
            tx.commit().await?;

            info!(resource = %lock.resource_key, holder = %lock.holder, refreshed = refreshed > 0, "Lock granted");
            return Ok(Acquisition::Granted(lock));
        }

        sqlx::query(
            "INSERT INTO lock_requests (waiter, resource_key, holder_at_denial, recorded_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(waiter, resource_key) DO UPDATE SET
                holder_at_denial = excluded.holder_at_denial,
                recorded_at = excluded.recorded_at",
        )
        .bind(&request.holder)
        .bind(&request.resource_key)
        .bind(&lock.holder)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        debug!(resource = %lock.resource_key, waiter = %request.holder, holder = %lock.holder, "Lock denied");
        Ok(Acquisition::Denied {
            holder: lock.holder,
            expires_at: lock.expires_at,
        })
    }

    /// Release a lock. Only the holder can release it.
    ///
    /// Returns `false` when there was no live lock to release.
    pub async fn release(&self, resource_key: &str, holder: &str) -> Result<bool> {
        let now = now_millis();
        let mut tx = self.store.begin().await?;

        let removed: Option<LockRow> = sqlx::query_as(&format!(
            "DELETE FROM locks WHERE resource_key = ? AND holder = ? AND expires_at >= ? RETURNING {LOCK_COLUMNS}"
        ))
        .bind(resource_key)
        .bind(holder)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = removed {
            let lock = Lock::try_from(row)?;
            let payload = unlocked(&lock, UnlockReason::Released, None);
            events::append_typed(&mut tx, holder, &payload).await?;
            tx.commit().await?;
            info!(resource = %resource_key, holder = %holder, held_ms = payload.held_ms, "Lock released");
            return Ok(true);
        }

        let other: Option<String> = sqlx::query_scalar(
            "SELECT holder FROM locks WHERE resource_key = ? AND expires_at >= ?",
        )
        .bind(resource_key)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;
        tx.commit().await?;

        match other {
            Some(_) => Err(Error::NotLockHolder {
                resource: resource_key.to_string(),
                holder: holder.to_string(),
            }),
            None => {
                debug!(resource = %resource_key, holder = %holder, "Release of unheld lock ignored");
                Ok(false)
            }
        }
    }

    /// Extend a lock's TTL (heartbeat).
    pub async fn extend(&self, resource_key: &str, holder: &str) -> Result<Lock> {
        let now = now_millis();
        let updated: Option<LockRow> = sqlx::query_as(&format!(
            "UPDATE locks SET expires_at = ? + ttl_ms
             WHERE resource_key = ? AND holder = ? AND expires_at >= ?
             RETURNING {LOCK_COLUMNS}"
        ))
        .bind(now)
        .bind(resource_key)
        .bind(holder)
        .bind(now)
        .fetch_optional(self.store.pool())
        .await?;

        match updated {
            Some(row) => Lock::try_from(row),
            None => match self.lock_state(resource_key).await? {
                Some(_) => Err(Error::NotLockHolder {
                    resource: resource_key.to_string(),
                    holder: holder.to_string(),
                }),
                None => Err(Error::NotFound(format!("no active lock on '{resource_key}'"))),
            },
        }
    }

    /// Release every lock `holder` owns and withdraw its pending requests.
    pub async fn release_all(&self, holder: &str) -> Result<Vec<Lock>> {
        let now = Utc::now();
        let mut tx = self.store.begin().await?;
        let removed = delete_held(&mut tx, holder).await?;
        for lock in &removed {
            let reason = if lock.is_expired_at(now) {
                UnlockReason::TtlExpired
            } else {
                UnlockReason::Released
            };
            events::append_typed(&mut tx, holder, &unlocked(lock, reason, None)).await?;
        }
        tx.commit().await?;

        info!(holder = %holder, count = removed.len(), "Released all locks");
        Ok(removed)
    }

    /// Cancel a pending request without acquiring.
    pub async fn withdraw(&self, holder: &str, resource_key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM lock_requests WHERE waiter = ? AND resource_key = ?")
            .bind(holder)
            .bind(resource_key)
            .execute(self.store.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Operator force-unlock. Removes the lock regardless of holder.
    ///
    /// Returns the released lock, or `None` when nothing was held.
    pub async fn force_release(
        &self,
        resource_key: &str,
        operator: &str,
        reason: &str,
    ) -> Result<Option<Lock>> {
        let mut tx = self.store.begin().await?;
        let removed: Option<LockRow> = sqlx::query_as(&format!(
            "DELETE FROM locks WHERE resource_key = ? RETURNING {LOCK_COLUMNS}"
        ))
        .bind(resource_key)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = removed else {
            tx.commit().await?;
            return Ok(None);
        };
        let lock = Lock::try_from(row)?;
        events::append_typed(&mut tx, operator, &unlocked(&lock, UnlockReason::Forced, Some(operator)))
            .await?;
        tx.commit().await?;

        warn!(resource = %resource_key, holder = %lock.holder, operator = %operator, reason = %reason, "Lock force-released");
        Ok(Some(lock))
    }

    /// Eagerly delete expired locks, announcing each one.
    pub async fn reclaim_expired(&self, source: &str) -> Result<Vec<Lock>> {
        self.reclaim_expired_at(source, Utc::now()).await
    }

    /// Delete locks whose TTL lapsed before `now`.
    pub async fn reclaim_expired_at(&self, source: &str, now: DateTime<Utc>) -> Result<Vec<Lock>> {
        let mut tx = self.store.begin().await?;
        let rows: Vec<LockRow> = sqlx::query_as(&format!(
            "DELETE FROM locks WHERE expires_at < ? RETURNING {LOCK_COLUMNS}"
        ))
        .bind(now.timestamp_millis())
        .fetch_all(&mut *tx)
        .await?;
        let reclaimed = into_locks(rows)?;
        for lock in &reclaimed {
            events::append_typed(&mut tx, source, &unlocked(lock, UnlockReason::TtlExpired, None))
                .await?;
        }
        tx.commit().await?;

        if !reclaimed.is_empty() {
            info!(count = reclaimed.len(), "Reclaimed expired locks");
        }
        Ok(reclaimed)
    }

    /// Current lock table (live locks only).
    pub async fn lock_table(&self) -> Result<Vec<Lock>> {
        let rows: Vec<LockRow> = sqlx::query_as(&format!(
            "SELECT {LOCK_COLUMNS} FROM locks WHERE expires_at >= ? ORDER BY resource_key"
        ))
        .bind(now_millis())
        .fetch_all(self.store.pool())
        .await?;
        into_locks(rows)
    }

    /// Live lock on a resource, if any.
    pub async fn lock_state(&self, resource_key: &str) -> Result<Option<Lock>> {
        let row: Option<LockRow> = sqlx::query_as(&format!(
            "SELECT {LOCK_COLUMNS} FROM locks WHERE resource_key = ? AND expires_at >= ?"
        ))
        .bind(resource_key)
        .bind(now_millis())
        .fetch_optional(self.store.pool())
        .await?;
        row.map(Lock::try_from).transpose()
    }

    /// Live locks held by one owner.
    pub async fn locks_held_by(&self, holder: &str) -> Result<Vec<Lock>> {
        let rows: Vec<LockRow> = sqlx::query_as(&format!(
            "SELECT {LOCK_COLUMNS} FROM locks WHERE holder = ? AND expires_at >= ? ORDER BY resource_key"
        ))
        .bind(holder)
        .bind(now_millis())
        .fetch_all(self.store.pool())
        .await?;
        into_locks(rows)
    }

    /// Every recorded pending request, oldest first.
    pub async fn pending_requests(&self) -> Result<Vec<PendingRequest>> {
        let rows: Vec<(String, String, String, i64)> = sqlx::query_as(
            "SELECT waiter, resource_key, holder_at_denial, recorded_at
             FROM lock_requests ORDER BY recorded_at, waiter",
        )
        .fetch_all(self.store.pool())
        .await?;

        rows.into_iter()
            .map(|(waiter, resource_key, holder_at_denial, recorded_at)| {
                Ok(PendingRequest {
                    waiter,
                    resource_key,
                    holder_at_denial,
                    recorded_at: from_millis(recorded_at)?,
                })
            })
            .collect()
    }

    /// Drop pending requests older than `max_age`. Returns how many were removed.
    pub async fn purge_stale_requests(&self, max_age: Duration) -> Result<u64> {
        let cutoff = now_millis().saturating_sub(max_age.num_milliseconds());
        let result = sqlx::query("DELETE FROM lock_requests WHERE recorded_at < ?")
            .bind(cutoff)
            .execute(self.store.pool())
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{payloads::FileUnlocked, EventFilter, EventLog, EventType};

    async fn setup() -> Result<(LockManager, EventLog)> {
        let store = Store::in_memory().await?;
        Ok((LockManager::new(store.clone()), EventLog::new(store)))
    }

    fn request(resource: &str, holder: &str) -> AcquireRequest {
        AcquireRequest::new(resource, holder).with_reason("editing")
    }

    #[tokio::test]
    async fn acquire_grants_free_resource() -> Result<()> {
        let (mgr, log) = setup().await?;
        let outcome = mgr.acquire(&request("server/api.ts", "loop-1")).await?;
        assert!(outcome.is_granted());

        let locked = log.recent(&EventFilter::of_types([EventType::FileLocked]), 10).await?;
        assert_eq!(locked.len(), 1);
        assert_eq!(locked[0].source, "loop-1");
        Ok(())
    }

    #[tokio::test]
    async fn second_holder_is_denied_and_request_recorded() -> Result<()> {
        let (mgr, log) = setup().await?;
        mgr.acquire(&request("server/api.ts", "loop-1")).await?;
        let before = log.latest_sequence().await?;

        let outcome = mgr.acquire(&request("server/api.ts", "loop-2")).await?;
        assert!(matches!(outcome, Acquisition::Denied { ref holder, .. } if holder == "loop-1"));
        // Denials are not announced.
        assert_eq!(log.latest_sequence().await?, before);

        let pending = mgr.pending_requests().await?;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].waiter, "loop-2");
        assert_eq!(pending[0].holder_at_denial, "loop-1");
        Ok(())
    }

    #[tokio::test]
    async fn reacquire_by_holder_refreshes_without_event() -> Result<()> {
        let (mgr, log) = setup().await?;
        mgr.acquire(&request("a.rs", "loop-1").with_ttl(Duration::seconds(5))).await?;
        let before = log.latest_sequence().await?;

        let outcome = mgr.acquire(&request("a.rs", "loop-1").with_ttl(Duration::seconds(60))).await?;
        let Acquisition::Granted(lock) = outcome else {
            panic!("expected grant");
        };
        assert_eq!(lock.ttl, Duration::seconds(60));
        assert_eq!(log.latest_sequence().await?, before);
        Ok(())
    }

    #[tokio::test]
    async fn release_requires_holder() -> Result<()> {
        let (mgr, _) = setup().await?;
        mgr.acquire(&request("a.rs", "loop-1")).await?;

        let result = mgr.release("a.rs", "loop-2").await;
        assert!(matches!(result, Err(Error::NotLockHolder { .. })));
        assert!(mgr.release("a.rs", "loop-1").await?);
        assert!(!mgr.release("a.rs", "loop-1").await?);
        Ok(())
    }

    #[tokio::test]
    async fn release_publishes_held_duration() -> Result<()> {
        let (mgr, log) = setup().await?;
        mgr.acquire(&request("a.rs", "loop-1")).await?;
        mgr.release("a.rs", "loop-1").await?;

        let events = log.recent(&EventFilter::of_types([EventType::FileUnlocked]), 10).await?;
        let payload: FileUnlocked = events[0].payload_as()?;
        assert_eq!(payload.holder, "loop-1");
        assert_eq!(payload.reason, UnlockReason::Released);
        assert!(payload.held_ms >= 0);
        assert!(!payload.forced);
        Ok(())
    }

    #[tokio::test]
    async fn expired_lock_is_acquirable_by_another_holder() -> Result<()> {
        let (mgr, _) = setup().await?;
        mgr.acquire(&request("a.rs", "loop-1").with_ttl(Duration::milliseconds(20))).await?;
        tokio::time::sleep(std::time::Duration::from_millis(40)).await;

        assert!(mgr.lock_state("a.rs").await?.is_none());
        let outcome = mgr.acquire(&request("a.rs", "loop-2")).await?;
        assert!(outcome.is_granted());
        Ok(())
    }

    #[tokio::test]
    async fn extend_by_non_holder_fails() -> Result<()> {
        let (mgr, _) = setup().await?;
        mgr.acquire(&request("a.rs", "loop-1")).await?;
        assert!(matches!(mgr.extend("a.rs", "loop-2").await, Err(Error::NotLockHolder { .. })));
        assert!(matches!(mgr.extend("b.rs", "loop-1").await, Err(Error::NotFound(_))));
        let lock = mgr.extend("a.rs", "loop-1").await?;
        assert_eq!(lock.holder, "loop-1");
        Ok(())
    }

    #[tokio::test]
    async fn release_all_clears_locks_and_requests() -> Result<()> {
        let (mgr, _) = setup().await?;
        mgr.acquire(&request("a.rs", "loop-1")).await?;
        mgr.acquire(&request("b.rs", "loop-1")).await?;
        mgr.acquire(&request("c.rs", "loop-2")).await?;
        mgr.acquire(&request("c.rs", "loop-1")).await?;

        let released = mgr.release_all("loop-1").await?;
        assert_eq!(released.len(), 2);
        assert!(mgr.locks_held_by("loop-1").await?.is_empty());
        assert!(mgr.pending_requests().await?.is_empty());
        assert_eq!(mgr.lock_table().await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn force_release_is_flagged() -> Result<()> {
        let (mgr, log) = setup().await?;
        mgr.acquire(&request("a.rs", "loop-1")).await?;

        let released = mgr.force_release("a.rs", "operator", "stuck").await?;
        assert_eq!(released.map(|l| l.holder), Some("loop-1".to_string()));
        assert!(mgr.force_release("a.rs", "operator", "again").await?.is_none());

        let events = log.recent(&EventFilter::of_types([EventType::FileUnlocked]), 10).await?;
        let payload: FileUnlocked = events[0].payload_as()?;
        assert!(payload.forced);
        assert_eq!(payload.released_by.as_deref(), Some("operator"));
        Ok(())
    }

    #[tokio::test]
    async fn reclaim_expired_announces_ttl_expiry() -> Result<()> {
        let (mgr, log) = setup().await?;
        mgr.acquire(&request("a.rs", "loop-1").with_ttl(Duration::milliseconds(10))).await?;
        mgr.acquire(&request("b.rs", "loop-1")).await?;
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;

        let reclaimed = mgr.reclaim_expired("orphan-cleaner").await?;
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].resource_key, "a.rs");
        assert!(mgr.reclaim_expired("orphan-cleaner").await?.is_empty());

        let events = log.recent(&EventFilter::of_types([EventType::FileUnlocked]), 10).await?;
        assert_eq!(events[0].payload_as::<FileUnlocked>()?.reason, UnlockReason::TtlExpired);
        Ok(())
    }

    #[tokio::test]
    async fn lock_is_live_at_exact_expiry() -> Result<()> {
        let (mgr, _) = setup().await?;
        let Acquisition::Granted(lock) = mgr.acquire(&request("a.rs", "loop-1")).await? else {
            panic!("expected grant");
        };
        assert!(!lock.is_expired_at(lock.expires_at));
        assert!(lock.is_expired_at(lock.expires_at + Duration::milliseconds(1)));

        assert!(mgr.reclaim_expired_at("orphan-cleaner", lock.expires_at).await?.is_empty());
        let reclaimed = mgr
            .reclaim_expired_at("orphan-cleaner", lock.expires_at + Duration::milliseconds(1))
            .await?;
        assert_eq!(reclaimed.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn withdraw_and_purge_requests() -> Result<()> {
        let (mgr, _) = setup().await?;
        mgr.acquire(&request("a.rs", "loop-1")).await?;
        mgr.acquire(&request("a.rs", "loop-2")).await?;
        mgr.acquire(&request("a.rs", "loop-3")).await?;

        assert!(mgr.withdraw("loop-2", "a.rs").await?);
        assert!(!mgr.withdraw("loop-2", "a.rs").await?);
        assert_eq!(mgr.pending_requests().await?.len(), 1);

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(mgr.purge_stale_requests(Duration::milliseconds(5)).await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn empty_keys_rejected() -> Result<()> {
        let (mgr, _) = setup().await?;
        let result = mgr.acquire(&AcquireRequest::new("", "loop-1")).await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
        Ok(())
    }
}
