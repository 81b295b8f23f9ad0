//! Durable coordination event log.
//!
//! Append-only, totally ordered by sequence number. Consumers own a durable
//! cursor (`subscriptions.last_acked_seq`) that only moves forward on explicit
//! acknowledgment, giving at-least-once delivery without push notifications.

pub mod payloads;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sqlx::{sqlite::SqliteRow, FromRow, QueryBuilder, Sqlite, SqliteConnection};
use tracing::{debug, info};

pub use self::payloads::EventPayload;
use crate::{
    store::{from_millis, now_millis, Store},
    Error, Result,
};

/// Default number of events a single poll returns.
pub const DEFAULT_POLL_LIMIT: u32 = 500;

/// Coordination event types.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventType {
    // Lifecycle
    TestStarted,
    TestPassed,
    TestFailed,
    TestBlocked,
    // Locking
    FileLocked,
    FileUnlocked,
    // Conflict and health
    FileConflict,
    StuckDetected,
    DigressionDetected,
    RegressionDetected,
    ResourceWarning,
    PartialWrite,
    // Decisions
    DecisionNeeded,
    DecisionResolved,
    PriorityChanged,
    PauseRequested,
    ResumeRequested,
    SkipRequested,
    RollbackTriggered,
    // Deadlock
    ForceRelease,
    // Components
    ComponentStarted,
    ComponentStopped,
    ComponentDegraded,
    // Checkpoints
    CheckpointCreated,
    CheckpointRolledBack,
}

/// Informational ordering hint. Never affects delivery order.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// A published, immutable event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Sequence number; unique and monotonically increasing.
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub event_type: EventType,
    pub payload: serde_json::Value,
    pub correlation_id: Option<String>,
    pub priority: EventPriority,
}

impl Event {
    /// Decode the payload into its typed form.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            Error::Parse(format!(
                "Event {} ({}) has unexpected payload: {e}",
                self.id, self.event_type
            ))
        })
    }
}

/// An event waiting to be appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    pub source: String,
    pub event_type: EventType,
    pub payload: serde_json::Value,
    pub correlation_id: Option<String>,
    pub priority: EventPriority,
}

impl NewEvent {
    /// Create an event with an empty object payload.
    pub fn new(source: impl Into<String>, event_type: EventType) -> Self {
        Self {
            source: source.into(),
            event_type,
            payload: serde_json::Value::Object(serde_json::Map::new()),
            correlation_id: None,
            priority: EventPriority::Normal,
        }
    }

    /// Create an event from a typed payload; the event type follows the payload.
    pub fn typed<P: EventPayload>(source: impl Into<String>, payload: &P) -> Result<Self> {
        Ok(Self {
            payload: serde_json::to_value(payload)?,
            ..Self::new(source, P::EVENT_TYPE)
        })
    }

    #[must_use]
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    #[must_use]
    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    #[must_use]
    pub const fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }
}

/// Which events a subscription sees.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFilter {
    /// Empty means every type.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub event_types: Vec<EventType>,
    /// Empty means every source.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl EventFilter {
    /// Match every event.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Match only the given types.
    pub fn of_types(types: impl IntoIterator<Item = EventType>) -> Self {
        Self {
            event_types: types.into_iter().collect(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.sources.push(source.into());
        self
    }

    #[must_use]
    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Pure predicate equivalent to the SQL the filter compiles to.
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        (self.event_types.is_empty() || self.event_types.contains(&event.event_type))
            && (self.sources.is_empty() || self.sources.iter().any(|s| *s == event.source))
            && self
                .correlation_id
                .as_ref()
                .map_or(true, |c| event.correlation_id.as_ref() == Some(c))
    }

    fn push_conditions(&self, builder: &mut QueryBuilder<'_, Sqlite>) {
        if !self.event_types.is_empty() {
            builder.push(" AND event_type IN (");
            let mut separated = builder.separated(", ");
            for event_type in &self.event_types {
                separated.push_bind(event_type.to_string());
            }
            separated.push_unseparated(")");
        }
        if !self.sources.is_empty() {
            builder.push(" AND source IN (");
            let mut separated = builder.separated(", ");
            for source in &self.sources {
                separated.push_bind(source.clone());
            }
            separated.push_unseparated(")");
        }
        if let Some(correlation_id) = &self.correlation_id {
            builder.push(" AND correlation_id = ");
            builder.push_bind(correlation_id.clone());
        }
    }
}

/// Where a new subscription's cursor starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StartAt {
    /// Only events published after subscribing.
    #[default]
    Tail,
    /// Replay the whole log.
    Beginning,
    /// Events with sequence greater than the given one.
    After(i64),
}

/// A durable consumer cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subscription {
    pub subscriber_id: String,
    pub filter: EventFilter,
    pub last_acked_seq: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(FromRow)]
struct EventRow {
    seq: i64,
    timestamp: i64,
    source: String,
    event_type: String,
    payload: String,
    correlation_id: Option<String>,
    priority: String,
}

impl TryFrom<EventRow> for Event {
    type Error = Error;

    fn try_from(row: EventRow) -> Result<Self> {
        Ok(Self {
            id: row.seq,
            timestamp: from_millis(row.timestamp)?,
            source: row.source,
            event_type: row
                .event_type
                .parse()
                .map_err(|_| Error::Parse(format!("Unknown event type '{}'", row.event_type)))?,
            payload: serde_json::from_str(&row.payload)?,
            correlation_id: row.correlation_id,
            priority: row.priority.parse().unwrap_or_default(),
        })
    }
}

const EVENT_COLUMNS: &str =
    "SELECT seq, timestamp, source, event_type, payload, correlation_id, priority FROM events";

fn decode_rows(rows: Vec<SqliteRow>) -> Result<Vec<Event>> {
    rows.iter()
        .map(|row| EventRow::from_row(row).map_err(Error::from).and_then(Event::try_from))
        .collect()
}

/// Append an event on an open connection, typically inside a caller's transaction.
pub(crate) async fn append(conn: &mut SqliteConnection, event: &NewEvent) -> Result<i64> {
    let payload = serde_json::to_string(&event.payload)?;
    let result = sqlx::query(
        "INSERT INTO events (timestamp, source, event_type, payload, correlation_id, priority)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(now_millis())
    .bind(&event.source)
    .bind(event.event_type.as_ref())
    .bind(payload)
    .bind(&event.correlation_id)
    .bind(event.priority.as_ref())
    .execute(&mut *conn)
    .await?;
    Ok(result.last_insert_rowid())
}

/// Append a typed payload on an open connection.
pub(crate) async fn append_typed<P: EventPayload>(
    conn: &mut SqliteConnection,
    source: &str,
    payload: &P,
) -> Result<i64> {
    append(conn, &NewEvent::typed(source, payload)?).await
}

/// Publisher and subscription cursors over the shared store.
#[derive(Debug, Clone)]
pub struct EventLog {
    store: Store,
}

impl EventLog {
    #[must_use]
    pub const fn new(store: Store) -> Self {
        Self { store }
    }

    /// Append an event and return its sequence number.
    pub async fn publish(&self, event: NewEvent) -> Result<i64> {
        let mut conn = self.store.pool().acquire().await?;
        let seq = append(&mut conn, &event).await?;
        debug!(seq, event_type = %event.event_type, source = %event.source, "Published event");
        Ok(seq)
    }

    /// Publish a typed payload.
    pub async fn publish_typed<P: EventPayload>(&self, source: &str, payload: &P) -> Result<i64> {
        self.publish(NewEvent::typed(source, payload)?).await
    }

    /// Create or resume a subscription.
    ///
    /// Subscribing again with an existing id keeps its cursor and replaces the filter,
    /// so a restarted consumer resumes where it last acknowledged.
    pub async fn subscribe(
        &self,
        subscriber_id: &str,
        filter: EventFilter,
        start: StartAt,
    ) -> Result<Subscription> {
        if subscriber_id.trim().is_empty() {
            return Err(Error::InvalidInput("subscriber id cannot be empty".into()));
        }
        let filter_json = serde_json::to_string(&filter)?;
        let start_expr = match start {
            StartAt::Tail => "COALESCE((SELECT MAX(seq) FROM events), 0)",
            StartAt::Beginning => "0",
            StartAt::After(_) => "?",
        };
        let sql = format!(
            "INSERT INTO subscriptions (subscriber_id, filter, last_acked_seq, created_at)
             VALUES (?, ?, {start_expr}, ?)
             ON CONFLICT(subscriber_id) DO UPDATE SET filter = excluded.filter"
        );

        let mut query = sqlx::query(&sql).bind(subscriber_id).bind(&filter_json);
        if let StartAt::After(seq) = start {
            query = query.bind(seq.max(0));
        }
        query.bind(now_millis()).execute(self.store.pool()).await?;

        let subscription = self.subscription(subscriber_id).await?;
        info!(
            subscriber = %subscriber_id,
            cursor = subscription.last_acked_seq,
            "Subscription ready"
        );
        Ok(subscription)
    }

    /// Look up a subscription.
    pub async fn subscription(&self, subscriber_id: &str) -> Result<Subscription> {
        let row: Option<(String, String, i64, i64)> = sqlx::query_as(
            "SELECT subscriber_id, filter, last_acked_seq, created_at
             FROM subscriptions WHERE subscriber_id = ?",
        )
        .bind(subscriber_id)
        .fetch_optional(self.store.pool())
        .await?;

        let (subscriber_id, filter, last_acked_seq, created_at) =
            row.ok_or_else(|| Error::NotFound(format!("subscription '{subscriber_id}'")))?;
        Ok(Subscription {
            subscriber_id,
            filter: serde_json::from_str(&filter)?,
            last_acked_seq,
            created_at: from_millis(created_at)?,
        })
    }

    /// Events after the cursor matching the filter, oldest first. Does not move the cursor.
    pub async fn poll(&self, subscriber_id: &str) -> Result<Vec<Event>> {
        self.poll_batch(subscriber_id, DEFAULT_POLL_LIMIT).await
    }

    /// Like [`Self::poll`] with an explicit batch limit.
    pub async fn poll_batch(&self, subscriber_id: &str, limit: u32) -> Result<Vec<Event>> {
        let subscription = self.subscription(subscriber_id).await?;
        let events = self
            .list(&subscription.filter, Some(subscription.last_acked_seq), limit)
            .await?;
        debug!(subscriber = %subscriber_id, count = events.len(), "Polled events");
        Ok(events)
    }

    /// Advance the cursor to `max(current, seq)`. Idempotent; may skip ahead.
    pub async fn ack(&self, subscriber_id: &str, seq: i64) -> Result<()> {
        let result = sqlx::query(
            "UPDATE subscriptions SET last_acked_seq = MAX(last_acked_seq, ?)
             WHERE subscriber_id = ?",
        )
        .bind(seq)
        .bind(subscriber_id)
        .execute(self.store.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("subscription '{subscriber_id}'")));
        }
        Ok(())
    }

    /// Drop a subscription. Returns false if it did not exist.
    pub async fn unsubscribe(&self, subscriber_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM subscriptions WHERE subscriber_id = ?")
            .bind(subscriber_id)
            .execute(self.store.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Read-only projection for operators: matching events after `after`, oldest first.
    pub async fn list(
        &self,
        filter: &EventFilter,
        after: Option<i64>,
        limit: u32,
    ) -> Result<Vec<Event>> {
        let mut builder = QueryBuilder::<Sqlite>::new(EVENT_COLUMNS);
        builder.push(" WHERE seq > ");
        builder.push_bind(after.unwrap_or(0));
        filter.push_conditions(&mut builder);
        builder.push(" ORDER BY seq ASC LIMIT ");
        builder.push_bind(i64::from(limit));

        let rows = builder.build().fetch_all(self.store.pool()).await?;
        decode_rows(rows)
    }

    /// The most recent `limit` matching events, oldest first.
    pub async fn recent(&self, filter: &EventFilter, limit: u32) -> Result<Vec<Event>> {
        let mut builder = QueryBuilder::<Sqlite>::new(EVENT_COLUMNS);
        builder.push(" WHERE 1 = 1");
        filter.push_conditions(&mut builder);
        builder.push(" ORDER BY seq DESC LIMIT ");
        builder.push_bind(i64::from(limit));

        let rows = builder.build().fetch_all(self.store.pool()).await?;
        let mut events = decode_rows(rows)?;
        events.reverse();
        Ok(events)
    }

    /// Highest sequence number published so far (0 for an empty log).
    pub async fn latest_sequence(&self) -> Result<i64> {
        let seq: Option<i64> = sqlx::query_scalar("SELECT MAX(seq) FROM events")
            .fetch_one(self.store.pool())
            .await?;
        Ok(seq.unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{payloads::FileConflict, *};

    async fn log() -> Result<EventLog> {
        Ok(EventLog::new(Store::in_memory().await?))
    }

    #[test]
    fn event_type_wire_names() {
        assert_eq!(EventType::CheckpointRolledBack.to_string(), "checkpoint_rolled_back");
        assert_eq!(
            "force_release".parse::<EventType>().ok(),
            Some(EventType::ForceRelease)
        );
        assert!("not_an_event".parse::<EventType>().is_err());
    }

    #[tokio::test]
    async fn publish_assigns_increasing_sequence() -> Result<()> {
        let log = log().await?;
        let first = log.publish(NewEvent::new("loop-1", EventType::TestStarted)).await?;
        let second = log.publish(NewEvent::new("loop-1", EventType::TestPassed)).await?;
        assert!(second > first);
        assert_eq!(log.latest_sequence().await?, second);
        Ok(())
    }

    #[tokio::test]
    async fn tail_subscription_skips_history() -> Result<()> {
        let log = log().await?;
        log.publish(NewEvent::new("loop-1", EventType::TestStarted)).await?;
        log.subscribe("monitor", EventFilter::all(), StartAt::Tail).await?;
        assert!(log.poll("monitor").await?.is_empty());

        let seq = log.publish(NewEvent::new("loop-2", EventType::TestFailed)).await?;
        let events = log.poll("monitor").await?;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, seq);
        Ok(())
    }

    #[tokio::test]
    async fn poll_does_not_advance_until_ack() -> Result<()> {
        let log = log().await?;
        log.subscribe("monitor", EventFilter::all(), StartAt::Beginning).await?;
        let a = log.publish(NewEvent::new("loop-1", EventType::TestStarted)).await?;
        let b = log.publish(NewEvent::new("loop-1", EventType::TestPassed)).await?;

        assert_eq!(log.poll("monitor").await?.len(), 2);
        assert_eq!(log.poll("monitor").await?.len(), 2);

        log.ack("monitor", a).await?;
        let remaining = log.poll("monitor").await?;
        assert_eq!(remaining.iter().map(|e| e.id).collect::<Vec<_>>(), vec![b]);

        // Acking an older sequence never moves the cursor back.
        log.ack("monitor", a - 1).await?;
        assert_eq!(log.subscription("monitor").await?.last_acked_seq, a);
        Ok(())
    }

    #[tokio::test]
    async fn filter_by_type_source_and_correlation() -> Result<()> {
        let log = log().await?;
        let filter = EventFilter::of_types([EventType::FileConflict])
            .with_source("loop-2")
            .with_correlation("CP-UFS-001");
        log.subscribe("coordinator", filter.clone(), StartAt::Beginning).await?;

        log.publish(NewEvent::new("loop-2", EventType::FileLocked).with_correlation("CP-UFS-001"))
            .await?;
        log.publish(NewEvent::new("loop-1", EventType::FileConflict).with_correlation("CP-UFS-001"))
            .await?;
        log.publish(NewEvent::new("loop-2", EventType::FileConflict)).await?;
        let wanted = log
            .publish(
                NewEvent::new("loop-2", EventType::FileConflict).with_correlation("CP-UFS-001"),
            )
            .await?;

        let events = log.poll("coordinator").await?;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, wanted);
        assert!(filter.matches(&events[0]));
        Ok(())
    }

    #[tokio::test]
    async fn resubscribe_keeps_cursor() -> Result<()> {
        let log = log().await?;
        log.subscribe("loop-1", EventFilter::all(), StartAt::Beginning).await?;
        let seq = log.publish(NewEvent::new("monitor", EventType::PauseRequested)).await?;
        log.ack("loop-1", seq).await?;

        let resumed = log.subscribe("loop-1", EventFilter::all(), StartAt::Beginning).await?;
        assert_eq!(resumed.last_acked_seq, seq);
        Ok(())
    }

    #[tokio::test]
    async fn ack_unknown_subscription_is_not_found() -> Result<()> {
        let log = log().await?;
        assert!(matches!(log.ack("ghost", 1).await, Err(Error::NotFound(_))));
        Ok(())
    }

    #[tokio::test]
    async fn typed_payload_round_trips() -> Result<()> {
        let log = log().await?;
        let conflict = FileConflict {
            resource_key: "server/api.ts".into(),
            owners: vec!["loop-1".into(), "loop-2".into()],
        };
        log.publish_typed("loop-1", &conflict).await?;

        let events = log.recent(&EventFilter::all(), 10).await?;
        assert_eq!(events[0].event_type, EventType::FileConflict);
        assert_eq!(events[0].payload_as::<FileConflict>()?, conflict);
        assert!(events[0].payload_as::<payloads::ForceRelease>().is_err());
        Ok(())
    }

    #[tokio::test]
    async fn recent_returns_latest_in_order() -> Result<()> {
        let log = log().await?;
        for n in 0..5 {
            log.publish(NewEvent::new("loop-1", EventType::TestStarted).with_payload(json!({ "n": n })))
                .await?;
        }
        let events = log.recent(&EventFilter::all(), 2).await?;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].payload["n"], 3);
        assert_eq!(events[1].payload["n"], 4);
        Ok(())
    }
}
