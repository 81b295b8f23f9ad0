//! Conflict policy and human decisions.
//!
//! The coordinator consumes conflict-class events through a durable
//! subscription and answers them with directive events (`pause_requested`,
//! `resume_requested`, `rollback_triggered`, `priority_changed`,
//! `skip_requested`). Cases policy cannot settle become a [`Decision`] with
//! enumerated options, a default, and a timeout after which the default is
//! applied automatically.
//!
//! Every decision row is closed by compare-and-set on its status, so two
//! racing resolvers never both apply an option.

use chrono::{DateTime, Duration, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqliteConnection};
use tracing::{debug, info, warn};

use crate::{
    checkpoint,
    config::CoordinationConfig,
    deadlock::{LowestPriorityPolicy, Participant, VictimPolicy},
    events::{
        self,
        payloads::{
            DecisionNeeded, DecisionResolved, FileConflict, ForceRelease, PauseRequested,
            RegressionDetected, ResumeRequested, RollbackTriggered, SkipRequested, StuckDetected,
        },
        Event, EventFilter, EventLog, EventPriority, EventType, NewEvent, StartAt,
    },
    health::{HealthManager, HealthStatus},
    locks::LockManager,
    priority,
    store::{from_millis, now_millis, Store},
    Error, Result,
};

/// Subscriber id and event source of the coordinator.
pub const COORDINATOR_ID: &str = "coordinator";

/// Resolver recorded when a decision times out.
pub const TIMEOUT_RESOLVER: &str = "timeout";

/// Failed handling attempts after which an event is handed to operators and acknowledged.
pub const MAX_EVENT_ATTEMPTS: i64 = 3;

#[derive(
    Debug,
    Clone,
    Copy,
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
pub enum DecisionKind {
    FileConflict,
    Stuck,
    Regression,
    RepeatedVictim,
    /// An event the coordinator kept failing to handle.
    FailedEvent,
    Manual,
}

#[derive(
    Debug,
    Clone,
    Copy,
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
pub enum DecisionStatus {
    Pending,
    Resolved,
    TimedOut,
}

/// An effect applied when a decision option is chosen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DecisionAction {
    Pause {
        owner: String,
        #[serde(default)]
        blocked_on: Option<String>,
        #[serde(default)]
        resource_key: Option<String>,
    },
    Resume {
        owner: String,
    },
    /// Roll back to `checkpoint_id`, or the owner's latest active checkpoint
    /// at the time the option is applied.
    Rollback {
        owner: String,
        #[serde(default)]
        checkpoint_id: Option<String>,
        #[serde(default)]
        work_item_id: Option<String>,
    },
    SetPriority {
        owner: String,
        priority: i64,
    },
    /// Shift the owner's priority relative to its value when the option is applied.
    AdjustPriority {
        owner: String,
        delta: i64,
    },
    Skip {
        owner: String,
        work_item_id: String,
    },
    Ignore,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionOption {
    pub key: String,
    pub description: String,
    pub actions: Vec<DecisionAction>,
}

impl DecisionOption {
    pub fn new(
        key: impl Into<String>,
        description: impl Into<String>,
        actions: Vec<DecisionAction>,
    ) -> Self {
        Self {
            key: key.into(),
            description: description.into(),
            actions,
        }
    }
}

/// A question only a human (or the timeout) can answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub id: String,
    pub kind: DecisionKind,
    pub summary: String,
    pub options: Vec<DecisionOption>,
    pub default_option: String,
    pub created_at: DateTime<Utc>,
    pub timeout_at: DateTime<Utc>,
    pub status: DecisionStatus,
    pub chosen_option: Option<String>,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub correlation_id: Option<String>,
}

impl Decision {
    #[must_use]
    pub fn option(&self, key: &str) -> Option<&DecisionOption> {
        self.options.iter().find(|o| o.key == key)
    }
}

/// Input for [`Coordinator::create_decision`].
#[derive(Debug, Clone)]
pub struct NewDecision {
    pub kind: DecisionKind,
    pub summary: String,
    pub options: Vec<DecisionOption>,
    pub default_option: String,
    pub correlation_id: Option<String>,
}

/// An owner the coordinator asked to pause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PausedOwner {
    pub owner: String,
    pub blocked_on: Option<String>,
    pub resource_key: Option<String>,
    pub reason: String,
    pub paused_at: DateTime<Utc>,
}

/// What one coordinator tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub handled: usize,
    pub decisions_created: Vec<String>,
    pub resumed: Vec<String>,
    pub expired: Vec<String>,
}

/// How a file conflict is settled.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ConflictPlan {
    /// One owner strictly outranks the rest.
    Pause { winner: String, losers: Vec<String> },
    /// The top priority is shared; `default_keep` wins the tie-break.
    Ambiguous { owners: Vec<String>, default_keep: String },
}

fn plan_conflict(participants: &[Participant]) -> Option<ConflictPlan> {
    if participants.len() < 2 {
        return None;
    }
    let top = participants.iter().map(|p| p.priority).max()?;
    let tied: Vec<Participant> = participants
        .iter()
        .filter(|p| p.priority == top)
        .cloned()
        .collect();

    if let [winner] = tied.as_slice() {
        let losers = participants
            .iter()
            .filter(|p| p.id != winner.id)
            .map(|p| p.id.clone())
            .collect();
        return Some(ConflictPlan::Pause {
            winner: winner.id.clone(),
            losers,
        });
    }

    // Among the tied, the policy's victim keeps losing until one remains.
    let mut remaining = tied;
    while remaining.len() > 1 {
        let victim = LowestPriorityPolicy.select(&remaining)?;
        remaining.retain(|p| p.id != victim);
    }
    let default_keep = remaining.first()?.id.clone();
    Some(ConflictPlan::Ambiguous {
        owners: participants.iter().map(|p| p.id.clone()).collect(),
        default_keep,
    })
}

#[derive(FromRow)]
struct DecisionRow {
    id: String,
    kind: String,
    summary: String,
    options: String,
    default_option: String,
    created_at: i64,
    timeout_at: i64,
    status: String,
    chosen_option: Option<String>,
    resolved_by: Option<String>,
    resolved_at: Option<i64>,
    correlation_id: Option<String>,
}

impl TryFrom<DecisionRow> for Decision {
    type Error = Error;

    fn try_from(row: DecisionRow) -> Result<Self> {
        Ok(Self {
            kind: row
                .kind
                .parse()
                .map_err(|_| Error::Parse(format!("Unknown decision kind '{}'", row.kind)))?,
            status: row
                .status
                .parse()
                .map_err(|_| Error::Parse(format!("Unknown decision status '{}'", row.status)))?,
            options: serde_json::from_str(&row.options)?,
            created_at: from_millis(row.created_at)?,
            timeout_at: from_millis(row.timeout_at)?,
            resolved_at: row.resolved_at.map(from_millis).transpose()?,
            id: row.id,
            summary: row.summary,
            default_option: row.default_option,
            chosen_option: row.chosen_option,
            resolved_by: row.resolved_by,
            correlation_id: row.correlation_id,
        })
    }
}

const DECISION_COLUMNS: &str = "id, kind, summary, options, default_option, created_at, timeout_at, \
     status, chosen_option, resolved_by, resolved_at, correlation_id";

/// Event types the coordinator reacts to.
fn watched_events() -> EventFilter {
    EventFilter::of_types([
        EventType::FileConflict,
        EventType::StuckDetected,
        EventType::RegressionDetected,
        EventType::ForceRelease,
        EventType::FileUnlocked,
        EventType::ComponentStopped,
    ])
}

/// Applies conflict policy and owns the decision lifecycle.
#[derive(Debug, Clone)]
pub struct Coordinator {
    store: Store,
    events: EventLog,
    locks: LockManager,
    health: HealthManager,
    decision_timeout: Duration,
    stuck_retry_budget: u32,
    victim_retry_budget: u32,
    batch_size: u32,
}

impl Coordinator {
    #[must_use]
    pub fn new(store: Store, health: HealthManager, config: &CoordinationConfig) -> Self {
        Self {
            events: EventLog::new(store.clone()),
            locks: LockManager::with_ttl(store.clone(), config.lock_ttl()),
            store,
            health,
            decision_timeout: config.decision_timeout(),
            stuck_retry_budget: config.stuck_retry_budget,
            victim_retry_budget: config.victim_retry_budget,
            batch_size: config.poll_batch_size,
        }
    }

    /// Create or resume the coordinator's subscription.
    pub async fn start(&self) -> Result<()> {
        self.events
            .subscribe(COORDINATOR_ID, watched_events(), StartAt::Tail)
            .await?;
        Ok(())
    }

    /// Handle pending events, resume unblocked owners, expire overdue decisions.
    ///
    /// Each event is acknowledged only after it was handled, so a failed tick
    /// sees the same event again. Events with unreadable payloads are skipped.
    /// An event that fails [`MAX_EVENT_ATTEMPTS`] times becomes a decision and
    /// is acknowledged so it stops blocking the subscription.
    pub async fn tick(&self) -> Result<TickReport> {
        self.tick_at(Utc::now()).await
    }

    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let mut report = TickReport::default();
        for event in self.events.poll_batch(COORDINATOR_ID, self.batch_size).await? {
            match self.handle(&event).await {
                Ok(Some(decision_id)) => report.decisions_created.push(decision_id),
                Ok(None) => {}
                Err(Error::Parse(message)) => {
                    warn!(seq = event.id, event_type = %event.event_type, error = %message, "Skipping unreadable event");
                }
                Err(e) if e.is_transient() || matches!(e, Error::StoreUnavailable(_)) => return Err(e),
                Err(e) => {
                    let attempts = match self.record_failure(event.id, &e).await {
                        Ok(attempts) => attempts,
                        Err(record_error) => {
                            warn!(seq = event.id, error = %record_error, "Could not record handler failure");
                            return Err(e);
                        }
                    };
                    if attempts < MAX_EVENT_ATTEMPTS {
                        return Err(e);
                    }
                    if let Some(decision_id) = self.escalate_failure(&event, attempts, &e).await? {
                        report.decisions_created.push(decision_id);
                    }
                }
            }
            self.clear_failure(event.id).await?;
            self.events.ack(COORDINATOR_ID, event.id).await?;
            report.handled += 1;
        }
        report.resumed = self.resume_unblocked().await?;
        report.expired = self.expire_decisions_at(now).await?;
        Ok(report)
    }

    async fn record_failure(&self, seq: i64, error: &Error) -> Result<i64> {
        let attempts: i64 = sqlx::query_scalar(
            "INSERT INTO coordinator_failures (seq, attempts, last_error, last_at) VALUES (?, 1, ?, ?)
             ON CONFLICT(seq) DO UPDATE SET attempts = attempts + 1,
               last_error = excluded.last_error, last_at = excluded.last_at
             RETURNING attempts",
        )
        .bind(seq)
        .bind(error.to_string())
        .bind(now_millis())
        .fetch_one(self.store.pool())
        .await?;
        warn!(seq, attempts, error = %error, "Coordinator failed to handle event");
        Ok(attempts)
    }

    async fn clear_failure(&self, seq: i64) -> Result<()> {
        sqlx::query("DELETE FROM coordinator_failures WHERE seq = ?")
            .bind(seq)
            .execute(self.store.pool())
            .await?;
        Ok(())
    }

    async fn escalate_failure(&self, event: &Event, attempts: i64, error: &Error) -> Result<Option<String>> {
        let decision = NewDecision {
            kind: DecisionKind::FailedEvent,
            summary: format!(
                "{} event {} from {} failed {attempts} times: {error}",
                event.event_type, event.id, event.source
            ),
            options: vec![DecisionOption::new(
                "ignore",
                "Acknowledge the event without acting on it",
                vec![DecisionAction::Ignore],
            )],
            default_option: "ignore".into(),
            correlation_id: event.correlation_id.clone(),
        };
        let mut tx = self.store.begin().await?;
        let created = self.insert_decision(&mut tx, &decision, Some(event.id)).await?;
        tx.commit().await?;
        warn!(seq = event.id, event_type = %event.event_type, attempts, "Event handed to operators");
        Ok(created.map(|d| d.id))
    }

    async fn handle(&self, event: &Event) -> Result<Option<String>> {
        debug!(seq = event.id, event_type = %event.event_type, "Coordinator handling event");
        match event.event_type {
            EventType::FileConflict => self.on_file_conflict(event).await,
            EventType::StuckDetected => self.on_stuck(event).await,
            EventType::RegressionDetected => self.on_regression(event).await,
            EventType::ForceRelease => self.on_force_release(event).await,
            // Releases and deaths only matter to the resumption check after the batch.
            _ => Ok(None),
        }
    }

    async fn on_file_conflict(&self, event: &Event) -> Result<Option<String>> {
        let conflict: FileConflict = event.payload_as()?;
        let owners: Vec<String> = conflict.owners.iter().cloned().sorted().unique().collect();
        let priorities = {
            let mut conn = self.store.pool().acquire().await?;
            priority::priorities_of(&mut conn, &owners).await?
        };
        let participants: Vec<Participant> = owners
            .iter()
            .map(|id| Participant {
                id: id.clone(),
                priority: priorities.get(id).copied().unwrap_or(priority::DEFAULT_PRIORITY),
            })
            .collect();

        match plan_conflict(&participants) {
            None => {
                warn!(resource = %conflict.resource_key, "File conflict with fewer than two owners ignored");
                Ok(None)
            }
            Some(ConflictPlan::Pause { winner, losers }) => {
                let mut tx = self.store.begin().await?;
                for loser in &losers {
                    let action = DecisionAction::Pause {
                        owner: loser.clone(),
                        blocked_on: Some(winner.clone()),
                        resource_key: Some(conflict.resource_key.clone()),
                    };
                    let reason = format!("conflict on {} with higher-priority {winner}", conflict.resource_key);
                    apply_action(&mut tx, &action, COORDINATOR_ID, &reason, event.correlation_id.as_deref())
                        .await?;
                }
                tx.commit().await?;
                info!(resource = %conflict.resource_key, winner = %winner, paused = ?losers, "File conflict settled by priority");
                Ok(None)
            }
            Some(ConflictPlan::Ambiguous { owners, default_keep }) => {
                let options = owners
                    .iter()
                    .map(|keep| {
                        let actions = owners
                            .iter()
                            .filter(|o| *o != keep)
                            .map(|o| DecisionAction::Pause {
                                owner: o.clone(),
                                blocked_on: Some(keep.clone()),
                                resource_key: Some(conflict.resource_key.clone()),
                            })
                            .collect();
                        DecisionOption::new(
                            format!("keep-{keep}"),
                            format!("{keep} continues on {}, the others pause", conflict.resource_key),
                            actions,
                        )
                    })
                    .collect();
                let decision = NewDecision {
                    kind: DecisionKind::FileConflict,
                    summary: format!(
                        "Equal-priority conflict on {} between {}",
                        conflict.resource_key,
                        owners.join(", ")
                    ),
                    options,
                    default_option: format!("keep-{default_keep}"),
                    correlation_id: event.correlation_id.clone(),
                };
                let mut tx = self.store.begin().await?;
                let created = self.insert_decision(&mut tx, &decision, Some(event.id)).await?;
                tx.commit().await?;
                Ok(created.map(|d| d.id))
            }
        }
    }

    async fn on_stuck(&self, event: &Event) -> Result<Option<String>> {
        let stuck: StuckDetected = event.payload_as()?;
        let mut tx = self.store.begin().await?;
        let count: i64 = sqlx::query_scalar(
            "INSERT INTO stuck_reports (owner, work_item_id, count, last_at) VALUES (?, ?, 1, ?)
             ON CONFLICT(owner, work_item_id) DO UPDATE SET count = count + 1, last_at = excluded.last_at
             RETURNING count",
        )
        .bind(&stuck.owner)
        .bind(&stuck.work_item_id)
        .bind(now_millis())
        .fetch_one(&mut *tx)
        .await?;

        if count <= i64::from(self.stuck_retry_budget) {
            tx.commit().await?;
            debug!(owner = %stuck.owner, work_item = %stuck.work_item_id, count, "Stuck report within budget");
            return Ok(None);
        }

        sqlx::query("DELETE FROM stuck_reports WHERE owner = ? AND work_item_id = ?")
            .bind(&stuck.owner)
            .bind(&stuck.work_item_id)
            .execute(&mut *tx)
            .await?;
        let owner = stuck.owner.clone();
        let decision = NewDecision {
            kind: DecisionKind::Stuck,
            summary: format!(
                "{owner} stuck on {} {count} times{}",
                stuck.work_item_id,
                stuck.reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default()
            ),
            options: vec![
                DecisionOption::new(
                    "rollback",
                    "Roll back to the latest checkpoint",
                    vec![DecisionAction::Rollback {
                        owner: owner.clone(),
                        checkpoint_id: None,
                        work_item_id: Some(stuck.work_item_id.clone()),
                    }],
                ),
                DecisionOption::new(
                    "deprioritize",
                    "Lower the owner's priority by one",
                    vec![DecisionAction::AdjustPriority {
                        owner: owner.clone(),
                        delta: -1,
                    }],
                ),
                DecisionOption::new(
                    "skip",
                    "Skip the work item",
                    vec![DecisionAction::Skip {
                        owner: owner.clone(),
                        work_item_id: stuck.work_item_id.clone(),
                    }],
                ),
                DecisionOption::new("resume", "Let the owner keep trying", vec![DecisionAction::Resume { owner }]),
            ],
            default_option: "rollback".into(),
            correlation_id: event.correlation_id.clone(),
        };
        let created = self.insert_decision(&mut tx, &decision, Some(event.id)).await?;
        tx.commit().await?;
        Ok(created.map(|d| d.id))
    }

    async fn on_regression(&self, event: &Event) -> Result<Option<String>> {
        let regression: RegressionDetected = event.payload_as()?;
        if regression.auto_rolled_back {
            return Ok(None);
        }
        let Some(blamed) = regression.blamed_loop.clone() else {
            warn!(work_item = %regression.work_item_id, "Regression without a blamed owner left to operators");
            return Ok(None);
        };
        let decision = NewDecision {
            kind: DecisionKind::Regression,
            summary: format!(
                "{} regressed between {} and {}, blamed on {blamed}",
                regression.blamed_test, regression.passing_commit, regression.failing_commit
            ),
            options: vec![
                DecisionOption::new(
                    "rollback",
                    format!("Roll {blamed} back to its latest checkpoint"),
                    vec![DecisionAction::Rollback {
                        owner: blamed,
                        checkpoint_id: None,
                        work_item_id: Some(regression.blamed_test.clone()),
                    }],
                ),
                DecisionOption::new("ignore", "Accept the regression", vec![DecisionAction::Ignore]),
            ],
            default_option: "rollback".into(),
            correlation_id: event.correlation_id.clone(),
        };
        let mut tx = self.store.begin().await?;
        let created = self.insert_decision(&mut tx, &decision, Some(event.id)).await?;
        tx.commit().await?;
        Ok(created.map(|d| d.id))
    }

    async fn on_force_release(&self, event: &Event) -> Result<Option<String>> {
        let release: ForceRelease = event.payload_as()?;
        let mut tx = self.store.begin().await?;
        let count: i64 = sqlx::query_scalar(
            "INSERT INTO victim_counts (owner, count, last_at) VALUES (?, 1, ?)
             ON CONFLICT(owner) DO UPDATE SET count = count + 1, last_at = excluded.last_at
             RETURNING count",
        )
        .bind(&release.victim)
        .bind(now_millis())
        .fetch_one(&mut *tx)
        .await?;

        if count <= i64::from(self.victim_retry_budget) {
            tx.commit().await?;
            return Ok(None);
        }

        sqlx::query("DELETE FROM victim_counts WHERE owner = ?")
            .bind(&release.victim)
            .execute(&mut *tx)
            .await?;
        let decision = NewDecision {
            kind: DecisionKind::RepeatedVictim,
            summary: format!("{} chosen as deadlock victim {count} times", release.victim),
            options: vec![
                DecisionOption::new(
                    "boost",
                    "Raise the victim's priority by one",
                    vec![DecisionAction::AdjustPriority {
                        owner: release.victim.clone(),
                        delta: 1,
                    }],
                ),
                DecisionOption::new("ignore", "Keep priorities as they are", vec![DecisionAction::Ignore]),
            ],
            default_option: "boost".into(),
            correlation_id: event.correlation_id.clone(),
        };
        let created = self.insert_decision(&mut tx, &decision, Some(event.id)).await?;
        tx.commit().await?;
        Ok(created.map(|d| d.id))
    }

    /// Open a decision and publish `decision_needed`.
    pub async fn create_decision(&self, decision: &NewDecision) -> Result<Decision> {
        let mut tx = self.store.begin().await?;
        let created = self.insert_decision(&mut tx, decision, None).await?;
        tx.commit().await?;
        created.ok_or_else(|| Error::Database("decision insert was ignored".into()))
    }

    /// Insert a decision unless one already exists for `source_seq`.
    async fn insert_decision(
        &self,
        conn: &mut SqliteConnection,
        decision: &NewDecision,
        source_seq: Option<i64>,
    ) -> Result<Option<Decision>> {
        if decision.options.is_empty() {
            return Err(Error::InvalidInput("a decision needs at least one option".into()));
        }
        if !decision.options.iter().any(|o| o.key == decision.default_option) {
            return Err(Error::InvalidInput(format!(
                "default option '{}' is not one of the options",
                decision.default_option
            )));
        }

        let id = format!("dec-{}", uuid::Uuid::new_v4().simple());
        let created_at = now_millis();
        let timeout_at = created_at.saturating_add(self.decision_timeout.num_milliseconds());
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO decisions
             (id, kind, summary, options, default_option, created_at, timeout_at, status, correlation_id, source_seq)
             VALUES (?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?)",
        )
        .bind(&id)
        .bind(decision.kind.as_ref())
        .bind(&decision.summary)
        .bind(serde_json::to_string(&decision.options)?)
        .bind(&decision.default_option)
        .bind(created_at)
        .bind(timeout_at)
        .bind(&decision.correlation_id)
        .bind(source_seq)
        .execute(&mut *conn)
        .await?
        .rows_affected();

        if inserted == 0 {
            debug!(source_seq = ?source_seq, "Decision already exists for event");
            return Ok(None);
        }

        let record = Decision {
            id: id.clone(),
            kind: decision.kind,
            summary: decision.summary.clone(),
            options: decision.options.clone(),
            default_option: decision.default_option.clone(),
            created_at: from_millis(created_at)?,
            timeout_at: from_millis(timeout_at)?,
            status: DecisionStatus::Pending,
            chosen_option: None,
            resolved_by: None,
            resolved_at: None,
            correlation_id: decision.correlation_id.clone(),
        };
        let needed = DecisionNeeded {
            decision_id: id.clone(),
            kind: decision.kind.to_string(),
            summary: decision.summary.clone(),
            options: decision.options.iter().map(|o| o.key.clone()).collect(),
            default_option: decision.default_option.clone(),
            timeout_at: record.timeout_at,
        };
        let event = NewEvent::typed(COORDINATOR_ID, &needed)?
            .with_correlation(id.clone())
            .with_priority(EventPriority::High);
        events::append(conn, &event).await?;

        info!(decision = %id, kind = %decision.kind, default = %decision.default_option, "Decision needed");
        Ok(Some(record))
    }

    /// Resolve a pending decision with `choice` and apply it.
    ///
    /// Fails with [`Error::DecisionClosed`] when the decision was already
    /// resolved or timed out; nothing is applied in that case.
    pub async fn resolve(&self, decision_id: &str, choice: &str, resolved_by: &str) -> Result<Decision> {
        let decision = self.decision(decision_id).await?;
        let option = decision
            .option(choice)
            .ok_or_else(|| {
                Error::InvalidInput(format!(
                    "'{choice}' is not an option of {decision_id} (expected one of {})",
                    decision.options.iter().map(|o| o.key.as_str()).join(", ")
                ))
            })?
            .clone();
        self.close(&decision, &option, resolved_by, DecisionStatus::Resolved).await
    }

    /// Apply the default option of every pending decision past its timeout.
    pub async fn expire_decisions(&self) -> Result<Vec<String>> {
        self.expire_decisions_at(Utc::now()).await
    }

    pub async fn expire_decisions_at(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let overdue: Vec<DecisionRow> = sqlx::query_as(&format!(
            "SELECT {DECISION_COLUMNS} FROM decisions
             WHERE status = 'pending' AND timeout_at <= ? ORDER BY created_at"
        ))
        .bind(now.timestamp_millis())
        .fetch_all(self.store.pool())
        .await?;

        let mut expired = Vec::with_capacity(overdue.len());
        for row in overdue {
            let decision = Decision::try_from(row)?;
            let Some(option) = decision.option(&decision.default_option).cloned() else {
                warn!(decision = %decision.id, "Default option missing, decision left pending");
                continue;
            };
            match self.close(&decision, &option, TIMEOUT_RESOLVER, DecisionStatus::TimedOut).await {
                Ok(_) => expired.push(decision.id),
                // Someone answered between the scan and the update.
                Err(Error::DecisionClosed { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(expired)
    }

    async fn close(
        &self,
        decision: &Decision,
        option: &DecisionOption,
        resolved_by: &str,
        status: DecisionStatus,
    ) -> Result<Decision> {
        let resolved_at = now_millis();
        let mut tx = self.store.begin().await?;
        let updated = sqlx::query(
            "UPDATE decisions SET status = ?, chosen_option = ?, resolved_by = ?, resolved_at = ?
             WHERE id = ? AND status = 'pending'",
        )
        .bind(status.as_ref())
        .bind(&option.key)
        .bind(resolved_by)
        .bind(resolved_at)
        .bind(&decision.id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            tx.rollback().await?;
            let current = self.decision(&decision.id).await?;
            return Err(Error::DecisionClosed {
                id: decision.id.clone(),
                status: current.status.to_string(),
            });
        }

        let reason = format!("decision {} chose {}", decision.id, option.key);
        for action in &option.actions {
            apply_action(&mut tx, action, resolved_by, &reason, Some(&decision.id)).await?;
        }
        let resolved = DecisionResolved {
            decision_id: decision.id.clone(),
            chosen_option: option.key.clone(),
            resolved_by: resolved_by.to_string(),
            timed_out: status == DecisionStatus::TimedOut,
        };
        let event = NewEvent::typed(COORDINATOR_ID, &resolved)?.with_correlation(decision.id.clone());
        events::append(&mut tx, &event).await?;
        tx.commit().await?;

        info!(decision = %decision.id, choice = %option.key, by = %resolved_by, status = %status, "Decision closed");
        Ok(Decision {
            status,
            chosen_option: Some(option.key.clone()),
            resolved_by: Some(resolved_by.to_string()),
            resolved_at: Some(from_millis(resolved_at)?),
            ..decision.clone()
        })
    }

    /// Resume paused owners whose blocker released the resource or died.
    pub async fn resume_unblocked(&self) -> Result<Vec<String>> {
        let mut resumed = Vec::new();
        for paused in self.paused_owners().await? {
            let (Some(blocker), Some(resource)) = (&paused.blocked_on, &paused.resource_key) else {
                continue;
            };
            let still_held = self
                .locks
                .lock_state(resource)
                .await?
                .is_some_and(|lock| &lock.holder == blocker);
            let blocker_dead = self
                .health
                .status(blocker)
                .await?
                .is_some_and(|c| c.status == HealthStatus::Dead);
            if still_held && !blocker_dead {
                continue;
            }

            let mut tx = self.store.begin().await?;
            let removed = sqlx::query("DELETE FROM paused_owners WHERE owner = ? AND paused_at = ?")
                .bind(&paused.owner)
                .bind(paused.paused_at.timestamp_millis())
                .execute(&mut *tx)
                .await?
                .rows_affected();
            if removed > 0 {
                let reason = if blocker_dead {
                    format!("{blocker} is dead")
                } else {
                    format!("{blocker} released {resource}")
                };
                events::append_typed(
                    &mut tx,
                    COORDINATOR_ID,
                    &ResumeRequested {
                        target: paused.owner.clone(),
                        reason,
                    },
                )
                .await?;
            }
            tx.commit().await?;
            if removed > 0 {
                info!(owner = %paused.owner, blocker = %blocker, "Owner resumed");
                resumed.push(paused.owner);
            }
        }
        Ok(resumed)
    }

    /// Operator pause. Stays until an operator resumes the owner.
    pub async fn pause(&self, owner: &str, reason: &str, by: &str) -> Result<()> {
        self.apply_single(
            &DecisionAction::Pause {
                owner: owner.to_string(),
                blocked_on: None,
                resource_key: None,
            },
            by,
            reason,
        )
        .await
    }

    pub async fn resume(&self, owner: &str, by: &str) -> Result<()> {
        self.apply_single(&DecisionAction::Resume { owner: owner.to_string() }, by, "operator resume")
            .await
    }

    pub async fn skip(&self, owner: &str, work_item_id: &str, by: &str) -> Result<()> {
        self.apply_single(
            &DecisionAction::Skip {
                owner: owner.to_string(),
                work_item_id: work_item_id.to_string(),
            },
            by,
            "operator skip",
        )
        .await
    }

    /// Set an owner's priority, returning the previous one.
    pub async fn set_priority(&self, owner: &str, priority: i64, by: &str) -> Result<i64> {
        let mut tx = self.store.begin().await?;
        let previous = priority::set_priority(&mut tx, owner, priority, by).await?;
        tx.commit().await?;
        Ok(previous)
    }

    async fn apply_single(&self, action: &DecisionAction, by: &str, reason: &str) -> Result<()> {
        let mut tx = self.store.begin().await?;
        apply_action(&mut tx, action, by, reason, None).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn decision(&self, decision_id: &str) -> Result<Decision> {
        let row: Option<DecisionRow> =
            sqlx::query_as(&format!("SELECT {DECISION_COLUMNS} FROM decisions WHERE id = ?"))
                .bind(decision_id)
                .fetch_optional(self.store.pool())
                .await?;
        row.ok_or_else(|| Error::NotFound(format!("decision '{decision_id}'")))
            .and_then(Decision::try_from)
    }

    pub async fn pending_decisions(&self) -> Result<Vec<Decision>> {
        self.decisions(Some(DecisionStatus::Pending)).await
    }

    /// Decisions, newest first, optionally filtered by status.
    pub async fn decisions(&self, status: Option<DecisionStatus>) -> Result<Vec<Decision>> {
        let rows: Vec<DecisionRow> = match status {
            Some(status) => {
                sqlx::query_as(&format!(
                    "SELECT {DECISION_COLUMNS} FROM decisions WHERE status = ? ORDER BY created_at DESC, id"
                ))
                .bind(status.as_ref())
                .fetch_all(self.store.pool())
                .await?
            }
            None => {
                sqlx::query_as(&format!(
                    "SELECT {DECISION_COLUMNS} FROM decisions ORDER BY created_at DESC, id"
                ))
                .fetch_all(self.store.pool())
                .await?
            }
        };
        rows.into_iter().map(Decision::try_from).collect()
    }

    pub async fn paused_owners(&self) -> Result<Vec<PausedOwner>> {
        let rows: Vec<(String, Option<String>, Option<String>, String, i64)> = sqlx::query_as(
            "SELECT owner, blocked_on, resource_key, reason, paused_at FROM paused_owners ORDER BY paused_at, owner",
        )
        .fetch_all(self.store.pool())
        .await?;
        rows.into_iter()
            .map(|(owner, blocked_on, resource_key, reason, paused_at)| {
                Ok(PausedOwner {
                    owner,
                    blocked_on,
                    resource_key,
                    reason,
                    paused_at: from_millis(paused_at)?,
                })
            })
            .collect()
    }
}

/// Apply one action inside the caller's transaction, publishing its directive.
async fn apply_action(
    conn: &mut SqliteConnection,
    action: &DecisionAction,
    by: &str,
    reason: &str,
    correlation_id: Option<&str>,
) -> Result<()> {
    let event = match action {
        DecisionAction::Pause {
            owner,
            blocked_on,
            resource_key,
        } => {
            sqlx::query(
                "INSERT INTO paused_owners (owner, blocked_on, resource_key, reason, paused_at)
                 VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT(owner) DO UPDATE SET blocked_on = excluded.blocked_on,
                   resource_key = excluded.resource_key, reason = excluded.reason, paused_at = excluded.paused_at",
            )
            .bind(owner)
            .bind(blocked_on)
            .bind(resource_key)
            .bind(reason)
            .bind(now_millis())
            .execute(&mut *conn)
            .await?;
            NewEvent::typed(
                by,
                &PauseRequested {
                    target: owner.clone(),
                    reason: reason.to_string(),
                    blocked_on: blocked_on.clone(),
                    resource_key: resource_key.clone(),
                },
            )?
        }
        DecisionAction::Resume { owner } => {
            sqlx::query("DELETE FROM paused_owners WHERE owner = ?")
                .bind(owner)
                .execute(&mut *conn)
                .await?;
            NewEvent::typed(
                by,
                &ResumeRequested {
                    target: owner.clone(),
                    reason: reason.to_string(),
                },
            )?
        }
        DecisionAction::Rollback {
            owner,
            checkpoint_id,
            work_item_id,
        } => {
            let checkpoint_id = match checkpoint_id {
                Some(id) => Some(id.clone()),
                None => checkpoint::latest_active_id(conn, owner).await?,
            };
            NewEvent::typed(
                by,
                &RollbackTriggered {
                    target: owner.clone(),
                    checkpoint_id,
                    reason: reason.to_string(),
                    work_item_id: work_item_id.clone(),
                },
            )?
            .with_priority(EventPriority::High)
        }
        DecisionAction::SetPriority { owner, priority } => {
            priority::set_priority(conn, owner, *priority, by).await?;
            return Ok(());
        }
        DecisionAction::AdjustPriority { owner, delta } => {
            let current = priority::priority_of(conn, owner).await?;
            priority::set_priority(conn, owner, current.saturating_add(*delta), by).await?;
            return Ok(());
        }
        DecisionAction::Skip { owner, work_item_id } => {
            sqlx::query("DELETE FROM stuck_reports WHERE owner = ? AND work_item_id = ?")
                .bind(owner)
                .bind(work_item_id)
                .execute(&mut *conn)
                .await?;
            NewEvent::typed(
                by,
                &SkipRequested {
                    target: owner.clone(),
                    work_item_id: work_item_id.clone(),
                    reason: reason.to_string(),
                },
            )?
        }
        DecisionAction::Ignore => return Ok(()),
    };
    let event = match correlation_id {
        Some(id) => event.with_correlation(id),
        None => event,
    };
    events::append(conn, &event).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{health::HealthThresholds, locks::AcquireRequest};

    struct Fixture {
        coordinator: Coordinator,
        log: EventLog,
        locks: LockManager,
        store: Store,
    }

    async fn fixture() -> Result<Fixture> {
        let store = Store::in_memory().await?;
        let config = CoordinationConfig {
            stuck_retry_budget: 2,
            victim_retry_budget: 1,
            ..CoordinationConfig::default()
        };
        let health = HealthManager::new(store.clone(), HealthThresholds::default());
        let coordinator = Coordinator::new(store.clone(), health, &config);
        coordinator.start().await?;
        Ok(Fixture {
            coordinator,
            log: EventLog::new(store.clone()),
            locks: LockManager::new(store.clone()),
            store,
        })
    }

    fn participant(id: &str, priority: i64) -> Participant {
        Participant {
            id: id.into(),
            priority,
        }
    }

    async fn directives<P: events::EventPayload>(log: &EventLog, event_type: EventType) -> Result<Vec<P>> {
        log.recent(&EventFilter::of_types([event_type]), 100)
            .await?
            .iter()
            .map(Event::payload_as::<P>)
            .collect()
    }

    #[test]
    fn higher_priority_keeps_working() {
        let plan = plan_conflict(&[participant("loop-1", 1), participant("loop-2", 5)]);
        assert_eq!(
            plan,
            Some(ConflictPlan::Pause {
                winner: "loop-2".into(),
                losers: vec!["loop-1".into()],
            })
        );
    }

    #[test]
    fn equal_priority_is_ambiguous_with_tie_break_default() {
        let plan = plan_conflict(&[participant("loop-2", 0), participant("loop-1", 0)]);
        assert_eq!(
            plan,
            Some(ConflictPlan::Ambiguous {
                owners: vec!["loop-2".into(), "loop-1".into()],
                default_keep: "loop-1".into(),
            })
        );
        assert_eq!(plan_conflict(&[participant("loop-1", 0)]), None);
    }

    #[tokio::test]
    async fn conflict_pauses_lower_priority_and_resumes_on_release() -> Result<()> {
        let fx = fixture().await?;
        fx.coordinator.set_priority("loop-1", 5, "operator").await?;
        fx.locks.acquire(&AcquireRequest::new("server/api.ts", "loop-1")).await?;
        fx.log
            .publish_typed(
                "loop-2",
                &FileConflict {
                    resource_key: "server/api.ts".into(),
                    owners: vec!["loop-1".into(), "loop-2".into()],
                },
            )
            .await?;

        let report = fx.coordinator.tick().await?;
        assert_eq!(report.handled, 1);
        assert!(report.resumed.is_empty());
        let pauses: Vec<PauseRequested> = directives(&fx.log, EventType::PauseRequested).await?;
        assert_eq!(pauses.len(), 1);
        assert_eq!(pauses[0].target, "loop-2");
        assert_eq!(pauses[0].blocked_on.as_deref(), Some("loop-1"));

        fx.locks.release("server/api.ts", "loop-1").await?;
        let report = fx.coordinator.tick().await?;
        assert_eq!(report.resumed, vec!["loop-2".to_string()]);
        assert!(fx.coordinator.paused_owners().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn equal_priority_conflict_opens_one_decision() -> Result<()> {
        let fx = fixture().await?;
        fx.log
            .publish_typed(
                "loop-1",
                &FileConflict {
                    resource_key: "server/api.ts".into(),
                    owners: vec!["loop-1".into(), "loop-2".into()],
                },
            )
            .await?;
        let event = fx.log.recent(&EventFilter::of_types([EventType::FileConflict]), 1).await?;

        // Redelivery of the same event must not duplicate the decision.
        assert!(fx.coordinator.handle(&event[0]).await?.is_some());
        assert!(fx.coordinator.handle(&event[0]).await?.is_none());

        let pending = fx.coordinator.pending_decisions().await?;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, DecisionKind::FileConflict);
        assert_eq!(pending[0].default_option, "keep-loop-1");
        Ok(())
    }

    #[tokio::test]
    async fn resolving_twice_fails_and_applies_once() -> Result<()> {
        let fx = fixture().await?;
        let decision = fx
            .coordinator
            .create_decision(&NewDecision {
                kind: DecisionKind::Manual,
                summary: "pause loop-3?".into(),
                options: vec![
                    DecisionOption::new(
                        "pause",
                        "pause it",
                        vec![DecisionAction::Pause {
                            owner: "loop-3".into(),
                            blocked_on: None,
                            resource_key: None,
                        }],
                    ),
                    DecisionOption::new("ignore", "leave it", vec![DecisionAction::Ignore]),
                ],
                default_option: "ignore".into(),
                correlation_id: None,
            })
            .await?;

        assert!(matches!(
            fx.coordinator.resolve(&decision.id, "nope", "alice").await,
            Err(Error::InvalidInput(_))
        ));
        let resolved = fx.coordinator.resolve(&decision.id, "pause", "alice").await?;
        assert_eq!(resolved.status, DecisionStatus::Resolved);

        let again = fx.coordinator.resolve(&decision.id, "ignore", "bob").await;
        assert!(matches!(again, Err(Error::DecisionClosed { .. })));
        let pauses: Vec<PauseRequested> = directives(&fx.log, EventType::PauseRequested).await?;
        assert_eq!(pauses.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn stuck_beyond_budget_times_out_to_rollback() -> Result<()> {
        let fx = fixture().await?;
        for _ in 0..3 {
            fx.log
                .publish_typed(
                    "loop-1",
                    &StuckDetected {
                        owner: "loop-1".into(),
                        work_item_id: "CP-UFS-001".into(),
                        reason: Some("build keeps failing".into()),
                    },
                )
                .await?;
        }
        let report = fx.coordinator.tick().await?;
        assert_eq!(report.decisions_created.len(), 1);

        let later = Utc::now() + Duration::hours(2);
        let report = fx.coordinator.tick_at(later).await?;
        assert_eq!(report.expired, report_ids(&fx.coordinator).await?);

        let decision = fx.coordinator.decision(&report.expired[0]).await?;
        assert_eq!(decision.status, DecisionStatus::TimedOut);
        assert_eq!(decision.resolved_by.as_deref(), Some(TIMEOUT_RESOLVER));
        let rollbacks: Vec<RollbackTriggered> = directives(&fx.log, EventType::RollbackTriggered).await?;
        assert_eq!(rollbacks.len(), 1);
        assert_eq!(rollbacks[0].target, "loop-1");
        Ok(())
    }

    async fn report_ids(coordinator: &Coordinator) -> Result<Vec<String>> {
        Ok(coordinator
            .decisions(Some(DecisionStatus::TimedOut))
            .await?
            .into_iter()
            .map(|d| d.id)
            .collect())
    }

    #[tokio::test]
    async fn repeated_victim_gets_boost_decision() -> Result<()> {
        let fx = fixture().await?;
        for _ in 0..2 {
            fx.log
                .publish_typed(
                    "deadlock-detector",
                    &ForceRelease {
                        victim: "loop-2".into(),
                        cycle: vec!["loop-1".into(), "loop-2".into()],
                        held_locks: vec!["Y".into()],
                        must_rollback: true,
                        checkpoint_id: None,
                        victim_priority: 0,
                    },
                )
                .await?;
        }
        let report = fx.coordinator.tick().await?;
        let decision = fx.coordinator.decision(&report.decisions_created[0]).await?;
        assert_eq!(decision.kind, DecisionKind::RepeatedVictim);

        fx.coordinator.resolve(&decision.id, "boost", "operator").await?;
        let mut conn = fx.store.pool().acquire().await?;
        assert_eq!(priority::priority_of(&mut conn, "loop-2").await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn deprioritize_applies_to_priority_at_resolution() -> Result<()> {
        let fx = fixture().await?;
        fx.coordinator.set_priority("loop-1", 2, "operator").await?;
        for _ in 0..3 {
            fx.log
                .publish_typed(
                    "loop-1",
                    &StuckDetected {
                        owner: "loop-1".into(),
                        work_item_id: "CP-UFS-001".into(),
                        reason: None,
                    },
                )
                .await?;
        }
        let report = fx.coordinator.tick().await?;
        let decision_id = report.decisions_created[0].clone();

        // Raised after the decision opened; lowering must start from here.
        fx.coordinator.set_priority("loop-1", 7, "operator").await?;
        fx.coordinator.resolve(&decision_id, "deprioritize", "operator").await?;

        let mut conn = fx.store.pool().acquire().await?;
        assert_eq!(priority::priority_of(&mut conn, "loop-1").await?, 6);
        Ok(())
    }

    #[tokio::test]
    async fn event_failing_repeatedly_is_escalated_and_acknowledged() -> Result<()> {
        let fx = fixture().await?;
        sqlx::query("DROP TABLE stuck_reports").execute(fx.store.pool()).await?;
        fx.log
            .publish_typed(
                "loop-1",
                &StuckDetected {
                    owner: "loop-1".into(),
                    work_item_id: "CP-UFS-001".into(),
                    reason: None,
                },
            )
            .await?;

        for _ in 1..MAX_EVENT_ATTEMPTS {
            assert!(matches!(fx.coordinator.tick().await, Err(Error::Database(_))));
        }
        let report = fx.coordinator.tick().await?;
        assert_eq!(report.handled, 1);
        assert_eq!(report.decisions_created.len(), 1);
        let decision = fx.coordinator.decision(&report.decisions_created[0]).await?;
        assert_eq!(decision.kind, DecisionKind::FailedEvent);
        assert_eq!(decision.default_option, "ignore");

        let needed: Vec<DecisionNeeded> = directives(&fx.log, EventType::DecisionNeeded).await?;
        assert_eq!(needed.len(), 1);
        assert_eq!(fx.coordinator.tick().await?.handled, 0);
        Ok(())
    }

    #[tokio::test]
    async fn operator_pause_needs_operator_resume() -> Result<()> {
        let fx = fixture().await?;
        fx.coordinator.pause("loop-4", "investigating", "operator").await?;
        assert!(fx.coordinator.resume_unblocked().await?.is_empty());
        fx.coordinator.resume("loop-4", "operator").await?;
        assert!(fx.coordinator.paused_owners().await?.is_empty());
        Ok(())
    }
}
