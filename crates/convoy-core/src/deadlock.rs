//! Wait-for graph and deadlock detection.
//!
//! The graph is never stored. Each detection cycle rebuilds it from the pending
//! request table joined with the live lock table, then cycle detection runs as a
//! pure function over that snapshot. A detected cycle yields exactly one
//! `force_release` naming a victim; the victim rolls itself back.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use petgraph::{algo::tarjan_scc, graphmap::DiGraphMap};
use serde::Serialize;
use sqlx::SqliteConnection;
use tracing::{debug, warn};

use crate::{
    checkpoint,
    events::{self, payloads::ForceRelease, EventPriority, NewEvent},
    priority,
    store::{from_millis, now_millis, Store},
    Result,
};

/// Source identity used for detector events.
pub const DETECTOR_SOURCE: &str = "deadlock-detector";

/// Edge `waiter -> holder`: the waiter is blocked on a resource the holder owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WaitEdge {
    pub waiter: String,
    pub holder: String,
    pub resource_key: String,
    pub recorded_at: DateTime<Utc>,
}

/// Cycle participant as seen by a victim policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub id: String,
    /// Larger is more important.
    pub priority: i64,
}

/// Chooses which cycle participant gives way.
pub trait VictimPolicy: Send + Sync + std::fmt::Debug {
    /// Pick the victim. `None` only for an empty slice.
    fn select(&self, participants: &[Participant]) -> Option<String>;
}

/// Lowest priority loses; equal priorities lose to the lexicographically
/// greatest identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct LowestPriorityPolicy;

impl VictimPolicy for LowestPriorityPolicy {
    fn select(&self, participants: &[Participant]) -> Option<String> {
        participants
            .iter()
            .min_by(|a, b| a.priority.cmp(&b.priority).then_with(|| b.id.cmp(&a.id)))
            .map(|p| p.id.clone())
    }
}

/// Find every deadlocked participant set in a wait-for graph.
///
/// Each returned cycle is a strongly connected component with more than one
/// member, or a single member waiting on itself. Members are sorted.
#[must_use]
pub fn find_cycles(edges: &[WaitEdge]) -> Vec<Vec<String>> {
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    for edge in edges {
        graph.add_edge(edge.waiter.as_str(), edge.holder.as_str(), ());
    }

    let mut cycles: Vec<Vec<String>> = tarjan_scc(&graph)
        .into_iter()
        .filter(|scc| match scc.as_slice() {
            [single] => graph.contains_edge(*single, *single),
            members => members.len() > 1,
        })
        .map(|scc| {
            let mut members: Vec<String> = scc.into_iter().map(ToString::to_string).collect();
            members.sort();
            members
        })
        .collect();
    cycles.sort();
    cycles
}

/// Stable identity for a participant set.
#[must_use]
pub fn cycle_key(cycle: &[String]) -> String {
    cycle.join(",")
}

/// Outcome for one detected cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Deadlock {
    pub cycle: Vec<String>,
    pub victim: String,
    pub held_locks: Vec<String>,
    pub checkpoint_id: Option<String>,
    /// Sequence of the `force_release` event, when this pass emitted it.
    pub event_seq: Option<i64>,
}

/// Periodic cycle detector over the shared store.
#[derive(Debug)]
pub struct DeadlockDetector {
    store: Store,
    policy: Box<dyn VictimPolicy>,
    pending_ttl: Duration,
}

impl DeadlockDetector {
    #[must_use]
    pub fn new(store: Store, pending_ttl: Duration) -> Self {
        Self::with_policy(store, pending_ttl, Box::new(LowestPriorityPolicy))
    }

    #[must_use]
    pub fn with_policy(store: Store, pending_ttl: Duration, policy: Box<dyn VictimPolicy>) -> Self {
        Self {
            store,
            policy,
            pending_ttl,
        }
    }

    /// Current wait-for edges: fresh pending requests against live locks held by someone else.
    pub async fn wait_edges(&self) -> Result<Vec<WaitEdge>> {
        let mut conn = self.store.pool().acquire().await?;
        load_edges(&mut conn, self.pending_ttl).await
    }

    /// Run one detection cycle.
    ///
    /// Emits one `force_release` per newly observed cycle. Cycles already
    /// signalled are reported with `event_seq = None`; records of cycles that
    /// no longer exist are cleared so a re-formed cycle is signalled again.
    pub async fn detect(&self) -> Result<Vec<Deadlock>> {
        let mut tx = self.store.begin().await?;

        // Placeholder write so the transaction holds the write lock while it reads.
        sqlx::query("DELETE FROM deadlock_resolutions WHERE emitted_at < 0")
            .execute(&mut *tx)
            .await?;

        let edges = load_edges(&mut tx, self.pending_ttl).await?;
        let cycles = find_cycles(&edges);
        let keys: BTreeSet<String> = cycles.iter().map(|c| cycle_key(c)).collect();

        let recorded: Vec<String> = sqlx::query_scalar("SELECT cycle_key FROM deadlock_resolutions")
            .fetch_all(&mut *tx)
            .await?;
        for stale in recorded.iter().filter(|k| !keys.contains(*k)) {
            sqlx::query("DELETE FROM deadlock_resolutions WHERE cycle_key = ?")
                .bind(stale)
                .execute(&mut *tx)
                .await?;
            debug!(cycle = %stale, "Cycle dissolved");
        }

        let mut deadlocks = Vec::with_capacity(cycles.len());
        for cycle in cycles {
            deadlocks.push(self.resolve_cycle(&mut tx, cycle).await?);
        }
        tx.commit().await?;
        Ok(deadlocks)
    }

    async fn resolve_cycle(&self, conn: &mut SqliteConnection, cycle: Vec<String>) -> Result<Deadlock> {
        let key = cycle_key(&cycle);
        let priorities = priority::priorities_of(conn, &cycle).await?;
        let participants: Vec<Participant> = cycle
            .iter()
            .map(|id| Participant {
                id: id.clone(),
                priority: priorities.get(id).copied().unwrap_or(priority::DEFAULT_PRIORITY),
            })
            .collect();

        let existing: Option<String> =
            sqlx::query_scalar("SELECT victim FROM deadlock_resolutions WHERE cycle_key = ?")
                .bind(&key)
                .fetch_optional(&mut *conn)
                .await?;

        let victim = match existing.clone() {
            Some(victim) => victim,
            None => self
                .policy
                .select(&participants)
                .or_else(|| cycle.first().cloned())
                .unwrap_or_default(),
        };

        let held_locks: Vec<String> = sqlx::query_scalar(
            "SELECT resource_key FROM locks WHERE holder = ? AND expires_at >= ? ORDER BY resource_key",
        )
        .bind(&victim)
        .bind(now_millis())
        .fetch_all(&mut *conn)
        .await?;
        let checkpoint_id = checkpoint::latest_active_id(conn, &victim).await?;

        let event_seq = if existing.is_none() {
            sqlx::query(
                "INSERT INTO deadlock_resolutions (cycle_key, victim, emitted_at) VALUES (?, ?, ?)",
            )
            .bind(&key)
            .bind(&victim)
            .bind(now_millis())
            .execute(&mut *conn)
            .await?;

            let payload = ForceRelease {
                victim: victim.clone(),
                cycle: cycle.clone(),
                held_locks: held_locks.clone(),
                must_rollback: true,
                checkpoint_id: checkpoint_id.clone(),
                victim_priority: priorities.get(&victim).copied().unwrap_or_default(),
            };
            let event = NewEvent::typed(DETECTOR_SOURCE, &payload)?
                .with_priority(EventPriority::Critical)
                .with_correlation(key.clone());
            let seq = events::append(conn, &event).await?;
            warn!(cycle = %key, victim = %victim, held = held_locks.len(), "Deadlock detected");
            Some(seq)
        } else {
            None
        };

        Ok(Deadlock {
            cycle,
            victim,
            held_locks,
            checkpoint_id,
            event_seq,
        })
    }
}

async fn load_edges(conn: &mut SqliteConnection, pending_ttl: Duration) -> Result<Vec<WaitEdge>> {
    let now = now_millis();
    let rows: Vec<(String, String, String, i64)> = sqlx::query_as(
        "SELECT r.waiter, l.holder, r.resource_key, r.recorded_at
         FROM lock_requests r
         JOIN locks l ON l.resource_key = r.resource_key
         WHERE l.expires_at >= ? AND r.recorded_at > ? AND l.holder != r.waiter
         ORDER BY r.waiter, r.resource_key",
    )
    .bind(now)
    .bind(now.saturating_sub(pending_ttl.num_milliseconds()))
    .fetch_all(&mut *conn)
    .await?;

    rows.into_iter()
        .map(|(waiter, holder, resource_key, recorded_at)| {
            Ok(WaitEdge {
                waiter,
                holder,
                resource_key,
                recorded_at: from_millis(recorded_at)?,
            })
        })
        .collect()
}
