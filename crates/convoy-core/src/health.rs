//! Component heartbeats and degradation transitions.
//!
//! Status is a pure function of the time since the last heartbeat. The
//! `announced_status` column remembers what was last published so each
//! transition is announced exactly once, guarded by compare-and-set.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    events::{
        self,
        payloads::{ComponentDegraded, ComponentStarted, ComponentStopped, StopReason},
        EventPriority, NewEvent,
    },
    store::{from_millis, now_millis, Store},
    Error, Result,
};

/// Source identity used for health events.
pub const HEALTH_SOURCE: &str = "health-manager";

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
pub enum HealthStatus {
    Healthy,
    Degraded,
    Dead,
}

/// Silence thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthThresholds {
    pub degraded_after: Duration,
    pub dead_after: Duration,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            degraded_after: Duration::seconds(120),
            dead_after: Duration::seconds(600),
        }
    }
}

/// Status after `elapsed` of silence.
#[must_use]
pub fn status_for(elapsed: Duration, thresholds: &HealthThresholds) -> HealthStatus {
    if elapsed <= thresholds.degraded_after {
        HealthStatus::Healthy
    } else if elapsed <= thresholds.dead_after {
        HealthStatus::Degraded
    } else {
        HealthStatus::Dead
    }
}

/// One row of the component health table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentHealth {
    pub component: String,
    pub pid: Option<u32>,
    pub last_heartbeat: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    /// Status computed from elapsed time at read.
    pub status: HealthStatus,
    /// Status most recently published.
    pub announced: HealthStatus,
}

/// A published status change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthTransition {
    pub component: String,
    pub from: HealthStatus,
    pub to: HealthStatus,
}

type HealthRow = (String, Option<i64>, i64, String, i64);

/// Heartbeat tracking for loops and supervisory components.
#[derive(Debug, Clone)]
pub struct HealthManager {
    store: Store,
    thresholds: HealthThresholds,
}

impl HealthManager {
    #[must_use]
    pub const fn new(store: Store, thresholds: HealthThresholds) -> Self {
        Self { store, thresholds }
    }

    #[must_use]
    pub const fn thresholds(&self) -> &HealthThresholds {
        &self.thresholds
    }

    /// Record a heartbeat.
    ///
    /// The first heartbeat of a component, or the first after it was declared
    /// dead, publishes `component_started`. Recovering from degraded publishes
    /// nothing beyond the heartbeat itself.
    pub async fn heartbeat(&self, component: &str, pid: Option<u32>) -> Result<()> {
        if component.trim().is_empty() {
            return Err(Error::InvalidInput("component cannot be empty".into()));
        }
        let now = now_millis();
        let pid = pid.map(i64::from);
        let mut tx = self.store.begin().await?;

        let restarted = sqlx::query(
            "UPDATE component_health
             SET last_heartbeat = ?, pid = COALESCE(?, pid), announced_status = 'healthy', started_at = ?
             WHERE component = ? AND announced_status = 'dead'",
        )
        .bind(now)
        .bind(pid)
        .bind(now)
        .bind(component)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;

        let known = restarted
            || sqlx::query(
                "UPDATE component_health
                 SET last_heartbeat = ?, pid = COALESCE(?, pid), announced_status = 'healthy'
                 WHERE component = ?",
            )
            .bind(now)
            .bind(pid)
            .bind(component)
            .execute(&mut *tx)
            .await?
            .rows_affected()
                > 0;

        if !known {
            sqlx::query(
                "INSERT INTO component_health (component, pid, last_heartbeat, announced_status, started_at)
                 VALUES (?, ?, ?, 'healthy', ?)",
            )
            .bind(component)
            .bind(pid)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        if restarted || !known {
            let payload = ComponentStarted {
                component: component.to_string(),
                pid: pid.and_then(|p| u32::try_from(p).ok()),
                restarted,
            };
            events::append_typed(&mut tx, component, &payload).await?;
            info!(component = %component, restarted, "Component started");
        }
        tx.commit().await?;
        Ok(())
    }

    /// Health of one component.
    pub async fn status(&self, component: &str) -> Result<Option<ComponentHealth>> {
        let row: Option<HealthRow> = sqlx::query_as(
            "SELECT component, pid, last_heartbeat, announced_status, started_at
             FROM component_health WHERE component = ?",
        )
        .bind(component)
        .fetch_optional(self.store.pool())
        .await?;
        row.map(|row| self.decode(row, Utc::now())).transpose()
    }

    /// The whole component health table.
    pub async fn table(&self) -> Result<Vec<ComponentHealth>> {
        self.table_at(Utc::now()).await
    }

    async fn table_at(&self, now: DateTime<Utc>) -> Result<Vec<ComponentHealth>> {
        let rows: Vec<HealthRow> = sqlx::query_as(
            "SELECT component, pid, last_heartbeat, announced_status, started_at
             FROM component_health ORDER BY component",
        )
        .fetch_all(self.store.pool())
        .await?;
        rows.into_iter().map(|row| self.decode(row, now)).collect()
    }

    /// Components whose silence exceeds the dead threshold.
    pub async fn dead_components(&self) -> Result<Vec<ComponentHealth>> {
        Ok(self
            .table()
            .await?
            .into_iter()
            .filter(|c| c.status == HealthStatus::Dead)
            .collect())
    }

    /// Evaluate every component now and publish transitions.
    pub async fn check(&self) -> Result<Vec<HealthTransition>> {
        self.check_at(Utc::now()).await
    }

    /// Evaluate every component as of `now` and publish transitions.
    ///
    /// `component_degraded` is published once when a healthy component goes
    /// silent; `component_stopped` once when it is declared dead.
    pub async fn check_at(&self, now: DateTime<Utc>) -> Result<Vec<HealthTransition>> {
        let mut transitions = Vec::new();
        for component in self.table_at(now).await? {
            let worse = matches!(
                (component.announced, component.status),
                (HealthStatus::Healthy, HealthStatus::Degraded | HealthStatus::Dead)
                    | (HealthStatus::Degraded, HealthStatus::Dead)
            );
            if !worse {
                continue;
            }
            if let Some(transition) = self.announce(&component, now).await? {
                transitions.push(transition);
            }
        }
        Ok(transitions)
    }

    async fn announce(
        &self,
        component: &ComponentHealth,
        now: DateTime<Utc>,
    ) -> Result<Option<HealthTransition>> {
        let mut tx = self.store.begin().await?;
        // Only wins if no heartbeat arrived and nobody else announced in between.
        let updated = sqlx::query(
            "UPDATE component_health SET announced_status = ?
             WHERE component = ? AND announced_status = ? AND last_heartbeat = ?",
        )
        .bind(component.status.as_ref())
        .bind(&component.component)
        .bind(component.announced.as_ref())
        .bind(component.last_heartbeat.timestamp_millis())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            tx.commit().await?;
            return Ok(None);
        }

        let silent_ms = (now - component.last_heartbeat).num_milliseconds();
        let event = if component.status == HealthStatus::Dead {
            NewEvent::typed(
                HEALTH_SOURCE,
                &ComponentStopped {
                    component: component.component.clone(),
                    reason: StopReason::HeartbeatTimeout,
                    last_heartbeat: component.last_heartbeat,
                },
            )?
        } else {
            NewEvent::typed(
                HEALTH_SOURCE,
                &ComponentDegraded {
                    component: component.component.clone(),
                    last_heartbeat: component.last_heartbeat,
                    silent_ms,
                    detail: None,
                },
            )?
        };
        events::append(&mut tx, &event.with_priority(EventPriority::High)).await?;
        tx.commit().await?;

        warn!(
            component = %component.component,
            from = %component.announced,
            to = %component.status,
            silent_ms,
            "Component health changed"
        );
        Ok(Some(HealthTransition {
            component: component.component.clone(),
            from: component.announced,
            to: component.status,
        }))
    }

    /// Publish a degradation detected by the component itself (for example a
    /// supervisor that lost its store), without touching the health row.
    pub async fn report_degraded(&self, component: &str, detail: &str) -> Result<i64> {
        let payload = ComponentDegraded {
            component: component.to_string(),
            last_heartbeat: Utc::now(),
            silent_ms: 0,
            detail: Some(detail.to_string()),
        };
        let event = NewEvent::typed(component, &payload)?.with_priority(EventPriority::High);
        let mut conn = self.store.pool().acquire().await?;
        events::append(&mut conn, &event).await
    }

    /// Graceful shutdown: remove the component and publish `component_stopped`.
    pub async fn deregister(&self, component: &str) -> Result<bool> {
        let mut tx = self.store.begin().await?;
        let last: Option<i64> = sqlx::query_scalar(
            "DELETE FROM component_health WHERE component = ? RETURNING last_heartbeat",
        )
        .bind(component)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(last) = last else {
            tx.commit().await?;
            return Ok(false);
        };
        events::append_typed(
            &mut tx,
            component,
            &ComponentStopped {
                component: component.to_string(),
                reason: StopReason::Shutdown,
                last_heartbeat: from_millis(last)?,
            },
        )
        .await?;
        tx.commit().await?;
        info!(component = %component, "Component deregistered");
        Ok(true)
    }

    fn decode(&self, row: HealthRow, now: DateTime<Utc>) -> Result<ComponentHealth> {
        let (component, pid, last_heartbeat, announced, started_at) = row;
        let last_heartbeat = from_millis(last_heartbeat)?;
        Ok(ComponentHealth {
            component,
            pid: pid.and_then(|p| u32::try_from(p).ok()),
            last_heartbeat,
            started_at: from_millis(started_at)?,
            status: status_for(now - last_heartbeat, &self.thresholds),
            announced: announced
                .parse()
                .map_err(|_| Error::Parse(format!("Unknown health status '{announced}'")))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventFilter, EventLog, EventType};

    fn thresholds() -> HealthThresholds {
        HealthThresholds {
            degraded_after: Duration::seconds(2),
            dead_after: Duration::seconds(10),
        }
    }

    async fn setup() -> Result<(HealthManager, EventLog)> {
        let store = Store::in_memory().await?;
        Ok((HealthManager::new(store.clone(), thresholds()), EventLog::new(store)))
    }

    async fn count(log: &EventLog, event_type: EventType) -> Result<usize> {
        Ok(log.recent(&EventFilter::of_types([event_type]), 100).await?.len())
    }

    #[test]
    fn status_boundaries() {
        let t = thresholds();
        assert_eq!(status_for(Duration::seconds(2), &t), HealthStatus::Healthy);
        assert_eq!(status_for(Duration::milliseconds(2001), &t), HealthStatus::Degraded);
        assert_eq!(status_for(Duration::seconds(10), &t), HealthStatus::Degraded);
        assert_eq!(status_for(Duration::seconds(11), &t), HealthStatus::Dead);
    }

    #[tokio::test]
    async fn first_heartbeat_announces_start() -> Result<()> {
        let (health, log) = setup().await?;
        health.heartbeat("monitor", Some(42)).await?;
        health.heartbeat("monitor", None).await?;
        assert_eq!(count(&log, EventType::ComponentStarted).await?, 1);
        assert_eq!(health.status("monitor").await?.and_then(|c| c.pid), Some(42));
        Ok(())
    }

    #[tokio::test]
    async fn degraded_published_once_per_transition() -> Result<()> {
        let (health, log) = setup().await?;
        health.heartbeat("monitor", None).await?;
        let later = Utc::now() + Duration::seconds(3);

        let transitions = health.check_at(later).await?;
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].to, HealthStatus::Degraded);
        assert!(health.check_at(later).await?.is_empty());
        assert_eq!(count(&log, EventType::ComponentDegraded).await?, 1);

        // Recovery publishes nothing; a new silence degrades again.
        health.heartbeat("monitor", None).await?;
        assert!(health.check().await?.is_empty());
        assert_eq!(count(&log, EventType::ComponentDegraded).await?, 1);
        health.check_at(Utc::now() + Duration::seconds(3)).await?;
        assert_eq!(count(&log, EventType::ComponentDegraded).await?, 2);
        Ok(())
    }

    #[tokio::test]
    async fn dead_component_stopped_and_restarts() -> Result<()> {
        let (health, log) = setup().await?;
        health.heartbeat("loop-1", None).await?;

        let transitions = health.check_at(Utc::now() + Duration::seconds(30)).await?;
        assert_eq!(transitions[0].to, HealthStatus::Dead);
        assert_eq!(count(&log, EventType::ComponentStopped).await?, 1);

        health.heartbeat("loop-1", None).await?;
        assert_eq!(count(&log, EventType::ComponentStarted).await?, 2);
        assert_eq!(
            health.status("loop-1").await?.map(|c| c.announced),
            Some(HealthStatus::Healthy)
        );
        Ok(())
    }

    #[tokio::test]
    async fn deregister_publishes_shutdown() -> Result<()> {
        let (health, log) = setup().await?;
        health.heartbeat("coordinator", None).await?;
        assert!(health.deregister("coordinator").await?);
        assert!(!health.deregister("coordinator").await?);

        let stopped = log.recent(&EventFilter::of_types([EventType::ComponentStopped]), 10).await?;
        let payload: ComponentStopped = stopped[0].payload_as()?;
        assert_eq!(payload.reason, StopReason::Shutdown);
        Ok(())
    }
}
