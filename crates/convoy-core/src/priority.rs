//! Participant priorities.
//!
//! Larger numbers are more important. Owners without a row have priority 0.

use std::collections::HashMap;

use sqlx::SqliteConnection;

use crate::{
    events::{self, payloads::PriorityChanged},
    store::{now_millis, Store},
    Result,
};

/// Priority assumed for owners that were never assigned one.
pub const DEFAULT_PRIORITY: i64 = 0;

/// Read and write access to participant priorities.
#[derive(Debug, Clone)]
pub struct Priorities {
    store: Store,
}

impl Priorities {
    #[must_use]
    pub const fn new(store: Store) -> Self {
        Self { store }
    }

    /// Priority of one owner.
    pub async fn get(&self, owner: &str) -> Result<i64> {
        let mut conn = self.store.pool().acquire().await?;
        priority_of(&mut conn, owner).await
    }

    /// Every explicitly assigned priority, highest first.
    pub async fn all(&self) -> Result<Vec<(String, i64)>> {
        sqlx::query_as("SELECT owner, priority FROM participant_priorities ORDER BY priority DESC, owner")
            .fetch_all(self.store.pool())
            .await
            .map_err(Into::into)
    }

    /// Assign a priority and publish `priority_changed`.
    pub async fn set(&self, owner: &str, priority: i64, changed_by: &str) -> Result<i64> {
        let mut tx = self.store.begin().await?;
        let previous = set_priority(&mut tx, owner, priority, changed_by).await?;
        tx.commit().await?;
        Ok(previous)
    }
}

pub(crate) async fn priority_of(conn: &mut SqliteConnection, owner: &str) -> Result<i64> {
    let priority: Option<i64> =
        sqlx::query_scalar("SELECT priority FROM participant_priorities WHERE owner = ?")
            .bind(owner)
            .fetch_optional(&mut *conn)
            .await?;
    Ok(priority.unwrap_or(DEFAULT_PRIORITY))
}

pub(crate) async fn priorities_of(
    conn: &mut SqliteConnection,
    owners: &[String],
) -> Result<HashMap<String, i64>> {
    let mut priorities = HashMap::with_capacity(owners.len());
    for owner in owners {
        priorities.insert(owner.clone(), priority_of(conn, owner).await?);
    }
    Ok(priorities)
}

/// Upsert a priority inside the caller's transaction and publish `priority_changed`.
/// Returns the previous priority.
pub(crate) async fn set_priority(
    conn: &mut SqliteConnection,
    owner: &str,
    priority: i64,
    changed_by: &str,
) -> Result<i64> {
    // Takes the write lock before reading the previous value.
    sqlx::query(
        "INSERT OR IGNORE INTO participant_priorities (owner, priority, updated_at) VALUES (?, ?, ?)",
    )
    .bind(owner)
    .bind(DEFAULT_PRIORITY)
    .bind(now_millis())
    .execute(&mut *conn)
    .await?;

    let previous = priority_of(conn, owner).await?;

    sqlx::query("UPDATE participant_priorities SET priority = ?, updated_at = ? WHERE owner = ?")
        .bind(priority)
        .bind(now_millis())
        .bind(owner)
        .execute(&mut *conn)
        .await?;

    events::append_typed(
        conn,
        changed_by,
        &PriorityChanged {
            owner: owner.to_string(),
            priority,
            previous,
            changed_by: changed_by.to_string(),
        },
    )
    .await?;
    Ok(previous)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventFilter, EventLog, EventType};

    #[tokio::test]
    async fn unknown_owner_has_default_priority() -> Result<()> {
        let priorities = Priorities::new(Store::in_memory().await?);
        assert_eq!(priorities.get("loop-9").await?, DEFAULT_PRIORITY);
        Ok(())
    }

    #[tokio::test]
    async fn set_publishes_priority_changed() -> Result<()> {
        let store = Store::in_memory().await?;
        let priorities = Priorities::new(store.clone());
        priorities.set("loop-1", 5, "operator").await?;
        assert_eq!(priorities.get("loop-1").await?, 5);

        let events = EventLog::new(store)
            .recent(&EventFilter::of_types([EventType::PriorityChanged]), 10)
            .await?;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["priority"], 5);
        Ok(())
    }
}
