//! Checkpoint and rollback of repository state.
//!
//! A checkpoint is an immutable snapshot ref plus a row recording its owner and
//! whether it is still active. Rolling back restores the snapshot and deactivates
//! every later checkpoint of the same owner, since those describe discarded
//! history. Deactivated snapshots survive until the retention sweep purges them.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::{FromRow, SqliteConnection};
use tracing::{debug, info, warn};

use crate::{
    events::{
        self,
        payloads::{CheckpointCreated, CheckpointRolledBack},
    },
    store::{from_millis, now_millis, Store},
    vcs::{checkpoint_ref, VersionControl},
    Error, Result,
};

/// A restorable snapshot of repository state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Checkpoint {
    pub id: String,
    pub owner: String,
    pub label: String,
    pub snapshot_ref: String,
    pub created_at: DateTime<Utc>,
    pub active: bool,
    pub deactivated_at: Option<DateTime<Utc>>,
}

#[derive(FromRow)]
struct CheckpointRow {
    id: String,
    owner: String,
    label: String,
    snapshot_ref: String,
    created_at: i64,
    active: bool,
    deactivated_at: Option<i64>,
}

impl TryFrom<CheckpointRow> for Checkpoint {
    type Error = Error;

    fn try_from(row: CheckpointRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            owner: row.owner,
            label: row.label,
            snapshot_ref: row.snapshot_ref,
            created_at: from_millis(row.created_at)?,
            active: row.active,
            deactivated_at: row.deactivated_at.map(from_millis).transpose()?,
        })
    }
}

const CHECKPOINT_COLUMNS: &str =
    "id, owner, label, snapshot_ref, created_at, active, deactivated_at";

/// Id of the owner's most recent active checkpoint.
pub(crate) async fn latest_active_id(
    conn: &mut SqliteConnection,
    owner: &str,
) -> Result<Option<String>> {
    sqlx::query_scalar(
        "SELECT id FROM checkpoints WHERE owner = ? AND active = 1 ORDER BY seq DESC LIMIT 1",
    )
    .bind(owner)
    .fetch_optional(&mut *conn)
    .await
    .map_err(Into::into)
}

/// Creates, restores and retires checkpoints.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    store: Store,
    vcs: Arc<dyn VersionControl>,
}

impl CheckpointManager {
    #[must_use]
    pub fn new(store: Store, vcs: Arc<dyn VersionControl>) -> Self {
        Self { store, vcs }
    }

    /// Snapshot the current repository state for `owner`.
    pub async fn create(&self, owner: &str, label: &str) -> Result<Checkpoint> {
        if owner.trim().is_empty() {
            return Err(Error::InvalidInput("checkpoint owner cannot be empty".into()));
        }
        let id = format!("chk-{}", uuid::Uuid::new_v4().simple());
        let reference = checkpoint_ref(&id);
        let snapshot_ref = self
            .vcs
            .create_ref(&reference, owner, &format!("convoy checkpoint {id}: {label}"))
            .await?;

        let created_at = now_millis();
        let recorded = self
            .record(&id, owner, label, &snapshot_ref, created_at)
            .await;
        if let Err(e) = recorded {
            if let Err(cleanup) = self.vcs.delete_ref(&snapshot_ref).await {
                warn!(checkpoint = %id, error = %cleanup, "Failed to delete orphaned snapshot ref");
            }
            return Err(e);
        }

        info!(checkpoint = %id, owner = %owner, label = %label, "Checkpoint created");
        Ok(Checkpoint {
            id,
            owner: owner.to_string(),
            label: label.to_string(),
            snapshot_ref,
            created_at: from_millis(created_at)?,
            active: true,
            deactivated_at: None,
        })
    }

    async fn record(
        &self,
        id: &str,
        owner: &str,
        label: &str,
        snapshot_ref: &str,
        created_at: i64,
    ) -> Result<()> {
        let mut tx = self.store.begin().await?;
        sqlx::query(
            "INSERT INTO checkpoints (id, owner, label, snapshot_ref, created_at, active)
             VALUES (?, ?, ?, ?, ?, 1)",
        )
        .bind(id)
        .bind(owner)
        .bind(label)
        .bind(snapshot_ref)
        .bind(created_at)
        .execute(&mut *tx)
        .await?;

        events::append_typed(
            &mut tx,
            owner,
            &CheckpointCreated {
                checkpoint_id: id.to_string(),
                owner: owner.to_string(),
                label: label.to_string(),
                snapshot_ref: snapshot_ref.to_string(),
            },
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Restore the repository to a checkpoint.
    ///
    /// Idempotent: rolling back to the same checkpoint again yields the same
    /// state, because only checkpoints created after it are deactivated.
    pub async fn rollback(&self, checkpoint_id: &str) -> Result<Checkpoint> {
        let checkpoint = self.get(checkpoint_id).await?;
        if !checkpoint.active {
            return Err(Error::InvalidInput(format!(
                "checkpoint '{checkpoint_id}' is inactive"
            )));
        }

        self.vcs.reset_to_ref(&checkpoint.snapshot_ref).await?;

        let mut tx = self.store.begin().await?;
        let superseded: Vec<String> = sqlx::query_scalar(
            "UPDATE checkpoints SET active = 0, deactivated_at = ?
             WHERE owner = ? AND active = 1
               AND seq > (SELECT seq FROM checkpoints WHERE id = ?)
             RETURNING id",
        )
        .bind(now_millis())
        .bind(&checkpoint.owner)
        .bind(checkpoint_id)
        .fetch_all(&mut *tx)
        .await?;

        events::append_typed(
            &mut tx,
            &checkpoint.owner,
            &CheckpointRolledBack {
                checkpoint_id: checkpoint_id.to_string(),
                owner: checkpoint.owner.clone(),
                superseded: superseded.clone(),
            },
        )
        .await?;
        tx.commit().await?;

        info!(
            checkpoint = %checkpoint_id,
            owner = %checkpoint.owner,
            superseded = superseded.len(),
            "Rolled back to checkpoint"
        );
        Ok(checkpoint)
    }

    /// Soft-delete a checkpoint. Returns false if it was already inactive.
    pub async fn delete(&self, checkpoint_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE checkpoints SET active = 0, deactivated_at = ? WHERE id = ? AND active = 1",
        )
        .bind(now_millis())
        .bind(checkpoint_id)
        .execute(self.store.pool())
        .await?;

        if result.rows_affected() == 0 {
            // Distinguish "already inactive" from "never existed".
            self.get(checkpoint_id).await?;
            return Ok(false);
        }
        debug!(checkpoint = %checkpoint_id, "Checkpoint deactivated");
        Ok(true)
    }

    /// Active checkpoints, oldest first, optionally for one owner.
    pub async fn list(&self, owner: Option<&str>) -> Result<Vec<Checkpoint>> {
        self.query(owner, true).await
    }

    /// All checkpoints including inactive ones awaiting purge.
    pub async fn list_all(&self, owner: Option<&str>) -> Result<Vec<Checkpoint>> {
        self.query(owner, false).await
    }

    async fn query(&self, owner: Option<&str>, active_only: bool) -> Result<Vec<Checkpoint>> {
        let sql = format!(
            "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints
             WHERE (? IS NULL OR owner = ?) AND (? = 0 OR active = 1)
             ORDER BY seq"
        );
        let rows: Vec<CheckpointRow> = sqlx::query_as(&sql)
            .bind(owner)
            .bind(owner)
            .bind(active_only)
            .fetch_all(self.store.pool())
            .await?;
        rows.into_iter().map(Checkpoint::try_from).collect()
    }

    /// Most recent active checkpoint of an owner.
    pub async fn latest_active(&self, owner: &str) -> Result<Option<Checkpoint>> {
        let id = {
            let mut conn = self.store.pool().acquire().await?;
            latest_active_id(&mut conn, owner).await?
        };
        match id {
            Some(id) => self.get(&id).await.map(Some),
            None => Ok(None),
        }
    }

    /// Look up one checkpoint.
    pub async fn get(&self, checkpoint_id: &str) -> Result<Checkpoint> {
        let row: Option<CheckpointRow> = sqlx::query_as(&format!(
            "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE id = ?"
        ))
        .bind(checkpoint_id)
        .fetch_optional(self.store.pool())
        .await?;
        row.map(Checkpoint::try_from)
            .transpose()?
            .ok_or_else(|| Error::NotFound(format!("checkpoint '{checkpoint_id}'")))
    }

    /// Physically remove checkpoints deactivated longer than `retention` ago.
    ///
    /// The snapshot ref goes first and the row second, so a failure in between
    /// leaves a row whose purge is simply retried next sweep.
    pub async fn purge_expired(&self, retention: Duration) -> Result<Vec<String>> {
        let cutoff = now_millis().saturating_sub(retention.num_milliseconds());
        let candidates: Vec<(String, String)> = sqlx::query_as(
            "SELECT id, snapshot_ref FROM checkpoints
             WHERE active = 0 AND deactivated_at IS NOT NULL AND deactivated_at <= ?
             ORDER BY seq",
        )
        .bind(cutoff)
        .fetch_all(self.store.pool())
        .await?;

        let mut purged = Vec::with_capacity(candidates.len());
        for (id, snapshot_ref) in candidates {
            self.vcs.delete_ref(&snapshot_ref).await?;
            let removed = sqlx::query("DELETE FROM checkpoints WHERE id = ? AND active = 0")
                .bind(&id)
                .execute(self.store.pool())
                .await?
                .rows_affected();
            if removed > 0 {
                purged.push(id);
            }
        }

        if !purged.is_empty() {
            info!(count = purged.len(), "Purged expired checkpoints");
        }
        Ok(purged)
    }
}
