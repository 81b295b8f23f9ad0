//! Regression detection and blame.
//!
//! The monitor keeps the most recent confirmed pass of each work item. When a
//! previously passing item (or a dependency of a failing item) fails at a later
//! commit, it walks the blame range `(passing, failing]` and attributes the
//! regression to the owner of the earliest commit in that range.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::Serialize;
use sqlx::{FromRow, SqliteConnection};
use tracing::{debug, info, warn};

use crate::{
    checkpoint,
    events::{
        self,
        payloads::{RegressionDetected, RollbackTriggered},
        EventPriority, NewEvent,
    },
    store::{from_millis, now_millis, Store},
    vcs::VersionControl,
    Error, Result,
};

/// Source identity used for monitor events.
pub const MONITOR_SOURCE: &str = "regression-monitor";

/// External verification pipeline: pass or fail of a work item at a commit.
#[async_trait]
pub trait Verifier: Send + Sync + std::fmt::Debug {
    async fn verify(&self, work_item_id: &str, commit: &str) -> Result<bool>;
}

/// Most recent confirmed pass of a work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PassingRecord {
    pub work_item_id: String,
    pub commit: String,
    pub owner: String,
    pub recorded_at: DateTime<Utc>,
}

/// A detected regression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Regression {
    pub id: i64,
    /// Work item whose verification failed.
    pub work_item_id: String,
    /// Previously passing work item that regressed.
    pub blamed_test: String,
    pub blamed_loop: Option<String>,
    pub passing_commit: String,
    pub failing_commit: String,
    pub suspects: Vec<String>,
    pub auto_rolled_back: bool,
    pub detected_at: DateTime<Utc>,
}

#[derive(FromRow)]
struct RegressionRow {
    id: i64,
    work_item_id: String,
    blamed_test: String,
    blamed_loop: Option<String>,
    passing_commit: String,
    failing_commit: String,
    suspects: String,
    auto_rolled_back: bool,
    detected_at: i64,
}

impl TryFrom<RegressionRow> for Regression {
    type Error = Error;

    fn try_from(row: RegressionRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            work_item_id: row.work_item_id,
            blamed_test: row.blamed_test,
            blamed_loop: row.blamed_loop,
            passing_commit: row.passing_commit,
            failing_commit: row.failing_commit,
            suspects: serde_json::from_str(&row.suspects)?,
            auto_rolled_back: row.auto_rolled_back,
            detected_at: from_millis(row.detected_at)?,
        })
    }
}

/// Blame attribution over a commit range.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Blame {
    blamed_loop: Option<String>,
    suspects: Vec<String>,
}

fn blame(commits: &[crate::vcs::CommitInfo]) -> Blame {
    Blame {
        blamed_loop: commits.first().map(|c| c.owner.clone()),
        suspects: commits.iter().map(|c| c.owner.clone()).unique().collect(),
    }
}

/// Tracks passing history and publishes `regression_detected`.
#[derive(Debug, Clone)]
pub struct RegressionMonitor {
    store: Store,
    vcs: Arc<dyn VersionControl>,
    auto_rollback: bool,
}

impl RegressionMonitor {
    #[must_use]
    pub fn new(store: Store, vcs: Arc<dyn VersionControl>) -> Self {
        Self {
            store,
            vcs,
            auto_rollback: true,
        }
    }

    /// Enable or disable automatic `rollback_triggered` for attributed regressions.
    #[must_use]
    pub const fn with_auto_rollback(mut self, enabled: bool) -> Self {
        self.auto_rollback = enabled;
        self
    }

    /// Overwrite the passing record of a work item.
    pub async fn record_pass(&self, work_item_id: &str, commit: &str, owner: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO passing_records (work_item_id, commit_id, owner, recorded_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(work_item_id) DO UPDATE SET
                commit_id = excluded.commit_id,
                owner = excluded.owner,
                recorded_at = excluded.recorded_at",
        )
        .bind(work_item_id)
        .bind(commit)
        .bind(owner)
        .bind(now_millis())
        .execute(self.store.pool())
        .await?;

        debug!(work_item = %work_item_id, commit = %commit, owner = %owner, "Recorded pass");
        Ok(())
    }

    /// Passing record of one work item.
    pub async fn passing_record(&self, work_item_id: &str) -> Result<Option<PassingRecord>> {
        let row: Option<(String, String, String, i64)> = sqlx::query_as(
            "SELECT work_item_id, commit_id, owner, recorded_at FROM passing_records WHERE work_item_id = ?",
        )
        .bind(work_item_id)
        .fetch_optional(self.store.pool())
        .await?;
        row.map(into_record).transpose()
    }

    /// Every passing record.
    pub async fn passing_records(&self) -> Result<Vec<PassingRecord>> {
        let rows: Vec<(String, String, String, i64)> = sqlx::query_as(
            "SELECT work_item_id, commit_id, owner, recorded_at FROM passing_records ORDER BY work_item_id",
        )
        .fetch_all(self.store.pool())
        .await?;
        rows.into_iter().map(into_record).collect()
    }

    /// Declare that `work_item_id` builds on `depends_on`.
    pub async fn register_dependency(&self, work_item_id: &str, depends_on: &str) -> Result<()> {
        if work_item_id == depends_on {
            return Err(Error::InvalidInput(format!(
                "work item '{work_item_id}' cannot depend on itself"
            )));
        }
        sqlx::query("INSERT OR IGNORE INTO work_dependencies (work_item_id, depends_on) VALUES (?, ?)")
            .bind(work_item_id)
            .bind(depends_on)
            .execute(self.store.pool())
            .await?;
        Ok(())
    }

    /// Direct dependencies of a work item.
    pub async fn dependencies(&self, work_item_id: &str) -> Result<Vec<String>> {
        sqlx::query_scalar(
            "SELECT depends_on FROM work_dependencies WHERE work_item_id = ? ORDER BY depends_on",
        )
        .bind(work_item_id)
        .fetch_all(self.store.pool())
        .await
        .map_err(Into::into)
    }

    /// Attribute a verification failure of `work_item_id` at `commit`.
    ///
    /// Candidates are the item's own passing record and those of its direct
    /// dependencies. A candidate regresses when its passing commit is a strict
    /// ancestor of `commit`.
    pub async fn record_failure(&self, work_item_id: &str, commit: &str) -> Result<Vec<Regression>> {
        let mut candidates = Vec::new();
        if let Some(own) = self.passing_record(work_item_id).await? {
            candidates.push(own);
        }
        for dependency in self.dependencies(work_item_id).await? {
            if let Some(record) = self.passing_record(&dependency).await? {
                candidates.push(record);
            }
        }

        let mut regressions = Vec::new();
        for record in candidates {
            if let Some(regression) = self.attribute(work_item_id, &record, commit).await? {
                regressions.push(regression);
            }
        }
        Ok(regressions)
    }

    /// Re-verify every passing record older than `commit`.
    ///
    /// Items that still pass have their record advanced; items that fail are
    /// attributed as regressions.
    pub async fn on_commit(&self, commit: &str, verifier: &dyn Verifier) -> Result<Vec<Regression>> {
        let mut regressions = Vec::new();
        for record in self.passing_records().await? {
            if record.commit == commit {
                continue;
            }
            if !self.vcs.is_ancestor(&record.commit, commit).await? {
                debug!(work_item = %record.work_item_id, "Passing commit not an ancestor; skipping");
                continue;
            }
            if verifier.verify(&record.work_item_id, commit).await? {
                self.record_pass(&record.work_item_id, commit, &record.owner).await?;
            } else if let Some(regression) =
                self.attribute(&record.work_item_id, &record, commit).await?
            {
                regressions.push(regression);
            }
        }
        Ok(regressions)
    }

    async fn attribute(
        &self,
        failing_item: &str,
        record: &PassingRecord,
        failing_commit: &str,
    ) -> Result<Option<Regression>> {
        if record.commit == failing_commit
            || !self.vcs.is_ancestor(&record.commit, failing_commit).await?
        {
            return Ok(None);
        }
        let commits = self.vcs.commits_between(&record.commit, failing_commit).await?;
        if commits.is_empty() {
            return Ok(None);
        }
        let blame = blame(&commits);

        let mut tx = self.store.begin().await?;
        let suspects = serde_json::to_string(&blame.suspects)?;
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO regressions
                (work_item_id, blamed_test, blamed_loop, passing_commit, failing_commit, suspects, detected_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(failing_item)
        .bind(&record.work_item_id)
        .bind(&blame.blamed_loop)
        .bind(&record.commit)
        .bind(failing_commit)
        .bind(&suspects)
        .bind(now_millis())
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            tx.commit().await?;
            debug!(blamed_test = %record.work_item_id, commit = %failing_commit, "Regression already recorded");
            return Ok(None);
        }
        let id = inserted.last_insert_rowid();

        let auto_rolled_back = match (&blame.blamed_loop, self.auto_rollback) {
            (Some(blamed), true) => self.trigger_rollback(&mut tx, blamed, failing_item).await?,
            _ => false,
        };
        if auto_rolled_back {
            sqlx::query("UPDATE regressions SET auto_rolled_back = 1 WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        let payload = RegressionDetected {
            regression_id: id,
            work_item_id: failing_item.to_string(),
            blamed_test: record.work_item_id.clone(),
            blamed_loop: blame.blamed_loop.clone(),
            passing_commit: record.commit.clone(),
            failing_commit: failing_commit.to_string(),
            suspects: blame.suspects.clone(),
            auto_rolled_back,
        };
        let event = NewEvent::typed(MONITOR_SOURCE, &payload)?
            .with_priority(EventPriority::High)
            .with_correlation(failing_item);
        events::append(&mut tx, &event).await?;

        let row: RegressionRow = sqlx::query_as(
            "SELECT id, work_item_id, blamed_test, blamed_loop, passing_commit, failing_commit,
                    suspects, auto_rolled_back, detected_at
             FROM regressions WHERE id = ?",
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        warn!(
            work_item = %failing_item,
            blamed_test = %record.work_item_id,
            blamed_loop = ?blame.blamed_loop,
            range = %format!("{}..{failing_commit}", record.commit),
            "Regression detected"
        );
        Regression::try_from(row).map(Some)
    }

    async fn trigger_rollback(
        &self,
        conn: &mut SqliteConnection,
        blamed: &str,
        work_item_id: &str,
    ) -> Result<bool> {
        let Some(checkpoint_id) = checkpoint::latest_active_id(conn, blamed).await? else {
            debug!(owner = %blamed, "No active checkpoint; leaving regression to the coordinator");
            return Ok(false);
        };
        let payload = RollbackTriggered {
            target: blamed.to_string(),
            checkpoint_id: Some(checkpoint_id.clone()),
            reason: "regression".to_string(),
            work_item_id: Some(work_item_id.to_string()),
        };
        let event = NewEvent::typed(MONITOR_SOURCE, &payload)?
            .with_priority(EventPriority::High)
            .with_correlation(work_item_id);
        events::append(conn, &event).await?;
        info!(owner = %blamed, checkpoint = %checkpoint_id, "Automatic rollback triggered");
        Ok(true)
    }

    /// Regression history, newest first.
    pub async fn history(&self, limit: u32) -> Result<Vec<Regression>> {
        let rows: Vec<RegressionRow> = sqlx::query_as(
            "SELECT id, work_item_id, blamed_test, blamed_loop, passing_commit, failing_commit,
                    suspects, auto_rolled_back, detected_at
             FROM regressions ORDER BY id DESC LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(self.store.pool())
        .await?;
        rows.into_iter().map(Regression::try_from).collect()
    }
}

fn into_record(
    (work_item_id, commit, owner, recorded_at): (String, String, String, i64),
) -> Result<PassingRecord> {
    Ok(PassingRecord {
        work_item_id,
        commit,
        owner,
        recorded_at: from_millis(recorded_at)?,
    })
}
