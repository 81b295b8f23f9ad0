//! Periodic sweep reclaiming state left behind by crashed or stalled owners.
//!
//! Every pass is idempotent and runs on its own: a failure in one is logged,
//! recorded in the report, and does not stop the others.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::{
    checkpoint::CheckpointManager,
    events::{self, payloads::{PartialWrite, UnlockReason}},
    health::HealthManager,
    locks::{self, Lock, LockManager},
    store::Store,
    Error, ErrorClass, Result,
};

/// Source identity used for sweep events.
pub const ORPHAN_SOURCE: &str = "orphan-cleaner";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SweepPass {
    DeadOwners,
    ExpiredLocks,
    Checkpoints,
    StaleRequests,
}

/// A pass that did not complete.
#[derive(Debug, Clone, Serialize)]
pub struct SweepFailure {
    pub pass: SweepPass,
    pub class: ErrorClass,
    pub store_failure: bool,
    pub message: String,
}

/// Released lock attributed to a dead owner.
#[derive(Debug, Clone, Serialize)]
pub struct OrphanedLock {
    pub owner: String,
    pub resource_key: String,
    pub locked_at: DateTime<Utc>,
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    /// Locks released because their holder is dead; each is also a partial write.
    pub orphaned_locks: Vec<OrphanedLock>,
    /// Resource keys whose TTL lapsed.
    pub expired_locks: Vec<String>,
    pub purged_checkpoints: Vec<String>,
    pub purged_requests: u64,
    pub failures: Vec<SweepFailure>,
}

impl SweepReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Whether any pass failed because the store itself is broken.
    #[must_use]
    pub fn store_failed(&self) -> bool {
        self.failures.iter().any(|f| f.store_failure)
    }

    fn record_failure(&mut self, pass: SweepPass, error: &Error) {
        warn!(pass = %pass, error = %error, "Sweep pass failed");
        self.failures.push(SweepFailure {
            pass,
            class: error.class(),
            store_failure: error.is_store_failure(),
            message: error.to_string(),
        });
    }
}

/// Reclaims locks, checkpoints and requests nobody will clean up.
#[derive(Debug, Clone)]
pub struct OrphanCleaner {
    store: Store,
    locks: LockManager,
    checkpoints: CheckpointManager,
    health: HealthManager,
    retention: Duration,
    pending_ttl: Duration,
}

impl OrphanCleaner {
    #[must_use]
    pub const fn new(
        store: Store,
        locks: LockManager,
        checkpoints: CheckpointManager,
        health: HealthManager,
        retention: Duration,
        pending_ttl: Duration,
    ) -> Self {
        Self {
            store,
            locks,
            checkpoints,
            health,
            retention,
            pending_ttl,
        }
    }

    /// Run every pass once.
    ///
    /// Dead owners go first so their locks are attributed to the death
    /// rather than to TTL expiry.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        match self.release_dead_owners().await {
            Ok(orphaned) => report.orphaned_locks = orphaned,
            Err(e) => report.record_failure(SweepPass::DeadOwners, &e),
        }

        match self.locks.reclaim_expired(ORPHAN_SOURCE).await {
            Ok(expired) => {
                report.expired_locks = expired.into_iter().map(|l| l.resource_key).collect();
            }
            Err(e) => report.record_failure(SweepPass::ExpiredLocks, &e),
        }

        match self.checkpoints.purge_expired(self.retention).await {
            Ok(purged) => report.purged_checkpoints = purged,
            Err(e) => report.record_failure(SweepPass::Checkpoints, &e),
        }

        match self.locks.purge_stale_requests(self.pending_ttl).await {
            Ok(purged) => report.purged_requests = purged,
            Err(e) => report.record_failure(SweepPass::StaleRequests, &e),
        }

        info!(
            orphaned = report.orphaned_locks.len(),
            expired = report.expired_locks.len(),
            checkpoints = report.purged_checkpoints.len(),
            requests = report.purged_requests,
            failures = report.failures.len(),
            "Sweep finished"
        );
        report
    }

    /// Release every lock and request of owners past the dead threshold.
    ///
    /// A lock still held at death means the owner may have modified the
    /// resource without finishing, so each one is flagged as a partial write.
    pub async fn release_dead_owners(&self) -> Result<Vec<OrphanedLock>> {
        let mut orphaned = Vec::new();
        for component in self.health.dead_components().await? {
            let released = self.release_owner(&component.component).await?;
            orphaned.extend(released.into_iter().map(|lock| OrphanedLock {
                owner: lock.holder,
                resource_key: lock.resource_key,
                locked_at: lock.acquired_at,
            }));
        }
        Ok(orphaned)
    }

    async fn release_owner(&self, owner: &str) -> Result<Vec<Lock>> {
        let mut tx = self.store.begin().await?;
        let released = locks::delete_held(&mut tx, owner).await?;
        locks::announce_unlocked(&mut tx, ORPHAN_SOURCE, &released, UnlockReason::OwnerDead).await?;
        for lock in &released {
            events::append_typed(
                &mut tx,
                ORPHAN_SOURCE,
                &PartialWrite {
                    owner: owner.to_string(),
                    resource_key: lock.resource_key.clone(),
                    locked_at: lock.acquired_at,
                },
            )
            .await?;
        }
        tx.commit().await?;

        if !released.is_empty() {
            warn!(owner = %owner, count = released.len(), "Released locks of dead owner");
        }
        Ok(released)
    }
}
