//! Loop-side facade over the coordination core.
//!
//! A loop checkpoints before each unit of work, reports the outcome, and
//! honours directives addressed to it through its own durable subscription.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::{
    checkpoint::{Checkpoint, CheckpointManager},
    config::CoordinationConfig,
    events::{
        payloads::{
            ForceRelease, PauseRequested, PriorityChanged, ResumeRequested, RollbackTriggered,
            SkipRequested, TestFailed, TestPassed, TestStarted,
        },
        Event, EventFilter, EventLog, EventType, StartAt,
    },
    health::HealthManager,
    locks::{AcquireRequest, Acquisition, LockManager},
    regression::{Regression, RegressionMonitor, Verifier},
    store::Store,
    vcs::VersionControl,
    Error, Result,
};

/// A unit of work in progress, guarded by the checkpoint taken before it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkUnit {
    pub work_item_id: String,
    pub checkpoint: Checkpoint,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkOutcome {
    Passed,
    Failed { reason: String },
}

/// An instruction addressed to this loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "directive", rename_all = "snake_case")]
pub enum Directive {
    /// Deadlock victim: release everything and roll back.
    ForceRelease {
        cycle: Vec<String>,
        checkpoint_id: Option<String>,
    },
    Rollback {
        checkpoint_id: Option<String>,
        reason: String,
    },
    Pause {
        reason: String,
        blocked_on: Option<String>,
    },
    Resume {
        reason: String,
    },
    Skip {
        work_item_id: String,
        reason: String,
    },
    PriorityChanged {
        priority: i64,
    },
}

/// What [`LoopSession::handle_directive`] did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum DirectiveEffect {
    RolledBack { checkpoint_id: String, released_locks: usize },
    /// Locks were released but no checkpoint was available to restore.
    Released { released_locks: usize },
    /// Left to the loop's own scheduling.
    Deferred,
}

fn directive_for(owner: &str, event: &Event) -> Result<Option<Directive>> {
    let directive = match event.event_type {
        EventType::ForceRelease => {
            let p: ForceRelease = event.payload_as()?;
            (p.victim == owner).then_some(Directive::ForceRelease {
                cycle: p.cycle,
                checkpoint_id: p.checkpoint_id,
            })
        }
        EventType::RollbackTriggered => {
            let p: RollbackTriggered = event.payload_as()?;
            (p.target == owner).then_some(Directive::Rollback {
                checkpoint_id: p.checkpoint_id,
                reason: p.reason,
            })
        }
        EventType::PauseRequested => {
            let p: PauseRequested = event.payload_as()?;
            (p.target == owner).then_some(Directive::Pause {
                reason: p.reason,
                blocked_on: p.blocked_on,
            })
        }
        EventType::ResumeRequested => {
            let p: ResumeRequested = event.payload_as()?;
            (p.target == owner).then_some(Directive::Resume { reason: p.reason })
        }
        EventType::SkipRequested => {
            let p: SkipRequested = event.payload_as()?;
            (p.target == owner).then_some(Directive::Skip {
                work_item_id: p.work_item_id,
                reason: p.reason,
            })
        }
        EventType::PriorityChanged => {
            let p: PriorityChanged = event.payload_as()?;
            (p.owner == owner).then_some(Directive::PriorityChanged { priority: p.priority })
        }
        _ => None,
    };
    Ok(directive)
}

/// One loop's connection to the coordination core.
#[derive(Debug, Clone)]
pub struct LoopSession {
    owner: String,
    events: EventLog,
    locks: LockManager,
    checkpoints: CheckpointManager,
    regressions: RegressionMonitor,
    health: HealthManager,
    vcs: Arc<dyn VersionControl>,
    verifier: Option<Arc<dyn Verifier>>,
}

impl LoopSession {
    pub fn new(
        owner: impl Into<String>,
        store: Store,
        vcs: Arc<dyn VersionControl>,
        config: &CoordinationConfig,
    ) -> Self {
        Self {
            owner: owner.into(),
            events: EventLog::new(store.clone()),
            locks: LockManager::with_ttl(store.clone(), config.lock_ttl()),
            checkpoints: CheckpointManager::new(store.clone(), vcs.clone()),
            regressions: RegressionMonitor::new(store.clone(), vcs.clone())
                .with_auto_rollback(config.auto_rollback_on_regression),
            health: HealthManager::new(store, config.health_thresholds()),
            vcs,
            verifier: None,
        }
    }

    /// Re-verify earlier passes whenever this loop completes work at a new commit.
    #[must_use]
    pub fn with_verifier(mut self, verifier: Arc<dyn Verifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Session with default configuration.
    pub fn with_defaults(owner: impl Into<String>, store: Store, vcs: Arc<dyn VersionControl>) -> Self {
        Self::new(owner, store, vcs, &CoordinationConfig::default())
    }

    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    fn subscriber_id(&self) -> String {
        format!("{}-directives", self.owner)
    }

    /// Announce the loop and open its directive subscription.
    pub async fn start(&self) -> Result<()> {
        if self.owner.trim().is_empty() {
            return Err(Error::InvalidInput("loop owner cannot be empty".into()));
        }
        let filter = EventFilter::of_types([
            EventType::ForceRelease,
            EventType::RollbackTriggered,
            EventType::PauseRequested,
            EventType::ResumeRequested,
            EventType::SkipRequested,
            EventType::PriorityChanged,
        ]);
        self.events.subscribe(&self.subscriber_id(), filter, StartAt::Tail).await?;
        self.heartbeat().await
    }

    pub async fn heartbeat(&self) -> Result<()> {
        self.health.heartbeat(&self.owner, Some(std::process::id())).await
    }

    pub async fn acquire(&self, resource_key: &str, reason: &str) -> Result<Acquisition> {
        self.locks
            .acquire(&AcquireRequest::new(resource_key, &self.owner).with_reason(reason))
            .await
    }

    pub async fn release(&self, resource_key: &str) -> Result<bool> {
        self.locks.release(resource_key, &self.owner).await
    }

    /// Checkpoint the repository, then announce the work item.
    pub async fn begin_work(&self, work_item_id: &str) -> Result<WorkUnit> {
        let checkpoint = self
            .checkpoints
            .create(&self.owner, &format!("before {work_item_id}"))
            .await?;
        self.events
            .publish_typed(
                &self.owner,
                &TestStarted {
                    work_item_id: work_item_id.to_string(),
                    owner: self.owner.clone(),
                    checkpoint_id: checkpoint.id.clone(),
                },
            )
            .await?;
        Ok(WorkUnit {
            work_item_id: work_item_id.to_string(),
            checkpoint,
        })
    }

    /// Report the outcome of a unit of work at the current head.
    ///
    /// A pass updates the passing record and, with a verifier attached, re-checks
    /// older passes against the new head. A failure is checked for regressions.
    pub async fn complete(&self, unit: &WorkUnit, outcome: WorkOutcome) -> Result<Vec<Regression>> {
        let commit = self.vcs.head().await?;
        match outcome {
            WorkOutcome::Passed => {
                self.events
                    .publish_typed(
                        &self.owner,
                        &TestPassed {
                            work_item_id: unit.work_item_id.clone(),
                            owner: self.owner.clone(),
                            commit: commit.clone(),
                        },
                    )
                    .await?;
                self.regressions
                    .record_pass(&unit.work_item_id, &commit, &self.owner)
                    .await?;
                match &self.verifier {
                    Some(verifier) => self.regressions.on_commit(&commit, verifier.as_ref()).await,
                    None => Ok(Vec::new()),
                }
            }
            WorkOutcome::Failed { reason } => {
                self.events
                    .publish_typed(
                        &self.owner,
                        &TestFailed {
                            work_item_id: unit.work_item_id.clone(),
                            owner: self.owner.clone(),
                            commit: commit.clone(),
                            reason,
                        },
                    )
                    .await?;
                self.regressions.record_failure(&unit.work_item_id, &commit).await
            }
        }
    }

    /// Directives addressed to this loop since the last call.
    ///
    /// Everything polled is acknowledged, including events aimed at other loops.
    pub async fn directives(&self) -> Result<Vec<Directive>> {
        let subscriber = self.subscriber_id();
        let events = self.events.poll(&subscriber).await?;
        let mut directives = Vec::new();
        for event in &events {
            match directive_for(&self.owner, event) {
                Ok(Some(directive)) => directives.push(directive),
                Ok(None) => {}
                Err(e) => warn!(seq = event.id, error = %e, "Ignoring unreadable directive"),
            }
        }
        if let Some(last) = events.last() {
            self.events.ack(&subscriber, last.id).await?;
        }
        Ok(directives)
    }

    /// Carry out the core's part of a directive.
    ///
    /// Force-release drops every lock and rolls back; rollback restores the
    /// named checkpoint or the latest active one. Other directives are
    /// scheduling concerns of the loop itself.
    pub async fn handle_directive(&self, directive: &Directive) -> Result<DirectiveEffect> {
        match directive {
            Directive::ForceRelease { checkpoint_id, .. } => {
                let released = self.locks.release_all(&self.owner).await?.len();
                match self.restore(checkpoint_id.as_deref()).await? {
                    Some(checkpoint) => Ok(DirectiveEffect::RolledBack {
                        checkpoint_id: checkpoint.id,
                        released_locks: released,
                    }),
                    None => Ok(DirectiveEffect::Released { released_locks: released }),
                }
            }
            Directive::Rollback { checkpoint_id, .. } => {
                match self.restore(checkpoint_id.as_deref()).await? {
                    Some(checkpoint) => Ok(DirectiveEffect::RolledBack {
                        checkpoint_id: checkpoint.id,
                        released_locks: 0,
                    }),
                    None => Err(Error::NotFound(format!(
                        "no active checkpoint for '{}'",
                        self.owner
                    ))),
                }
            }
            Directive::Pause { .. }
            | Directive::Resume { .. }
            | Directive::Skip { .. }
            | Directive::PriorityChanged { .. } => Ok(DirectiveEffect::Deferred),
        }
    }

    async fn restore(&self, checkpoint_id: Option<&str>) -> Result<Option<Checkpoint>> {
        let target = match checkpoint_id {
            Some(id) => Some(self.checkpoints.get(id).await?),
            None => self.checkpoints.latest_active(&self.owner).await?,
        };
        let Some(target) = target else {
            return Ok(None);
        };
        let checkpoint = self.checkpoints.rollback(&target.id).await?;
        info!(owner = %self.owner, checkpoint = %checkpoint.id, "Loop rolled back");
        Ok(Some(checkpoint))
    }

    /// Announce a graceful stop.
    pub async fn finish(&self) -> Result<()> {
        self.health.deregister(&self.owner).await?;
        self.events.unsubscribe(&self.subscriber_id()).await?;
        Ok(())
    }
}
