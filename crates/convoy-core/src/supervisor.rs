//! Long-running monitor process.
//!
//! Drives the deadlock detector, health checks, orphan sweeps and the
//! coordinator on independent intervals until shutdown. Transient failures
//! are retried on the next tick; a system failure is escalated as
//! `component_degraded` (best effort) and stops the supervisor.

use std::{future::Future, sync::Arc, time::Duration as StdDuration};

use serde::Serialize;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::{
    checkpoint::CheckpointManager,
    config::CoordinationConfig,
    coordinator::{Coordinator, TickReport, COORDINATOR_ID},
    deadlock::{Deadlock, DeadlockDetector},
    health::{HealthManager, HealthTransition},
    locks::LockManager,
    orphan::{OrphanCleaner, SweepReport},
    store::Store,
    vcs::VersionControl,
    Error, Result,
};

/// Component name the supervisor heartbeats as.
pub const MONITOR_COMPONENT: &str = "monitor";

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
enum Task {
    Detect,
    HealthCheck,
    Sweep,
    Coordinate,
}

/// Everything one full pass did.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub deadlocks: Vec<Deadlock>,
    pub transitions: Vec<HealthTransition>,
    pub sweep: SweepReport,
    pub coordinator: TickReport,
}

#[derive(Debug)]
pub struct Supervisor {
    health: HealthManager,
    detector: DeadlockDetector,
    cleaner: OrphanCleaner,
    coordinator: Coordinator,
    config: CoordinationConfig,
}

impl Supervisor {
    pub fn new(store: Store, vcs: Arc<dyn VersionControl>, config: &CoordinationConfig) -> Self {
        let health = HealthManager::new(store.clone(), config.health_thresholds());
        let locks = LockManager::with_ttl(store.clone(), config.lock_ttl());
        let checkpoints = CheckpointManager::new(store.clone(), vcs);
        Self {
            detector: DeadlockDetector::new(store.clone(), config.pending_request_ttl()),
            cleaner: OrphanCleaner::new(
                store.clone(),
                locks,
                checkpoints,
                health.clone(),
                config.checkpoint_retention(),
                config.pending_request_ttl(),
            ),
            coordinator: Coordinator::new(store, health.clone(), config),
            health,
            config: config.clone(),
        }
    }

    #[must_use]
    pub const fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Run every task once, in detection, health, sweep, coordination order.
    pub async fn run_once(&self) -> Result<CycleReport> {
        self.coordinator.start().await?;
        let deadlocks = self.detector.detect().await?;
        let transitions = self.health.check().await?;
        let sweep = self.cleaner.sweep().await;
        let coordinator = self.coordinator.tick().await?;
        Ok(CycleReport {
            deadlocks,
            transitions,
            sweep,
            coordinator,
        })
    }

    /// Run until `shutdown` completes or a system failure occurs.
    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let pid = Some(std::process::id());
        self.health.heartbeat(MONITOR_COMPONENT, pid).await?;
        self.health.heartbeat(COORDINATOR_ID, pid).await?;
        self.coordinator.start().await?;

        let mut detect = ticker(self.config.detection_interval_secs);
        let mut health = ticker(self.config.health_check_interval_secs);
        let mut sweep = ticker(self.config.sweep_interval_secs);
        let mut coordinate = ticker(self.config.coordinator_poll_interval_secs);

        info!(
            detection_secs = self.config.detection_interval_secs,
            health_secs = self.config.health_check_interval_secs,
            sweep_secs = self.config.sweep_interval_secs,
            coordinator_secs = self.config.coordinator_poll_interval_secs,
            "Supervisor started"
        );

        tokio::pin!(shutdown);
        loop {
            let task = tokio::select! {
                () = &mut shutdown => break,
                _ = detect.tick() => Task::Detect,
                _ = health.tick() => Task::HealthCheck,
                _ = sweep.tick() => Task::Sweep,
                _ = coordinate.tick() => Task::Coordinate,
            };
            self.step(task).await?;
        }

        info!("Supervisor shutting down");
        self.health.deregister(COORDINATOR_ID).await?;
        self.health.deregister(MONITOR_COMPONENT).await?;
        Ok(())
    }

    async fn step(&self, task: Task) -> Result<()> {
        match self.perform(task).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_transient() => {
                warn!(task = %task, error = %e, "Transient failure, retrying next tick");
                Ok(())
            }
            Err(e) => {
                error!(task = %task, error = %e, code = e.code(), "Supervisor halting");
                if let Err(report_error) = self
                    .health
                    .report_degraded(MONITOR_COMPONENT, &format!("{task}: {e}"))
                    .await
                {
                    warn!(error = %report_error, "Could not publish degradation");
                }
                Err(e)
            }
        }
    }

    async fn perform(&self, task: Task) -> Result<()> {
        match task {
            Task::Detect => {
                self.detector.detect().await?;
            }
            Task::HealthCheck => {
                self.health.heartbeat(MONITOR_COMPONENT, Some(std::process::id())).await?;
                self.health.check().await?;
            }
            Task::Sweep => {
                let report = self.cleaner.sweep().await;
                if let Some(failure) = report.failures.iter().find(|f| f.store_failure) {
                    return Err(Error::Database(format!("{} pass: {}", failure.pass, failure.message)));
                }
            }
            Task::Coordinate => {
                self.health.heartbeat(COORDINATOR_ID, Some(std::process::id())).await?;
                self.coordinator.tick().await?;
            }
        }
        Ok(())
    }
}

fn ticker(secs: u64) -> tokio::time::Interval {
    let mut ticker = interval(StdDuration::from_secs(secs.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

/// Completes on SIGINT, or SIGTERM on Unix.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable, waiting for SIGINT only");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!(error = %e, "SIGINT handler failed");
                }
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "SIGINT handler failed");
        }
    }
}
