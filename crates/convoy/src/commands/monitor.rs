//! Monitor commands - one-shot sweep and detection, and the long-running supervisor

use anyhow::Result;
use convoy_core::{
    shutdown_signal, CheckpointManager, DeadlockDetector, Error, LockManager, OrphanCleaner,
    SweepReport, Supervisor,
};
use tracing::info;

use super::Context;

fn print_sweep(report: &SweepReport) {
    println!(
        "Released {} orphaned lock(s), reclaimed {} expired lock(s), purged {} checkpoint(s) and {} stale request(s)",
        report.orphaned_locks.len(),
        report.expired_locks.len(),
        report.purged_checkpoints.len(),
        report.purged_requests
    );
    for failure in &report.failures {
        println!("  {} pass failed: {}", failure.pass, failure.message);
    }
}

/// Run the sweep command
pub async fn sweep(context: &Context) -> Result<()> {
    let store = context.store.clone();
    let config = &context.config;
    let cleaner = OrphanCleaner::new(
        store.clone(),
        LockManager::with_ttl(store.clone(), config.lock_ttl()),
        CheckpointManager::new(store, context.discover_repository().await?),
        context.health(),
        config.checkpoint_retention(),
        config.pending_request_ttl(),
    );

    let report = cleaner.sweep().await;
    context.emit(&report, print_sweep)?;
    if report.store_failed() {
        return Err(Error::Database("sweep could not reach the store".into()).into());
    }
    Ok(())
}

/// Run the detect command
pub async fn detect(context: &Context) -> Result<()> {
    let detector = DeadlockDetector::new(context.store.clone(), context.config.pending_request_ttl());
    let deadlocks = detector.detect().await?;

    context.emit(&deadlocks, |deadlocks| {
        if deadlocks.is_empty() {
            println!("No deadlocks");
        }
        for deadlock in deadlocks {
            let signalled = if deadlock.event_seq.is_some() { "" } else { " (already signalled)" };
            println!(
                "Cycle {} -> victim {}{signalled}",
                deadlock.cycle.join(" -> "),
                deadlock.victim
            );
        }
    })
}

/// Run the supervise command
pub async fn supervise(context: &Context, once: bool) -> Result<()> {
    let supervisor = Supervisor::new(
        context.store.clone(),
        context.discover_repository().await?,
        &context.config,
    );

    if once {
        let report = supervisor.run_once().await?;
        return context.emit(&report, |report| {
            println!(
                "{} deadlock(s), {} health transition(s), {} event(s) coordinated",
                report.deadlocks.len(),
                report.transitions.len(),
                report.coordinator.handled
            );
            print_sweep(&report.sweep);
        });
    }

    info!(db = %context.config.database_path.display(), "Starting supervisor");
    supervisor.run(shutdown_signal()).await?;
    Ok(())
}
