//! End-to-end coordination scenarios across loops, monitor and coordinator.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    clippy::too_many_lines
)]

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use convoy_core::{
    events::payloads::{ForceRelease, RegressionDetected},
    AcquireRequest, Acquisition, DeadlockDetector, Directive, DirectiveEffect, EventFilter,
    EventLog, EventType, HealthManager, HealthStatus, HealthThresholds, LockManager, LoopSession,
    InMemoryRepository, Priorities, RegressionMonitor, Result, Store, Verifier, WorkOutcome,
};

use common::{as_vcs, clean_repo, count_events, three_loop_history};

#[tokio::test]
async fn denied_acquire_records_wait_edge_until_release() -> Result<()> {
    let store = Store::in_memory().await?;
    let locks = LockManager::new(store.clone());
    let detector = DeadlockDetector::new(store.clone(), Duration::minutes(5));

    let first = locks.acquire(&AcquireRequest::new("server/api.ts", "loop-1")).await?;
    assert!(first.is_granted());

    let second = locks.acquire(&AcquireRequest::new("server/api.ts", "loop-2")).await?;
    match second {
        Acquisition::Denied { holder, .. } => assert_eq!(holder, "loop-1"),
        Acquisition::Granted(_) => panic!("second holder must be denied"),
    }

    let edges = detector.wait_edges().await?;
    assert_eq!(edges.len(), 1);
    assert_eq!((edges[0].waiter.as_str(), edges[0].holder.as_str()), ("loop-2", "loop-1"));

    assert!(locks.release("server/api.ts", "loop-1").await?);
    assert!(locks
        .acquire(&AcquireRequest::new("server/api.ts", "loop-2"))
        .await?
        .is_granted());
    assert!(detector.wait_edges().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn cross_held_locks_deadlock_names_lower_priority_victim() -> Result<()> {
    let store = Store::in_memory().await?;
    let locks = LockManager::new(store.clone());
    let detector = DeadlockDetector::new(store.clone(), Duration::minutes(5));
    Priorities::new(store.clone()).set("loop-1", 3, "operator").await?;

    locks.acquire(&AcquireRequest::new("X", "loop-1")).await?;
    locks.acquire(&AcquireRequest::new("Y", "loop-2")).await?;
    assert!(!locks.acquire(&AcquireRequest::new("Y", "loop-1")).await?.is_granted());
    assert!(!locks.acquire(&AcquireRequest::new("X", "loop-2")).await?.is_granted());

    let deadlocks = detector.detect().await?;
    assert_eq!(deadlocks.len(), 1);
    assert_eq!(deadlocks[0].cycle, vec!["loop-1".to_string(), "loop-2".to_string()]);
    assert_eq!(deadlocks[0].victim, "loop-2");
    assert!(deadlocks[0].event_seq.is_some());

    // The same cycle is not signalled twice.
    let again = detector.detect().await?;
    assert_eq!(again.len(), 1);
    assert!(again[0].event_seq.is_none());
    assert_eq!(count_events(&store, EventType::ForceRelease).await?, 1);

    let log = EventLog::new(store.clone());
    let release = log.recent(&EventFilter::of_types([EventType::ForceRelease]), 1).await?;
    let payload: ForceRelease = release[0].payload_as()?;
    assert_eq!(payload.held_locks, vec!["Y".to_string()]);
    assert!(payload.must_rollback);

    // Victim gives way; the survivor proceeds.
    locks.release_all("loop-2").await?;
    assert!(locks.acquire(&AcquireRequest::new("Y", "loop-1")).await?.is_granted());
    assert!(detector.detect().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn rollback_directive_restores_pre_work_checkpoint() -> Result<()> {
    let store = Store::in_memory().await?;
    let repo = clean_repo().await?;
    let session = LoopSession::with_defaults("loop-1", store.clone(), as_vcs(&repo));
    session.start().await?;

    let unit = session.begin_work("CP-UFS-001").await?;
    repo.write_file("src/ufs.ts", "syntax error(").await;
    let build_ok = |contents: Option<String>| contents.as_deref() == Some("ok");
    assert!(!build_ok(repo.read_file("src/ufs.ts").await));

    session
        .complete(&unit, WorkOutcome::Failed { reason: "build broke".into() })
        .await?;
    EventLog::new(store.clone())
        .publish_typed(
            "coordinator",
            &convoy_core::events::payloads::RollbackTriggered {
                target: "loop-1".into(),
                checkpoint_id: Some(unit.checkpoint.id.clone()),
                reason: "build broke".into(),
                work_item_id: Some("CP-UFS-001".into()),
            },
        )
        .await?;

    let directives = session.directives().await?;
    assert!(matches!(directives.as_slice(), [Directive::Rollback { .. }]));
    let effect = session.handle_directive(&directives[0]).await?;
    assert_eq!(
        effect,
        DirectiveEffect::RolledBack {
            checkpoint_id: unit.checkpoint.id.clone(),
            released_locks: 0,
        }
    );
    assert!(build_ok(repo.read_file("src/ufs.ts").await));

    // Rolling back again lands in the same state.
    session.handle_directive(&directives[0]).await?;
    assert!(build_ok(repo.read_file("src/ufs.ts").await));
    Ok(())
}

/// Auth checks pass only while the working tree still exports a truthy auth.
#[derive(Debug)]
struct AuthSuite(Arc<InMemoryRepository>);

#[async_trait]
impl Verifier for AuthSuite {
    async fn verify(&self, work_item_id: &str, _commit: &str) -> Result<bool> {
        if work_item_id != "INF-AUTH-003" {
            return Ok(true);
        }
        let auth = self.0.read_file("src/auth.ts").await;
        Ok(auth.is_some_and(|source| source.contains("true")))
    }
}

#[tokio::test]
async fn later_commit_breaking_earlier_pass_is_blamed_on_committer() -> Result<()> {
    let store = Store::in_memory().await?;
    let repo = clean_repo().await?;
    let suite: Arc<dyn Verifier> = Arc::new(AuthSuite(repo.clone()));
    let loop1 = LoopSession::with_defaults("loop-1", store.clone(), as_vcs(&repo))
        .with_verifier(suite.clone());
    let loop2 = LoopSession::with_defaults("loop-2", store.clone(), as_vcs(&repo))
        .with_verifier(suite);
    loop1.start().await?;
    loop2.start().await?;

    repo.write_file("src/auth.ts", "export const auth = () => true;").await;
    repo.commit("a1", "loop-1", "Add auth").await?;
    let unit = loop1.begin_work("INF-AUTH-003").await?;
    assert!(loop1.complete(&unit, WorkOutcome::Passed).await?.is_empty());

    let unit = loop2.begin_work("CP-UFS-001").await?;
    repo.write_file("src/auth.ts", "export const auth = () => false;").await;
    repo.commit("b2", "loop-2", "Stub auth for ufs").await?;
    let regressions = loop2.complete(&unit, WorkOutcome::Passed).await?;

    assert_eq!(regressions.len(), 1);
    assert_eq!(regressions[0].blamed_test, "INF-AUTH-003");
    assert_eq!(regressions[0].blamed_loop.as_deref(), Some("loop-2"));
    assert_eq!(regressions[0].passing_commit, "a1");
    assert_eq!(regressions[0].failing_commit, "b2");
    assert_eq!(count_events(&store, EventType::RegressionDetected).await?, 1);

    // The broken item keeps its last good commit.
    let monitor = RegressionMonitor::new(store.clone(), as_vcs(&repo));
    let record = monitor.passing_record("INF-AUTH-003").await?;
    assert_eq!(record.map(|r| r.commit).as_deref(), Some("a1"));

    let directives = loop2.directives().await?;
    assert!(matches!(directives.as_slice(), [Directive::Rollback { .. }]));
    assert!(loop1.directives().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn dependent_failure_blames_intervening_loop() -> Result<()> {
    let store = Store::in_memory().await?;
    let repo = three_loop_history().await?;
    let monitor = RegressionMonitor::new(store.clone(), as_vcs(&repo)).with_auto_rollback(false);

    monitor.record_pass("INF-AUTH-003", "abc123", "loop-1").await?;
    monitor.register_dependency("CP-UFS-001", "INF-AUTH-003").await?;

    let regressions = monitor.record_failure("CP-UFS-001", "def456").await?;
    assert_eq!(regressions.len(), 1);
    assert_eq!(regressions[0].blamed_test, "INF-AUTH-003");
    assert_eq!(regressions[0].blamed_loop.as_deref(), Some("loop-2"));
    assert_eq!(regressions[0].suspects, vec!["loop-2".to_string(), "loop-3".to_string()]);

    let log = EventLog::new(store.clone());
    let detected = log.recent(&EventFilter::of_types([EventType::RegressionDetected]), 10).await?;
    let payload: RegressionDetected = detected[0].payload_as()?;
    assert_eq!(payload.blamed_loop.as_deref(), Some("loop-2"));
    assert_eq!((payload.passing_commit.as_str(), payload.failing_commit.as_str()), ("abc123", "def456"));

    // The same failure reported again is not a new regression.
    assert!(monitor.record_failure("CP-UFS-001", "def456").await?.is_empty());
    assert_eq!(count_events(&store, EventType::RegressionDetected).await?, 1);
    Ok(())
}

#[tokio::test]
async fn silent_monitor_degrades_once_per_silence() -> Result<()> {
    let store = Store::in_memory().await?;
    let health = HealthManager::new(
        store.clone(),
        HealthThresholds {
            degraded_after: Duration::seconds(2),
            dead_after: Duration::seconds(60),
        },
    );

    health.heartbeat("monitor", None).await?;
    let start = Utc::now();

    let first = health.check_at(start + Duration::seconds(3)).await?;
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].to, HealthStatus::Degraded);
    assert!(health.check_at(start + Duration::seconds(4)).await?.is_empty());
    assert_eq!(count_events(&store, EventType::ComponentDegraded).await?, 1);

    health.heartbeat("monitor", None).await?;
    assert!(health.check().await?.is_empty());
    assert_eq!(count_events(&store, EventType::ComponentDegraded).await?, 1);
    assert_eq!(
        health.status("monitor").await?.map(|c| c.status),
        Some(HealthStatus::Healthy)
    );

    let next_silence = Utc::now() + Duration::seconds(3);
    assert_eq!(health.check_at(next_silence).await?.len(), 1);
    assert_eq!(count_events(&store, EventType::ComponentDegraded).await?, 2);
    Ok(())
}

#[tokio::test]
async fn expired_lock_is_acquirable_by_another_holder() -> Result<()> {
    let store = Store::in_memory().await?;
    let locks = LockManager::new(store.clone());

    locks
        .acquire(&AcquireRequest::new("server/api.ts", "loop-1").with_ttl(Duration::milliseconds(20)))
        .await?;
    tokio::time::sleep(std::time::Duration::from_millis(40)).await;

    let taken = locks.acquire(&AcquireRequest::new("server/api.ts", "loop-2")).await?;
    assert!(taken.is_granted());
    assert_eq!(count_events(&store, EventType::FileUnlocked).await?, 1);
    Ok(())
}
