//! Checkpoint and blame round trips against a real `git` repository.
//!
//! Skipped when `git` is not installed.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::indexing_slicing)]

use std::{path::Path, process::Command, sync::Arc};

use convoy_core::{CheckpointManager, GitRepository, Result, Store, VersionControl};
use serial_test::serial;

fn git(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(args)
        .current_dir(dir)
        .status()
        .unwrap();
    assert!(status.success(), "git {args:?} failed");
}

fn init_repo() -> Option<tempfile::TempDir> {
    if which::which("git").is_err() {
        eprintln!("git not installed, skipping");
        return None;
    }
    let dir = tempfile::tempdir().unwrap();
    git(dir.path(), &["init", "-q"]);
    git(dir.path(), &["config", "user.name", "Test"]);
    git(dir.path(), &["config", "user.email", "test@example.com"]);
    git(dir.path(), &["config", "commit.gpgsign", "false"]);
    std::fs::write(dir.path().join("auth.ts"), "v1\n").unwrap();
    std::fs::write(dir.path().join("ufs.ts"), "v1\n").unwrap();
    git(dir.path(), &["add", "."]);
    git(dir.path(), &["commit", "-q", "-m", "initial"]);
    Some(dir)
}

#[tokio::test]
#[serial]
async fn rollback_restores_tracked_untracked_and_deleted_files() -> Result<()> {
    let Some(dir) = init_repo() else {
        return Ok(());
    };
    let repo = GitRepository::discover(dir.path()).await?;
    let head_before = repo.head().await?;
    let store = Store::open(&dir.path().join(".convoy").join("state.db")).await?;
    let checkpoints = CheckpointManager::new(store, Arc::new(repo.clone()));

    // Uncommitted work is part of the snapshot.
    std::fs::write(dir.path().join("auth.ts"), "v2-wip\n")?;
    std::fs::write(dir.path().join("notes.md"), "draft\n")?;
    let checkpoint = checkpoints.create("loop-1", "before CP-UFS-001").await?;

    std::fs::write(dir.path().join("auth.ts"), "broken\n")?;
    std::fs::remove_file(dir.path().join("ufs.ts"))?;
    std::fs::write(dir.path().join("scratch.tmp"), "junk\n")?;

    checkpoints.rollback(&checkpoint.id).await?;

    assert_eq!(std::fs::read_to_string(dir.path().join("auth.ts"))?, "v2-wip\n");
    assert_eq!(std::fs::read_to_string(dir.path().join("ufs.ts"))?, "v1\n");
    assert_eq!(std::fs::read_to_string(dir.path().join("notes.md"))?, "draft\n");
    assert!(!dir.path().join("scratch.tmp").exists());
    assert!(dir.path().join(".convoy").join("state.db").exists());
    assert_eq!(repo.head().await?, head_before);

    // Rolling back again is a no-op on content.
    checkpoints.rollback(&checkpoint.id).await?;
    assert_eq!(std::fs::read_to_string(dir.path().join("auth.ts"))?, "v2-wip\n");
    Ok(())
}

#[tokio::test]
#[serial]
async fn commits_between_reads_owner_trailer() -> Result<()> {
    let Some(dir) = init_repo() else {
        return Ok(());
    };
    let repo = GitRepository::discover(dir.path()).await?;
    let base = repo.head().await?;

    std::fs::write(dir.path().join("auth.ts"), "v2\n")?;
    git(dir.path(), &["commit", "-q", "-am", "Refactor auth\n\nConvoy-Owner: loop-2"]);
    std::fs::write(dir.path().join("ufs.ts"), "v2\n")?;
    git(dir.path(), &["commit", "-q", "-am", "Touch ufs"]);
    let tip = repo.head().await?;

    let range = repo.commits_between(&base, &tip).await?;
    assert_eq!(range.len(), 2);
    assert_eq!(range[0].owner, "loop-2");
    assert_eq!(range[0].summary, "Refactor auth");
    assert_eq!(range[1].owner, "Test");
    assert!(repo.is_ancestor(&base, &tip).await?);
    assert!(!repo.is_ancestor(&tip, &base).await?);
    Ok(())
}

#[tokio::test]
#[serial]
async fn purge_deletes_snapshot_ref() -> Result<()> {
    let Some(dir) = init_repo() else {
        return Ok(());
    };
    let repo = GitRepository::discover(dir.path()).await?;
    let store = Store::open(&dir.path().join(".convoy").join("state.db")).await?;
    let checkpoints = CheckpointManager::new(store, Arc::new(repo));

    let checkpoint = checkpoints.create("loop-1", "temp").await?;
    assert!(checkpoints.delete(&checkpoint.id).await?);
    let purged = checkpoints.purge_expired(chrono::Duration::zero()).await?;
    assert_eq!(purged, vec![checkpoint.id.clone()]);

    let output = Command::new("git")
        .args(["rev-parse", "--verify", "--quiet", &checkpoint.snapshot_ref])
        .current_dir(dir.path())
        .output()?;
    assert!(!output.status.success());
    Ok(())
}
