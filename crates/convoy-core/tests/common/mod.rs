//! Shared fixtures for convoy-core integration tests.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    dead_code
)]

use std::sync::Arc;

use convoy_core::{
    EventFilter, EventLog, EventType, InMemoryRepository, Result, Store, VersionControl,
};

/// A repository whose history mirrors a typical three-loop day:
/// `abc123` (loop-1, auth), `c2` (loop-2, auth refactor), `def456` (loop-3, ufs).
pub async fn three_loop_history() -> Result<Arc<InMemoryRepository>> {
    let repo = Arc::new(InMemoryRepository::new());
    repo.write_file("src/auth.ts", "export const auth = () => true;").await;
    repo.commit("abc123", "loop-1", "Add auth").await?;
    repo.write_file("src/auth.ts", "export const auth = () => false;").await;
    repo.commit("c2", "loop-2", "Refactor auth").await?;
    repo.write_file("src/ufs.ts", "import { auth } from './auth';").await;
    repo.commit("def456", "loop-3", "Add ufs").await?;
    Ok(repo)
}

/// A repository with a single clean commit.
pub async fn clean_repo() -> Result<Arc<InMemoryRepository>> {
    let repo = Arc::new(InMemoryRepository::new());
    repo.write_file("src/ufs.ts", "ok").await;
    repo.commit("c1", "loop-1", "initial").await?;
    Ok(repo)
}

pub fn as_vcs(repo: &Arc<InMemoryRepository>) -> Arc<dyn VersionControl> {
    repo.clone()
}

/// Number of events of one type in the log.
pub async fn count_events(store: &Store, event_type: EventType) -> Result<usize> {
    Ok(EventLog::new(store.clone())
        .recent(&EventFilter::of_types([event_type]), 1000)
        .await?
        .len())
}
