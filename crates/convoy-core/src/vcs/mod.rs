//! Version-control primitives consumed by checkpoints and regression blame.

mod git;
mod memory;

use async_trait::async_trait;
use serde::Serialize;

pub use self::{git::GitRepository, memory::InMemoryRepository};
use crate::Result;

/// Namespace for checkpoint snapshot refs.
pub const CHECKPOINT_REF_PREFIX: &str = "refs/convoy/checkpoints/";

/// Commit trailer that attributes a commit to a loop.
pub const OWNER_TRAILER: &str = "Convoy-Owner";

/// Full ref name for a checkpoint id.
#[must_use]
pub fn checkpoint_ref(checkpoint_id: &str) -> String {
    format!("{CHECKPOINT_REF_PREFIX}{checkpoint_id}")
}

/// One commit with the loop it is attributed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitInfo {
    pub id: String,
    pub owner: String,
    pub summary: String,
}

/// Repository operations the coordination core relies on.
#[async_trait]
pub trait VersionControl: Send + Sync + std::fmt::Debug {
    /// Capture the full working state (tracked, modified and untracked files)
    /// under `reference` without touching the working tree, index or HEAD.
    async fn create_ref(&self, reference: &str, owner: &str, message: &str) -> Result<String>;

    /// Restore the working tree to exactly the snapshot content and HEAD to the
    /// commit that was current when the snapshot was taken.
    async fn reset_to_ref(&self, reference: &str) -> Result<()>;

    /// Delete a snapshot ref. Deleting a missing ref succeeds.
    async fn delete_ref(&self, reference: &str) -> Result<()>;

    /// Current HEAD commit id.
    async fn head(&self) -> Result<String>;

    /// Commits in `(from, to]`, oldest first.
    async fn commits_between(&self, from: &str, to: &str) -> Result<Vec<CommitInfo>>;

    /// Whether `ancestor` is reachable from `descendant` (a commit is its own ancestor).
    async fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool>;
}
