//! Deterministic in-process repository for tests and dry runs.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{CommitInfo, VersionControl};
use crate::{Error, Result};

type Tree = BTreeMap<String, String>;

#[derive(Debug, Clone)]
struct MemoryCommit {
    parent: Option<String>,
    owner: String,
    summary: String,
}

#[derive(Debug, Clone)]
struct Snapshot {
    head: Option<String>,
    tree: Tree,
}

#[derive(Debug, Default)]
struct MemoryState {
    working: Tree,
    head: Option<String>,
    commits: HashMap<String, MemoryCommit>,
    refs: HashMap<String, Snapshot>,
}

impl MemoryState {
    /// First-parent chain from `start`, newest first.
    fn ancestry(&self, start: &str) -> Result<Vec<String>> {
        let mut chain = Vec::new();
        let mut cursor = Some(start.to_string());
        while let Some(id) = cursor {
            let commit = self
                .commits
                .get(&id)
                .ok_or_else(|| Error::vcs("log", format!("unknown commit '{id}'")))?;
            cursor = commit.parent.clone();
            chain.push(id);
        }
        Ok(chain)
    }
}

/// Files, commits and refs held in memory.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    state: Mutex<MemoryState>,
}

impl InMemoryRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn write_file(&self, path: &str, contents: &str) {
        self.state
            .lock()
            .await
            .working
            .insert(path.to_string(), contents.to_string());
    }

    pub async fn remove_file(&self, path: &str) {
        self.state.lock().await.working.remove(path);
    }

    pub async fn read_file(&self, path: &str) -> Option<String> {
        self.state.lock().await.working.get(path).cloned()
    }

    /// Snapshot of every file in the working tree.
    pub async fn files(&self) -> BTreeMap<String, String> {
        self.state.lock().await.working.clone()
    }

    /// Record a commit of the current working tree with a caller-chosen id.
    pub async fn commit(&self, id: &str, owner: &str, summary: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.commits.contains_key(id) {
            return Err(Error::vcs("commit", format!("commit '{id}' already exists")));
        }
        let parent = state.head.clone();
        state.commits.insert(
            id.to_string(),
            MemoryCommit {
                parent,
                owner: owner.to_string(),
                summary: summary.to_string(),
            },
        );
        state.head = Some(id.to_string());
        Ok(())
    }

    pub async fn has_ref(&self, reference: &str) -> bool {
        self.state.lock().await.refs.contains_key(reference)
    }
}

#[async_trait]
impl VersionControl for InMemoryRepository {
    async fn create_ref(&self, reference: &str, _owner: &str, _message: &str) -> Result<String> {
        let mut state = self.state.lock().await;
        let snapshot = Snapshot {
            head: state.head.clone(),
            tree: state.working.clone(),
        };
        state.refs.insert(reference.to_string(), snapshot);
        Ok(reference.to_string())
    }

    async fn reset_to_ref(&self, reference: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let snapshot = state
            .refs
            .get(reference)
            .cloned()
            .ok_or_else(|| Error::vcs("restore", format!("unknown ref '{reference}'")))?;
        state.working = snapshot.tree;
        state.head = snapshot.head;
        Ok(())
    }

    async fn delete_ref(&self, reference: &str) -> Result<()> {
        self.state.lock().await.refs.remove(reference);
        Ok(())
    }

    async fn head(&self) -> Result<String> {
        self.state
            .lock()
            .await
            .head
            .clone()
            .ok_or_else(|| Error::vcs("head", "repository has no commits"))
    }

    async fn commits_between(&self, from: &str, to: &str) -> Result<Vec<CommitInfo>> {
        let state = self.state.lock().await;
        let mut range = Vec::new();
        for id in state.ancestry(to)? {
            if id == from {
                break;
            }
            if let Some(commit) = state.commits.get(&id) {
                range.push(CommitInfo {
                    id: id.clone(),
                    owner: commit.owner.clone(),
                    summary: commit.summary.clone(),
                });
            }
        }
        range.reverse();
        Ok(range)
    }

    async fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool> {
        let state = self.state.lock().await;
        Ok(state.ancestry(descendant)?.iter().any(|id| id == ancestor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn history() -> Result<InMemoryRepository> {
        let repo = InMemoryRepository::new();
        repo.write_file("auth.ts", "v1").await;
        repo.commit("abc123", "loop-1", "auth").await?;
        repo.write_file("auth.ts", "v2").await;
        repo.commit("c2", "loop-2", "refactor auth").await?;
        repo.write_file("ufs.ts", "v1").await;
        repo.commit("def456", "loop-3", "ufs").await?;
        Ok(repo)
    }

    #[tokio::test]
    async fn commits_between_is_half_open_oldest_first() -> Result<()> {
        let repo = history().await?;
        let range = repo.commits_between("abc123", "def456").await?;
        let ids: Vec<&str> = range.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["c2", "def456"]);
        assert_eq!(range[0].owner, "loop-2");
        Ok(())
    }

    #[tokio::test]
    async fn ancestry_checks() -> Result<()> {
        let repo = history().await?;
        assert!(repo.is_ancestor("abc123", "def456").await?);
        assert!(repo.is_ancestor("def456", "def456").await?);
        assert!(!repo.is_ancestor("def456", "abc123").await?);
        assert!(repo.is_ancestor("nope", "zzz").await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn reset_restores_tree_and_head() -> Result<()> {
        let repo = history().await?;
        repo.create_ref("refs/convoy/checkpoints/chk-1", "loop-1", "before").await?;
        repo.write_file("ufs.ts", "broken").await;
        repo.write_file("scratch.txt", "tmp").await;
        repo.commit("bad", "loop-1", "oops").await?;

        repo.reset_to_ref("refs/convoy/checkpoints/chk-1").await?;
        assert_eq!(repo.read_file("ufs.ts").await.as_deref(), Some("v1"));
        assert!(repo.read_file("scratch.txt").await.is_none());
        assert_eq!(repo.head().await?, "def456");
        Ok(())
    }
}
