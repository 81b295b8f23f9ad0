//! `git` command-line implementation.

use std::{
    path::{Path, PathBuf},
    process::Output,
};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{CommitInfo, VersionControl, OWNER_TRAILER};
use crate::{Error, Result};

/// Paths never captured in snapshots nor cleaned on restore.
const DEFAULT_EXCLUDES: &[&str] = &[".convoy"];

const FIELD_SEP: char = '\u{1f}';
const RECORD_SEP: char = '\u{1e}';

/// A repository driven through the `git` binary.
#[derive(Debug, Clone)]
pub struct GitRepository {
    root: PathBuf,
    excludes: Vec<String>,
}

impl GitRepository {
    /// Use `root` as the repository top level without checking it.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            excludes: DEFAULT_EXCLUDES.iter().map(ToString::to_string).collect(),
        }
    }

    /// Locate `git` and the repository containing `path`.
    pub async fn discover(path: &Path) -> Result<Self> {
        which::which("git").map_err(|e| Error::vcs("locate git", e.to_string()))?;
        let repo = Self::new(path);
        let toplevel = repo.git("discover", &["rev-parse", "--show-toplevel"]).await?;
        Ok(Self::new(toplevel))
    }

    /// Also exclude `path` from snapshots and restores.
    #[must_use]
    pub fn with_exclude(mut self, path: impl Into<String>) -> Self {
        self.excludes.push(path.into());
        self
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn output(&self, operation: &str, args: &[&str], env: &[(&str, &str)]) -> Result<Output> {
        debug!(operation, args = ?args, "Running git");
        Command::new("git")
            .args(args)
            .envs(env.iter().copied())
            .current_dir(&self.root)
            .output()
            .await
            .map_err(|e| Error::vcs(operation, e.to_string()))
    }

    async fn git_with_env(
        &self,
        operation: &str,
        args: &[&str],
        env: &[(&str, &str)],
    ) -> Result<String> {
        let output = self.output(operation, args, env).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::vcs(operation, stderr.trim()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn git(&self, operation: &str, args: &[&str]) -> Result<String> {
        self.git_with_env(operation, args, &[]).await
    }

    fn add_pathspec(&self) -> Vec<String> {
        let mut spec = vec!["add".to_string(), "-A".to_string(), "--".to_string(), ".".to_string()];
        spec.extend(self.excludes.iter().map(|e| format!(":(exclude){e}")));
        spec
    }

    fn clean_args(&self) -> Vec<String> {
        let mut args = vec!["clean".to_string(), "-fdq".to_string()];
        for exclude in &self.excludes {
            args.push("-e".to_string());
            args.push(exclude.clone());
        }
        args
    }

    async fn write_snapshot_tree(&self, index: &str) -> Result<String> {
        let env = [("GIT_INDEX_FILE", index)];
        self.git_with_env("snapshot", &["read-tree", "HEAD"], &env).await?;
        let add = self.add_pathspec();
        let add: Vec<&str> = add.iter().map(String::as_str).collect();
        self.git_with_env("snapshot", &add, &env).await?;
        self.git_with_env("snapshot", &["write-tree"], &env).await
    }
}

/// Parse `git log` output written with the record format used by `commits_between`.
fn parse_log(raw: &str) -> Vec<CommitInfo> {
    raw.split(RECORD_SEP)
        .map(str::trim)
        .filter(|record| !record.is_empty())
        .filter_map(|record| {
            let mut fields = record.split(FIELD_SEP);
            let id = fields.next()?.trim().to_string();
            let author = fields.next().unwrap_or_default().trim();
            let summary = fields.next().unwrap_or_default().trim().to_string();
            let trailer = fields.next().unwrap_or_default().trim();
            let owner = if trailer.is_empty() { author } else { trailer };
            Some(CommitInfo {
                id,
                owner: owner.to_string(),
                summary,
            })
        })
        .collect()
}

#[async_trait]
impl VersionControl for GitRepository {
    async fn create_ref(&self, reference: &str, owner: &str, message: &str) -> Result<String> {
        let head = self.git("snapshot", &["rev-parse", "--verify", "HEAD"]).await?;

        let index_name = format!("convoy-index-{}", reference.replace('/', "-"));
        let index = self.git("snapshot", &["rev-parse", "--git-path", &index_name]).await?;
        let index = self.root.join(index);
        let index_str = index.to_string_lossy().to_string();

        let tree = self.write_snapshot_tree(&index_str).await;
        if let Err(e) = tokio::fs::remove_file(&index).await {
            debug!(path = %index.display(), error = %e, "Temporary index not removed");
        }
        let tree = tree?;

        let email = format!("{owner}@convoy.local");
        let env = [
            ("GIT_AUTHOR_NAME", owner),
            ("GIT_AUTHOR_EMAIL", email.as_str()),
            ("GIT_COMMITTER_NAME", owner),
            ("GIT_COMMITTER_EMAIL", email.as_str()),
        ];
        let body = format!("{message}\n\n{OWNER_TRAILER}: {owner}");
        let commit = self
            .git_with_env("snapshot", &["commit-tree", &tree, "-p", &head, "-m", &body], &env)
            .await?;

        self.git("snapshot", &["update-ref", reference, &commit]).await?;
        Ok(reference.to_string())
    }

    async fn reset_to_ref(&self, reference: &str) -> Result<()> {
        let parent_spec = format!("{reference}^");
        let parent = self.git("restore", &["rev-parse", "--verify", &parent_spec]).await?;

        self.git("restore", &["reset", "-q", "--hard", reference]).await?;
        let clean = self.clean_args();
        let clean: Vec<&str> = clean.iter().map(String::as_str).collect();
        self.git("restore", &clean).await?;
        self.git("restore", &["reset", "-q", "--mixed", &parent]).await?;
        Ok(())
    }

    async fn delete_ref(&self, reference: &str) -> Result<()> {
        let exists = self
            .output("delete ref", &["rev-parse", "--verify", "--quiet", reference], &[])
            .await?
            .status
            .success();
        if exists {
            self.git("delete ref", &["update-ref", "-d", reference]).await?;
        }
        Ok(())
    }

    async fn head(&self) -> Result<String> {
        self.git("head", &["rev-parse", "--verify", "HEAD"]).await
    }

    async fn commits_between(&self, from: &str, to: &str) -> Result<Vec<CommitInfo>> {
        let range = format!("{from}..{to}");
        let format = format!(
            "--format=%H%x1f%an%x1f%s%x1f%(trailers:key={OWNER_TRAILER},valueonly,separator=%x2C)%x1e"
        );
        let raw = self.git("log", &["log", "--reverse", &format, &range]).await?;
        Ok(parse_log(&raw))
    }

    async fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool> {
        let output = self
            .output("merge-base", &["merge-base", "--is-ancestor", ancestor, descendant], &[])
            .await?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(Error::vcs(
                "merge-base",
                String::from_utf8_lossy(&output.stderr).trim(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_log_prefers_owner_trailer() {
        let raw = "abc\u{1f}Alice\u{1f}Add auth\u{1f}loop-2\u{1e}\ndef\u{1f}Bob\u{1f}Fix build\u{1f}\u{1e}\n";
        let commits = parse_log(raw);
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0].owner, "loop-2");
        assert_eq!(commits[1].owner, "Bob");
        assert_eq!(commits[1].summary, "Fix build");
    }

    #[test]
    fn parse_log_ignores_blank_output() {
        assert!(parse_log("\n").is_empty());
    }

    #[test]
    fn clean_keeps_excluded_paths() {
        let repo = GitRepository::new("/tmp/repo").with_exclude("target");
        let args = repo.clean_args();
        assert!(args.windows(2).any(|w| w[0] == "-e" && w[1] == ".convoy"));
        assert!(args.windows(2).any(|w| w[0] == "-e" && w[1] == "target"));
    }
}
