//! Repository side effects, behind a trait so the worker loop is testable
//! without a real checkout.
//!
//! The real implementation shells out to the `git` CLI. Commit and push are
//! best-effort from the loop's perspective: a failure is logged on the work
//! item, never fatal to the process.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;

use crate::errors::WorkError;

/// Where to clone from and which branches to track.
#[derive(Debug, Clone)]
pub struct RepoRef {
    pub repo_url: String,
    pub clone_branch: String,
    pub push_branch: String,
}

#[async_trait]
pub trait RepoOps: Send + Sync {
    /// Clone `repo_ref.clone_branch` into `dest`.
    async fn clone_repo(&self, repo_ref: &RepoRef, dest: &Path) -> Result<(), WorkError>;

    /// Check out `branch`, creating it if it does not exist.
    async fn checkout_branch(&self, branch: &str) -> Result<(), WorkError>;

    /// Stage everything, commit with `summary`, and push. A clean tree is
    /// not an error; returns whether a commit was made.
    async fn commit_and_push(&self, summary: &str, branch: &str) -> Result<bool, WorkError>;

    /// Current HEAD revision, abbreviated.
    async fn revision(&self) -> Result<String, WorkError>;
}

/// `git` CLI implementation operating on one working directory.
pub struct GitCli {
    workdir: PathBuf,
}

impl GitCli {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    async fn git(&self, args: &[&str]) -> Result<String, WorkError> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .await
            .map_err(|e| WorkError::Git(format!("failed to run git {}: {e}", args.join(" "))))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WorkError::Git(format!(
                "git {} failed: {}",
                args.join(" "),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl RepoOps for GitCli {
    async fn clone_repo(&self, repo_ref: &RepoRef, dest: &Path) -> Result<(), WorkError> {
        let dest_str = dest
            .to_str()
            .ok_or_else(|| WorkError::Git("clone destination is not valid UTF-8".into()))?;
        let output = Command::new("git")
            .args([
                "clone",
                "--branch",
                &repo_ref.clone_branch,
                "--single-branch",
                &repo_ref.repo_url,
                dest_str,
            ])
            .output()
            .await
            .map_err(|e| WorkError::Git(format!("failed to run git clone: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WorkError::Git(format!("git clone failed: {}", stderr.trim())));
        }
        Ok(())
    }

    async fn checkout_branch(&self, branch: &str) -> Result<(), WorkError> {
        // Prefer an existing branch; fall back to creating it.
        if self.git(&["checkout", branch]).await.is_ok() {
            return Ok(());
        }
        self.git(&["checkout", "-b", branch]).await.map(|_| ())
    }

    async fn commit_and_push(&self, summary: &str, branch: &str) -> Result<bool, WorkError> {
        let status = self.git(&["status", "--porcelain"]).await?;
        if status.is_empty() {
            return Ok(false);
        }
        self.git(&["add", "-A"]).await?;
        self.git(&["commit", "-m", summary]).await?;
        self.git(&["push", "-u", "origin", branch]).await?;
        Ok(true)
    }

    async fn revision(&self) -> Result<String, WorkError> {
        self.git(&["rev-parse", "--short", "HEAD"]).await
    }
}
