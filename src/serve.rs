//! In-environment entry point.
//!
//! Runs inside the container or machine: bring up the control plane, clone
//! the repository, then hand the process over to the worker loop. The server
//! binds before the clone so `/healthz` answers while a large repository is
//! still downloading; `/status` reports `starting` until the loop takes over.
//! The process exits when the loop reaches `stopped`, after a short grace
//! period so any in-flight `/status` poll sees the terminal state.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::backlog::Backlog;
use crate::config::SECRET_ENV;
use crate::logs::LogSink;
use crate::redact::Redactor;
use crate::repo::{GitCli, RepoOps, RepoRef};
use crate::runner::ClaudeRunner;
use crate::server::ControlPlaneServer;
use crate::worker::{self, ControlLoopContext, STOP_GRACE};

pub async fn run() -> Result<()> {
    let container_name = std::env::var("CONTAINER_NAME").unwrap_or_else(|_| "agent".to_string());
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);
    let repo_ref = RepoRef {
        repo_url: std::env::var("REPO_URL").context("REPO_URL is required")?,
        clone_branch: std::env::var("CLONE_BRANCH").unwrap_or_else(|_| "main".to_string()),
        push_branch: std::env::var("PUSH_BRANCH")
            .unwrap_or_else(|_| format!("agent/{container_name}")),
    };
    let workdir = PathBuf::from(
        std::env::var("WORKDIR").unwrap_or_else(|_| "/workspace/repo".to_string()),
    );
    let data_dir = PathBuf::from(
        std::env::var("DATA_DIR").unwrap_or_else(|_| "/workspace/data".to_string()),
    );

    // Every line that leaves this process goes through the redactor.
    let secrets: Vec<String> = SECRET_ENV
        .iter()
        .filter_map(|key| std::env::var(key).ok())
        .collect();
    let logs = LogSink::new(Redactor::new(secrets), Some(data_dir.join("logs")))?;
    logs.archive()?;

    let repo: Arc<dyn RepoOps> = Arc::new(GitCli::new(&workdir));
    let ctx = ControlLoopContext::new(
        container_name,
        workdir.clone(),
        Backlog::new(data_dir.join("backlog.json")),
        logs,
        std::env::var("WEBHOOK_URL").ok(),
        Arc::new(ClaudeRunner::new()),
        Arc::clone(&repo),
        repo_ref.clone(),
    );

    let mut server = ControlPlaneServer::new(Arc::clone(&ctx));
    let addr = server.start(&format!("0.0.0.0:{port}")).await?;
    info!(%addr, "control plane listening");

    if let Err(e) = prepare_worktree(&*repo, &repo_ref, &workdir, &ctx).await {
        server.stop();
        return Err(e);
    }

    worker::run(Arc::clone(&ctx)).await;

    tokio::time::sleep(STOP_GRACE).await;
    server.stop();
    Ok(())
}

async fn prepare_worktree(
    repo: &dyn RepoOps,
    repo_ref: &RepoRef,
    workdir: &std::path::Path,
    ctx: &ControlLoopContext,
) -> Result<()> {
    if !workdir.join(".git").exists() {
        info!(url = %repo_ref.repo_url, branch = %repo_ref.clone_branch, "cloning repository");
        ctx.logs.line(&format!(
            "cloning {} ({})",
            repo_ref.repo_url, repo_ref.clone_branch
        ));
        repo.clone_repo(repo_ref, workdir)
            .await
            .map_err(|e| anyhow::anyhow!("clone failed: {e}"))?;
    }
    repo.checkout_branch(&repo_ref.push_branch)
        .await
        .map_err(|e| anyhow::anyhow!("checkout failed: {e}"))?;
    Ok(())
}
