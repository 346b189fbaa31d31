//! Configuration for provisioning and running an execution environment.
//!
//! Everything is environment-variable driven. The declared-variable manifest
//! below is diffed against the supplied configuration before anything is
//! provisioned: a missing required variable is a fatal pre-launch error,
//! never a runtime one.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};

use crate::errors::LifecycleError;
use crate::repo::RepoRef;

/// Variables the execution environment cannot run without.
pub const REQUIRED_ENV: &[&str] = &["ANTHROPIC_API_KEY", "GIT_TOKEN"];

/// Forwarded when present; absence is fine.
pub const OPTIONAL_ENV: &[&str] = &["WEBHOOK_URL", "CLAUDE_CMD"];

/// Subset of forwarded variables whose values are secrets and must be
/// redacted from all log output.
pub const SECRET_ENV: &[&str] = &["ANTHROPIC_API_KEY", "GIT_TOKEN"];

/// Default local port scan base; incremented until a free port is found.
pub const BASE_PORT: u16 = 48100;

/// Remote-transport credentials and placement.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub api_token: String,
    pub app: String,
    pub image: String,
}

/// Everything needed to provision one environment.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub container_name: String,
    /// Environment variables forwarded verbatim into the environment.
    pub env: HashMap<String, String>,
    pub webhook_url: Option<String>,
    pub remote: Option<RemoteConfig>,
}

impl AgentConfig {
    /// Build from the current process environment. `remote` credentials are
    /// collected only when the remote transport is requested.
    pub fn from_env(container_name: String, remote: bool) -> Result<Self> {
        let mut env = HashMap::new();
        for key in REQUIRED_ENV.iter().chain(OPTIONAL_ENV) {
            if let Ok(value) = std::env::var(key) {
                env.insert(key.to_string(), value);
            }
        }
        let webhook_url = env.get("WEBHOOK_URL").cloned();

        let remote = if remote {
            Some(RemoteConfig {
                api_token: std::env::var("FLY_API_TOKEN")
                    .context("FLY_API_TOKEN is required for the remote transport")?,
                app: std::env::var("FLY_APP")
                    .context("FLY_APP is required for the remote transport")?,
                image: std::env::var("AGENT_IMAGE")
                    .context("AGENT_IMAGE is required for the remote transport")?,
            })
        } else {
            None
        };

        Ok(Self {
            container_name,
            env,
            webhook_url,
            remote,
        })
    }

    /// Diff the declared manifest against the supplied configuration.
    /// Returns the fatal pre-launch error if anything required is missing.
    pub fn check_required(&self) -> Result<(), LifecycleError> {
        let missing: Vec<String> = REQUIRED_ENV
            .iter()
            .filter(|key| !self.env.contains_key(**key))
            .map(|key| key.to_string())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(LifecycleError::MissingEnv(missing))
        }
    }

    /// Values that must never appear in log output.
    pub fn secret_values(&self) -> Vec<String> {
        SECRET_ENV
            .iter()
            .filter_map(|key| self.env.get(*key).cloned())
            .collect()
    }
}

/// Resolve the repository reference from flags, falling back to environment
/// variables and then to the local git checkout.
pub fn resolve_repo_ref(
    repo: Option<String>,
    branch: Option<String>,
    push_branch: Option<String>,
    container_name: &str,
) -> Result<RepoRef> {
    let repo_url = match repo.or_else(|| std::env::var("REPO_URL").ok()) {
        Some(url) => url,
        None => local_origin_url()
            .ok_or_else(|| anyhow!("No repository given: pass --repo or set REPO_URL"))?,
    };
    let clone_branch = branch
        .or_else(|| std::env::var("CLONE_BRANCH").ok())
        .or_else(local_branch)
        .unwrap_or_else(|| "main".to_string());
    let push_branch = push_branch
        .or_else(|| std::env::var("PUSH_BRANCH").ok())
        .unwrap_or_else(|| format!("agent/{container_name}"));
    Ok(RepoRef {
        repo_url,
        clone_branch,
        push_branch,
    })
}

fn local_origin_url() -> Option<String> {
    git_stdout(&["remote", "get-url", "origin"])
}

fn local_branch() -> Option<String> {
    git_stdout(&["rev-parse", "--abbrev-ref", "HEAD"])
}

fn git_stdout(args: &[&str]) -> Option<String> {
    let output = std::process::Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if value.is_empty() { None } else { Some(value) }
}

/// Directory for the local state file and registry log.
pub fn state_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".deckhand"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(keys: &[&str]) -> AgentConfig {
        AgentConfig {
            container_name: "test".into(),
            env: keys
                .iter()
                .map(|k| (k.to_string(), format!("{k}-value-123456")))
                .collect(),
            webhook_url: None,
            remote: None,
        }
    }

    #[test]
    fn all_required_present_passes() {
        let config = config_with(REQUIRED_ENV);
        assert!(config.check_required().is_ok());
    }

    #[test]
    fn missing_required_is_fatal_and_named() {
        let config = config_with(&["GIT_TOKEN"]);
        let err = config.check_required().unwrap_err();
        match err {
            LifecycleError::MissingEnv(missing) => {
                assert_eq!(missing, vec!["ANTHROPIC_API_KEY".to_string()]);
            }
            other => panic!("expected MissingEnv, got {other}"),
        }
    }

    #[test]
    fn secret_values_come_from_secret_manifest_only() {
        let mut config = config_with(REQUIRED_ENV);
        config
            .env
            .insert("WEBHOOK_URL".into(), "https://hooks.example".into());
        let secrets = config.secret_values();
        assert_eq!(secrets.len(), SECRET_ENV.len());
        assert!(secrets.iter().all(|s| s.contains("-value-")));
    }

    #[test]
    fn repo_ref_prefers_explicit_flags() {
        let repo_ref = resolve_repo_ref(
            Some("https://example.com/x.git".into()),
            Some("dev".into()),
            Some("agent/out".into()),
            "name",
        )
        .unwrap();
        assert_eq!(repo_ref.repo_url, "https://example.com/x.git");
        assert_eq!(repo_ref.clone_branch, "dev");
        assert_eq!(repo_ref.push_branch, "agent/out");
    }

    #[test]
    fn push_branch_defaults_to_container_name() {
        let repo_ref = resolve_repo_ref(
            Some("https://example.com/x.git".into()),
            Some("main".into()),
            None,
            "agent-abc123",
        )
        .unwrap();
        assert_eq!(repo_ref.push_branch, "agent/agent-abc123");
    }
}
