//! Environment lifecycle: provisioning, health gating, teardown, and the
//! persisted registry of everything started.
//!
//! `start` refuses to create anything until the configuration manifest
//! checks out, so a failed start leaves zero registry entries behind.
//! `stop` is idempotent and always clears local records, even when the
//! environment is already gone.

pub mod local;
pub mod registry;
pub mod remote;

use std::collections::HashMap;
use std::time::Duration;

use futures_util::future::join_all;
use tracing::{info, warn};

use crate::config::{AgentConfig, state_dir};
use crate::errors::LifecycleError;
use crate::http::ControlPlaneClient;
use crate::repo::RepoRef;

pub use registry::{AgentState, Registry, RegistryEntry, StateFile, Transport};

use local::{CONTAINER_PORT, LocalDocker, build_context, find_free_port};
use remote::{FlyMachines, MachineApi, machine_base_url};

/// Health probe cadence and cap for a freshly started environment.
const HEALTH_INTERVAL: Duration = Duration::from_secs(1);
const HEALTH_TIMEOUT_SECS: u64 = 120;

/// Registry entries older than this are ignored when listing live
/// environments.
const LIVE_WINDOW_HOURS: i64 = 24;

pub struct LifecycleManager {
    registry: Registry,
    state_file: StateFile,
}

impl LifecycleManager {
    pub fn new() -> anyhow::Result<Self> {
        let dir = state_dir()?;
        Ok(Self::with_paths(
            Registry::new(dir.join("containers.ndjson")),
            StateFile::new(dir.join("agent.json")),
        ))
    }

    pub fn with_paths(registry: Registry, state_file: StateFile) -> Self {
        Self {
            registry,
            state_file,
        }
    }

    pub fn state_file(&self) -> &StateFile {
        &self.state_file
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Provision an environment, wait until its control plane answers the
    /// health probe, and record it. Nothing is persisted if provisioning or
    /// the health gate fails before the environment is reachable.
    pub async fn start(
        &self,
        config: &AgentConfig,
        repo_ref: &RepoRef,
    ) -> Result<AgentState, LifecycleError> {
        config.check_required()?;

        let state = match &config.remote {
            Some(remote_config) => {
                self.start_remote(config, repo_ref, remote_config.clone())
                    .await?
            }
            None => self.start_local(config, repo_ref).await?,
        };

        self.state_file.save(&state)?;
        self.registry.append(&state)?;
        info!(name = %state.name, url = %state.base_url, "environment started");
        Ok(state)
    }

    async fn start_local(
        &self,
        config: &AgentConfig,
        repo_ref: &RepoRef,
    ) -> Result<AgentState, LifecycleError> {
        let docker = LocalDocker::connect()?;
        docker.ensure_image(&build_context()).await?;
        let host_port = find_free_port()?;
        docker.launch(config, repo_ref, host_port).await?;

        let base_url = format!("http://127.0.0.1:{host_port}");
        let client = ControlPlaneClient::new(&base_url, None);
        if let Err(err) = wait_healthy(&docker, &config.container_name, &client).await {
            // The container is useless if it never came up; reap it so a
            // retry with the same name can proceed.
            let _ = docker.remove(&config.container_name).await;
            return Err(err);
        }

        Ok(AgentState {
            name: config.container_name.clone(),
            transport: Transport::Local,
            base_url,
            routing_token: None,
        })
    }

    async fn start_remote(
        &self,
        config: &AgentConfig,
        repo_ref: &RepoRef,
        remote_config: crate::config::RemoteConfig,
    ) -> Result<AgentState, LifecycleError> {
        let app = remote_config.app.clone();
        let api = FlyMachines::new(remote_config);

        let mut env: HashMap<String, String> = config.env.clone();
        env.insert("PORT".into(), CONTAINER_PORT.to_string());
        env.insert("CONTAINER_NAME".into(), config.container_name.clone());
        env.insert("REPO_URL".into(), repo_ref.repo_url.clone());
        env.insert("CLONE_BRANCH".into(), repo_ref.clone_branch.clone());
        env.insert("PUSH_BRANCH".into(), repo_ref.push_branch.clone());

        let machine = api.create_machine(&config.container_name, env).await?;
        api.wait_until_started(&machine.id).await?;

        let base_url = machine_base_url(&app);
        let state = AgentState {
            name: config.container_name.clone(),
            transport: Transport::Remote,
            base_url,
            routing_token: Some(machine.id.clone()),
        };

        let client = ControlPlaneClient::new(&state.base_url, state.routing_token.clone());
        if let Err(err) = wait_probe(&client).await {
            let _ = api.destroy_machine(&machine.id).await;
            return Err(err);
        }
        Ok(state)
    }

    /// Tear the environment down and forget it. Safe to call repeatedly and
    /// safe when the environment already died on its own.
    pub async fn stop(&self, state: &AgentState) -> Result<(), LifecycleError> {
        match state.transport {
            Transport::Local => {
                let docker = LocalDocker::connect()?;
                docker.remove(&state.name).await?;
            }
            Transport::Remote => {
                if let Some(machine_id) = &state.routing_token {
                    let remote_config = crate::config::RemoteConfig {
                        api_token: std::env::var("FLY_API_TOKEN")
                            .map_err(|_| LifecycleError::Machine(
                                "FLY_API_TOKEN is required to stop a remote environment".into(),
                            ))?,
                        app: std::env::var("FLY_APP").map_err(|_| {
                            LifecycleError::Machine(
                                "FLY_APP is required to stop a remote environment".into(),
                            )
                        })?,
                        image: String::new(),
                    };
                    FlyMachines::new(remote_config)
                        .destroy_machine(machine_id)
                        .await?;
                }
            }
        }
        self.registry.mark_stopped(Some(&state.name))?;
        self.state_file.clear()?;
        info!(name = %state.name, "environment stopped");
        Ok(())
    }

    /// Recent registry entries whose control plane still answers. Entries
    /// that fail the probe are marked stopped so the registry self-heals.
    pub async fn list_live(&self) -> anyhow::Result<Vec<RegistryEntry>> {
        let candidates = self
            .registry
            .recent_live(chrono::Duration::hours(LIVE_WINDOW_HOURS))?;

        let probes = candidates.iter().map(|entry| {
            let client =
                ControlPlaneClient::new(&entry.state.base_url, entry.state.routing_token.clone());
            async move { client.is_healthy().await }
        });
        let results = join_all(probes).await;

        let mut live = Vec::new();
        for (entry, healthy) in candidates.into_iter().zip(results) {
            if healthy {
                live.push(entry);
            } else {
                warn!(name = %entry.state.name, "registry entry no longer responding, marking stopped");
                self.registry.mark_stopped(Some(&entry.state.name))?;
            }
        }
        Ok(live)
    }
}

/// Poll the health endpoint until it answers, watching the container so a
/// crash is reported with its output instead of a bare timeout.
async fn wait_healthy(
    docker: &LocalDocker,
    name: &str,
    client: &ControlPlaneClient,
) -> Result<(), LifecycleError> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(HEALTH_TIMEOUT_SECS);
    loop {
        if client.is_healthy().await {
            return Ok(());
        }
        if !docker.is_running(name).await.unwrap_or(true) {
            let log_tail = docker.log_tail(name).await;
            return Err(LifecycleError::ExitedEarly { log_tail });
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(LifecycleError::HealthTimeout {
                timeout_secs: HEALTH_TIMEOUT_SECS,
            });
        }
        tokio::time::sleep(HEALTH_INTERVAL).await;
    }
}

/// Remote health gate: no process to inspect, just the probe and the clock.
async fn wait_probe(client: &ControlPlaneClient) -> Result<(), LifecycleError> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(HEALTH_TIMEOUT_SECS);
    loop {
        if client.is_healthy().await {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(LifecycleError::HealthTimeout {
                timeout_secs: HEALTH_TIMEOUT_SECS,
            });
        }
        tokio::time::sleep(HEALTH_INTERVAL).await;
    }
}
