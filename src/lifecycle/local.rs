//! Local transport: the execution environment is a detached Docker
//! container on this host.
//!
//! Container control goes through the Docker API; the image build shells out
//! to `docker build` the same way repository side effects shell out to
//! `git`. The host port is picked by scanning upward from a base value
//! until a bind succeeds.

use std::collections::HashMap;
use std::net::TcpListener;

use bollard::Docker;
use bollard::errors::Error as BollardError;
use bollard::models::{ContainerCreateBody, HostConfig, PortBinding};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, LogsOptionsBuilder, RemoveContainerOptionsBuilder,
};
use futures_util::StreamExt;
use tokio::process::Command;

use crate::config::{AgentConfig, BASE_PORT};
use crate::errors::LifecycleError;
use crate::repo::RepoRef;

/// Port the control plane listens on inside the container.
pub const CONTAINER_PORT: u16 = 8080;

/// How many ports above the base to try before giving up.
const PORT_SCAN_RANGE: u16 = 100;

/// Image tag used when none is configured.
pub const DEFAULT_IMAGE: &str = "deckhand-agent:latest";

/// Lines of container output surfaced when the environment dies before
/// becoming healthy.
const LOG_TAIL_LINES: usize = 80;

pub struct LocalDocker {
    docker: Docker,
    image: String,
}

impl LocalDocker {
    pub fn connect() -> Result<Self, LifecycleError> {
        let docker = Docker::connect_with_local_defaults()?;
        let image = std::env::var("AGENT_IMAGE").unwrap_or_else(|_| DEFAULT_IMAGE.to_string());
        Ok(Self { docker, image })
    }

    /// Build the agent image if it is not present locally.
    pub async fn ensure_image(&self, build_dir: &str) -> Result<(), LifecycleError> {
        if self.docker.inspect_image(&self.image).await.is_ok() {
            return Ok(());
        }
        tracing::info!("image {} not found, building", self.image);
        let output = Command::new("docker")
            .args(["build", "-t", &self.image, build_dir])
            .output()
            .await
            .map_err(|e| LifecycleError::ImageBuild(format!("failed to run docker build: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(LifecycleError::ImageBuild(stderr.trim().to_string()));
        }
        Ok(())
    }

    /// Create and start a detached container for `config`, publishing the
    /// control-plane port on `host_port`. Returns once the container is
    /// started (not yet healthy).
    pub async fn launch(
        &self,
        config: &AgentConfig,
        repo_ref: &RepoRef,
        host_port: u16,
    ) -> Result<(), LifecycleError> {
        let body = container_body(&self.image, config, repo_ref, host_port);
        self.docker
            .create_container(
                Some(
                    CreateContainerOptionsBuilder::new()
                        .name(&config.container_name)
                        .build(),
                ),
                body,
            )
            .await?;
        self.docker
            .start_container(
                &config.container_name,
                None::<bollard::query_parameters::StartContainerOptions>,
            )
            .await?;
        Ok(())
    }

    /// Whether the container process is still running.
    pub async fn is_running(&self, name: &str) -> Result<bool, LifecycleError> {
        let inspect = self
            .docker
            .inspect_container(
                name,
                None::<bollard::query_parameters::InspectContainerOptions>,
            )
            .await?;
        Ok(inspect
            .state
            .and_then(|s| s.running)
            .unwrap_or(false))
    }

    /// Fetch the tail of a container's combined output.
    pub async fn log_tail(&self, name: &str) -> String {
        let options = LogsOptionsBuilder::new()
            .stdout(true)
            .stderr(true)
            .tail(&LOG_TAIL_LINES.to_string())
            .build();
        let mut stream = self.docker.logs(name, Some(options));
        let mut lines = Vec::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(output) => lines.push(output.to_string()),
                Err(_) => break,
            }
        }
        lines.join("")
    }

    /// Force-remove the container. Removing an already-removed container is
    /// not an error.
    pub async fn remove(&self, name: &str) -> Result<(), LifecycleError> {
        match self
            .docker
            .remove_container(
                name,
                Some(RemoveContainerOptionsBuilder::new().force(true).build()),
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Build the create-container request: forwarded env plus the injected
/// identity/repo variables, with the control-plane port published on the
/// loopback interface.
fn container_body(
    image: &str,
    config: &AgentConfig,
    repo_ref: &RepoRef,
    host_port: u16,
) -> ContainerCreateBody {
    let mut env: Vec<String> = config
        .env
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    env.push(format!("PORT={CONTAINER_PORT}"));
    env.push(format!("CONTAINER_NAME={}", config.container_name));
    env.push(format!("REPO_URL={}", repo_ref.repo_url));
    env.push(format!("CLONE_BRANCH={}", repo_ref.clone_branch));
    env.push(format!("PUSH_BRANCH={}", repo_ref.push_branch));

    let container_port = format!("{CONTAINER_PORT}/tcp");
    let port_bindings: HashMap<String, Option<Vec<PortBinding>>> = [(
        container_port.clone(),
        Some(vec![PortBinding {
            host_ip: Some("127.0.0.1".to_string()),
            host_port: Some(host_port.to_string()),
        }]),
    )]
    .into_iter()
    .collect();

    ContainerCreateBody {
        image: Some(image.to_string()),
        env: Some(env),
        exposed_ports: Some(vec![container_port]),
        host_config: Some(HostConfig {
            port_bindings: Some(port_bindings),
            ..HostConfig::default()
        }),
        ..ContainerCreateBody::default()
    }
}

fn is_not_found(error: &BollardError) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError { status_code: 404, .. }
    )
}

/// Build context for the agent image. Defaults to the current directory,
/// which is the checkout shipping the `Dockerfile`; installed binaries
/// override it with `AGENT_BUILD_CONTEXT`.
pub fn build_context() -> String {
    std::env::var("AGENT_BUILD_CONTEXT").unwrap_or_else(|_| ".".to_string())
}

/// Allocate a free local port by scanning upward from the base value until a
/// bind succeeds.
pub fn find_free_port() -> Result<u16, LifecycleError> {
    let base = BASE_PORT;
    for port in base..base + PORT_SCAN_RANGE {
        if TcpListener::bind(("127.0.0.1", port)).is_ok() {
            return Ok(port);
        }
    }
    Err(LifecycleError::NoFreePort {
        base,
        base_end: base + PORT_SCAN_RANGE,
    })
}
