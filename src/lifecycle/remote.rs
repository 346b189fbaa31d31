//! Remote transport: the execution environment is a Fly.io machine.
//!
//! The machine API is a trait so lifecycle tests can script responses; the
//! production implementation talks to the Fly Machines REST API with a
//! bearer token.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::RemoteConfig;
use crate::errors::LifecycleError;

const MACHINES_API_BASE: &str = "https://api.machines.dev";

/// Port the control plane listens on inside the machine.
pub const MACHINE_PORT: u16 = 8080;

#[derive(Debug, Clone, Deserialize)]
pub struct Machine {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub state: String,
}

#[derive(Debug, Serialize)]
struct CreateMachineRequest {
    name: String,
    config: MachineConfig,
}

#[derive(Debug, Serialize)]
struct MachineConfig {
    image: String,
    env: HashMap<String, String>,
    services: Vec<MachineService>,
    auto_destroy: bool,
}

#[derive(Debug, Serialize)]
struct MachineService {
    protocol: String,
    internal_port: u16,
    ports: Vec<ServicePort>,
}

#[derive(Debug, Serialize)]
struct ServicePort {
    port: u16,
    handlers: Vec<String>,
}

/// Machine provisioning operations, abstracted for testability.
#[async_trait]
pub trait MachineApi: Send + Sync {
    /// Create a machine and return its id.
    async fn create_machine(
        &self,
        name: &str,
        env: HashMap<String, String>,
    ) -> Result<Machine, LifecycleError>;

    /// Block until the machine reaches the `started` state.
    async fn wait_until_started(&self, machine_id: &str) -> Result<(), LifecycleError>;

    /// Destroy a machine. Destroying an unknown machine is not an error.
    async fn destroy_machine(&self, machine_id: &str) -> Result<(), LifecycleError>;

    /// List machines in the app.
    async fn list_machines(&self) -> Result<Vec<Machine>, LifecycleError>;
}

/// Fly Machines REST client.
pub struct FlyMachines {
    client: reqwest::Client,
    base_url: String,
    config: RemoteConfig,
}

impl FlyMachines {
    pub fn new(config: RemoteConfig) -> Self {
        Self::with_base_url(config, MACHINES_API_BASE.to_string())
    }

    pub fn with_base_url(config: RemoteConfig, base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url,
            config,
        }
    }

    fn url(&self, suffix: &str) -> String {
        format!(
            "{}/v1/apps/{}/machines{}",
            self.base_url, self.config.app, suffix
        )
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.bearer_auth(&self.config.api_token)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, LifecycleError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(LifecycleError::Machine(format!("{status}: {body}")))
    }
}

#[async_trait]
impl MachineApi for FlyMachines {
    async fn create_machine(
        &self,
        name: &str,
        env: HashMap<String, String>,
    ) -> Result<Machine, LifecycleError> {
        let request = CreateMachineRequest {
            name: name.to_string(),
            config: MachineConfig {
                image: self.config.image.clone(),
                env,
                services: vec![MachineService {
                    protocol: "tcp".to_string(),
                    internal_port: MACHINE_PORT,
                    ports: vec![ServicePort {
                        port: 443,
                        handlers: vec!["tls".to_string(), "http".to_string()],
                    }],
                }],
                auto_destroy: true,
            },
        };
        let response = self
            .authed(self.client.post(self.url("")))
            .json(&request)
            .send()
            .await
            .map_err(|e| LifecycleError::Machine(e.to_string()))?;
        let machine = Self::check(response)
            .await?
            .json::<Machine>()
            .await
            .map_err(|e| LifecycleError::Machine(format!("invalid create response: {e}")))?;
        Ok(machine)
    }

    async fn wait_until_started(&self, machine_id: &str) -> Result<(), LifecycleError> {
        let url = self.url(&format!("/{machine_id}/wait?state=started&timeout=60"));
        let response = self
            .authed(self.client.get(url))
            .send()
            .await
            .map_err(|e| LifecycleError::Machine(e.to_string()))?;
        Self::check(response).await?;
        Ok(())
    }

    async fn destroy_machine(&self, machine_id: &str) -> Result<(), LifecycleError> {
        let url = self.url(&format!("/{machine_id}?force=true"));
        let response = self
            .authed(self.client.delete(url))
            .send()
            .await
            .map_err(|e| LifecycleError::Machine(e.to_string()))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check(response).await?;
        Ok(())
    }

    async fn list_machines(&self) -> Result<Vec<Machine>, LifecycleError> {
        let response = self
            .authed(self.client.get(self.url("")))
            .send()
            .await
            .map_err(|e| LifecycleError::Machine(e.to_string()))?;
        let machines = Self::check(response)
            .await?
            .json::<Vec<Machine>>()
            .await
            .map_err(|e| LifecycleError::Machine(format!("invalid list response: {e}")))?;
        Ok(machines)
    }
}

/// Public URL for reaching a machine's control plane through the Fly proxy.
/// Requests must carry the sticky-routing header so the proxy pins them to
/// this machine.
pub fn machine_base_url(app: &str) -> String {
    format!("https://{app}.fly.dev")
}
