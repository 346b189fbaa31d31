//! Client for the control-plane wire protocol.
//!
//! All waiting is client-side: callers poll `status`, `message`, and the
//! offset streams. For remote environments the routing token is sent as a
//! `fly-force-instance-id` header so every poll reaches the same machine.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::server::{
    Ack, ErrorBody, InterruptResponse, MessageCreated, MessageRequest, MessageView, StreamSlice,
};
use crate::worker::StatusSnapshot;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

pub struct ControlPlaneClient {
    base_url: String,
    routing_token: Option<String>,
    http: reqwest::Client,
}

impl ControlPlaneClient {
    pub fn new(base_url: impl Into<String>, routing_token: Option<String>) -> Self {
        Self {
            base_url: base_url.into(),
            routing_token,
            http: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.http.request(method, format!("{}{path}", self.base_url));
        if let Some(token) = &self.routing_token {
            builder = builder.header("fly-force-instance-id", token);
        }
        builder
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            return response.json().await.context("Failed to decode response body");
        }
        let error = response
            .json::<ErrorBody>()
            .await
            .map(|b| b.error)
            .unwrap_or_else(|_| status.to_string());
        bail!("control plane returned {status}: {error}")
    }

    /// Whether the environment answers its health endpoint.
    pub async fn is_healthy(&self) -> bool {
        self.request(reqwest::Method::GET, "/healthz")
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    /// Submit a prompt; returns the allocated message id.
    pub async fn submit(&self, prompt: &str) -> Result<String> {
        let response = self
            .request(reqwest::Method::POST, "/message")
            .json(&MessageRequest {
                prompt: prompt.to_string(),
            })
            .send()
            .await
            .context("Failed to POST /message")?;
        Ok(Self::decode::<MessageCreated>(response).await?.id)
    }

    pub async fn message(&self, id: &str) -> Result<MessageView> {
        let response = self
            .request(reqwest::Method::GET, &format!("/message/{id}"))
            .send()
            .await
            .context("Failed to GET /message")?;
        Self::decode(response).await
    }

    pub async fn events(&self, offset: usize) -> Result<StreamSlice<Value>> {
        let response = self
            .request(reqwest::Method::GET, &format!("/events?offset={offset}"))
            .send()
            .await
            .context("Failed to GET /events")?;
        Self::decode(response).await
    }

    pub async fn logs(&self, offset: usize) -> Result<StreamSlice<String>> {
        let response = self
            .request(reqwest::Method::GET, &format!("/logs?offset={offset}"))
            .send()
            .await
            .context("Failed to GET /logs")?;
        Self::decode(response).await
    }

    pub async fn status(&self) -> Result<StatusSnapshot> {
        let response = self
            .request(reqwest::Method::GET, "/status")
            .send()
            .await
            .context("Failed to GET /status")?;
        Self::decode(response).await
    }

    /// Returns whether an in-flight run was interrupted.
    pub async fn interrupt(&self) -> Result<bool> {
        let response = self
            .request(reqwest::Method::POST, "/interrupt")
            .send()
            .await
            .context("Failed to POST /interrupt")?;
        Ok(Self::decode::<InterruptResponse>(response).await?.interrupted)
    }

    pub async fn detach(&self) -> Result<()> {
        let response = self
            .request(reqwest::Method::POST, "/detach")
            .send()
            .await
            .context("Failed to POST /detach")?;
        Self::decode::<Ack>(response).await.map(|_| ())
    }

    pub async fn stop(&self) -> Result<()> {
        let response = self
            .request(reqwest::Method::POST, "/stop")
            .send()
            .await
            .context("Failed to POST /stop")?;
        Self::decode::<Ack>(response).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_token_is_optional() {
        let client = ControlPlaneClient::new("http://127.0.0.1:1", None);
        assert_eq!(client.base_url(), "http://127.0.0.1:1");
    }

    #[tokio::test]
    async fn unreachable_host_is_unhealthy_not_an_error() {
        // Reserved port on localhost; connection refused immediately.
        let client = ControlPlaneClient::new("http://127.0.0.1:9", None);
        assert!(!client.is_healthy().await);
    }
}
