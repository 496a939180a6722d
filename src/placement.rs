//! Placement service client.
//!
//! The placement service knows, for every target, the SSH route it declared
//! (container port, backend host key fingerprint, proxy private key) and where
//! each instance of it currently runs.

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Route class under which targets declare their SSH endpoint.
pub const SSH_ROUTE: &str = "diego-ssh";

#[derive(Debug, Error)]
pub enum PlacementError {
    #[error("not found")]
    NotFound,
    #[error("placement service returned {0}")]
    Status(StatusCode),
    #[error("request failed: {0}")]
    Transport(String),
    #[error("invalid response: {0}")]
    Decode(String),
    #[error("target declares no diego-ssh route")]
    MissingRoute,
    #[error("cannot build request URL from {0}")]
    InvalidUrl(String),
}

/// The SSH route a target declared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementRecord {
    pub container_port: u16,
    pub host_fingerprint: String,
    pub private_key: String,
}

/// One container-port to host-port mapping of a running instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub container_port: u16,
    pub host_port: u16,
}

/// Where one instance of a target is reachable right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementLocation {
    #[serde(default)]
    pub process_guid: String,
    pub index: u32,
    #[serde(default)]
    pub instance_guid: String,
    pub address: String,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
}

impl PlacementLocation {
    /// The host-visible port for a container port, if mapped.
    pub fn host_port(&self, container_port: u16) -> Option<u16> {
        self.ports
            .iter()
            .find(|m| m.container_port == container_port)
            .map(|m| m.host_port)
    }
}

/// Body of `GET /targets/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetResponse {
    #[serde(default)]
    pub process_guid: String,
    #[serde(default)]
    pub instances: u32,
    #[serde(default)]
    pub routes: HashMap<String, serde_json::Value>,
}

impl TargetResponse {
    /// Extract the SSH route declaration, if the target has one.
    pub fn ssh_route(&self) -> Result<PlacementRecord, PlacementError> {
        let raw = self.routes.get(SSH_ROUTE).ok_or(PlacementError::MissingRoute)?;
        serde_json::from_value(raw.clone()).map_err(|e| PlacementError::Decode(e.to_string()))
    }
}

/// Lookups the authenticator needs from the placement service.
#[async_trait]
pub trait PlacementService: Send + Sync {
    /// The SSH route declared by `target`.
    async fn route(&self, target: &str) -> Result<PlacementRecord, PlacementError>;

    /// The current location of instance `index` of `target`.
    async fn location(&self, target: &str, index: u32)
    -> Result<PlacementLocation, PlacementError>;
}

/// HTTP client for the placement service.
pub struct PlacementClient {
    client: reqwest::Client,
    base_url: Url,
}

impl PlacementClient {
    pub fn new(base_url: Url) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("instance-ssh/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, base_url })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, PlacementError> {
        endpoint(&self.base_url, segments)
            .ok_or_else(|| PlacementError::InvalidUrl(self.base_url.to_string()))
    }

    async fn get(&self, url: Url) -> Result<String, PlacementError> {
        debug!("Placement lookup {}", url);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| PlacementError::Transport(e.to_string()))?;

        match response.status() {
            status if status.is_success() => response
                .text()
                .await
                .map_err(|e| PlacementError::Transport(e.to_string())),
            StatusCode::NOT_FOUND => Err(PlacementError::NotFound),
            status => Err(PlacementError::Status(status)),
        }
    }
}

#[async_trait]
impl PlacementService for PlacementClient {
    async fn route(&self, target: &str) -> Result<PlacementRecord, PlacementError> {
        let url = self.endpoint(&["targets", target])?;
        let body = self.get(url).await?;
        let response: TargetResponse =
            serde_json::from_str(&body).map_err(|e| PlacementError::Decode(e.to_string()))?;
        response.ssh_route()
    }

    async fn location(
        &self,
        target: &str,
        index: u32,
    ) -> Result<PlacementLocation, PlacementError> {
        let index = index.to_string();
        let url = self.endpoint(&["targets", target, "instances", &index])?;
        let body = self.get(url).await?;
        serde_json::from_str(&body).map_err(|e| PlacementError::Decode(e.to_string()))
    }
}

/// Append percent-encoded path segments to a base URL.
pub(crate) fn endpoint(base: &Url, segments: &[&str]) -> Option<Url> {
    let mut url = base.clone();
    url.path_segments_mut().ok()?.pop_if_empty().extend(segments);
    Some(url)
}
