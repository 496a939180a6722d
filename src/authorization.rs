//! Authorization service client for the delegated realm.
//!
//! A caller presents a bearer credential; the service answers whether the
//! caller may open a shell on an application and which placement target backs it.

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::placement::endpoint;

#[derive(Debug, Error)]
pub enum AuthorizationError {
    #[error("authorization service returned {0}")]
    Status(StatusCode),
    #[error("request failed: {0}")]
    Transport(String),
    #[error("invalid response: {0}")]
    Decode(String),
    #[error("cannot build request URL from {0}")]
    InvalidUrl(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppMetadata {
    pub guid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppEntity {
    #[serde(default)]
    pub version: String,
    /// Whether the application allows SSH access at all.
    #[serde(default)]
    pub allow_ssh: bool,
    /// Whether the application runs on the placement platform.
    #[serde(default)]
    pub diego: bool,
}

/// Body of `GET /apps/{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationRecord {
    pub metadata: AppMetadata,
    pub entity: AppEntity,
}

impl AuthorizationRecord {
    /// Why a delegated session may not proceed, if it may not. Both gates must hold.
    pub fn ssh_denial(&self) -> Option<&'static str> {
        if !self.entity.diego {
            return Some("application is not eligible for instance access");
        }
        if !self.entity.allow_ssh {
            return Some("ssh is disabled for the application");
        }
        None
    }

    /// The placement target that backs this application.
    pub fn platform_target(&self) -> String {
        format!("{}-{}", self.metadata.guid, self.entity.version)
    }
}

#[async_trait]
pub trait AuthorizationService: Send + Sync {
    /// Fetch the record for `app` as seen by the holder of `credential`.
    async fn app(&self, app: &str, credential: &str)
    -> Result<AuthorizationRecord, AuthorizationError>;
}

/// HTTP client for the authorization service.
pub struct AuthorizationClient {
    client: reqwest::Client,
    base_url: Url,
}

impl AuthorizationClient {
    pub fn new(base_url: Url) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("instance-ssh/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, base_url })
    }
}

#[async_trait]
impl AuthorizationService for AuthorizationClient {
    async fn app(
        &self,
        app: &str,
        credential: &str,
    ) -> Result<AuthorizationRecord, AuthorizationError> {
        let url = endpoint(&self.base_url, &["apps", app])
            .ok_or_else(|| AuthorizationError::InvalidUrl(self.base_url.to_string()))?;
        debug!("Authorization lookup {}", url);

        let response = self
            .client
            .get(url)
            .header(reqwest::header::AUTHORIZATION, credential)
            .send()
            .await
            .map_err(|e| AuthorizationError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AuthorizationError::Status(response.status()));
        }

        let body = response
            .text()
            .await
            .map_err(|e| AuthorizationError::Transport(e.to_string()))?;

        serde_json::from_str(&body).map_err(|e| AuthorizationError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StubHttp;

    const APP_BODY: &str = r#"{
        "metadata": {"guid": "app-guid", "url": "/v2/apps/app-guid"},
        "entity": {"name": "my-app", "version": "app-version", "allow_ssh": true, "diego": true}
    }"#;

    #[test]
    fn test_gates() {
        let mut record: AuthorizationRecord = serde_json::from_str(APP_BODY).unwrap();
        assert_eq!(record.ssh_denial(), None);
        assert_eq!(record.platform_target(), "app-guid-app-version");

        record.entity.allow_ssh = false;
        assert!(record.ssh_denial().is_some());

        record.entity.allow_ssh = true;
        record.entity.diego = false;
        assert!(record.ssh_denial().is_some());
    }

    #[tokio::test]
    async fn test_sends_credential_verbatim() {
        let stub = StubHttp::start(vec![("/apps/app-guid", 200, APP_BODY)]).await;
        let client = AuthorizationClient::new(Url::parse(&stub.url).unwrap()).unwrap();

        let record = client.app("app-guid", "bearer token").await.unwrap();
        assert_eq!(record.metadata.guid, "app-guid");

        let requests = stub.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].header("authorization"), Some("bearer token"));
    }

    #[tokio::test]
    async fn test_denied_lookup() {
        let stub = StubHttp::start(vec![("/apps/secret", 403, "")]).await;
        let client = AuthorizationClient::new(Url::parse(&stub.url).unwrap()).unwrap();

        assert!(matches!(
            client.app("secret", "bearer token").await,
            Err(AuthorizationError::Status(StatusCode::FORBIDDEN))
        ));
        assert!(matches!(
            client.app("missing", "bearer token").await,
            Err(AuthorizationError::Status(StatusCode::NOT_FOUND))
        ));
    }
}
