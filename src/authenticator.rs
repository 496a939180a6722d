//! Proxy authentication and routing decisions.
//!
//! Given the identity from the handshake username and the presented password,
//! decide whether to admit the client and, if so, which backend to dial and
//! with what key material. Every failure here surfaces to the client as a
//! plain authentication rejection; the detail only goes to the log.

use std::fmt;
use std::sync::Arc;

use russh::keys::PrivateKey;
use thiserror::Error;
use tracing::debug;

use crate::authorization::AuthorizationService;
use crate::identity::{Identity, IdentityError, Realm};
use crate::keys;
use crate::placement::{PlacementError, PlacementService};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("malformed identity: {0}")]
    MalformedIdentity(#[from] IdentityError),

    #[error("{0} realm is disabled")]
    RealmDisabled(Realm),

    #[error("unknown target {target}: {reason}")]
    UnknownTarget { target: String, reason: String },

    #[error("instance {index} of {target} not found: {reason}")]
    InstanceNotFound {
        target: String,
        index: u32,
        reason: String,
    },

    #[error("not authorized for {target}: {reason}")]
    NotAuthorized { target: String, reason: String },

    #[error("backend host key mismatch: expected {expected}, presented {presented}")]
    HostKeyMismatch { expected: String, presented: String },

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
}

/// Everything needed to dial and authenticate to one backend instance.
#[derive(Clone)]
pub struct BackendRoute {
    /// `host:port` of the instance's daemon.
    pub address: String,
    /// Fingerprint the backend's host key must have.
    pub host_fingerprint: String,
    /// Key the proxy authenticates to the backend with.
    pub private_key: Arc<PrivateKey>,
}

impl fmt::Debug for BackendRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRoute")
            .field("address", &self.address)
            .field("host_fingerprint", &self.host_fingerprint)
            .finish_non_exhaustive()
    }
}

/// Realm policy plus the services consulted to resolve a route.
pub struct Authenticator {
    placement: Arc<dyn PlacementService>,
    authorization: Option<Arc<dyn AuthorizationService>>,
    delegated_only: bool,
}

impl Authenticator {
    /// Build an authenticator. Without an authorization service the delegated
    /// realm is disabled; with `delegated_only` the platform realm is.
    pub fn new(
        placement: Arc<dyn PlacementService>,
        authorization: Option<Arc<dyn AuthorizationService>>,
        delegated_only: bool,
    ) -> Self {
        Self {
            placement,
            authorization,
            delegated_only,
        }
    }

    /// Parse a handshake username and authenticate it.
    pub async fn authenticate_user(
        &self,
        username: &str,
        credential: &str,
    ) -> Result<(Identity, BackendRoute), AuthError> {
        let identity = Identity::parse(username)?;
        let route = self.authenticate(&identity, credential).await?;
        Ok((identity, route))
    }

    /// Resolve the backend route for `identity`, checking `credential` as its realm requires.
    pub async fn authenticate(
        &self,
        identity: &Identity,
        credential: &str,
    ) -> Result<BackendRoute, AuthError> {
        match identity.realm {
            Realm::Platform => {
                if self.delegated_only {
                    return Err(AuthError::RealmDisabled(Realm::Platform));
                }
                self.resolve(&identity.target, identity.index).await
            }
            Realm::Delegated => {
                let authorization = self
                    .authorization
                    .as_ref()
                    .ok_or(AuthError::RealmDisabled(Realm::Delegated))?;

                let record = authorization
                    .app(&identity.target, credential)
                    .await
                    .map_err(|e| AuthError::NotAuthorized {
                        target: identity.target.clone(),
                        reason: e.to_string(),
                    })?;

                if let Some(reason) = record.ssh_denial() {
                    return Err(AuthError::NotAuthorized {
                        target: identity.target.clone(),
                        reason: reason.to_string(),
                    });
                }

                let target = record.platform_target();
                debug!("Delegated identity {} maps to target {}", identity, target);
                self.resolve(&target, identity.index).await
            }
        }
    }

    /// Combine the instance location with the target's SSH route.
    async fn resolve(&self, target: &str, index: u32) -> Result<BackendRoute, AuthError> {
        let instance_not_found = |reason: String| AuthError::InstanceNotFound {
            target: target.to_string(),
            index,
            reason,
        };

        let location = match self.placement.location(target, index).await {
            Ok(location) => location,
            Err(PlacementError::NotFound) => {
                // A target that does not exist has no instances either.
                return Err(match self.placement.route(target).await {
                    Err(PlacementError::NotFound) => AuthError::UnknownTarget {
                        target: target.to_string(),
                        reason: "no such target".to_string(),
                    },
                    _ => instance_not_found("no such instance".to_string()),
                });
            }
            Err(e) => return Err(instance_not_found(e.to_string())),
        };

        if location.index != index {
            return Err(instance_not_found(format!(
                "placement answered for index {}",
                location.index
            )));
        }

        let record = self
            .placement
            .route(target)
            .await
            .map_err(|e| AuthError::UnknownTarget {
                target: target.to_string(),
                reason: match e {
                    PlacementError::NotFound => "no such target".to_string(),
                    other => other.to_string(),
                },
            })?;

        let host_port = location
            .host_port(record.container_port)
            .ok_or_else(|| {
                instance_not_found(format!(
                    "container port {} is not mapped",
                    record.container_port
                ))
            })?;

        let private_key =
            keys::decode_private_key(&record.private_key).map_err(|e| AuthError::UnknownTarget {
                target: target.to_string(),
                reason: format!("{:#}", e),
            })?;

        Ok(BackendRoute {
            address: format!("{}:{}", location.address, host_port),
            host_fingerprint: record.host_fingerprint,
            private_key: Arc::new(private_key),
        })
    }
}
