//! The proxy's client connection to a backend daemon.

use std::future::Future;
use std::sync::{Arc, OnceLock};

use russh::client;
use russh::keys::{PrivateKeyWithHashAlg, PublicKey};
use russh::server;
use russh::{Channel, Disconnect};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::authenticator::{AuthError, BackendRoute};
use crate::keys;

use super::relay;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error(transparent)]
    Ssh(#[from] russh::Error),
    #[error("host key mismatch: expected {expected}, presented {presented}")]
    HostKeyMismatch { expected: String, presented: String },
}

/// The client half's handle on the proxied client connection, set once the
/// client has authenticated.
pub type ClientSlot = Arc<OnceLock<server::Handle>>;

/// Client handler for the backend connection.
pub struct BackendHandler {
    address: String,
    expected_fingerprint: String,
    client: ClientSlot,
}

impl BackendHandler {
    pub fn new(address: &str, expected_fingerprint: &str, client: ClientSlot) -> Self {
        Self {
            address: address.to_string(),
            expected_fingerprint: expected_fingerprint.to_string(),
            client,
        }
    }

    /// Open the matching channel towards the client and relay the pair.
    /// The backend channel is closed if the client refuses.
    fn reopen_on_client<F, Fut>(&self, channel: Channel<client::Msg>, kind: &'static str, open: F)
    where
        F: FnOnce(server::Handle) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Channel<server::Msg>, russh::Error>> + Send + 'static,
    {
        let Some(client) = self.client.get().cloned() else {
            warn!("{} channel from {} before the client was ready", kind, self.address);
            tokio::spawn(async move {
                let _ = channel.close().await;
            });
            return;
        };

        tokio::spawn(async move {
            match open(client.clone()).await {
                Ok(client_channel) => relay::relay(client_channel, channel, client).await,
                Err(e) => {
                    debug!("Client refused {} channel: {:?}", kind, e);
                    let _ = channel.close().await;
                }
            }
        });
    }
}

impl client::Handler for BackendHandler {
    type Error = BackendError;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        if keys::fingerprint_matches(server_public_key, &self.expected_fingerprint) {
            debug!("Backend {} host key verified", self.address);
            return Ok(true);
        }
        Err(BackendError::HostKeyMismatch {
            expected: self.expected_fingerprint.clone(),
            presented: keys::fingerprint(server_public_key),
        })
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<client::Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let connected_address = connected_address.to_string();
        let originator_address = originator_address.to_string();
        self.reopen_on_client(channel, "forwarded-tcpip", move |client| async move {
            client
                .channel_open_forwarded_tcpip(
                    connected_address,
                    connected_port,
                    originator_address,
                    originator_port,
                )
                .await
        });
        Ok(())
    }

    async fn server_channel_open_forwarded_streamlocal(
        &mut self,
        channel: Channel<client::Msg>,
        socket_path: &str,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let socket_path = socket_path.to_string();
        self.reopen_on_client(channel, "forwarded-streamlocal", move |client| async move {
            client.channel_open_forwarded_streamlocal(socket_path).await
        });
        Ok(())
    }

    async fn server_channel_open_x11(
        &mut self,
        channel: Channel<client::Msg>,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let originator_address = originator_address.to_string();
        self.reopen_on_client(channel, "x11", move |client| async move {
            client.channel_open_x11(originator_address, originator_port).await
        });
        Ok(())
    }
}

impl Drop for BackendHandler {
    fn drop(&mut self) {
        // The backend connection is gone; take the client down with it.
        if let Some(client) = self.client.get().cloned() {
            let address = self.address.clone();
            tokio::spawn(async move {
                debug!("Backend {} disconnected, closing client", address);
                let _ = client
                    .disconnect(
                        Disconnect::ByApplication,
                        "backend connection closed".to_string(),
                        "en".to_string(),
                    )
                    .await;
            });
        }
    }
}

/// Dial the backend for `route`, verify its host key and authenticate as `user`.
pub async fn connect(
    route: &BackendRoute,
    user: &str,
    client: ClientSlot,
) -> Result<client::Handle<BackendHandler>, AuthError> {
    let config = Arc::new(client::Config::default());
    let handler = BackendHandler::new(&route.address, &route.host_fingerprint, client);

    let mut handle = client::connect(config, route.address.as_str(), handler)
        .await
        .map_err(|e| match e {
            BackendError::HostKeyMismatch { expected, presented } => {
                AuthError::HostKeyMismatch { expected, presented }
            }
            BackendError::Ssh(e) => {
                AuthError::BackendUnavailable(format!("{}: {}", route.address, e))
            }
        })?;

    let key = PrivateKeyWithHashAlg::new(route.private_key.clone(), None);
    let result = handle
        .authenticate_publickey(user, key)
        .await
        .map_err(|e| AuthError::BackendUnavailable(format!("{}: {}", route.address, e)))?;
    if !result.success() {
        return Err(AuthError::BackendUnavailable(format!(
            "{} rejected the proxy key for {}",
            route.address, user
        )));
    }

    info!("Connected to backend {} as {}", route.address, user);
    Ok(handle)
}
