//! Public-facing SSH proxy.
//!
//! Clients log in with password authentication: the username is an identity
//! (`diego:<process-guid>/<index>` or `cf:<app-guid>/<index>`) and the password
//! is the credential for the delegated realm. On success the proxy has already
//! dialed and authenticated to the backend, so every channel and forwarding
//! request afterwards is replayed there and the backend decides whether to
//! refuse it. Session, direct-tcpip, direct-streamlocal and x11 channels are
//! relayed, as are tcp and streamlocal forwarding requests.

pub mod backend;
pub mod relay;

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{Context, Result};
use russh::client;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, Disconnect, MethodKind, MethodSet};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::authenticator::Authenticator;
use crate::authorization::{AuthorizationClient, AuthorizationService};
use crate::config::ProxySettings;
use crate::placement::PlacementClient;
use backend::{BackendHandler, ClientSlot};

/// The SSH proxy server.
pub struct Proxy {
    listen_addr: SocketAddr,
    config: Arc<russh::server::Config>,
    authenticator: Arc<Authenticator>,
    backend_user: Arc<str>,
}

impl Proxy {
    /// Build a proxy talking to the HTTP services named in `settings`.
    pub fn from_settings(settings: ProxySettings) -> Result<Self> {
        let placement = PlacementClient::new(settings.placement_url.clone())
            .context("Failed to create placement client")?;
        let authorization = match settings.authorization_url.clone() {
            Some(url) => Some(Arc::new(
                AuthorizationClient::new(url).context("Failed to create authorization client")?,
            ) as Arc<dyn AuthorizationService>),
            None => None,
        };

        let authenticator =
            Authenticator::new(Arc::new(placement), authorization, settings.delegated_only);
        Ok(Self::new(settings, authenticator))
    }

    pub fn new(settings: ProxySettings, authenticator: Authenticator) -> Self {
        let config = russh::server::Config {
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            methods: MethodSet::from(&[MethodKind::Password][..]),
            keys: vec![settings.host_key],
            ..Default::default()
        };

        Self {
            listen_addr: settings.listen_addr,
            config: Arc::new(config),
            authenticator: Arc::new(authenticator),
            backend_user: settings.backend_user.into(),
        }
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        TcpListener::bind(self.listen_addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.listen_addr))
    }

    /// Accept client connections until the listener fails.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        info!("SSH proxy listening on {}", listener.local_addr()?);

        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let config = self.config.clone();
            let handler = ProxyConnection::new(
                self.authenticator.clone(),
                self.backend_user.clone(),
                peer_addr,
            );

            tokio::spawn(async move {
                match russh::server::run_stream(config, stream, handler).await {
                    Ok(session) => {
                        if let Err(e) = session.await {
                            warn!("SSH session error from {}: {}", peer_addr, e);
                        }
                    }
                    Err(e) => {
                        warn!("SSH connection error from {}: {}", peer_addr, e);
                    }
                }
                debug!("Connection from {} closed", peer_addr);
            });
        }
    }
}

/// Per-connection handler state.
struct ProxyConnection {
    authenticator: Arc<Authenticator>,
    backend_user: Arc<str>,
    peer_addr: SocketAddr,

    /// Client handle, shared with the backend handler for forwarded channels.
    client: ClientSlot,

    /// Backend connection (after authentication).
    backend: Option<client::Handle<BackendHandler>>,
}

impl ProxyConnection {
    fn new(authenticator: Arc<Authenticator>, backend_user: Arc<str>, peer_addr: SocketAddr) -> Self {
        Self {
            authenticator,
            backend_user,
            peer_addr,
            client: Arc::new(OnceLock::new()),
            backend: None,
        }
    }

    fn reject() -> Auth {
        Auth::Reject {
            proceed_with_methods: None,
            partial_success: false,
        }
    }
}

impl Drop for ProxyConnection {
    fn drop(&mut self) {
        if let Some(backend) = self.backend.take() {
            let peer_addr = self.peer_addr;
            tokio::spawn(async move {
                debug!("Client {} gone, closing backend connection", peer_addr);
                let _ = backend
                    .disconnect(Disconnect::ByApplication, "client disconnected", "en")
                    .await;
            });
        }
    }
}

impl Handler for ProxyConnection {
    type Error = anyhow::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if self.backend.is_some() {
            return Ok(Self::reject());
        }

        let (identity, route) = match self.authenticator.authenticate_user(user, password).await {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!("Authentication failed for {:?} from {}: {}", user, self.peer_addr, e);
                return Ok(Self::reject());
            }
        };

        match backend::connect(&route, &self.backend_user, self.client.clone()).await {
            Ok(handle) => {
                info!(
                    "Authenticated {} from {}, backend {}",
                    identity, self.peer_addr, route.address
                );
                self.backend = Some(handle);
                Ok(Auth::Accept)
            }
            Err(e) => {
                warn!("Backend for {} from {} failed: {}", identity, self.peer_addr, e);
                Ok(Self::reject())
            }
        }
    }

    async fn auth_succeeded(&mut self, session: &mut Session) -> Result<(), Self::Error> {
        let _ = self.client.set(session.handle());
        Ok(())
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(backend) = &self.backend else {
            return Ok(false);
        };
        let opened = backend.channel_open_session().await;
        Ok(relay_opened(opened, channel, session, "session"))
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(backend) = &self.backend else {
            return Ok(false);
        };
        debug!("direct-tcpip to {}:{}", host_to_connect, port_to_connect);
        let opened = backend
            .channel_open_direct_tcpip(
                host_to_connect,
                port_to_connect,
                originator_address,
                originator_port,
            )
            .await;
        Ok(relay_opened(opened, channel, session, "direct-tcpip"))
    }

    async fn channel_open_direct_streamlocal(
        &mut self,
        channel: Channel<Msg>,
        socket_path: &str,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(backend) = &self.backend else {
            return Ok(false);
        };
        let opened = backend.channel_open_direct_streamlocal(socket_path).await;
        Ok(relay_opened(opened, channel, session, "direct-streamlocal"))
    }

    async fn channel_open_x11(
        &mut self,
        channel: Channel<Msg>,
        originator_address: &str,
        originator_port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(backend) = &self.backend else {
            return Ok(false);
        };
        let opened = backend
            .channel_open_x11(originator_address, originator_port)
            .await;
        Ok(relay_opened(opened, channel, session, "x11"))
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(backend) = self.backend.as_mut() else {
            return Ok(false);
        };

        match backend.tcpip_forward(address, *port).await {
            Ok(bound) => {
                if bound != 0 {
                    *port = bound;
                }
                info!("Backend forwarding {}:{}", address, port);
                Ok(true)
            }
            Err(e) => {
                warn!("Backend refused tcpip-forward {}:{}: {}", address, port, e);
                Ok(false)
            }
        }
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(backend) = &self.backend else {
            return Ok(false);
        };

        match backend.cancel_tcpip_forward(address, port).await {
            Ok(()) => Ok(true),
            Err(e) => {
                debug!("Backend refused cancel-tcpip-forward {}:{}: {}", address, port, e);
                Ok(false)
            }
        }
    }

    async fn streamlocal_forward(
        &mut self,
        socket_path: &str,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(backend) = self.backend.as_mut() else {
            return Ok(false);
        };

        match backend.streamlocal_forward(socket_path).await {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!("Backend refused streamlocal-forward {}: {}", socket_path, e);
                Ok(false)
            }
        }
    }

    async fn cancel_streamlocal_forward(
        &mut self,
        socket_path: &str,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(backend) = &self.backend else {
            return Ok(false);
        };

        match backend.cancel_streamlocal_forward(socket_path).await {
            Ok(()) => Ok(true),
            Err(e) => {
                debug!("Backend refused cancel-streamlocal-forward {}: {}", socket_path, e);
                Ok(false)
            }
        }
    }
}

/// Start relaying a client channel if the backend accepted its twin.
fn relay_opened(
    opened: Result<Channel<client::Msg>, russh::Error>,
    channel: Channel<Msg>,
    session: &mut Session,
    kind: &str,
) -> bool {
    match opened {
        Ok(backend_channel) => {
            debug!("Relaying {} channel {:?}", kind, channel.id());
            relay::spawn(channel, backend_channel, session.handle());
            true
        }
        Err(e) => {
            warn!("Backend refused {} channel: {}", kind, e);
            false
        }
    }
}
