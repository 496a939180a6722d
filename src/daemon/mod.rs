//! Backend SSH daemon.
//!
//! Terminates connections from the proxy (or any SSH client), authenticates
//! them against a single configured public key, and dispatches channels and
//! global requests to handlers registered by name:
//! - "session" channels run shells and commands ([`session`])
//! - "direct-tcpip" channels dial out from the daemon ([`forward`])
//! - "tcpip-forward" / "cancel-tcpip-forward" manage listeners shared
//!   through the [`listeners::ListenerRegistry`]

pub mod forward;
pub mod listeners;
pub mod pty;
pub mod session;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use russh::keys::PublicKey;
use russh::server::{Auth, Handle, Handler, Msg, Session};
use russh::{Channel, MethodKind, MethodSet};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::config::DaemonSettings;
use crate::keys;
use forward::{CancelTcpipForwardHandler, DirectTcpipHandler, TcpipForwardHandler};
use listeners::{ConnectionId, ListenerRegistry};
use session::{SessionChannelHandler, ShellLocator};

/// Refusal of a single channel open. The connection carries on.
#[derive(Debug, Error)]
pub enum ChannelRefused {
    #[error("unknown channel type")]
    UnknownChannelType,
    #[error("port {0} out of range")]
    InvalidPort(u32),
    #[error("connect failed: {0}")]
    ConnectFailed(String),
}

/// The channel type and its open parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelOpen {
    Session,
    DirectTcpip {
        host: String,
        port: u32,
        originator_address: String,
        originator_port: u32,
    },
}

impl ChannelOpen {
    pub fn channel_type(&self) -> &'static str {
        match self {
            ChannelOpen::Session => "session",
            ChannelOpen::DirectTcpip { .. } => "direct-tcpip",
        }
    }
}

/// A channel the client asked to open, handed to its handler.
pub struct NewChannel {
    pub channel: Channel<Msg>,
    pub handle: Handle,
    pub open: ChannelOpen,
}

/// Handles one channel type. Accepting means taking over the channel,
/// usually by spawning a task that owns it.
#[async_trait]
pub trait ChannelHandler: Send + Sync {
    async fn handle(&self, new_channel: NewChannel) -> Result<(), ChannelRefused>;
}

/// Connection-scoped global requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GlobalRequest {
    TcpipForward { address: String, port: u32 },
    CancelTcpipForward { address: String, port: u32 },
}

impl GlobalRequest {
    pub fn name(&self) -> &'static str {
        match self {
            GlobalRequest::TcpipForward { .. } => "tcpip-forward",
            GlobalRequest::CancelTcpipForward { .. } => "cancel-tcpip-forward",
        }
    }
}

/// What a global request handler may touch.
pub struct GlobalContext<'a> {
    pub handle: Handle,
    pub listeners: &'a ListenerRegistry,
    /// The requesting connection. Listeners it registers are stopped when it ends.
    pub connection: ConnectionId,
}

/// Handles one global request name. `Some(port)` is success.
#[async_trait]
pub trait GlobalRequestHandler: Send + Sync {
    async fn handle(&self, ctx: &GlobalContext<'_>, request: GlobalRequest) -> Option<u32>;
}

/// Handlers registered by channel type and request name.
#[derive(Default, Clone)]
pub struct Handlers {
    channels: HashMap<String, Arc<dyn ChannelHandler>>,
    globals: HashMap<String, Arc<dyn GlobalRequestHandler>>,
}

impl Handlers {
    /// Session, direct-tcpip and both forwarding requests.
    pub fn standard(shell: ShellLocator) -> Self {
        let mut handlers = Self::default();
        handlers.channel("session", Arc::new(SessionChannelHandler::new(shell)));
        handlers.channel("direct-tcpip", Arc::new(DirectTcpipHandler));
        handlers.global("tcpip-forward", Arc::new(TcpipForwardHandler));
        handlers.global("cancel-tcpip-forward", Arc::new(CancelTcpipForwardHandler));
        handlers
    }

    pub fn channel(&mut self, kind: &str, handler: Arc<dyn ChannelHandler>) -> &mut Self {
        self.channels.insert(kind.to_string(), handler);
        self
    }

    pub fn global(&mut self, name: &str, handler: Arc<dyn GlobalRequestHandler>) -> &mut Self {
        self.globals.insert(name.to_string(), handler);
        self
    }

    fn channel_handler(&self, kind: &str) -> Option<Arc<dyn ChannelHandler>> {
        self.channels.get(kind).cloned()
    }

    fn global_handler(&self, name: &str) -> Option<Arc<dyn GlobalRequestHandler>> {
        self.globals.get(name).cloned()
    }
}

/// Who may connect.
#[derive(Debug, Clone)]
enum AuthPolicy {
    Unauthenticated,
    /// Only the key with this fingerprint. `None` admits nobody.
    AuthorizedKey { fingerprint: Option<String> },
}

impl AuthPolicy {
    fn permits(&self, key: &PublicKey) -> bool {
        match self {
            AuthPolicy::Unauthenticated => true,
            AuthPolicy::AuthorizedKey { fingerprint } => fingerprint
                .as_deref()
                .is_some_and(|expected| keys::fingerprint_matches(key, expected)),
        }
    }

    fn methods(&self) -> MethodSet {
        match self {
            AuthPolicy::Unauthenticated => {
                MethodSet::from(&[MethodKind::None, MethodKind::PublicKey][..])
            }
            AuthPolicy::AuthorizedKey { .. } => MethodSet::from(&[MethodKind::PublicKey][..]),
        }
    }
}

fn reject() -> Auth {
    Auth::Reject {
        proceed_with_methods: None,
        partial_success: false,
    }
}

/// The backend daemon.
pub struct Daemon {
    listen_addr: SocketAddr,
    config: Arc<russh::server::Config>,
    auth: Arc<AuthPolicy>,
    handlers: Arc<Handlers>,
    listeners: Arc<ListenerRegistry>,
}

impl Daemon {
    pub fn new(settings: DaemonSettings) -> Self {
        Self::with_handlers(settings, Handlers::standard(ShellLocator::from_env()))
    }

    pub fn with_handlers(settings: DaemonSettings, handlers: Handlers) -> Self {
        let auth = if settings.allow_unauthenticated {
            AuthPolicy::Unauthenticated
        } else {
            AuthPolicy::AuthorizedKey {
                fingerprint: settings.authorized_key.as_ref().map(keys::fingerprint),
            }
        };

        let config = russh::server::Config {
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            methods: auth.methods(),
            keys: vec![settings.host_key],
            ..Default::default()
        };

        Self {
            listen_addr: settings.listen_addr,
            config: Arc::new(config),
            auth: Arc::new(auth),
            handlers: Arc::new(handlers),
            listeners: Arc::new(ListenerRegistry::new()),
        }
    }

    /// Bind the configured listen address.
    pub async fn bind(&self) -> Result<TcpListener> {
        TcpListener::bind(self.listen_addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.listen_addr))
    }

    /// Accept connections until the listener fails.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        info!("SSH daemon listening on {}", listener.local_addr()?);

        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let config = self.config.clone();
            let handler = DaemonConnection {
                peer_addr,
                auth: self.auth.clone(),
                handlers: self.handlers.clone(),
                listeners: self.listeners.clone(),
                connection: ConnectionId::next(),
            };

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
struct DaemonConnection {
    peer_addr: SocketAddr,
    auth: Arc<AuthPolicy>,
    handlers: Arc<Handlers>,
    listeners: Arc<ListenerRegistry>,
    connection: ConnectionId,
}

impl DaemonConnection {
    async fn dispatch_channel(
        &self,
        channel: Channel<Msg>,
        open: ChannelOpen,
        session: &mut Session,
    ) -> Result<bool, anyhow::Error> {
        let kind = open.channel_type();
        let Some(handler) = self.handlers.channel_handler(kind) else {
            warn!("No handler for {} channel from {}", kind, self.peer_addr);
            return Ok(false);
        };

        let new_channel = NewChannel {
            channel,
            handle: session.handle(),
            open,
        };
        match handler.handle(new_channel).await {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!("Refused {} channel from {}: {}", kind, self.peer_addr, e);
                Ok(false)
            }
        }
    }

    async fn dispatch_global(
        &self,
        request: GlobalRequest,
        session: &mut Session,
    ) -> Option<u32> {
        let name = request.name();
        let Some(handler) = self.handlers.global_handler(name) else {
            warn!("No handler for {} request from {}", name, self.peer_addr);
            return None;
        };

        let ctx = GlobalContext {
            handle: session.handle(),
            listeners: &self.listeners,
            connection: self.connection,
        };
        handler.handle(&ctx, request).await
    }
}

impl Drop for DaemonConnection {
    fn drop(&mut self) {
        for (key, mut entry) in self.listeners.remove_owned_by(self.connection) {
            debug!("Stopping forward {:?} for closed connection", key);
            entry.cancel();
        }
    }
}

impl Handler for DaemonConnection {
    type Error = anyhow::Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        match *self.auth {
            AuthPolicy::Unauthenticated => {
                info!("Accepted unauthenticated user {} from {}", user, self.peer_addr);
                Ok(Auth::Accept)
            }
            AuthPolicy::AuthorizedKey { .. } => Ok(reject()),
        }
    }

    async fn auth_publickey_offered(
        &mut self,
        _user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        if self.auth.permits(public_key) {
            Ok(Auth::Accept)
        } else {
            Ok(reject())
        }
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        if self.auth.permits(public_key) {
            info!("Authenticated {} from {}", user, self.peer_addr);
            Ok(Auth::Accept)
        } else {
            warn!(
                "Rejected key {} for {} from {}",
                keys::fingerprint(public_key),
                user,
                self.peer_addr
            );
            Ok(reject())
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!("Session channel opened: {:?}", channel.id());
        self.dispatch_channel(channel, ChannelOpen::Session, session)
            .await
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
        let open = ChannelOpen::DirectTcpip {
            host: host_to_connect.to_string(),
            port: port_to_connect,
            originator_address: originator_address.to_string(),
            originator_port,
        };
        self.dispatch_channel(channel, open, session).await
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let request = GlobalRequest::TcpipForward {
            address: address.to_string(),
            port: *port,
        };
        match self.dispatch_global(request, session).await {
            Some(bound) => {
                *port = bound;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let request = GlobalRequest::CancelTcpipForward {
            address: address.to_string(),
            port,
        };
        Ok(self.dispatch_global(request, session).await.is_some())
    }
}
