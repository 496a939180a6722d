//! TCP forwarding: direct-tcpip channels and tcpip-forward listeners.

use std::net::SocketAddr;

use async_trait::async_trait;
use russh::server::Handle;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::listeners::{ListenerEntry, ListenerKey};
use super::{
    ChannelHandler, ChannelOpen, ChannelRefused, GlobalContext, GlobalRequest,
    GlobalRequestHandler, NewChannel,
};

/// Handler for "direct-tcpip" channels.
#[derive(Debug, Default)]
pub struct DirectTcpipHandler;

#[async_trait]
impl ChannelHandler for DirectTcpipHandler {
    async fn handle(&self, new_channel: NewChannel) -> Result<(), ChannelRefused> {
        let ChannelOpen::DirectTcpip {
            host,
            port,
            originator_address,
            originator_port,
        } = new_channel.open
        else {
            return Err(ChannelRefused::UnknownChannelType);
        };

        let port = u16::try_from(port).map_err(|_| ChannelRefused::InvalidPort(port))?;
        let stream = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|e| ChannelRefused::ConnectFailed(format!("{}:{}: {}", host, port, e)))?;

        info!(
            "Direct-tcpip {}:{} for {}:{}",
            host, port, originator_address, originator_port
        );

        let channel_id = new_channel.channel.id();
        tokio::spawn(async move {
            relay(new_channel.channel.into_stream(), stream).await;
            debug!("Direct-tcpip channel {:?} finished", channel_id);
        });
        Ok(())
    }
}

/// Relay bytes between a channel stream and a socket until either side closes.
async fn relay<S>(mut channel: S, mut stream: TcpStream)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    match tokio::io::copy_bidirectional(&mut channel, &mut stream).await {
        Ok((up, down)) => debug!("Relay finished: {} bytes out, {} bytes back", up, down),
        Err(e) => debug!("Relay ended: {}", e),
    }
}

/// Map the requested bind address to a host the OS can bind.
fn bind_host(address: &str) -> &str {
    match address {
        "" | "*" | "0.0.0.0" => "0.0.0.0",
        "localhost" => "127.0.0.1",
        other => other,
    }
}

/// Handler for the "tcpip-forward" global request.
#[derive(Debug, Default)]
pub struct TcpipForwardHandler;

#[async_trait]
impl GlobalRequestHandler for TcpipForwardHandler {
    async fn handle(&self, ctx: &GlobalContext<'_>, request: GlobalRequest) -> Option<u32> {
        let GlobalRequest::TcpipForward { address, port } = request else {
            return None;
        };

        let Ok(requested) = u16::try_from(port) else {
            warn!("tcpip-forward port {} out of range", port);
            return None;
        };

        // The same key can never be bound twice; reject before touching the socket.
        if requested != 0 && ctx.listeners.contains(&ListenerKey::new(address.clone(), port)) {
            warn!("tcpip-forward {}:{} already registered", address, port);
            return None;
        }

        let listener = match TcpListener::bind((bind_host(&address), requested)).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!("Failed to bind {}:{}: {}", address, port, e);
                return None;
            }
        };
        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                warn!("Failed to read bound address for {}:{}: {}", address, port, e);
                return None;
            }
        };
        let bound_port = local_addr.port() as u32;

        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(accept_loop(
            listener,
            stop_rx,
            ctx.handle.clone(),
            address.clone(),
            bound_port,
        ));

        let key = ListenerKey::new(address, bound_port);
        let entry = ListenerEntry::new(ctx.connection, local_addr, stop_tx, task);
        if ctx.listeners.insert(key.clone(), entry).is_err() {
            warn!("tcpip-forward {:?} already registered", key);
            return None;
        }

        info!("Forwarding {} for {:?}", local_addr, key);
        Some(bound_port)
    }
}

/// Handler for the "cancel-tcpip-forward" global request.
#[derive(Debug, Default)]
pub struct CancelTcpipForwardHandler;

#[async_trait]
impl GlobalRequestHandler for CancelTcpipForwardHandler {
    async fn handle(&self, ctx: &GlobalContext<'_>, request: GlobalRequest) -> Option<u32> {
        let GlobalRequest::CancelTcpipForward { address, port } = request else {
            return None;
        };

        let key = ListenerKey::new(address, port);
        // Any connection may cancel a forward.
        let Some(entry) = ctx.listeners.remove(&key) else {
            debug!("cancel-tcpip-forward for unknown {:?}", key);
            return None;
        };
        if entry.owner() != ctx.connection {
            debug!("{:?} cancelled by another connection", key);
        }
        entry.shutdown().await;

        info!("Cancelled forward {:?}", key);
        Some(port)
    }
}

async fn accept_loop(
    listener: TcpListener,
    mut stop: oneshot::Receiver<()>,
    handle: Handle,
    address: String,
    port: u32,
) {
    loop {
        tokio::select! {
            _ = &mut stop => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(forward_connection(
                        handle.clone(),
                        stream,
                        peer,
                        address.clone(),
                        port,
                    ));
                }
                Err(e) => {
                    warn!("Accept error on forward {}:{}: {}", address, port, e);
                    break;
                }
            },
        }
    }
    debug!("Forward listener {}:{} stopped", address, port);
}

async fn forward_connection(
    handle: Handle,
    stream: TcpStream,
    peer: SocketAddr,
    address: String,
    port: u32,
) {
    match handle
        .channel_open_forwarded_tcpip(address, port, peer.ip().to_string(), peer.port() as u32)
        .await
    {
        Ok(channel) => relay(channel.into_stream(), stream).await,
        Err(e) => warn!("Failed to open forwarded-tcpip channel for {}: {}", peer, e),
    }
}
