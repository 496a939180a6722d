//! Shared fixtures for the end-to-end tests: a real daemon, a real proxy with
//! in-memory placement/authorization services, and a russh test client.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use russh::client;
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg, PublicKey};
use russh::{Channel, ChannelMsg};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

use instance_ssh::authenticator::Authenticator;
use instance_ssh::authorization::{
    AppEntity, AppMetadata, AuthorizationError, AuthorizationRecord, AuthorizationService,
};
use instance_ssh::config::{DaemonSettings, ProxySettings};
use instance_ssh::daemon::session::ShellLocator;
use instance_ssh::daemon::{Daemon, Handlers};
use instance_ssh::keys;
use instance_ssh::placement::{
    PlacementError, PlacementLocation, PlacementRecord, PlacementService, PortMapping,
};
use instance_ssh::proxy::Proxy;

pub const DAEMON_CONTAINER_PORT: u16 = 2222;

/// A daemon running on a loopback port.
pub struct TestDaemon {
    pub addr: SocketAddr,
    pub host_key: PrivateKey,
    pub _task: tokio::task::JoinHandle<()>,
}

impl TestDaemon {
    pub fn fingerprint(&self) -> String {
        keys::fingerprint(self.host_key.public_key())
    }
}

/// Start a daemon accepting only `authorized_key`.
pub async fn start_daemon(authorized_key: &PublicKey) -> TestDaemon {
    let host_key = keys::generate_ed25519().unwrap();
    let settings = DaemonSettings {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        host_key: host_key.clone(),
        authorized_key: Some(authorized_key.clone()),
        allow_unauthenticated: false,
    };
    let daemon = Daemon::with_handlers(settings, Handlers::standard(ShellLocator::with_shell("/bin/sh")));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(async move {
        let _ = daemon.serve(listener).await;
    });

    TestDaemon {
        addr,
        host_key,
        _task: task,
    }
}

/// Placement service that knows a single target.
pub struct StaticPlacement {
    pub record: PlacementRecord,
    pub location: PlacementLocation,
    pub targets: Mutex<Vec<String>>,
}

impl StaticPlacement {
    /// Route every target to `daemon`, authenticating with `backend_key`.
    pub fn for_daemon(daemon: &TestDaemon, backend_key: &PrivateKey, fingerprint: &str) -> Arc<Self> {
        Self::for_address(daemon.addr, backend_key, fingerprint)
    }

    /// Route every target to `addr`.
    pub fn for_address(addr: SocketAddr, backend_key: &PrivateKey, fingerprint: &str) -> Arc<Self> {
        Arc::new(Self {
            record: PlacementRecord {
                container_port: DAEMON_CONTAINER_PORT,
                host_fingerprint: fingerprint.to_string(),
                private_key: keys::encode_private_key(backend_key).unwrap(),
            },
            location: PlacementLocation {
                process_guid: "my-proc".to_string(),
                index: 0,
                instance_guid: "instance-0".to_string(),
                address: addr.ip().to_string(),
                ports: vec![PortMapping {
                    container_port: DAEMON_CONTAINER_PORT,
                    host_port: addr.port(),
                }],
            },
            targets: Mutex::new(Vec::new()),
        })
    }

    pub fn targets(&self) -> Vec<String> {
        self.targets.lock().unwrap().clone()
    }
}

#[async_trait]
impl PlacementService for StaticPlacement {
    async fn route(&self, target: &str) -> Result<PlacementRecord, PlacementError> {
        self.targets.lock().unwrap().push(target.to_string());
        Ok(self.record.clone())
    }

    async fn location(&self, target: &str, index: u32) -> Result<PlacementLocation, PlacementError> {
        self.targets.lock().unwrap().push(target.to_string());
        if index == self.location.index {
            Ok(self.location.clone())
        } else {
            Err(PlacementError::NotFound)
        }
    }
}

/// Authorization service that admits one bearer token.
pub struct StaticAuthorization {
    pub token: String,
}

#[async_trait]
impl AuthorizationService for StaticAuthorization {
    async fn app(&self, app: &str, credential: &str) -> Result<AuthorizationRecord, AuthorizationError> {
        if credential != self.token {
            return Err(AuthorizationError::Status(reqwest::StatusCode::UNAUTHORIZED));
        }
        Ok(AuthorizationRecord {
            metadata: AppMetadata {
                guid: app.to_string(),
            },
            entity: AppEntity {
                version: "v1".to_string(),
                allow_ssh: true,
                diego: true,
            },
        })
    }
}

/// Start a proxy backed by the given services.
pub async fn start_proxy(
    placement: Arc<dyn PlacementService>,
    authorization: Option<Arc<dyn AuthorizationService>>,
) -> SocketAddr {
    let settings = ProxySettings {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        host_key: keys::generate_ed25519().unwrap(),
        placement_url: reqwest::Url::parse("http://placement.invalid").unwrap(),
        authorization_url: None,
        delegated_only: false,
        backend_user: "vcap".to_string(),
    };
    let proxy = Proxy::new(settings, Authenticator::new(placement, authorization, false));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = proxy.serve(listener).await;
    });
    addr
}

/// Test client handler: trusts any host key and hands forwarded channels to the test.
pub struct TestClient {
    forwarded: mpsc::UnboundedSender<Channel<client::Msg>>,
}

impl client::Handler for TestClient {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<client::Msg>,
        _connected_address: &str,
        _connected_port: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let _ = self.forwarded.send(channel);
        Ok(())
    }
}

pub type Forwarded = mpsc::UnboundedReceiver<Channel<client::Msg>>;

pub async fn connect(addr: SocketAddr) -> (client::Handle<TestClient>, Forwarded) {
    let (tx, rx) = mpsc::unbounded_channel();
    let config = Arc::new(client::Config::default());
    let handle = client::connect(config, addr, TestClient { forwarded: tx })
        .await
        .unwrap();
    (handle, rx)
}

/// Connect to a daemon and authenticate with `key`.
pub async fn connect_with_key(
    addr: SocketAddr,
    key: &PrivateKey,
) -> (client::Handle<TestClient>, Forwarded, bool) {
    let (mut handle, rx) = connect(addr).await;
    let result = handle
        .authenticate_publickey("vcap", PrivateKeyWithHashAlg::new(Arc::new(key.clone()), None))
        .await
        .unwrap();
    (handle, rx, result.success())
}

/// Connect to a proxy with password authentication.
pub async fn connect_with_password(
    addr: SocketAddr,
    user: &str,
    password: &str,
) -> (client::Handle<TestClient>, Forwarded, bool) {
    let (mut handle, rx) = connect(addr).await;
    let result = handle.authenticate_password(user, password).await.unwrap();
    (handle, rx, result.success())
}

#[derive(Debug, Default)]
pub struct Output {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_status: Option<u32>,
    pub successes: usize,
    pub failures: usize,
}

impl Output {
    pub fn stdout(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }
}

/// Read channel messages until the channel closes.
pub async fn collect(channel: &mut Channel<client::Msg>) -> Output {
    let mut output = Output::default();
    loop {
        let msg = timeout(Duration::from_secs(10), channel.wait())
            .await
            .expect("timed out waiting for channel output");
        match msg {
            Some(ChannelMsg::Data { data }) => output.stdout.extend_from_slice(&data),
            Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                output.stderr.extend_from_slice(&data)
            }
            Some(ChannelMsg::ExitStatus { exit_status }) => output.exit_status = Some(exit_status),
            Some(ChannelMsg::Success) => output.successes += 1,
            Some(ChannelMsg::Failure) => output.failures += 1,
            Some(ChannelMsg::Close) | None => break,
            Some(_) => {}
        }
    }
    output
}

/// Wait for the next success/failure reply on a channel.
pub async fn next_reply(channel: &mut Channel<client::Msg>) -> bool {
    loop {
        let msg = timeout(Duration::from_secs(10), channel.wait())
            .await
            .expect("timed out waiting for a reply");
        match msg {
            Some(ChannelMsg::Success) => return true,
            Some(ChannelMsg::Failure) => return false,
            Some(ChannelMsg::Close) | None => panic!("channel closed before reply"),
            Some(_) => {}
        }
    }
}

pub async fn tcp_echo_server() -> (u16, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let task = tokio::spawn(async move {
        loop {
            if let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    loop {
                        match socket.read(&mut buf).await {
                            Ok(0) => break,
                            Ok(n) => {
                                if socket.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                            Err(_) => break,
                        }
                    }
                });
            }
        }
    });

    (port, task)
}

/// Relay a single TCP connection to `target`. Aborting the task cuts it.
pub async fn tcp_relay(target: SocketAddr) -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let task = tokio::spawn(async move {
        let (mut inbound, _) = listener.accept().await.unwrap();
        let mut outbound = TcpStream::connect(target).await.unwrap();
        let _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await;
    });

    (addr, task)
}

/// Read channel data up to the first newline and parse it as a pid.
pub async fn read_pid(channel: &mut Channel<client::Msg>) -> i32 {
    let mut line = Vec::new();
    while !line.contains(&b'\n') {
        let msg = timeout(Duration::from_secs(10), channel.wait())
            .await
            .expect("timed out waiting for a pid");
        match msg {
            Some(ChannelMsg::Data { data }) => line.extend_from_slice(&data),
            Some(ChannelMsg::Close) | None => panic!("channel closed before printing a pid"),
            Some(_) => {}
        }
    }
    String::from_utf8_lossy(&line).trim().parse().unwrap()
}

pub fn process_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

/// Poll `condition` for up to five seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..50 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    condition()
}
