//! Session channels: pty, environment, shell/exec, window changes and signals.
//!
//! Each session channel runs on its own task that reads channel messages in
//! order. At most one process is started per channel; its output is streamed
//! back and its exit status is sent before the channel is closed.

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use russh::server::{Handle, Msg};
use russh::{Channel, ChannelId, ChannelMsg, CryptoVec, Sig};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::pty::{self, Pty, WindowSize};
use super::{ChannelHandler, ChannelOpen, ChannelRefused, NewChannel};

/// `SSH_EXTENDED_DATA_STDERR`
const EXTENDED_DATA_STDERR: u32 = 1;

/// Exit status reported when the process could not be started.
pub const SPAWN_FAILURE_STATUS: u32 = 255;

/// What a session channel asked to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Start {
    Shell,
    Exec(String),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("a process was already started on this channel")]
    AlreadyStarted,
    #[error("a pty is already allocated")]
    PtyAlreadyAllocated,
    #[error("no pty allocated")]
    NoPty,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Locates the shell used for `shell` and `exec` requests.
#[derive(Debug, Clone)]
pub struct ShellLocator {
    shell: String,
}

impl ShellLocator {
    /// `$SHELL` if set and non-empty, otherwise `/bin/sh`.
    pub fn from_env() -> Self {
        let shell = std::env::var("SHELL")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "/bin/sh".to_string());
        Self { shell }
    }

    pub fn with_shell(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }

    /// Build the command for a start request.
    pub fn command(&self, start: &Start) -> Command {
        let mut command = Command::new(&self.shell);
        match start {
            Start::Shell => {
                command.arg("-l");
            }
            Start::Exec(line) => {
                command.arg("-c").arg(line);
            }
        }
        command
    }
}

/// Configuration accumulated on a session channel before its process starts.
#[derive(Debug, Default)]
pub struct SessionState {
    env: Vec<(String, String)>,
    pty: Option<Pty>,
    started: bool,
}

impl SessionState {
    pub fn allocate_pty(&mut self, term: &str, size: WindowSize) -> Result<(), SessionError> {
        if self.pty.is_some() {
            return Err(SessionError::PtyAlreadyAllocated);
        }
        if self.started {
            return Err(SessionError::AlreadyStarted);
        }
        self.pty = Some(Pty::open(term, size)?);
        Ok(())
    }

    /// Record a variable for the eventual process. Later values win.
    pub fn set_env(&mut self, name: &str, value: &str) {
        self.env.retain(|(k, _)| k != name);
        self.env.push((name.to_string(), value.to_string()));
    }

    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }

    pub fn resize(&mut self, size: WindowSize) -> Result<(), SessionError> {
        let pty = self.pty.as_mut().ok_or(SessionError::NoPty)?;
        pty.resize(size)?;
        Ok(())
    }

    pub fn pty(&self) -> Option<&Pty> {
        self.pty.as_ref()
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Claim the channel's single start. A second claim fails.
    pub fn begin(&mut self) -> Result<(), SessionError> {
        if self.started {
            return Err(SessionError::AlreadyStarted);
        }
        self.started = true;
        Ok(())
    }

    /// Spawn the process for `start` with the accumulated configuration.
    pub fn spawn(&mut self, shell: &ShellLocator, start: &Start) -> Result<Spawned, SessionError> {
        let mut command = shell.command(start);
        command.envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        command.kill_on_drop(true);

        let spawned = match self.pty.as_mut() {
            Some(pty) => {
                command.env("TERM", pty.term());
                pty.attach(&mut command)?;
                let child = command.spawn()?;
                drop(command);
                pty.release_slave();

                Spawned {
                    child,
                    stdin: Box::new(pty.writer()?),
                    stdout: Box::new(pty.reader()?),
                    stderr: None,
                    tty: true,
                }
            }
            None => {
                command
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped())
                    .process_group(0);
                let mut child = command.spawn()?;

                let stdin = child
                    .stdin
                    .take()
                    .ok_or_else(|| io::Error::other("child stdin not captured"))?;
                let stdout = child
                    .stdout
                    .take()
                    .ok_or_else(|| io::Error::other("child stdout not captured"))?;
                let stderr = child
                    .stderr
                    .take()
                    .ok_or_else(|| io::Error::other("child stderr not captured"))?;

                Spawned {
                    child,
                    stdin: Box::new(stdin),
                    stdout: Box::new(stdout),
                    stderr: Some(Box::new(stderr)),
                    tty: false,
                }
            }
        };

        Ok(spawned)
    }
}

type Reader = Box<dyn AsyncRead + Send + Unpin>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// A started process whose streams are not yet connected to the channel.
pub struct Spawned {
    child: Child,
    stdin: Writer,
    stdout: Reader,
    stderr: Option<Reader>,
    tty: bool,
}

impl Spawned {
    /// Connect the process to the channel. Output goes out as channel data
    /// (stderr as extended data); on exit the status is sent and the channel closed.
    pub fn attach(self, handle: Handle, channel_id: ChannelId) -> Process {
        let Spawned {
            mut child,
            stdin,
            stdout,
            stderr,
            tty,
        } = self;

        let pid = child.id();
        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let stdin_task = tokio::spawn(pump_stdin(stdin_rx, stdin));

        let waiter = tokio::spawn(async move {
            let stdout_pump = pump_output(stdout, handle.clone(), channel_id, None, tty);
            let stderr_pump = async {
                if let Some(stderr) = stderr {
                    pump_output(
                        stderr,
                        handle.clone(),
                        channel_id,
                        Some(EXTENDED_DATA_STDERR),
                        tty,
                    )
                    .await;
                }
            };
            futures::future::join(stdout_pump, stderr_pump).await;

            let exit_status = match child.wait().await {
                Ok(status) => exit_code(status),
                Err(e) => {
                    warn!("Failed to wait for process on channel {:?}: {}", channel_id, e);
                    SPAWN_FAILURE_STATUS
                }
            };
            stdin_task.abort();

            debug!(
                "Process on channel {:?} exited with status {}",
                channel_id, exit_status
            );
            let _ = handle.exit_status_request(channel_id, exit_status).await;
            let _ = handle.eof(channel_id).await;
            let _ = handle.close(channel_id).await;
        });

        Process {
            pid,
            stdin: Some(stdin_tx),
            waiter,
        }
    }
}

/// A running process attached to a session channel.
pub struct Process {
    pid: Option<u32>,
    stdin: Option<mpsc::UnboundedSender<Vec<u8>>>,
    waiter: JoinHandle<()>,
}

impl Process {
    /// Queue input for the process without waiting for it to be read.
    pub fn write_stdin(&self, data: Vec<u8>) {
        if let Some(tx) = &self.stdin {
            let _ = tx.send(data);
        }
    }

    /// Close the process's standard input.
    pub fn close_stdin(&mut self) {
        self.stdin = None;
    }

    /// Deliver a signal to the process group.
    pub fn signal(&self, signal: Signal) -> nix::Result<()> {
        if self.waiter.is_finished() {
            return Ok(());
        }
        match self.pid {
            Some(pid) => killpg(Pid::from_raw(pid as i32), signal),
            None => Ok(()),
        }
    }

    /// Kill the process group if still running. The waiter then reaps the child.
    pub fn terminate(&self) {
        if let Err(e) = self.signal(Signal::SIGKILL) {
            debug!("Failed to kill process group {:?}: {}", self.pid, e);
        }
    }
}

async fn pump_stdin(mut rx: mpsc::UnboundedReceiver<Vec<u8>>, mut stdin: Writer) {
    while let Some(data) = rx.recv().await {
        if stdin.write_all(&data).await.is_err() {
            break;
        }
        if stdin.flush().await.is_err() {
            break;
        }
    }
    let _ = stdin.shutdown().await;
}

async fn pump_output(
    mut reader: Reader,
    handle: Handle,
    channel_id: ChannelId,
    ext: Option<u32>,
    tty: bool,
) {
    let mut buf = vec![0u8; 32768];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if tty && pty::is_hangup(&e) => break,
            Err(e) => {
                warn!("Process output error on channel {:?}: {}", channel_id, e);
                break;
            }
        };

        let payload = CryptoVec::from_slice(&buf[..n]);
        let sent = match ext {
            Some(code) => handle
                .extended_data(channel_id, code, payload)
                .await
                .is_ok(),
            None => handle.data(channel_id, payload).await.is_ok(),
        };
        if !sent {
            break;
        }
    }
}

/// The process's exit code, or 128 + signal number when killed by a signal.
pub fn exit_code(status: ExitStatus) -> u32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code as u32,
        (None, Some(signal)) => 128 + signal as u32,
        (None, None) => SPAWN_FAILURE_STATUS,
    }
}

/// Map an SSH signal name to an OS signal.
pub fn os_signal(sig: &Sig) -> Option<Signal> {
    let signal = match sig {
        Sig::ABRT => Signal::SIGABRT,
        Sig::ALRM => Signal::SIGALRM,
        Sig::FPE => Signal::SIGFPE,
        Sig::HUP => Signal::SIGHUP,
        Sig::ILL => Signal::SIGILL,
        Sig::INT => Signal::SIGINT,
        Sig::KILL => Signal::SIGKILL,
        Sig::PIPE => Signal::SIGPIPE,
        Sig::QUIT => Signal::SIGQUIT,
        Sig::SEGV => Signal::SIGSEGV,
        Sig::TERM => Signal::SIGTERM,
        Sig::USR1 => Signal::SIGUSR1,
        Sig::Custom(name) => match name.as_str() {
            "USR2" => Signal::SIGUSR2,
            _ => return None,
        },
    };
    Some(signal)
}

async fn reply(handle: &Handle, channel_id: ChannelId, want_reply: bool, ok: bool) {
    if !want_reply {
        return;
    }
    let _ = if ok {
        handle.channel_success(channel_id).await
    } else {
        handle.channel_failure(channel_id).await
    };
}

/// Handler for "session" channels.
pub struct SessionChannelHandler {
    shell: ShellLocator,
}

impl SessionChannelHandler {
    pub fn new(shell: ShellLocator) -> Self {
        Self { shell }
    }
}

#[async_trait]
impl ChannelHandler for SessionChannelHandler {
    async fn handle(&self, new_channel: NewChannel) -> Result<(), ChannelRefused> {
        if !matches!(new_channel.open, ChannelOpen::Session) {
            return Err(ChannelRefused::UnknownChannelType);
        }

        let shell = self.shell.clone();
        tokio::spawn(run_session(new_channel.channel, new_channel.handle, shell));
        Ok(())
    }
}

async fn run_session(mut channel: Channel<Msg>, handle: Handle, shell: ShellLocator) {
    let id = channel.id();
    let mut state = SessionState::default();
    let mut process: Option<Process> = None;

    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::RequestPty {
                want_reply,
                term,
                col_width,
                row_height,
                pix_width,
                pix_height,
                ..
            } => {
                let size = WindowSize {
                    cols: col_width,
                    rows: row_height,
                    pix_width,
                    pix_height,
                };
                let ok = match state.allocate_pty(&term, size) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("pty-req on channel {:?} failed: {}", id, e);
                        false
                    }
                };
                reply(&handle, id, want_reply, ok).await;
            }
            ChannelMsg::SetEnv {
                want_reply,
                variable_name,
                variable_value,
            } => {
                state.set_env(&variable_name, &variable_value);
                reply(&handle, id, want_reply, true).await;
            }
            ChannelMsg::WindowChange {
                col_width,
                row_height,
                pix_width,
                pix_height,
            } => {
                let size = WindowSize {
                    cols: col_width,
                    rows: row_height,
                    pix_width,
                    pix_height,
                };
                if let Err(e) = state.resize(size) {
                    debug!("window-change on channel {:?} ignored: {}", id, e);
                }
            }
            ChannelMsg::RequestShell { want_reply } => {
                process = start(&mut state, &shell, Start::Shell, &handle, id, want_reply)
                    .await
                    .or(process);
            }
            ChannelMsg::Exec {
                want_reply,
                command,
            } => {
                let line = String::from_utf8_lossy(&command).to_string();
                process = start(&mut state, &shell, Start::Exec(line), &handle, id, want_reply)
                    .await
                    .or(process);
            }
            ChannelMsg::RequestSubsystem { want_reply, name } => {
                warn!("Subsystem {:?} not supported on channel {:?}", name, id);
                reply(&handle, id, want_reply, false).await;
            }
            ChannelMsg::Data { data } => {
                if let Some(process) = &process {
                    process.write_stdin(data.to_vec());
                }
            }
            ChannelMsg::Eof => {
                if let Some(process) = process.as_mut() {
                    process.close_stdin();
                }
            }
            ChannelMsg::Signal { signal } => match (&process, os_signal(&signal)) {
                (Some(process), Some(sig)) => {
                    if let Err(e) = process.signal(sig) {
                        warn!("Failed to deliver {:?} on channel {:?}: {}", sig, id, e);
                    }
                }
                (_, None) => debug!("Unsupported signal {:?} on channel {:?}", signal, id),
                (None, _) => debug!("Signal on channel {:?} with no process", id),
            },
            _ => {}
        }
    }

    debug!("Session channel {:?} closed", id);
    if let Some(process) = process {
        process.terminate();
    }
}

/// Handle a shell or exec request. Returns the process if one was started.
async fn start(
    state: &mut SessionState,
    shell: &ShellLocator,
    start: Start,
    handle: &Handle,
    id: ChannelId,
    want_reply: bool,
) -> Option<Process> {
    if let Err(e) = state.begin() {
        warn!("{:?} on channel {:?} rejected: {}", start, id, e);
        reply(handle, id, want_reply, false).await;
        return None;
    }

    match state.spawn(shell, &start) {
        Ok(spawned) => {
            info!("Started {:?} on channel {:?}", start, id);
            reply(handle, id, want_reply, true).await;
            Some(spawned.attach(handle.clone(), id))
        }
        Err(e) => {
            warn!("Failed to start {:?} on channel {:?}: {}", start, id, e);
            reply(handle, id, want_reply, false).await;
            let _ = handle.exit_status_request(id, SPAWN_FAILURE_STATUS).await;
            let _ = handle.eof(id).await;
            let _ = handle.close(id).await;
            None
        }
    }
}
