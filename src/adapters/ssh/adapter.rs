//! Outbound SSH client adapter (spec.md §4.4).
//!
//! The teacher depends on `russh`/`russh-keys` for its inbound SFTP
//! *server*; here the same crates are driven as a client (`russh::client`)
//! to open exec channels against remote hosts instead.
//!
//! `russh::Channel` multiplexes stdout/stderr/exit-status over a single
//! message queue rather than exposing them as independent `AsyncRead`s
//! (spec.md §4.6's "multiplexes stdout/stderr over the exec channel" note
//! applies equally here), so a background task owns the channel and fans
//! its messages out into a stdout pipe, a stderr pipe, and an exit-status
//! oneshot, which is the shape [`RunningProcess`] expects.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Msg};
use russh::{ChannelMsg, Disconnect};
use russh_keys::key::PublicKey;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, oneshot};

use crate::adapters::{Adapter, BoxedRead, BoxedWrite, Exit, ExitSlot, RunningProcess};
use crate::command::{Command, Invocation, KnownHostsPolicy, StdinSource};
use crate::error::{Result, XecError};
use crate::events::EventBus;

use super::auth::authenticate;
use super::pool::{PoolKey, PooledConnection, SshHandle, SshPool};

/// `russh::client::Handler` that enforces the configured known-hosts policy
/// (spec.md §4.4, §9 "Security defaults": strict host-key checking on by
/// default).
pub struct ClientHandler {
    pub known_hosts_path: Option<std::path::PathBuf>,
    pub policy: KnownHostsPolicy,
    pub host_label: String,
    pub port: u16,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        match self.policy {
            KnownHostsPolicy::Insecure => Ok(true),
            KnownHostsPolicy::Strict => {
                let path = known_hosts_path(self.known_hosts_path.as_deref());
                Ok(
                    russh_keys::check_known_hosts_path(&self.host_label, self.port, server_public_key, &path)
                        .unwrap_or(false),
                )
            }
            KnownHostsPolicy::AcceptNew => {
                let path = known_hosts_path(self.known_hosts_path.as_deref());
                match russh_keys::check_known_hosts_path(&self.host_label, self.port, server_public_key, &path) {
                    Ok(true) => Ok(true),
                    _ => {
                        let _ =
                            russh_keys::learn_known_hosts_path(&self.host_label, self.port, server_public_key, &path);
                        Ok(true)
                    }
                }
            }
        }
    }
}

fn known_hosts_path(configured: Option<&std::path::Path>) -> std::path::PathBuf {
    if let Some(p) = configured {
        return p.to_path_buf();
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_string());
    std::path::PathBuf::from(home).join(".ssh/known_hosts")
}

pub struct SshAdapter {
    pool: SshPool,
}

impl SshAdapter {
    pub fn new(max_per_key: usize, idle_ttl: Duration, acquire_timeout: Duration, events: EventBus) -> Self {
        Self { pool: SshPool::new(max_per_key, idle_ttl, acquire_timeout, events) }
    }

    /// Closes every idle pooled connection (spec.md §5 `Engine::dispose`).
    pub async fn dispose_idle(&self) {
        self.pool.dispose_idle().await;
    }

    /// Leases a connection for `options` from the pool, opening a fresh one
    /// if none is idle. Used by command exec above and by `put`/`get`
    /// (`super::transfer`) — both lean on the same pooled connection rather
    /// than each dialing their own (SPEC_FULL.md §14).
    pub(crate) async fn acquire(&self, options: &crate::command::SshOptions) -> Result<PooledConnection> {
        let key = PoolKey::from_options(options);
        let opts = options.clone();
        self.pool.acquire(key, || async move { SshAdapter::connect(&opts).await }).await
    }

    async fn connect(options: &crate::command::SshOptions) -> Result<SshHandle> {
        let config = Arc::new(client::Config {
            keepalive_interval: Some(options.keepalive_interval),
            ..Default::default()
        });
        let handler = ClientHandler {
            known_hosts_path: options.known_hosts_path.clone(),
            policy: options.known_hosts_policy,
            host_label: options.host.clone(),
            port: options.port,
        };
        let addr = (options.host.as_str(), options.port);
        let mut handle =
            tokio::time::timeout(options.connect_timeout, client::connect(config, addr, handler))
                .await
                .map_err(|_| XecError::HostUnreachable(options.host.clone()))?
                .map_err(|e| XecError::HandshakeFailure(e.to_string()))?;

        authenticate(&mut handle, &options.user, &options.auth).await?;
        Ok(handle)
    }
}

enum ChannelCommand {
    Signal(String),
    Stdin(Vec<u8>),
    StdinEof,
    Close,
}

pub struct SshProcess {
    stdout: Option<DuplexStream>,
    stderr: Option<DuplexStream>,
    stdin: Option<DuplexStream>,
    exit: ExitSlot,
    control_tx: mpsc::Sender<ChannelCommand>,
}

#[async_trait]
impl RunningProcess for SshProcess {
    fn take_stdout(&mut self) -> Option<BoxedRead> {
        self.stdout.take().map(|s| Box::pin(s) as BoxedRead)
    }

    fn take_stderr(&mut self) -> Option<BoxedRead> {
        self.stderr.take().map(|s| Box::pin(s) as BoxedRead)
    }

    fn take_stdin(&mut self) -> Option<BoxedWrite> {
        self.stdin.take().map(|s| Box::pin(s) as BoxedWrite)
    }

    async fn wait(&mut self) -> Result<Exit> {
        self.exit.wait().await
    }

    async fn signal(&mut self, signal: &str) -> Result<()> {
        let _ = self.control_tx.send(ChannelCommand::Signal(signal.to_string())).await;
        Ok(())
    }

    async fn dispose(&mut self) -> Result<()> {
        let _ = self.control_tx.send(ChannelCommand::Close).await;
        Ok(())
    }
}

#[async_trait]
impl Adapter for SshAdapter {
    async fn launch(&self, command: &Command) -> Result<Box<dyn RunningProcess>> {
        let crate::command::AdapterTarget::Ssh(options) = &command.target else {
            return Err(XecError::Validation("ssh adapter received non-ssh target".to_string()));
        };

        let pooled = self.acquire(options).await?;

        let mut channel = pooled
            .handle
            .channel_open_session()
            .await
            .map_err(|e| XecError::ChannelOpenFailure(e.to_string()))?;

        if command.interactive {
            channel
                .request_pty(false, "xterm", 80, 24, 0, 0, &[])
                .await
                .map_err(|e| XecError::ChannelOpenFailure(e.to_string()))?;
        }

        let invocation = match &command.invocation {
            Invocation::Argv(argv) => crate::escaping::join(argv),
            Invocation::Shell(s) => s.clone(),
        };
        channel
            .exec(true, invocation.as_bytes())
            .await
            .map_err(|e| XecError::ChannelOpenFailure(e.to_string()))?;

        let (stdout_local, stdout_remote) = tokio::io::duplex(64 * 1024);
        let (stderr_local, stderr_remote) = tokio::io::duplex(64 * 1024);
        let (stdin_local, mut stdin_remote) = tokio::io::duplex(64 * 1024);
        let (exit_tx, exit_rx) = oneshot::channel();
        let (control_tx, mut control_rx) = mpsc::channel(4);

        match &command.stdin {
            StdinSource::Text(text) => {
                let _ = channel.data(text.as_bytes()).await;
                let _ = channel.eof().await;
            }
            StdinSource::Bytes(bytes) => {
                let _ = channel.data(bytes.as_slice()).await;
                let _ = channel.eof().await;
            }
            StdinSource::None | StdinSource::Inherit | StdinSource::Piped => {}
        }

        tokio::spawn(async move {
            let mut stdout_remote = stdout_remote;
            let mut stderr_remote = stderr_remote;
            let mut exit = Exit::default();
            loop {
                tokio::select! {
                    msg = channel.wait() => {
                        match msg {
                            Some(ChannelMsg::Data { data }) => {
                                let _ = stdout_remote.write_all(&data).await;
                            }
                            Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                                let _ = stderr_remote.write_all(&data).await;
                            }
                            Some(ChannelMsg::ExtendedData { .. }) => {}
                            Some(ChannelMsg::ExitStatus { exit_status }) => {
                                exit.exit_code = Some(exit_status as i32);
                            }
                            Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                                exit.signal = Some(format!("{signal_name:?}"));
                            }
                            Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                            Some(_) => {}
                        }
                    }
                    cmd = control_rx.recv() => {
                        match cmd {
                            Some(ChannelCommand::Signal(sig)) => {
                                let name = sig.trim_start_matches("SIG");
                                let _ = channel.signal(russh::Sig::from_name(name).unwrap_or(russh::Sig::TERM)).await;
                            }
                            Some(ChannelCommand::Stdin(bytes)) => {
                                let _ = channel.data(bytes.as_slice()).await;
                            }
                            Some(ChannelCommand::StdinEof) => {
                                let _ = channel.eof().await;
                            }
                            Some(ChannelCommand::Close) | None => break,
                        }
                    }
                }
            }
            let _ = channel.close().await;
            pooled.release().await;
            let _ = exit_tx.send(exit);
        });

        let stdin_control_tx = control_tx.clone();
        tokio::spawn(async move {
            use tokio::io::AsyncReadExt;
            let mut buf = vec![0u8; 8192];
            loop {
                match stdin_remote.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if stdin_control_tx.send(ChannelCommand::Stdin(buf[..n].to_vec())).await.is_err() {
                            break;
                        }
                    }
                }
            }
            let _ = stdin_control_tx.send(ChannelCommand::StdinEof).await;
        });

        Ok(Box::new(SshProcess {
            stdout: Some(stdout_local),
            stderr: Some(stderr_local),
            stdin: Some(stdin_local),
            exit: ExitSlot::new(exit_rx),
            control_tx,
        }))
    }
}

/// Closes the underlying transport politely; used by `Engine::dispose`.
pub async fn disconnect(handle: &SshHandle) {
    let _ = handle.disconnect(Disconnect::ByApplication, "", "English").await;
}
