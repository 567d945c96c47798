//! SSH access to ephemeral hosts: a low-level `ChannelExt` for passthru exec
//! on an already-open channel (used by the engine during bootstrap), and a
//! higher-level `SshClient` that owns the whole connect/auth/exec-or-sftp
//! lifecycle for a single call.
//!
//! Grounded on the teacher's `src/ssh.rs` (`ChannelExt`) and `src/worker.rs`
//! (connection setup, keepalive, host-key handling). Unlike the teacher —
//! which keeps one long-lived session per VM for the lifetime of its
//! process — `SshClient` opens a fresh TCP session per call: callers own
//! retry/backoff, this layer does not retry.

use crate::error::{PrecipError, Result};
use anyhow::Context;
use async_trait::async_trait;
use russh::{client::Msg, Channel, CryptoVec};
use russh_sftp::client::SftpSession;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(PartialEq, Eq, Copy, Clone)]
pub enum StreamMode<'a> {
    Capture,
    Log { level: log::Level, prefix: &'a str },
}

pub struct ExecOutcome {
    pub code: u32,
    /// Some(_) if stdout is configured to `StreamMode::Capture`.
    pub stdout: Option<CryptoVec>,
    /// Some(_) if stderr is configured to `StreamMode::Capture`.
    pub stderr: Option<CryptoVec>,
}

#[async_trait]
pub trait ChannelExt {
    async fn exec_to_completion(
        &mut self,
        command: &str,
        err_on_nonzero: bool,
        stdout_mode: StreamMode<'_>,
        stderr_mode: StreamMode<'_>,
    ) -> anyhow::Result<ExecOutcome>;

    /// Context is for logs and for the returned error.
    async fn exec_passthru(&mut self, context: &str, command: &str) -> anyhow::Result<()>;

    async fn read_file(&mut self, path: &str) -> anyhow::Result<CryptoVec>;
}

#[async_trait]
impl ChannelExt for Channel<Msg> {
    async fn exec_to_completion(
        &mut self,
        command: &str,
        err_on_nonzero: bool,
        stdout_mode: StreamMode<'_>,
        stderr_mode: StreamMode<'_>,
    ) -> anyhow::Result<ExecOutcome> {
        self.exec(true, command).await?;

        let mut code = None;
        let mut stdout_buf = CryptoVec::new();
        let mut stderr_buf = CryptoVec::new();

        fn handle_data_msg(buf: &mut CryptoVec, mode: &StreamMode, data: CryptoVec) -> anyhow::Result<()> {
            buf.extend(&data);
            match mode {
                StreamMode::Capture => { /* noop */ }
                StreamMode::Log { level, prefix } => {
                    while let Some(newline_pos) = buf.iter().position(|byte| *byte == b'\n') {
                        let line = std::str::from_utf8(&buf[..newline_pos])?;
                        log::log!(*level, "{prefix}: {line}");
                        *buf = CryptoVec::from_slice(&buf[newline_pos + 1..]);
                    }
                }
            }
            Ok(())
        }

        while let Some(msg) = self.wait().await {
            match msg {
                russh::ChannelMsg::Data { data } => {
                    handle_data_msg(&mut stdout_buf, &stdout_mode, data)?;
                }
                russh::ChannelMsg::ExtendedData { data, ext } if ext == 1 => {
                    handle_data_msg(&mut stderr_buf, &stderr_mode, data)?;
                }
                russh::ChannelMsg::ExitStatus { exit_status } => {
                    code = Some(exit_status);
                    // cannot leave the loop immediately, there might still be more data to receive
                }
                _ => {}
            }
        }
        self.close().await?;
        let code = code.ok_or(anyhow::format_err!("channel ended without ExitStatus"))?;
        if err_on_nonzero && code != 0 {
            anyhow::bail!("remote command returned {code}");
        }
        Ok(ExecOutcome {
            code,
            stdout: if stdout_mode == StreamMode::Capture { Some(stdout_buf) } else { None },
            stderr: if stderr_mode == StreamMode::Capture { Some(stderr_buf) } else { None },
        })
    }

    async fn exec_passthru(&mut self, context: &str, command: &str) -> anyhow::Result<()> {
        let passthru = StreamMode::Log { level: log::Level::Debug, prefix: context };
        self.exec_to_completion(command, true, passthru, passthru).await.context(context.to_owned())?;
        Ok(())
    }

    async fn read_file(&mut self, path: &str) -> anyhow::Result<CryptoVec> {
        let command = format!("cat {path}");
        let outcome = self
            .exec_to_completion(
                &command,
                true,
                StreamMode::Capture,
                StreamMode::Log { level: log::Level::Debug, prefix: &command },
            )
            .await?;
        Ok(outcome.stdout.unwrap())
    }
}

pub struct RunOutcome {
    pub exit_code: u32,
    pub stdout: String,
    pub stderr: String,
}

/// Disables host-key verification: these are just-launched hosts with no
/// prior host key to pin against.
struct ClientHandler;

#[async_trait]
impl russh::client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

/// The seam `LifecycleEngine`/`FanOutExecutor` actually depend on, so tests
/// can swap in a fake transport instead of opening real TCP connections —
/// the same reason the teacher keeps `VmProvider`/`ChannelExt` as traits
/// rather than inlining them into their one real caller.
#[async_trait]
pub trait SshTransport: Send + Sync {
    async fn run(&self, host: &str, user: &str, cmd: &str) -> Result<RunOutcome>;
    async fn put_bytes(&self, host: &str, user: &str, contents: &[u8], remote: &str) -> Result<()>;
    async fn get(&self, host: &str, user: &str, remote: &str, local: &Path) -> Result<()>;

    async fn put(&self, host: &str, user: &str, local: &Path, remote: &str) -> Result<()> {
        let mut contents = Vec::new();
        tokio::fs::File::open(local)
            .await
            .map_err(|e| PrecipError::Ssh(anyhow::anyhow!("opening local file {}: {e}", local.display())))?
            .read_to_end(&mut contents)
            .await
            .map_err(|e| PrecipError::Ssh(anyhow::anyhow!("reading local file {}: {e}", local.display())))?;
        self.put_bytes(host, user, &contents, remote).await
    }
}

/// A fresh-session-per-call SSH client used by the fan-out executor.
pub struct SshClient {
    private_key_path: std::path::PathBuf,
}

impl SshClient {
    pub fn new(private_key_path: impl Into<std::path::PathBuf>) -> Self {
        Self { private_key_path: private_key_path.into() }
    }

    /// Opens a session, requests a PTY, runs `cmd` to completion, captures
    /// both streams, and returns the remote exit code.
    async fn run_impl(&self, host: &str, user: &str, cmd: &str) -> Result<RunOutcome> {
        let session = self.connect(host, user).await?;
        let mut channel = session
            .channel_open_session()
            .await
            .map_err(|e| PrecipError::Ssh(anyhow::anyhow!("opening channel: {e}")))?;
        channel
            .request_pty(false, "xterm", 80, 24, 0, 0, &[])
            .await
            .map_err(|e| PrecipError::Ssh(anyhow::anyhow!("requesting pty: {e}")))?;

        let outcome = channel
            .exec_to_completion(cmd, false, StreamMode::Capture, StreamMode::Capture)
            .await
            .map_err(PrecipError::Ssh)?;

        Ok(RunOutcome {
            exit_code: outcome.code,
            stdout: String::from_utf8_lossy(&outcome.stdout.unwrap_or_default()).into_owned(),
            stderr: String::from_utf8_lossy(&outcome.stderr.unwrap_or_default()).into_owned(),
        })
    }

    /// Same as `put`, but the source is already in memory (used internally
    /// for the embedded bootstrap script, which has no path on disk).
    async fn put_bytes_impl(&self, host: &str, user: &str, contents: &[u8], remote: &str) -> Result<()> {
        let session = self.connect(host, user).await?;
        let sftp = self.open_sftp(&session).await?;

        let mut remote_file = sftp
            .create(remote)
            .await
            .map_err(|e| PrecipError::Ssh(anyhow::anyhow!("creating remote file {remote}: {e}")))?;
        remote_file
            .write_all(contents)
            .await
            .map_err(|e| PrecipError::Ssh(anyhow::anyhow!("writing remote file {remote}: {e}")))?;
        let _ = remote_file.shutdown().await;
        let _ = sftp.close().await;
        Ok(())
    }

    async fn get_impl(&self, host: &str, user: &str, remote: &str, local: &Path) -> Result<()> {
        let session = self.connect(host, user).await?;
        let sftp = self.open_sftp(&session).await?;

        let mut remote_file = sftp
            .open(remote)
            .await
            .map_err(|e| PrecipError::Ssh(anyhow::anyhow!("opening remote file {remote}: {e}")))?;
        let mut contents = Vec::new();
        remote_file
            .read_to_end(&mut contents)
            .await
            .map_err(|e| PrecipError::Ssh(anyhow::anyhow!("reading remote file {remote}: {e}")))?;
        let _ = sftp.close().await;

        tokio::fs::write(local, &contents)
            .await
            .map_err(|e| PrecipError::Ssh(anyhow::anyhow!("writing local file {}: {e}", local.display())))?;
        Ok(())
    }

    async fn connect(&self, host: &str, user: &str) -> Result<russh::client::Handle<ClientHandler>> {
        let key_pair = russh::keys::load_secret_key(&self.private_key_path, None).map_err(|e| {
            PrecipError::Ssh(anyhow::anyhow!("loading private key {}: {e}", self.private_key_path.display()))
        })?;

        let config = Arc::new(russh::client::Config { keepalive_interval: Some(KEEPALIVE_INTERVAL), ..Default::default() });
        let tcp = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host, 22)))
            .await
            .map_err(|_| PrecipError::Ssh(anyhow::anyhow!("connecting to {host}:22 timed out")))?
            .map_err(|e| PrecipError::Ssh(anyhow::anyhow!("connecting to {host}:22: {e}")))?;

        let mut session = russh::client::connect_stream(config, tcp, ClientHandler)
            .await
            .map_err(|e| PrecipError::Ssh(anyhow::anyhow!("ssh handshake with {host}: {e}")))?;

        let authenticated = session
            .authenticate_publickey(user, Arc::new(key_pair))
            .await
            .map_err(|e| PrecipError::Ssh(anyhow::anyhow!("authenticating to {host} as {user}: {e}")))?;
        if !authenticated {
            return Err(PrecipError::Ssh(anyhow::anyhow!("{host}: public key rejected for user {user}")));
        }
        Ok(session)
    }

    async fn open_sftp(&self, session: &russh::client::Handle<ClientHandler>) -> Result<SftpSession> {
        let channel = session
            .channel_open_session()
            .await
            .map_err(|e| PrecipError::Ssh(anyhow::anyhow!("opening sftp channel: {e}")))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| PrecipError::Ssh(anyhow::anyhow!("requesting sftp subsystem: {e}")))?;
        SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| PrecipError::Ssh(anyhow::anyhow!("starting sftp session: {e}")))
    }
}

#[async_trait]
impl SshTransport for SshClient {
    async fn run(&self, host: &str, user: &str, cmd: &str) -> Result<RunOutcome> {
        self.run_impl(host, user, cmd).await
    }

    async fn put_bytes(&self, host: &str, user: &str, contents: &[u8], remote: &str) -> Result<()> {
        self.put_bytes_impl(host, user, contents, remote).await
    }

    async fn get(&self, host: &str, user: &str, remote: &str, local: &Path) -> Result<()> {
        self.get_impl(host, user, remote, local).await
    }
}
