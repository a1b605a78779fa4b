//! [`SshConnector`] backed by russh.
//!
//! The interactive channel is owned by a driver task. Writes and resizes are
//! sent to it over a command queue; everything the remote shell prints is
//! copied into an in-memory pipe whose read half becomes the session's
//! [`TransportOutput`].
//!
//! [`TransportOutput`]: super::transport::TransportOutput

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Buf;
use bytes::BytesMut;
use russh::ChannelMsg;
use russh::Disconnect;
use russh::client;
use russh::client::Handle;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::transport::ConnectParams;
use super::transport::Connected;
use super::transport::Credentials;
use super::transport::OsInfo;
use super::transport::SshConnector;
use super::transport::TerminalTransport;
use super::transport::TransportError;

const OUTPUT_PIPE_CAPACITY: usize = 64 * 1024;
const PENDING_OUTPUT_LIMIT: usize = 1024 * 1024;
const COMMAND_QUEUE_DEPTH: usize = 64;
const OS_PROBE_COMMAND: &str = "uname -sr";

/// Accepts every host key and logs its fingerprint. Host trust is decided
/// by whoever is allowed to create sessions.
struct ClientHandler {
    host: String,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        info!(
            host = %self.host,
            fingerprint = %server_public_key.fingerprint(),
            "accepting server host key"
        );
        Ok(true)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RusshConnector;

impl RusshConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SshConnector for RusshConnector {
    async fn connect(&self, params: &ConnectParams) -> Result<Connected, TransportError> {
        let connect_error = |reason: String| TransportError::Connect {
            host: params.host.clone(),
            port: params.port,
            reason,
        };

        let config = Arc::new(client::Config {
            keepalive_interval: Some(params.keepalive_interval),
            ..Default::default()
        });
        let handler = ClientHandler {
            host: params.host.clone(),
        };
        let connecting = client::connect(config, (params.host.clone(), params.port), handler);
        let mut handle = match tokio::time::timeout(params.connect_timeout, connecting).await {
            Ok(Ok(handle)) => handle,
            Ok(Err(err)) => return Err(connect_error(err.to_string())),
            Err(_) => {
                return Err(TransportError::Timeout {
                    host: params.host.clone(),
                    port: params.port,
                    timeout: params.connect_timeout,
                });
            }
        };

        let authenticated = match &params.credentials {
            Credentials::Password(password) => handle
                .authenticate_password(params.username.clone(), password.clone())
                .await
                .map_err(|err| connect_error(err.to_string()))?,
            Credentials::PrivateKey { pem, passphrase } => {
                let key = russh_keys::decode_secret_key(pem, passphrase.as_deref()).map_err(
                    |err| TransportError::InvalidKey {
                        reason: err.to_string(),
                    },
                )?;
                handle
                    .authenticate_publickey(params.username.clone(), Arc::new(key))
                    .await
                    .map_err(|err| connect_error(err.to_string()))?
            }
        };
        if !authenticated {
            let _ = handle
                .disconnect(Disconnect::ByApplication, "authentication failed", "en")
                .await;
            return Err(TransportError::Authentication {
                username: params.username.clone(),
                host: params.host.clone(),
            });
        }

        let os = detect_os(&handle, params.os_detect_timeout).await;

        let channel = handle
            .channel_open_session()
            .await
            .map_err(TransportError::channel)?;
        channel
            .request_pty(
                false,
                &params.pty.term,
                params.pty.cols,
                params.pty.rows,
                0,
                0,
                &[],
            )
            .await
            .map_err(TransportError::channel)?;
        channel
            .request_shell(true)
            .await
            .map_err(TransportError::channel)?;

        let (sink, source) = tokio::io::duplex(OUTPUT_PIPE_CAPACITY);
        let (commands, command_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let cancel = CancellationToken::new();
        tokio::spawn(drive_channel(channel, command_rx, sink, cancel.clone()));
        debug!(host = %params.host, port = params.port, "interactive shell opened");

        Ok(Connected {
            transport: Arc::new(SshTransport {
                handle: Mutex::new(handle),
                commands,
                cancel,
            }),
            output: Box::new(source),
            os,
        })
    }
}

/// Runs `uname -sr` on a separate channel. Failure only costs the OS fields.
async fn detect_os(handle: &Handle<ClientHandler>, timeout: Duration) -> Option<OsInfo> {
    let probe = async {
        let mut channel = handle.channel_open_session().await.ok()?;
        channel.exec(true, OS_PROBE_COMMAND).await.ok()?;
        let mut output = Vec::new();
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => output.extend_from_slice(&data),
                ChannelMsg::Eof | ChannelMsg::Close => break,
                _ => {}
            }
        }
        OsInfo::from_uname(&String::from_utf8_lossy(&output))
    };
    match tokio::time::timeout(timeout, probe).await {
        Ok(os) => os,
        Err(_) => {
            warn!(?timeout, "os detection timed out");
            None
        }
    }
}

enum ChannelCommand {
    Write(Vec<u8>, oneshot::Sender<Result<(), TransportError>>),
    Resize {
        cols: u32,
        rows: u32,
        reply: oneshot::Sender<Result<(), TransportError>>,
    },
}

/// The interactive channel as the driver sees it. Implementations must be
/// cancel-safe in [`ShellChannel::next_output`].
#[async_trait]
trait ShellChannel: Send {
    /// Next chunk printed by the remote shell; `None` once it hung up.
    async fn next_output(&mut self) -> Option<Vec<u8>>;
    async fn send_data(&mut self, data: &[u8]) -> Result<(), TransportError>;
    async fn window_change(&mut self, cols: u32, rows: u32) -> Result<(), TransportError>;
    async fn finish(&mut self);
}

#[async_trait]
impl ShellChannel for russh::Channel<client::Msg> {
    async fn next_output(&mut self) -> Option<Vec<u8>> {
        loop {
            match self.wait().await? {
                ChannelMsg::Data { data } | ChannelMsg::ExtendedData { data, .. } => {
                    return Some(data.to_vec());
                }
                ChannelMsg::ExitStatus { exit_status } => {
                    debug!(exit_status, "remote shell exited");
                }
                ChannelMsg::Eof | ChannelMsg::Close => return None,
                _ => {}
            }
        }
    }

    async fn send_data(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.data(data).await.map_err(TransportError::channel)
    }

    async fn window_change(&mut self, cols: u32, rows: u32) -> Result<(), TransportError> {
        russh::Channel::window_change(self, cols, rows, 0, 0)
            .await
            .map_err(TransportError::channel)
    }

    async fn finish(&mut self) {
        let _ = self.eof().await;
        let _ = self.close().await;
    }
}

/// Owns the channel. Remote output is spooled into `pending` and written to
/// the pipe only as fast as the output pump reads it, so a paused pump never
/// holds up writes or resizes. Once `pending` reaches
/// [`PENDING_OUTPUT_LIMIT`] the channel is no longer polled for output.
async fn drive_channel<C, W>(
    mut channel: C,
    mut commands: mpsc::Receiver<ChannelCommand>,
    mut sink: W,
    cancel: CancellationToken,
) where
    C: ShellChannel,
    W: AsyncWrite + Unpin + Send,
{
    let mut pending = BytesMut::new();
    let mut remote_open = true;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            command = commands.recv() => match command {
                Some(ChannelCommand::Write(data, reply)) => {
                    let _ = reply.send(channel.send_data(&data).await);
                }
                Some(ChannelCommand::Resize { cols, rows, reply }) => {
                    let _ = reply.send(channel.window_change(cols, rows).await);
                }
                None => break,
            },
            written = sink.write(&pending[..]), if !pending.is_empty() => match written {
                Ok(0) | Err(_) => break,
                Ok(n) => pending.advance(n),
            },
            output = channel.next_output(), if remote_open && pending.len() < PENDING_OUTPUT_LIMIT => {
                match output {
                    Some(data) => pending.extend_from_slice(&data),
                    None => remote_open = false,
                }
            }
        }
        if !remote_open && pending.is_empty() {
            break;
        }
    }
    channel.finish().await;
    // Dropping the sink delivers EOF to the output pump.
    drop(sink);
}

struct SshTransport {
    handle: Mutex<Handle<ClientHandler>>,
    commands: mpsc::Sender<ChannelCommand>,
    cancel: CancellationToken,
}

impl SshTransport {
    async fn request(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<(), TransportError>>) -> ChannelCommand,
    ) -> Result<(), TransportError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| TransportError::Closed)?;
        response.await.map_err(|_| TransportError::Closed)?
    }
}

#[async_trait]
impl TerminalTransport for SshTransport {
    async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        let data = data.to_vec();
        self.request(|reply| ChannelCommand::Write(data, reply)).await
    }

    async fn resize(&self, cols: u32, rows: u32) -> Result<(), TransportError> {
        self.request(|reply| ChannelCommand::Resize { cols, rows, reply })
            .await
    }

    async fn keepalive(&self) -> Result<(), TransportError> {
        if self.commands.is_closed() || self.handle.lock().await.is_closed() {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    async fn close(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().await;
        if let Err(err) = handle
            .disconnect(Disconnect::ByApplication, "session terminated", "en")
            .await
        {
            debug!("ssh disconnect failed: {err}");
        }
    }
}
