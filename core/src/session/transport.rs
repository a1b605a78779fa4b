use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncRead;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("authentication rejected for {username}@{host}")]
    Authentication { username: String, host: String },
    #[error("invalid private key: {reason}")]
    InvalidKey { reason: String },
    #[error("connection to {host}:{port} failed: {reason}")]
    Connect {
        host: String,
        port: u16,
        reason: String,
    },
    #[error("connection to {host}:{port} timed out after {timeout:?}")]
    Timeout {
        host: String,
        port: u16,
        timeout: Duration,
    },
    #[error("ssh channel error: {reason}")]
    Channel { reason: String },
    #[error("transport closed")]
    Closed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Credential problems are reported to the caller and never registered.
    pub fn is_authentication(&self) -> bool {
        matches!(
            self,
            TransportError::Authentication { .. } | TransportError::InvalidKey { .. }
        )
    }

    pub fn channel(reason: impl std::fmt::Display) -> Self {
        TransportError::Channel {
            reason: reason.to_string(),
        }
    }
}

#[derive(Clone)]
pub enum Credentials {
    Password(String),
    PrivateKey {
        pem: String,
        passphrase: Option<String>,
    },
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Password(_) => f.write_str("Password(..)"),
            Credentials::PrivateKey { passphrase, .. } => f
                .debug_struct("PrivateKey")
                .field("encrypted", &passphrase.is_some())
                .finish(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    pub term: String,
    pub cols: u32,
    pub rows: u32,
}

#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub credentials: Credentials,
    pub pty: PtyRequest,
    pub connect_timeout: Duration,
    pub keepalive_interval: Duration,
    pub os_detect_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsInfo {
    pub os_type: String,
    pub os_version: Option<String>,
}

impl OsInfo {
    /// Parses `uname -sr` output such as `Linux 6.1.0-13-amd64`.
    pub fn from_uname(output: &str) -> Option<Self> {
        let line = output.lines().map(str::trim).find(|l| !l.is_empty())?;
        let mut parts = line.splitn(2, char::is_whitespace);
        let os_type = parts.next()?.to_string();
        let os_version = parts
            .next()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string);
        Some(Self { os_type, os_version })
    }
}

/// Merged stdout/stderr of the remote shell. EOF means the transport closed.
pub type TransportOutput = Box<dyn AsyncRead + Send + Unpin>;

/// Write side and control of an interactive remote shell.
#[async_trait]
pub trait TerminalTransport: Send + Sync {
    async fn write(&self, data: &[u8]) -> Result<(), TransportError>;

    async fn resize(&self, cols: u32, rows: u32) -> Result<(), TransportError>;

    /// Liveness probe run by the keepalive ticker.
    async fn keepalive(&self) -> Result<(), TransportError>;

    /// Closes the shell. The output stream reaches EOF afterwards.
    async fn close(&self);
}

pub struct Connected {
    pub transport: Arc<dyn TerminalTransport>,
    pub output: TransportOutput,
    pub os: Option<OsInfo>,
}

impl std::fmt::Debug for Connected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connected").field("os", &self.os).finish_non_exhaustive()
    }
}

#[async_trait]
pub trait SshConnector: Send + Sync {
    async fn connect(&self, params: &ConnectParams) -> Result<Connected, TransportError>;
}
