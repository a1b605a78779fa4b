//! Scripted SSH transport and viewer helpers shared by the core
//! integration suites.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use termgate_core::config::GatewayConfig;
use termgate_core::config::ServiceEndpoint;
use termgate_core::hub::ViewerFrame;
use termgate_core::session::ConnectParams;
use termgate_core::session::Connected;
use termgate_core::session::OsInfo;
use termgate_core::session::SshConnector;
use termgate_core::session::TerminalTransport;
use termgate_core::session::TransportError;
use termgate_protocol::WebSocketMessage;
use tokio::io::AsyncWriteExt;
use tokio::io::DuplexStream;
use tokio::sync::Notify;
use tokio::sync::mpsc;

/// How the scripted connector answers the next `connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectBehaviour {
    Accept,
    RejectCredentials,
    Unreachable,
}

/// Stands in for a remote shell: records stdin and lets tests print output.
#[derive(Clone, Default)]
pub struct ScriptedShell {
    stdin: Arc<Mutex<Vec<u8>>>,
    resizes: Arc<Mutex<Vec<(u32, u32)>>>,
    output: Arc<tokio::sync::Mutex<Option<DuplexStream>>>,
    closed: Arc<AtomicBool>,
    written: Arc<Notify>,
}

impl ScriptedShell {
    pub fn stdin(&self) -> String {
        String::from_utf8_lossy(&self.stdin.lock().unwrap_or_else(PoisonError::into_inner))
            .into_owned()
    }

    pub fn resizes(&self) -> Vec<(u32, u32)> {
        self.resizes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Waits until stdin contains `needle`.
    pub async fn wait_for_stdin(&self, needle: &str, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.written.notified();
                if self.stdin().contains(needle) {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    /// Prints `text` as if the remote shell produced it.
    pub async fn print(&self, text: &str) {
        if let Some(output) = self.output.lock().await.as_mut() {
            let _ = output.write_all(text.as_bytes()).await;
        }
    }

    /// Ends the output stream as if the remote side hung up.
    pub async fn hang_up(&self) {
        self.output.lock().await.take();
    }
}

struct ScriptedTransport {
    shell: ScriptedShell,
}

#[async_trait]
impl TerminalTransport for ScriptedTransport {
    async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        if self.shell.is_closed() {
            return Err(TransportError::Closed);
        }
        self.shell
            .stdin
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(data);
        self.shell.written.notify_waiters();
        Ok(())
    }

    async fn resize(&self, cols: u32, rows: u32) -> Result<(), TransportError> {
        self.shell
            .resizes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((cols, rows));
        Ok(())
    }

    async fn keepalive(&self) -> Result<(), TransportError> {
        if self.shell.is_closed() {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    async fn close(&self) {
        self.shell.closed.store(true, Ordering::SeqCst);
        self.shell.hang_up().await;
    }
}

/// [`SshConnector`] that never touches the network.
pub struct ScriptedConnector {
    behaviour: Mutex<ConnectBehaviour>,
    shells: Mutex<Vec<ScriptedShell>>,
    attempts: AtomicUsize,
    held: AtomicBool,
    released: Notify,
}

impl Default for ScriptedConnector {
    fn default() -> Self {
        Self::new(ConnectBehaviour::Accept)
    }
}

impl ScriptedConnector {
    pub fn new(behaviour: ConnectBehaviour) -> Self {
        Self {
            behaviour: Mutex::new(behaviour),
            shells: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
            held: AtomicBool::new(false),
            released: Notify::new(),
        }
    }

    pub fn set_behaviour(&self, behaviour: ConnectBehaviour) {
        *self.behaviour.lock().unwrap_or_else(PoisonError::into_inner) = behaviour;
    }

    /// Makes every `connect` wait for [`Self::release_connects`].
    pub fn hold_connects(&self) {
        self.held.store(true, Ordering::SeqCst);
    }

    pub fn release_connects(&self) {
        self.held.store(false, Ordering::SeqCst);
        self.released.notify_waiters();
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn last_shell(&self) -> Option<ScriptedShell> {
        self.shells
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }
}

#[async_trait]
impl SshConnector for ScriptedConnector {
    async fn connect(&self, params: &ConnectParams) -> Result<Connected, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        loop {
            let released = self.released.notified();
            if !self.held.load(Ordering::SeqCst) {
                break;
            }
            released.await;
        }
        let behaviour = *self.behaviour.lock().unwrap_or_else(PoisonError::into_inner);
        match behaviour {
            ConnectBehaviour::RejectCredentials => Err(TransportError::Authentication {
                username: params.username.clone(),
                host: params.host.clone(),
            }),
            ConnectBehaviour::Unreachable => Err(TransportError::Connect {
                host: params.host.clone(),
                port: params.port,
                reason: "connection refused".to_string(),
            }),
            ConnectBehaviour::Accept => {
                let (remote, local) = tokio::io::duplex(16 * 1024);
                let shell = ScriptedShell {
                    output: Arc::new(tokio::sync::Mutex::new(Some(remote))),
                    ..ScriptedShell::default()
                };
                self.shells
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(shell.clone());
                Ok(Connected {
                    transport: Arc::new(ScriptedTransport { shell }),
                    output: Box::new(local),
                    os: Some(OsInfo {
                        os_type: "Linux".to_string(),
                        os_version: Some("6.1.0".to_string()),
                    }),
                })
            }
        }
    }
}

/// Gateway configuration pointing every collaborator at `base_url` with
/// fast retries.
pub fn test_config(base_url: &str) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    let endpoint = ServiceEndpoint {
        base_url: base_url.to_string(),
        timeout_ms: Some(500),
    };
    config.services.session_record = endpoint.clone();
    config.services.context = endpoint.clone();
    config.services.rag = endpoint;
    config.retry.max_retries = 1;
    config.retry.initial_backoff_ms = 1;
    config.retry.max_backoff_ms = 5;
    config.retry.attempt_timeout_ms = 500;
    config.ssh.control_timeout_ms = 500;
    config
}

/// Next decoded text frame, or `None` on close or timeout.
pub async fn next_message(
    frames: &mut mpsc::Receiver<ViewerFrame>,
    timeout: Duration,
) -> Option<WebSocketMessage> {
    match tokio::time::timeout(timeout, frames.recv()).await {
        Ok(Some(ViewerFrame::Text(text))) => WebSocketMessage::decode(&text).ok(),
        _ => None,
    }
}

/// Every text frame received until the queue stays quiet for `quiet`.
pub async fn drain_messages(
    frames: &mut mpsc::Receiver<ViewerFrame>,
    quiet: Duration,
) -> Vec<WebSocketMessage> {
    let mut messages = Vec::new();
    while let Some(message) = next_message(frames, quiet).await {
        messages.push(message);
    }
    messages
}

/// Waits for the first message matching `predicate`, skipping others.
pub async fn wait_for_message(
    frames: &mut mpsc::Receiver<ViewerFrame>,
    timeout: Duration,
    predicate: impl Fn(&WebSocketMessage) -> bool,
) -> Option<WebSocketMessage> {
    let wait = async {
        loop {
            match frames.recv().await {
                Some(ViewerFrame::Text(text)) => {
                    if let Ok(message) = WebSocketMessage::decode(&text) {
                        if predicate(&message) {
                            return Some(message);
                        }
                    }
                }
                Some(ViewerFrame::Close(_)) | None => return None,
            }
        }
    };
    tokio::time::timeout(timeout, wait).await.ok().flatten()
}
