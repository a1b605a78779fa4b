use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::OnceLock;
use std::sync::PoisonError;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use termgate_protocol::SessionStatus;
use termgate_protocol::SessionView;
use termgate_protocol::Suggestion;
use termgate_protocol::TerminalMode;
use termgate_protocol::WebSocketMessage;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::error::SessionError;
use super::line::LineEdit;
use super::line::edit_line;
use super::transport::OsInfo;
use super::transport::TerminalTransport;
use crate::caller::Caller;
use crate::hub::ViewerId;

const HISTORY_LIMIT: usize = 100;
const SUGGESTION_LIMIT: usize = 32;
const INPUT_QUEUE_DEPTH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PauseCommand {
    Pause,
    Resume,
}

/// A decoded client frame together with the viewer that sent it.
#[derive(Debug, Clone)]
pub struct InputEvent {
    pub viewer: ViewerId,
    pub caller: Arc<Caller>,
    pub message: WebSocketMessage,
}

pub struct NewConnection {
    pub id: String,
    pub owner: Caller,
    pub client_ip: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub term: String,
    pub cols: u32,
    pub rows: u32,
    pub keepalive_interval: Duration,
    pub max_buffer_size: usize,
}

#[derive(Debug)]
struct ConnectionState {
    status: SessionStatus,
    os: Option<OsInfo>,
    cols: u32,
    rows: u32,
    term: String,
    paused: bool,
    paused_at: Option<DateTime<Utc>>,
    mode: TerminalMode,
    area_id: Option<String>,
    bytes_since_reset: u64,
    max_buffer_size: usize,
    last_reset: Instant,
    last_activity: Instant,
    ended_at: Option<DateTime<Utc>>,
    suggestions: VecDeque<Suggestion>,
    history: VecDeque<String>,
    command_line: String,
    query_line: String,
}

/// One live terminal session.
///
/// Identity fields are immutable; everything else sits behind a single
/// per-connection lock that is never held across an await.
pub struct Connection {
    id: String,
    owner: Caller,
    client_ip: String,
    host: String,
    port: u16,
    username: String,
    created_at: DateTime<Utc>,
    transport: OnceLock<Arc<dyn TerminalTransport>>,
    state: Mutex<ConnectionState>,
    mode_change: tokio::sync::Mutex<()>,
    pause_tx: mpsc::Sender<PauseCommand>,
    pause_rx: Mutex<Option<mpsc::Receiver<PauseCommand>>>,
    ack_tx: mpsc::Sender<bool>,
    ack_rx: tokio::sync::Mutex<mpsc::Receiver<bool>>,
    input_tx: mpsc::Sender<InputEvent>,
    input_rx: Mutex<Option<mpsc::Receiver<InputEvent>>>,
    keepalive: watch::Sender<Duration>,
    done: CancellationToken,
    tasks: TaskTracker,
}

impl Connection {
    pub fn new(init: NewConnection) -> Arc<Self> {
        let (pause_tx, pause_rx) = mpsc::channel(1);
        let (ack_tx, ack_rx) = mpsc::channel(1);
        let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE_DEPTH);
        let (keepalive, _) = watch::channel(init.keepalive_interval);
        let now = Instant::now();
        Arc::new(Self {
            id: init.id,
            owner: init.owner,
            client_ip: init.client_ip,
            host: init.host,
            port: init.port,
            username: init.username,
            created_at: Utc::now(),
            transport: OnceLock::new(),
            state: Mutex::new(ConnectionState {
                status: SessionStatus::Connecting,
                os: None,
                cols: init.cols,
                rows: init.rows,
                term: init.term,
                paused: false,
                paused_at: None,
                mode: TerminalMode::Normal,
                area_id: None,
                bytes_since_reset: 0,
                max_buffer_size: init.max_buffer_size,
                last_reset: now,
                last_activity: now,
                ended_at: None,
                suggestions: VecDeque::new(),
                history: VecDeque::new(),
                command_line: String::new(),
                query_line: String::new(),
            }),
            mode_change: tokio::sync::Mutex::new(()),
            pause_tx,
            pause_rx: Mutex::new(Some(pause_rx)),
            ack_tx,
            ack_rx: tokio::sync::Mutex::new(ack_rx),
            input_tx,
            input_rx: Mutex::new(Some(input_rx)),
            keepalive,
            done: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user_id(&self) -> &str {
        &self.owner.user_id
    }

    /// The caller that created the session; used for calls made on its
    /// behalf once no viewer is involved.
    pub fn owner(&self) -> &Caller {
        &self.owner
    }

    pub fn client_ip(&self) -> &str {
        &self.client_ip
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// `None` until the connector has opened the shell.
    pub fn transport(&self) -> Option<&Arc<dyn TerminalTransport>> {
        self.transport.get()
    }

    /// Installs the shell transport. Returns `false` if one was already set.
    pub(crate) fn attach_transport(&self, transport: Arc<dyn TerminalTransport>) -> bool {
        self.transport.set(transport).is_ok()
    }

    pub fn done(&self) -> &CancellationToken {
        &self.done
    }

    pub(crate) fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }

    pub fn status(&self) -> SessionStatus {
        self.lock().status
    }

    /// Applies a status change if the lifecycle allows it.
    pub fn transition(&self, next: SessionStatus) -> bool {
        let mut state = self.lock();
        if !state.status.can_transition_to(next) {
            return false;
        }
        state.status = next;
        if next.is_terminal() {
            state.ended_at = Some(Utc::now());
        }
        true
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.lock().ended_at
    }

    pub fn os(&self) -> Option<OsInfo> {
        self.lock().os.clone()
    }

    pub fn set_os(&self, os: Option<OsInfo>) {
        self.lock().os = os;
    }

    pub fn geometry(&self) -> (u32, u32) {
        let state = self.lock();
        (state.cols, state.rows)
    }

    pub fn set_geometry(&self, cols: u32, rows: u32) {
        let mut state = self.lock();
        state.cols = cols;
        state.rows = rows;
    }

    pub fn mode(&self) -> TerminalMode {
        self.lock().mode
    }

    /// Held across a whole mode change so concurrent toggles apply in order.
    pub(crate) async fn lock_mode_change(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.mode_change.lock().await
    }

    pub fn area_id(&self) -> Option<String> {
        self.lock().area_id.clone()
    }

    /// Switches mode. `area_id` of `None` keeps the current area so a later
    /// toggle can reuse it.
    pub fn set_mode(&self, mode: TerminalMode, area_id: Option<String>) {
        let mut state = self.lock();
        state.mode = mode;
        if area_id.is_some() {
            state.area_id = area_id;
        }
        state.query_line.clear();
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    pub(crate) fn set_paused(&self, paused: bool) {
        let mut state = self.lock();
        state.paused = paused;
        state.paused_at = paused.then(Utc::now);
    }

    pub fn paused_at(&self) -> Option<DateTime<Utc>> {
        self.lock().paused_at
    }

    pub fn record_activity(&self) {
        self.lock().last_activity = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.lock().last_activity.elapsed()
    }

    /// Accounts for bytes read from the remote side.
    pub fn record_output(&self, bytes: usize) {
        let mut state = self.lock();
        state.bytes_since_reset = state.bytes_since_reset.saturating_add(bytes as u64);
        state.last_activity = Instant::now();
    }

    pub fn bytes_since_reset(&self) -> u64 {
        self.lock().bytes_since_reset
    }

    pub fn max_buffer_size(&self) -> usize {
        self.lock().max_buffer_size
    }

    pub(crate) fn reset_accounting(&self, buffer_size: usize) {
        let mut state = self.lock();
        state.bytes_since_reset = 0;
        state.max_buffer_size = buffer_size;
        state.last_reset = Instant::now();
    }

    pub fn since_reset(&self) -> Duration {
        self.lock().last_reset.elapsed()
    }

    pub fn keepalive_interval(&self) -> Duration {
        *self.keepalive.borrow()
    }

    pub fn set_keepalive_interval(&self, interval: Duration) {
        self.keepalive.send_replace(interval);
    }

    pub(crate) fn watch_keepalive(&self) -> watch::Receiver<Duration> {
        self.keepalive.subscribe()
    }

    pub fn input_sender(&self) -> mpsc::Sender<InputEvent> {
        self.input_tx.clone()
    }

    pub(crate) fn take_input(&self) -> Option<mpsc::Receiver<InputEvent>> {
        self.input_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub(crate) fn take_pause_receiver(&self) -> Option<mpsc::Receiver<PauseCommand>> {
        self.pause_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub(crate) fn ack_sender(&self) -> mpsc::Sender<bool> {
        self.ack_tx.clone()
    }

    /// Asks the output pump to pause or resume and waits for its
    /// acknowledgement. Both legs are bounded by `timeout`.
    pub async fn request_pause(&self, pause: bool, timeout: Duration) -> Result<bool, SessionError> {
        let action = if pause { "pause" } else { "resume" };
        let timed_out = || SessionError::ControlTimeout {
            session_id: self.id.clone(),
            action,
        };
        if self.done.is_cancelled() || self.status() != SessionStatus::Connected {
            return Err(SessionError::terminated(&self.id));
        }
        let mut acks = self.ack_rx.lock().await;
        // Acks from requests that already timed out.
        while acks.try_recv().is_ok() {}
        let command = if pause {
            PauseCommand::Pause
        } else {
            PauseCommand::Resume
        };
        self.pause_tx
            .send_timeout(command, timeout)
            .await
            .map_err(|_| timed_out())?;
        match tokio::time::timeout(timeout, acks.recv()).await {
            Ok(Some(paused)) => Ok(paused),
            Ok(None) => Err(SessionError::terminated(&self.id)),
            Err(_) => Err(timed_out()),
        }
    }

    /// Feeds normal-mode keystrokes into the command assembler and returns
    /// the commands completed by this chunk.
    pub fn track_command_input(&self, data: &str) -> Vec<String> {
        let mut state = self.lock();
        let LineEdit { submitted, .. } = edit_line(&mut state.command_line, data);
        for command in &submitted {
            push_history(&mut state.history, command);
        }
        submitted
    }

    /// Adds a command that reached the shell without being typed.
    pub fn remember_command(&self, command: &str) {
        push_history(&mut self.lock().history, command);
    }

    pub fn recent_commands(&self, limit: usize) -> Vec<String> {
        let state = self.lock();
        let skip = state.history.len().saturating_sub(limit);
        state.history.iter().skip(skip).cloned().collect()
    }

    pub fn edit_query_line(&self, data: &str) -> LineEdit {
        edit_line(&mut self.lock().query_line, data)
    }

    pub fn remember_suggestions(&self, suggestions: &[Suggestion]) {
        let mut state = self.lock();
        for suggestion in suggestions {
            if state.suggestions.len() == SUGGESTION_LIMIT {
                state.suggestions.pop_front();
            }
            state.suggestions.push_back(suggestion.clone());
        }
    }

    pub fn suggestion(&self, suggestion_id: &str) -> Option<String> {
        self.lock()
            .suggestions
            .iter()
            .find(|s| s.suggestion_id == suggestion_id)
            .map(|s| s.command.clone())
    }

    pub fn view(&self, viewers: usize) -> SessionView {
        let state = self.lock();
        SessionView {
            session_id: self.id.clone(),
            user_id: self.owner.user_id.clone(),
            client_ip: self.client_ip.clone(),
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            os_type: state.os.as_ref().map(|os| os.os_type.clone()),
            os_version: state.os.as_ref().and_then(|os| os.os_version.clone()),
            status: state.status,
            cols: state.cols,
            rows: state.rows,
            term: state.term.clone(),
            mode: state.mode,
            area_id: state.area_id.clone(),
            paused: state.paused,
            viewers,
            created_at: self.created_at,
            ended_at: state.ended_at,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn push_history(history: &mut VecDeque<String>, command: &str) {
    if history.len() == HISTORY_LIMIT {
        history.pop_front();
    }
    history.push_back(command.to_string());
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.owner.user_id)
            .field("target", &format_args!("{}@{}:{}", self.username, self.host, self.port))
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}
