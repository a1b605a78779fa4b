//! Per-connection pumps between the SSH transport and the viewers.
//!
//! Every connection runs three tasks on its [`TaskTracker`]: the output pump
//! (remote bytes to `terminal_output` frames), the input pump (client frames
//! to the shell or to query mode) and a control task (keepalive and idle
//! detection). All three stop when the connection's done token fires.
//!
//! [`TaskTracker`]: tokio_util::task::TaskTracker

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use termgate_protocol::ControlAction;
use termgate_protocol::SessionStatus;
use termgate_protocol::TerminalMode;
use termgate_protocol::WebSocketMessage;
use termgate_protocol::collab::CommandRecord;
use termgate_protocol::collab::TerminalContext;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio::time::interval_at;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::connection::Connection;
use super::connection::InputEvent;
use super::connection::PauseCommand;
use super::manager::SessionManager;
use super::transport::TransportOutput;
use crate::caller::Caller;
use crate::hub::is_shortcut_key;
use crate::memory::AdaptiveBuffer;
use crate::memory::CleanupReason;

const ACK_TIMEOUT: Duration = Duration::from_secs(2);
const CONTEXT_COMMANDS: usize = 20;

/// Why a bridge asked for its session to end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Termination {
    pub status: SessionStatus,
    pub reason: String,
}

impl Termination {
    pub fn disconnected(reason: impl Into<String>) -> Self {
        Self {
            status: SessionStatus::Disconnected,
            reason: reason.into(),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: SessionStatus::Failed,
            reason: reason.into(),
        }
    }
}

pub(crate) fn start(manager: &SessionManager, conn: &Arc<Connection>, output: TransportOutput) {
    let tasks = conn.tasks();
    tasks.spawn(output_pump(manager.clone(), Arc::clone(conn), output));
    tasks.spawn(input_pump(manager.clone(), Arc::clone(conn)));
    tasks.spawn(control_loop(manager.clone(), Arc::clone(conn)));
}

enum OutputEvent {
    Cancelled,
    Pause(Option<PauseCommand>),
    Read(std::io::Result<usize>),
}

async fn output_pump(manager: SessionManager, conn: Arc<Connection>, mut output: TransportOutput) {
    let Some(mut pause_rx) = conn.take_pause_receiver() else {
        return;
    };
    let ack = conn.ack_sender();
    let done = conn.done().clone();
    let memory = Arc::clone(manager.memory());
    let mut sizing = AdaptiveBuffer::new(&manager.settings().buffer);
    let mut buf = memory.pool().borrow(sizing.size());
    let mut carry = Utf8Carry::default();

    let termination = loop {
        let event = tokio::select! {
            biased;
            _ = done.cancelled() => OutputEvent::Cancelled,
            command = pause_rx.recv() => OutputEvent::Pause(command),
            read = output.read(&mut buf) => OutputEvent::Read(read),
        };
        match event {
            OutputEvent::Cancelled | OutputEvent::Pause(None) => break None,
            OutputEvent::Pause(Some(PauseCommand::Resume)) => send_ack(&ack, false).await,
            OutputEvent::Pause(Some(PauseCommand::Pause)) => {
                conn.set_paused(true);
                send_ack(&ack, true).await;
                manager.broadcast_status(&conn, Some("output paused")).await;
                if !hold_until_resumed(&conn, &mut pause_rx, &ack).await {
                    break None;
                }
                manager.broadcast_status(&conn, Some("output resumed")).await;
            }
            OutputEvent::Read(Ok(0)) => break Some(Termination::disconnected("remote closed the session")),
            OutputEvent::Read(Ok(n)) => {
                conn.record_output(n);
                memory.add_bytes_processed(n as u64);
                let text = carry.decode(&buf[..n]);
                if !text.is_empty() {
                    manager
                        .hub()
                        .broadcast(conn.id(), &WebSocketMessage::output(text))
                        .await;
                }
                if let Some(size) = sizing.record(n) {
                    conn.reset_accounting(size);
                    if memory.over_threshold() {
                        memory.request_cleanup(CleanupReason::Threshold);
                    }
                    if size != buf.len() {
                        debug!(session_id = conn.id(), size, "read buffer resized");
                        memory.pool().give_back(std::mem::take(&mut buf));
                        buf = memory.pool().borrow(size);
                    }
                }
            }
            OutputEvent::Read(Err(err)) => {
                break Some(Termination::failed(format!("read from remote failed: {err}")));
            }
        }
    };

    memory.pool().give_back(buf);
    let rest = carry.finish();
    if !rest.is_empty() {
        manager
            .hub()
            .broadcast(conn.id(), &WebSocketMessage::output(rest))
            .await;
    }
    if let Some(termination) = termination {
        match termination.status {
            SessionStatus::Failed => error!(session_id = conn.id(), reason = %termination.reason, "output pump stopped"),
            _ => info!(session_id = conn.id(), reason = %termination.reason, "output pump stopped"),
        }
        let _ = manager.terminate_with(conn.id(), termination).await;
    }
}

/// Blocks the pump while paused. Returns `false` if the session ended.
async fn hold_until_resumed(
    conn: &Connection,
    pause_rx: &mut mpsc::Receiver<PauseCommand>,
    ack: &mpsc::Sender<bool>,
) -> bool {
    let done = conn.done().clone();
    loop {
        let command = tokio::select! {
            _ = done.cancelled() => return false,
            command = pause_rx.recv() => command,
        };
        match command {
            Some(PauseCommand::Resume) => {
                conn.set_paused(false);
                send_ack(ack, false).await;
                return true;
            }
            Some(PauseCommand::Pause) => send_ack(ack, true).await,
            None => return false,
        }
    }
}

async fn send_ack(ack: &mpsc::Sender<bool>, paused: bool) {
    if ack.send_timeout(paused, ACK_TIMEOUT).await.is_err() {
        warn!(paused, "pause acknowledgement dropped");
    }
}

async fn input_pump(manager: SessionManager, conn: Arc<Connection>) {
    let Some(mut input) = conn.take_input() else {
        return;
    };
    let done = conn.done().clone();
    loop {
        let event = tokio::select! {
            biased;
            _ = done.cancelled() => break,
            event = input.recv() => event,
        };
        let Some(event) = event else {
            break;
        };
        if let Err(termination) = handle_input(&manager, &conn, event).await {
            let _ = manager.terminate_with(conn.id(), termination).await;
            break;
        }
    }
}

async fn handle_input(
    manager: &SessionManager,
    conn: &Arc<Connection>,
    event: InputEvent,
) -> Result<(), Termination> {
    let InputEvent {
        viewer,
        caller,
        message,
    } = event;
    match message {
        WebSocketMessage::TerminalInput(input) => {
            conn.record_activity();
            let data = input.data;
            if is_shortcut_key(&data) {
                let query = Arc::clone(manager.query());
                let session = Arc::clone(conn);
                conn.tasks().spawn(async move {
                    query.toggle(&session, viewer, &caller).await;
                });
            } else if conn.mode() == TerminalMode::Query {
                let submitted = manager.query().handle_keystrokes(conn, &data).await;
                for text in submitted {
                    let query = Arc::clone(manager.query());
                    let session = Arc::clone(conn);
                    let caller = Arc::clone(&caller);
                    conn.tasks().spawn(async move {
                        let area_id = session.area_id();
                        query.handle_query(&session, &caller, &text, area_id).await;
                    });
                }
            } else {
                write_to_shell(conn, data.as_bytes()).await?;
                for command in conn.track_command_input(&data) {
                    record_command(manager, conn, &caller, command);
                }
            }
        }
        WebSocketMessage::Resize(resize) => {
            if let Err(err) = manager.resize(conn, resize.cols, resize.rows).await {
                warn!(session_id = conn.id(), "resize failed: {err}");
            }
        }
        WebSocketMessage::ModeChangeRequest(request) => {
            let query = Arc::clone(manager.query());
            let session = Arc::clone(conn);
            conn.tasks().spawn(async move {
                query.handle_request(&session, viewer, &caller, request).await;
            });
        }
        WebSocketMessage::ExecuteSuggestion(request) => match conn.suggestion(&request.suggestion_id) {
            Some(command) => {
                conn.record_activity();
                write_to_shell(conn, format!("{command}\r").as_bytes()).await?;
                conn.remember_command(&command);
                record_command(manager, conn, &caller, command);
            }
            None => warn!(
                session_id = conn.id(),
                suggestion_id = request.suggestion_id,
                "unknown suggestion"
            ),
        },
        WebSocketMessage::SessionControl(control) => match control.action {
            ControlAction::Pause | ControlAction::Resume => {
                let pause = control.action == ControlAction::Pause;
                if let Err(err) = conn
                    .request_pause(pause, manager.settings().ssh.control_timeout())
                    .await
                {
                    warn!(session_id = conn.id(), "session control failed: {err}");
                }
            }
            ControlAction::Terminate => {
                info!(session_id = conn.id(), viewer, "terminate requested by viewer");
                return Err(Termination::disconnected("terminated by viewer"));
            }
        },
        other => debug!(
            session_id = conn.id(),
            kind = other.kind(),
            "ignoring server-only message from viewer"
        ),
    }
    Ok(())
}

async fn write_to_shell(conn: &Connection, bytes: &[u8]) -> Result<(), Termination> {
    let Some(transport) = conn.transport() else {
        return Err(Termination::failed("session has no transport"));
    };
    transport
        .write(bytes)
        .await
        .map_err(|err| Termination::failed(format!("write to remote failed: {err}")))
}

/// Appends `command` to the session's record and refreshes the stored
/// terminal context with the latest history.
fn record_command(
    manager: &SessionManager,
    conn: &Arc<Connection>,
    caller: &Arc<Caller>,
    command: String,
) {
    let records = manager.records().clone();
    let session_id = conn.id().to_string();
    let caller = Arc::clone(caller);
    let context = TerminalContext {
        recent_commands: conn.recent_commands(CONTEXT_COMMANDS),
        ..TerminalContext::default()
    };
    conn.tasks().spawn(async move {
        let record = CommandRecord {
            command,
            executed_at: Utc::now(),
        };
        if let Err(err) = records
            .append_command(&session_id, &record, caller.token())
            .await
        {
            warn!(session_id, "failed to record command: {err}");
            return;
        }
        if let Err(err) = records
            .update_context(&session_id, &context, caller.token())
            .await
        {
            debug!(session_id, "failed to refresh terminal context: {err}");
        }
    });
}

async fn control_loop(manager: SessionManager, conn: Arc<Connection>) {
    let done = conn.done().clone();
    let idle_timeout = manager.settings().ssh.idle_timeout();
    let mut keepalive = conn.watch_keepalive();
    let mut period = *keepalive.borrow_and_update();
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = done.cancelled() => break,
            changed = keepalive.changed() => {
                if changed.is_err() {
                    break;
                }
                period = *keepalive.borrow_and_update();
                debug!(session_id = conn.id(), ?period, "keepalive interval changed");
                ticker = interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                continue;
            }
            _ = ticker.tick() => {}
        }

        if let Some(transport) = conn.transport() {
            if let Err(err) = transport.keepalive().await {
                let reason = format!("keepalive failed: {err}");
                let _ = manager
                    .terminate_with(conn.id(), Termination::failed(reason))
                    .await;
                break;
            }
        }
        if let Some(limit) = idle_timeout {
            if conn.idle_for() >= limit {
                info!(session_id = conn.id(), ?limit, "session idle; terminating");
                let _ = manager
                    .terminate_with(conn.id(), Termination::disconnected("idle timeout"))
                    .await;
                break;
            }
        }
    }
}

/// Holds back a trailing partial UTF-8 sequence so multi-byte characters are
/// never split across two `terminal_output` frames.
#[derive(Debug, Default)]
struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let split = self.pending.len() - incomplete_tail(&self.pending);
        let text = String::from_utf8_lossy(&self.pending[..split]).into_owned();
        self.pending.drain(..split);
        text
    }

    fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

/// Length of an incomplete multi-byte sequence at the end of `bytes`.
fn incomplete_tail(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let byte = bytes[bytes.len() - back];
        if byte & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let needed = match byte {
            0xF0..=0xFF => 4,
            0xE0..=0xEF => 3,
            0xC0..=0xDF => 2,
            _ => 1,
        };
        return if needed > back { back } else { 0 };
    }
    0
}
