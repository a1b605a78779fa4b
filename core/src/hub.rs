//! Per-session registry of connected viewer sockets.
//!
//! The hub never touches a socket directly. Each viewer is represented by a
//! bounded queue drained by that socket's writer task; a write succeeds
//! once the frame is queued within the configured write deadline. A viewer
//! whose writer has gone away simply fails its writes until it is
//! explicitly unregistered.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use futures::future::join_all;
use termgate_protocol::WebSocketMessage;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tracing::debug;
use tracing::warn;

use crate::config::WebSocketConfig;

pub type ViewerId = u64;

/// Control-sequence family that toggles query mode: Ctrl+Q as a raw byte,
/// as a kitty keyboard-protocol CSI-u sequence and as an xterm
/// `modifyOtherKeys` sequence.
const SHORTCUT_SEQUENCES: &[&str] = &["\x11", "\x1b[113;5u", "\x1b[27;5;113~"];

/// Best-effort check for the query-mode shortcut. Only whole input chunks
/// are matched; a shortcut embedded in pasted text is passed through.
pub fn is_shortcut_key(data: &str) -> bool {
    SHORTCUT_SEQUENCES.contains(&data)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewerFrame {
    Text(Arc<str>),
    Close(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Returned by [`WebSocketHub::register`]; the socket's writer task drains
/// `frames` until it yields `None`.
#[derive(Debug)]
pub struct ViewerRegistration {
    pub id: ViewerId,
    pub frames: mpsc::Receiver<ViewerFrame>,
}

#[derive(Debug, Clone)]
struct Viewer {
    id: ViewerId,
    tx: mpsc::Sender<ViewerFrame>,
}

#[derive(Debug)]
pub struct WebSocketHub {
    sessions: RwLock<HashMap<String, Vec<Viewer>>>,
    next_id: AtomicU64,
    write_deadline: Duration,
    queue_depth: usize,
}

impl WebSocketHub {
    pub fn new(config: &WebSocketConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            write_deadline: config.write_deadline(),
            queue_depth: config.viewer_queue_depth.max(1),
        }
    }

    pub fn register(&self, session_id: &str) -> ViewerRegistration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, frames) = mpsc::channel(self.queue_depth);
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(session_id.to_string())
            .or_default()
            .push(Viewer { id, tx });
        debug!(session_id, viewer = id, "viewer registered");
        ViewerRegistration { id, frames }
    }

    pub fn unregister(&self, session_id: &str, viewer: ViewerId) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let Some(viewers) = sessions.get_mut(session_id) else {
            return false;
        };
        let before = viewers.len();
        viewers.retain(|v| v.id != viewer);
        let removed = viewers.len() != before;
        if viewers.is_empty() {
            sessions.remove(session_id);
        }
        if removed {
            debug!(session_id, viewer, "viewer unregistered");
        }
        removed
    }

    pub fn viewer_count(&self, session_id: &str) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .map_or(0, Vec::len)
    }

    pub async fn broadcast(&self, session_id: &str, message: &WebSocketMessage) -> BroadcastReport {
        self.deliver(session_id, message, |_| true).await
    }

    /// Delivers to every viewer of the session except `origin`.
    pub async fn broadcast_except(
        &self,
        session_id: &str,
        origin: ViewerId,
        message: &WebSocketMessage,
    ) -> BroadcastReport {
        self.deliver(session_id, message, |id| id != origin).await
    }

    pub async fn send_to(
        &self,
        session_id: &str,
        viewer: ViewerId,
        message: &WebSocketMessage,
    ) -> bool {
        self.deliver(session_id, message, |id| id == viewer)
            .await
            .delivered
            == 1
    }

    /// Drops every viewer of the session after queueing a close frame.
    /// Returns how many viewers were attached.
    pub fn close_session(&self, session_id: &str, reason: &str) -> usize {
        let viewers = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id)
            .unwrap_or_default();
        for viewer in &viewers {
            // Dropping the sender ends the writer even when the queue is full.
            let _ = viewer.tx.try_send(ViewerFrame::Close(reason.to_string()));
        }
        viewers.len()
    }

    async fn deliver(
        &self,
        session_id: &str,
        message: &WebSocketMessage,
        include: impl Fn(ViewerId) -> bool,
    ) -> BroadcastReport {
        let targets: Vec<Viewer> = {
            let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
            match sessions.get(session_id) {
                Some(viewers) => viewers.iter().filter(|v| include(v.id)).cloned().collect(),
                None => return BroadcastReport::default(),
            }
        };
        if targets.is_empty() {
            return BroadcastReport::default();
        }
        let text: Arc<str> = match message.encode() {
            Ok(text) => Arc::from(text),
            Err(err) => {
                warn!(session_id, kind = message.kind(), "failed to encode message: {err}");
                return BroadcastReport {
                    delivered: 0,
                    failed: targets.len(),
                };
            }
        };

        let deadline = self.write_deadline;
        let results = join_all(targets.iter().map(|viewer| {
            let frame = ViewerFrame::Text(Arc::clone(&text));
            async move { (viewer.id, viewer.tx.send_timeout(frame, deadline).await) }
        }))
        .await;

        let mut report = BroadcastReport::default();
        for (viewer, result) in results {
            match result {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    report.failed += 1;
                    let cause = match err {
                        SendTimeoutError::Timeout(_) => "write deadline exceeded",
                        SendTimeoutError::Closed(_) => "socket closed",
                    };
                    warn!(session_id, viewer, kind = message.kind(), "viewer write failed: {cause}");
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use termgate_protocol::TerminalMode;

    fn hub() -> WebSocketHub {
        WebSocketHub::new(&WebSocketConfig {
            write_deadline_ms: 50,
            viewer_queue_depth: 4,
            ..WebSocketConfig::default()
        })
    }

    fn text_of(frame: ViewerFrame) -> WebSocketMessage {
        match frame {
            ViewerFrame::Text(text) => WebSocketMessage::decode(&text).expect("valid frame"),
            ViewerFrame::Close(reason) => panic!("unexpected close: {reason}"),
        }
    }

    #[tokio::test]
    async fn broadcast_survives_one_closed_viewer() {
        let hub = hub();
        let mut a = hub.register("s1");
        let closed = hub.register("s1");
        let mut c = hub.register("s1");
        drop(closed.frames);

        let report = hub.broadcast("s1", &WebSocketMessage::output("hello")).await;
        assert_eq!(report, BroadcastReport { delivered: 2, failed: 1 });
        assert_eq!(text_of(a.frames.recv().await.expect("a")), WebSocketMessage::output("hello"));
        assert_eq!(text_of(c.frames.recv().await.expect("c")), WebSocketMessage::output("hello"));
        // Failed viewers stay registered until explicitly removed.
        assert_eq!(hub.viewer_count("s1"), 3);
        assert!(hub.unregister("s1", closed.id));
        assert_eq!(hub.viewer_count("s1"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_times_out_without_blocking_others() {
        let hub = hub();
        let _stalled = hub.register("s1");
        let mut live = hub.register("s1");
        for _ in 0..4 {
            hub.broadcast("s1", &WebSocketMessage::output("x")).await;
            live.frames.recv().await.expect("drained");
        }
        let report = hub.broadcast("s1", &WebSocketMessage::output("y")).await;
        assert_eq!(report, BroadcastReport { delivered: 1, failed: 1 });
        assert_eq!(text_of(live.frames.recv().await.expect("live")), WebSocketMessage::output("y"));
    }

    #[tokio::test]
    async fn broadcast_except_and_send_to_target_viewers() {
        let hub = hub();
        let mut origin = hub.register("s1");
        let mut other = hub.register("s1");
        let msg = WebSocketMessage::ModeChanged(termgate_protocol::ModeChanged {
            mode: TerminalMode::Query,
            area_id: Some("area-1".to_string()),
        });

        let report = hub.broadcast_except("s1", origin.id, &msg).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(text_of(other.frames.recv().await.expect("other")), msg);
        assert!(origin.frames.try_recv().is_err());

        assert!(hub.send_to("s1", origin.id, &msg).await);
        assert_eq!(text_of(origin.frames.recv().await.expect("origin")), msg);
        assert!(!hub.send_to("s1", 9_999, &msg).await);
    }

    #[tokio::test]
    async fn close_session_ends_every_writer() {
        let hub = hub();
        let mut a = hub.register("s1");
        let mut b = hub.register("s1");
        let _unrelated = hub.register("s2");

        assert_eq!(hub.close_session("s1", "session terminated"), 2);
        for viewer in [&mut a, &mut b] {
            assert_eq!(
                viewer.frames.recv().await,
                Some(ViewerFrame::Close("session terminated".to_string()))
            );
            assert_eq!(viewer.frames.recv().await, None);
        }
        assert_eq!(hub.viewer_count("s1"), 0);
        assert_eq!(hub.viewer_count("s2"), 1);
        let report = hub.broadcast("s1", &WebSocketMessage::output("late")).await;
        assert_eq!(report, BroadcastReport::default());
    }

    #[test]
    fn shortcut_family_is_recognised() {
        assert!(is_shortcut_key("\x11"));
        assert!(is_shortcut_key("\x1b[113;5u"));
        assert!(is_shortcut_key("\x1b[27;5;113~"));
        assert!(!is_shortcut_key("q"));
        assert!(!is_shortcut_key("ls\x11"));
        assert!(!is_shortcut_key("\x1b[A"));
    }
}
