//! `GET /sessions/{id}/stream`: one browser viewer of a terminal session.
//!
//! The socket is split. A writer task drains the viewer's hub queue and
//! pings on an interval; the reader decodes client frames and feeds them to
//! the session's input pump until the socket, the session or the server
//! goes away.

use std::sync::Arc;

use axum::extract::Path;
use axum::extract::State;
use axum::extract::WebSocketUpgrade;
use axum::extract::ws::CloseFrame;
use axum::extract::ws::Message;
use axum::extract::ws::WebSocket;
use axum::extract::ws::close_code;
use axum::response::Response;
use bytes::Bytes;
use futures::SinkExt;
use futures::StreamExt;
use termgate_core::Caller;
use termgate_core::SessionError;
use termgate_core::hub::ViewerFrame;
use termgate_core::session::InputEvent;
use termgate_protocol::DecodeError;
use termgate_protocol::WebSocketMessage;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::AppState;
use crate::context::RequestContext;
use crate::error::ApiError;

pub(crate) async fn stream(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(session_id): Path<String>,
    upgrade: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let conn = state.manager.get_for(&ctx.caller, &session_id)?;
    if conn.status().is_terminal() {
        return Err(SessionError::terminated(&session_id).into());
    }
    Ok(upgrade.on_upgrade(move |socket| serve_viewer(socket, state, ctx.caller, session_id)))
}

/// Outcome of decoding one text frame from a viewer.
#[derive(Debug, PartialEq)]
pub(crate) enum ClientFrame {
    Forward(WebSocketMessage),
    ServerOnly(&'static str),
}

pub(crate) fn decode_client_frame(text: &str) -> Result<ClientFrame, DecodeError> {
    let message = WebSocketMessage::decode(text)?;
    if message.is_client_message() {
        Ok(ClientFrame::Forward(message))
    } else {
        Ok(ClientFrame::ServerOnly(message.kind()))
    }
}

async fn serve_viewer(socket: WebSocket, state: AppState, caller: Caller, session_id: String) {
    let (mut sink, mut stream) = socket.split();
    let attachment = match state.manager.attach_viewer(caller, &session_id).await {
        Ok(attachment) => attachment,
        Err(err) => {
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::POLICY,
                    reason: err.to_string().into(),
                })))
                .await;
            return;
        }
    };
    let viewer = attachment.viewer;
    let caller = attachment.caller;
    let input = attachment.input;
    let done = attachment.connection.done().clone();
    let mut frames = attachment.frames;
    info!(session_id, viewer, user_id = caller.user_id, "viewer connected");

    let ping_interval = state.websocket.ping_interval();
    let mut writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ping.tick().await;
        loop {
            tokio::select! {
                frame = frames.recv() => match frame {
                    Some(ViewerFrame::Text(text)) => {
                        if sink.send(Message::Text(text.as_ref().into())).await.is_err() {
                            break;
                        }
                    }
                    Some(ViewerFrame::Close(reason)) => {
                        let _ = sink
                            .send(Message::Close(Some(CloseFrame {
                                code: close_code::NORMAL,
                                reason: reason.into(),
                            })))
                            .await;
                        break;
                    }
                    None => break,
                },
                _ = ping.tick() => {
                    if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = sink.close().await;
    });

    let read_deadline = state.websocket.read_deadline();
    loop {
        let next = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            _ = done.cancelled() => break,
            next = tokio::time::timeout(read_deadline, stream.next()) => next,
        };
        let text = match next {
            Err(_) => {
                warn!(session_id, viewer, ?read_deadline, "viewer read deadline exceeded");
                break;
            }
            Ok(None) | Ok(Some(Ok(Message::Close(_)))) => break,
            Ok(Some(Err(err))) => {
                debug!(session_id, viewer, "viewer socket error: {err}");
                break;
            }
            Ok(Some(Ok(Message::Text(text)))) => text,
            Ok(Some(Ok(_))) => continue,
        };
        match decode_client_frame(text.as_str()) {
            Ok(ClientFrame::Forward(message)) => {
                let event = InputEvent {
                    viewer,
                    caller: Arc::clone(&caller),
                    message,
                };
                if input.send(event).await.is_err() {
                    break;
                }
            }
            Ok(ClientFrame::ServerOnly(kind)) => {
                debug!(session_id, viewer, kind, "ignoring server-only message from viewer");
            }
            Err(err) => warn!(session_id, viewer, "rejected viewer frame: {err}"),
        }
    }

    state.manager.detach_viewer(&session_id, viewer);
    // Detaching drops the hub's sender, which ends the writer.
    if tokio::time::timeout(state.websocket.write_deadline(), &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }
    info!(session_id, viewer, "viewer disconnected");
}
