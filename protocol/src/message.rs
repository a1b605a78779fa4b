use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::collab::Source;
use crate::session::SessionStatus;
use crate::session::TerminalMode;

/// One WebSocket frame. The `data` shape is fixed by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum WebSocketMessage {
    TerminalInput(TerminalInput),
    TerminalOutput(TerminalOutput),
    Resize(Resize),
    SessionStatus(SessionStatusUpdate),
    ModeChangeRequest(ModeChangeRequest),
    ModeChanged(ModeChanged),
    SuggestionAvailable(Suggestion),
    ExecuteSuggestion(ExecuteSuggestion),
    SessionControl(SessionControl),
    RagResponse(RagResponse),
}

const KNOWN_TYPES: &[&str] = &[
    "terminal_input",
    "terminal_output",
    "resize",
    "session_status",
    "mode_change_request",
    "mode_changed",
    "suggestion_available",
    "execute_suggestion",
    "session_control",
    "rag_response",
];

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame is not a JSON object with a string `type`")]
    MissingType,
    #[error("unknown message type `{0}`")]
    UnknownType(String),
    #[error("malformed `{kind}` payload: {source}")]
    Malformed {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl WebSocketMessage {
    /// Parses a text frame, rejecting unknown types instead of guessing.
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let raw: serde_json::Value = serde_json::from_str(text)?;
        let kind = raw
            .get("type")
            .and_then(serde_json::Value::as_str)
            .ok_or(DecodeError::MissingType)?
            .to_string();
        if !KNOWN_TYPES.contains(&kind.as_str()) {
            return Err(DecodeError::UnknownType(kind));
        }
        serde_json::from_value(raw).map_err(|source| DecodeError::Malformed { kind, source })
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WebSocketMessage::TerminalInput(_) => "terminal_input",
            WebSocketMessage::TerminalOutput(_) => "terminal_output",
            WebSocketMessage::Resize(_) => "resize",
            WebSocketMessage::SessionStatus(_) => "session_status",
            WebSocketMessage::ModeChangeRequest(_) => "mode_change_request",
            WebSocketMessage::ModeChanged(_) => "mode_changed",
            WebSocketMessage::SuggestionAvailable(_) => "suggestion_available",
            WebSocketMessage::ExecuteSuggestion(_) => "execute_suggestion",
            WebSocketMessage::SessionControl(_) => "session_control",
            WebSocketMessage::RagResponse(_) => "rag_response",
        }
    }

    /// Messages a browser is allowed to send to the gateway.
    pub fn is_client_message(&self) -> bool {
        matches!(
            self,
            WebSocketMessage::TerminalInput(_)
                | WebSocketMessage::Resize(_)
                | WebSocketMessage::ModeChangeRequest(_)
                | WebSocketMessage::ExecuteSuggestion(_)
                | WebSocketMessage::SessionControl(_)
        )
    }

    pub fn output(data: impl Into<String>) -> Self {
        WebSocketMessage::TerminalOutput(TerminalOutput { data: data.into() })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalInput {
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalOutput {
    pub data: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resize {
    pub cols: u32,
    pub rows: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatusUpdate {
    pub session_id: String,
    pub status: SessionStatus,
    #[serde(default)]
    pub paused: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Sent by the gateway to ask the viewer to pick a knowledge area, and by the
/// viewer to switch modes. An empty request from a viewer means "toggle".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeChangeRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<TerminalMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeChanged {
    pub mode: TerminalMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suggestion {
    pub suggestion_id: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteSuggestion {
    pub suggestion_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Pause,
    Resume,
    Terminate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionControl {
    pub action: ControlAction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RagResponse {
    pub query: String,
    pub answer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area_id: Option<String>,
    #[serde(default)]
    pub sources: Vec<Source>,
}
