use thiserror::Error;

use super::transport::TransportError;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("unknown session id {session_id}")]
    NotFound { session_id: String },
    #[error("session {session_id} belongs to another user")]
    Forbidden { session_id: String },
    #[error("invalid session parameters: {reason}")]
    InvalidParams { reason: String },
    #[error("ssh authentication failed: {source}")]
    Authentication {
        #[source]
        source: TransportError,
    },
    #[error("failed to connect session {session_id}: {source}")]
    Connect {
        session_id: String,
        #[source]
        source: TransportError,
    },
    #[error("session {session_id} transport error: {source}")]
    Transport {
        session_id: String,
        #[source]
        source: TransportError,
    },
    #[error("session {session_id} has already terminated")]
    AlreadyTerminated { session_id: String },
    #[error("session {session_id} did not acknowledge {action} in time")]
    ControlTimeout {
        session_id: String,
        action: &'static str,
    },
}

impl SessionError {
    pub(crate) fn not_found(session_id: &str) -> Self {
        Self::NotFound {
            session_id: session_id.to_string(),
        }
    }

    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidParams {
            reason: reason.into(),
        }
    }

    pub(crate) fn transport(session_id: &str, source: TransportError) -> Self {
        Self::Transport {
            session_id: session_id.to_string(),
            source,
        }
    }

    pub fn terminated(session_id: &str) -> Self {
        Self::AlreadyTerminated {
            session_id: session_id.to_string(),
        }
    }

    /// Machine-readable code used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::NotFound { .. } => "not_found",
            SessionError::Forbidden { .. } => "forbidden",
            SessionError::InvalidParams { .. } => "invalid_params",
            SessionError::Authentication { .. } => "authentication_failed",
            SessionError::Connect { .. } => "connect_failed",
            SessionError::Transport { .. } => "transport_error",
            SessionError::AlreadyTerminated { .. } => "terminated",
            SessionError::ControlTimeout { .. } => "control_timeout",
        }
    }
}
