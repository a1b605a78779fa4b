use axum::Json;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use serde_json::json;
use termgate_core::SessionError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("missing or empty x-user-id header")]
    Unauthenticated,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ApiError::Session(err) => match err {
                SessionError::NotFound { .. } => StatusCode::NOT_FOUND,
                SessionError::Forbidden { .. } => StatusCode::FORBIDDEN,
                SessionError::InvalidParams { .. } => StatusCode::BAD_REQUEST,
                SessionError::Authentication { .. } => StatusCode::UNAUTHORIZED,
                SessionError::Connect { .. } | SessionError::Transport { .. } => {
                    StatusCode::BAD_GATEWAY
                }
                SessionError::AlreadyTerminated { .. } => StatusCode::CONFLICT,
                SessionError::ControlTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            },
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Unauthenticated => "unauthenticated",
            ApiError::Session(err) => err.code(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(code = self.code(), "request failed: {self}");
        }
        let body = json!({
            "error": self.code(),
            "message": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}
