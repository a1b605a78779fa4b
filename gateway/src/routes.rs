use axum::Json;
use axum::extract::Path;
use axum::extract::Query;
use axum::extract::State;
use axum::http::StatusCode;
use serde::Serialize;
use termgate_core::resilience::BreakerSnapshot;
use termgate_protocol::CreateSessionRequest;
use termgate_protocol::ListSessionsQuery;
use termgate_protocol::SessionView;
use termgate_protocol::UpdateSessionRequest;
use tracing::info;

use crate::AppState;
use crate::context::RequestContext;
use crate::error::ApiError;

pub(crate) async fn create_session(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(request): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<SessionView>), ApiError> {
    let conn = state
        .manager
        .create_session(&ctx.caller, request, &ctx.client_ip)
        .await?;
    Ok((StatusCode::CREATED, Json(state.manager.view(&conn))))
}

/// Admins see every user's sessions; everyone else only their own.
pub(crate) async fn list_sessions(
    State(state): State<AppState>,
    ctx: RequestContext,
    Query(query): Query<ListSessionsQuery>,
) -> Json<Vec<SessionView>> {
    let owner = (!ctx.caller.is_admin).then_some(ctx.caller.user_id.as_str());
    let sessions = state
        .manager
        .list_sessions(owner, query.status, query.limit, query.offset)
        .iter()
        .map(|conn| state.manager.view(conn))
        .collect();
    Json(sessions)
}

pub(crate) async fn get_session(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(session_id): Path<String>,
) -> Result<Json<SessionView>, ApiError> {
    let conn = state.manager.get_for(&ctx.caller, &session_id)?;
    Ok(Json(state.manager.view(&conn)))
}

pub(crate) async fn terminate_session(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(session_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.manager.get_for(&ctx.caller, &session_id)?;
    state.manager.terminate_session(&session_id).await?;
    info!(session_id, user_id = ctx.caller.user_id, "session deleted");
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn update_session(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(session_id): Path<String>,
    Json(update): Json<UpdateSessionRequest>,
) -> Result<Json<SessionView>, ApiError> {
    state.manager.get_for(&ctx.caller, &session_id)?;
    let conn = state.manager.update_session(&session_id, update).await?;
    Ok(Json(state.manager.view(&conn)))
}

#[derive(Debug, Serialize)]
pub(crate) struct HealthReport {
    status: &'static str,
    sessions: usize,
    breakers: Vec<BreakerSnapshot>,
}

pub(crate) async fn health(State(state): State<AppState>) -> Json<HealthReport> {
    Json(HealthReport {
        status: "ok",
        sessions: state.manager.session_count(),
        breakers: state.breakers.snapshot(),
    })
}
