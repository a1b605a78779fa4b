//! HTTP and WebSocket surface of the terminal gateway.

mod context;
mod error;
mod routes;
pub mod shutdown;
mod ws;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::get;
use termgate_core::GatewayConfig;
use termgate_core::MemorySafeguard;
use termgate_core::SessionManager;
use termgate_core::WebSocketHub;
use termgate_core::config::WebSocketConfig;
use termgate_core::resilience::CircuitBreakerRegistry;
use termgate_core::resilience::ClientError;
use termgate_core::resilience::ResilienceServices;
use termgate_core::services::Collaborators;
use termgate_core::session::ManagerSettings;
use termgate_core::session::SshConnector;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use context::RequestContext;
pub use error::ApiError;

#[derive(Clone)]
pub struct AppState {
    pub manager: SessionManager,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub websocket: WebSocketConfig,
    pub shutdown: CancellationToken,
}

/// Wires the session manager and its collaborators from `config`.
pub fn build_state(
    config: &GatewayConfig,
    connector: Arc<dyn SshConnector>,
) -> Result<AppState, ClientError> {
    let resilience = ResilienceServices::new(&config.breaker, &config.retry);
    let collaborators = Collaborators::new(&resilience, &config.services)?;
    let manager = SessionManager::new(
        ManagerSettings::from(config),
        connector,
        Arc::new(WebSocketHub::new(&config.websocket)),
        MemorySafeguard::new(config.memory.clone()),
        &collaborators,
    );
    Ok(AppState {
        manager,
        breakers: Arc::clone(&resilience.breakers),
        websocket: config.websocket.clone(),
        shutdown: CancellationToken::new(),
    })
}

/// Starts the memory monitor and the breaker transition logger. Both stop
/// when the state's shutdown token fires.
pub fn start_background(state: &AppState) {
    state.manager.memory().spawn(state.shutdown.child_token());
    state.breakers.spawn_monitor(state.shutdown.child_token());
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/sessions",
            get(routes::list_sessions).post(routes::create_session),
        )
        .route(
            "/sessions/{id}",
            get(routes::get_session)
                .patch(routes::update_session)
                .delete(routes::terminate_session),
        )
        .route("/sessions/{id}/stream", get(ws::stream))
        .route("/healthz", get(routes::health))
        .with_state(state)
}

/// Serves until the shutdown token fires, then tears down every session,
/// giving in-flight tasks up to `grace` to finish.
pub async fn serve(state: AppState, listener: TcpListener, grace: Duration) -> std::io::Result<()> {
    let shutdown = state.shutdown.clone();
    let manager = state.manager.clone();
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "gateway listening");
    }
    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    manager.shutdown_all(grace).await;
    info!("gateway stopped");
    Ok(())
}
