use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

/// Cancels `token` on SIGINT or SIGTERM. Returns early if something else
/// cancels it first.
pub async fn wait_for_signal(token: CancellationToken) {
    let interrupt = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::SignalKind;
        use tokio::signal::unix::signal;
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!("failed to listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => info!("interrupt received; shutting down"),
        _ = terminate => info!("terminate received; shutting down"),
        _ = token.cancelled() => return,
    }
    token.cancel();
}
