use tokio_util::sync::CancellationToken;

/// Install a shutdown handler for SIGINT (and SIGTERM on unix).
///
/// Returns a `CancellationToken` that is cancelled when a signal arrives.
/// Every loop watches this token and exits cleanly.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(signal) => tracing::info!(signal, "Received signal, initiating graceful shutdown"),
            Err(e) => tracing::error!(error = %e, "Signal handler failed, shutting down"),
        }
        trigger.cancel();
    });

    token
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigterm.recv() => Ok("SIGTERM"),
        res = tokio::signal::ctrl_c() => res.map(|_| "SIGINT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await.map(|_| "SIGINT")
}
