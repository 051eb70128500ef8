use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

/// Resolves on SIGINT or SIGTERM.
pub async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            error!("failed to install SIGTERM handler, only SIGINT will stop the consumer: {e}");
            if let Err(e) = ctrl_c.await {
                error!("failed to listen for SIGINT: {e}");
            }
            return;
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
}
