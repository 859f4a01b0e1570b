use tokio_util::sync::CancellationToken;

/// Wait for Ctrl-C (SIGINT) or SIGTERM, then cancel the processor.
///
/// If the handlers cannot be installed the error is logged and the token is
/// left alone; the processor still stops at end of stream or on failure.
pub async fn wait_for_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                rill_error!(sys, error = %e, "failed to listen for SIGTERM");
                return;
            }
        };
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    rill_error!(sys, error = %e, "failed to listen for Ctrl-C");
                    return;
                }
                rill_info!(sys, signal = "SIGINT", "received signal, stopping processor");
            }
            _ = sigterm.recv() => {
                rill_info!(sys, signal = "SIGTERM", "received signal, stopping processor");
            }
            _ = cancel.cancelled() => return,
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    rill_error!(sys, error = %e, "failed to listen for Ctrl-C");
                    return;
                }
                rill_info!(sys, "received shutdown signal, stopping processor");
            }
            _ = cancel.cancelled() => return,
        }
    }
    cancel.cancel();
}
