use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Cancel `token` on SIGINT or SIGTERM.
///
/// If a handler cannot be installed the failure is logged and the token is
/// left for explicit cancellation. The returned task ends once the token is
/// cancelled, whoever cancels it.
pub fn install_shutdown_handler(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            res = tokio::signal::ctrl_c() => match res {
                Ok(()) => tracing::info!("received SIGINT, cancelling outstanding jobs"),
                Err(e) => {
                    tracing::warn!(error = %e, "cannot listen for SIGINT");
                    std::future::pending::<()>().await;
                }
            },
            _ = terminate() => tracing::info!("received SIGTERM, cancelling outstanding jobs"),
            _ = token.cancelled() => return,
        }
        token.cancel();
    })
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::warn!(error = %e, "cannot listen for SIGTERM");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn handler_stops_when_token_is_cancelled_elsewhere() {
        let token = CancellationToken::new();
        let handle = install_shutdown_handler(token.clone());
        tokio::task::yield_now().await;
        assert!(!handle.is_finished());

        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("signal task still running")
            .unwrap();
    }
}
