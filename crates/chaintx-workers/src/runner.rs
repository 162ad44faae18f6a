//! Interval loops with cooperative shutdown.

use std::future::Future;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Resolve on SIGINT or, on unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Cancel `token` when the process is asked to stop.
pub fn cancel_on_shutdown(token: CancellationToken) {
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown signal received");
        token.cancel();
    });
}

/// Run `tick` immediately and then every `period` until `token` is
/// cancelled. A tick in progress is allowed to finish.
pub async fn run_every<F, Fut>(name: &str, period: Duration, token: CancellationToken, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tracing::info!(worker = name, period_ms = period.as_millis() as u64, "worker loop started");
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => tick().await,
        }
    }
    tracing::info!(worker = name, "worker loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn loop_ticks_until_cancelled() {
        let token = CancellationToken::new();
        let ticks = Arc::new(AtomicUsize::new(0));

        let handle = {
            let token = token.clone();
            let ticks = ticks.clone();
            tokio::spawn(async move {
                run_every("test", Duration::from_secs(10), token, || {
                    let ticks = ticks.clone();
                    async move {
                        ticks.fetch_add(1, Ordering::SeqCst);
                    }
                })
                .await;
            })
        };

        tokio::time::sleep(Duration::from_secs(25)).await;
        token.cancel();
        handle.await.unwrap();
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }
}
