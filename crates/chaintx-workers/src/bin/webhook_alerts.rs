use std::sync::Arc;

use chaintx_workers::{run_every, start, AlertJob, TracingAlertSink};

#[tokio::main]
async fn main() {
    let rt = start("webhook-alerts").await;
    let settings = &rt.config.alert;
    if !settings.enabled {
        tracing::warn!("PAYMENT_REQUEST_WEBHOOK_ALERT_ENABLED is false, nothing to do");
        return;
    }

    let job = Arc::new(AlertJob::new(
        settings,
        rt.store.clone(),
        Arc::new(TracingAlertSink),
        rt.clock.clone(),
    ));
    tracing::info!(
        failed_count_threshold = settings.failed_count_threshold,
        pending_ready_threshold = settings.pending_ready_threshold,
        oldest_pending_age_seconds = settings.oldest_pending_age_seconds,
        cooldown_seconds = settings.cooldown.as_secs(),
        "webhook alert monitor running"
    );
    run_every("webhook-alerts", settings.poll_interval, rt.shutdown.clone(), || {
        let job = job.clone();
        async move {
            job.tick().await;
        }
    })
    .await;
    rt.store.close().await;
}
