use std::sync::Arc;

use chaintx::Dispatcher;
use chaintx_workers::{http_client, run_every, start, DispatchJob, HttpWebhookGateway};

#[tokio::main]
async fn main() {
    let rt = start("webhook-dispatcher").await;
    let settings = &rt.config.webhook;
    if !settings.enabled {
        tracing::warn!("PAYMENT_REQUEST_WEBHOOK_ENABLED is false, nothing to do");
        return;
    }

    let client = match http_client(settings.timeout) {
        Ok(client) => client,
        Err(e) => {
            tracing::error!(code = %e.code, "{}", e.message);
            std::process::exit(1);
        }
    };
    let gateway = HttpWebhookGateway::new(client, &settings.hmac_secret, rt.clock.clone());
    let dispatcher = Dispatcher::new(rt.store.clone(), Arc::new(gateway), rt.clock.clone());
    let job = Arc::new(DispatchJob::new(dispatcher, rt.clock.clone(), settings));

    tracing::info!(
        worker_id = %settings.worker_id,
        batch_size = settings.batch_size,
        max_attempts = settings.max_attempts,
        "webhook dispatcher running"
    );
    run_every("webhook-dispatcher", settings.poll_interval, rt.shutdown.clone(), || {
        let job = job.clone();
        async move {
            job.tick().await;
        }
    })
    .await;
    rt.store.close().await;
}
