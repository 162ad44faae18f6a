use std::sync::Arc;

use chaintx::Reconciler;
use chaintx_workers::webhook::DEFAULT_TIMEOUT;
use chaintx_workers::{http_client, run_every, start, ObserverRouter, ReconcileJob};

#[tokio::main]
async fn main() {
    let rt = start("reconciler").await;
    let settings = &rt.config.reconciler;
    if !settings.enabled {
        tracing::warn!("PAYMENT_REQUEST_RECONCILER_ENABLED is false, nothing to do");
        return;
    }

    let client = match http_client(DEFAULT_TIMEOUT) {
        Ok(client) => client,
        Err(e) => {
            tracing::error!(code = %e.code, "{}", e.message);
            std::process::exit(1);
        }
    };
    let router = ObserverRouter::from_config(client, settings);
    let reconciler = Reconciler::new(rt.store.clone(), Arc::new(router));
    let job = Arc::new(ReconcileJob::new(reconciler, rt.clock.clone(), settings));

    tracing::info!(
        worker_id = %settings.worker_id,
        batch_size = settings.batch_size,
        btc_esplora = settings.btc_esplora_base_url.is_some(),
        evm_networks = settings.evm_rpc_urls.len(),
        "reconciler running"
    );
    run_every("reconciler", settings.poll_interval, rt.shutdown.clone(), || {
        let job = job.clone();
        async move {
            job.tick().await;
        }
    })
    .await;
    rt.store.close().await;
}
