//! Composition shared by the worker binaries.

use std::sync::Arc;

use chaintx::{Clock, Config, SystemClock};
use chaintx_postgres::PgStore;
use tokio_util::sync::CancellationToken;

use crate::runner::cancel_on_shutdown;
use crate::telemetry::init_tracing;

pub struct WorkerRuntime {
    pub config: Config,
    pub store: Arc<PgStore>,
    pub clock: Arc<dyn Clock>,
    /// Cancelled on SIGINT/SIGTERM.
    pub shutdown: CancellationToken,
}

/// Load `.env` and configuration, then connect and run startup. Any failure
/// is logged and ends the process with status 1.
pub async fn start(worker: &str) -> WorkerRuntime {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(worker, "invalid configuration: {e}");
            std::process::exit(1);
        }
    };
    tracing::debug!(worker, ?config, "configuration loaded");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = match PgStore::bootstrap(&config, clock.as_ref()).await {
        Ok((store, report)) => {
            tracing::info!(
                worker,
                catalog_rows = report.catalog_rows,
                wallet_targets = report.wallet_sync.len(),
                "startup complete"
            );
            store
        }
        Err(e) => {
            tracing::error!(
                worker,
                code = %e.code,
                metadata = %serde_json::Value::Object(e.metadata.clone()),
                "startup failed: {}",
                e.message
            );
            std::process::exit(1);
        }
    };

    let shutdown = CancellationToken::new();
    cancel_on_shutdown(shutdown.clone());
    WorkerRuntime {
        config,
        store: Arc::new(store),
        clock,
        shutdown,
    }
}
