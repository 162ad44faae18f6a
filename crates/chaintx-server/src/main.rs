use std::sync::Arc;

use actix_web::{middleware::Logger, web, App, HttpServer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chaintx::{Clock, Config, SystemClock};
use chaintx_postgres::PgStore;
use chaintx_server::{routes, AppState};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("invalid configuration: {e}");
            std::process::exit(1);
        }
    };
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let store = match PgStore::bootstrap(&config, clock.as_ref()).await {
        Ok((store, report)) => {
            tracing::info!(
                catalog_rows = report.catalog_rows,
                wallet_sync = report.wallet_sync.len(),
                "startup checks passed"
            );
            Arc::new(store)
        }
        Err(e) => {
            tracing::error!(
                code = %e.code,
                metadata = %serde_json::Value::Object(e.metadata.clone()),
                "startup failed: {}",
                e.message
            );
            std::process::exit(1);
        }
    };

    if config.metrics_token.is_none() {
        tracing::warn!("METRICS_TOKEN not set, /metrics is publicly accessible");
    }
    if config.webhook.ops_admin_keys.is_empty() {
        tracing::warn!("PAYMENT_REQUEST_WEBHOOK_OPS_ADMIN_KEYS_JSON not set, webhook-outbox routes are open");
    }

    let port = config.port;
    let state = web::Data::new(AppState::new(&config, store.clone(), clock));

    tracing::info!("chaintx server listening on port {port}");
    tracing::info!(
        allocation_mode = config.allocation_mode.as_str(),
        webhook_enabled = config.webhook.enabled,
        "serving payment requests"
    );

    let result = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .app_data(web::PayloadConfig::new(64 * 1024))
            .wrap(Logger::default())
            .configure(routes::configure)
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await;

    store.close().await;
    result
}
