use std::path::PathBuf;
use std::sync::Arc;

use chaintx::bootstrap::build_allocator;
use chaintx::ports::{
    AssetCatalogReadModel, PaymentRequestReadModel, PaymentRequestRepository,
    WebhookOutboxReadModel, WebhookOutboxRepository,
};
use chaintx::{Clock, Config, PaymentRequestService, WebhookOutboxOps};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub payment_requests: PaymentRequestService,
    pub outbox_ops: WebhookOutboxOps,
    /// Bearer keys for the webhook-outbox routes; empty leaves them open.
    pub ops_admin_keys: Arc<Vec<String>>,
    pub metrics_token: Option<Arc<str>>,
    pub openapi_spec_path: PathBuf,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("ops_admin_keys", &format!("[{} REDACTED]", self.ops_admin_keys.len()))
            .field("metrics_token", &self.metrics_token.as_ref().map(|_| "[REDACTED]"))
            .field("openapi_spec_path", &self.openapi_spec_path)
            .finish_non_exhaustive()
    }
}

impl AppState {
    /// Wire the use cases over one store that implements every port the
    /// HTTP surface needs.
    pub fn new<S>(config: &Config, store: Arc<S>, clock: Arc<dyn Clock>) -> Self
    where
        S: AssetCatalogReadModel
            + PaymentRequestRepository
            + PaymentRequestReadModel
            + WebhookOutboxRepository
            + WebhookOutboxReadModel
            + 'static,
    {
        let payment_requests = PaymentRequestService::new(
            store.clone(),
            store.clone(),
            store.clone(),
            Arc::new(build_allocator(config)),
            clock.clone(),
            config.webhook.url_allowlist.clone(),
        );
        let outbox_ops = WebhookOutboxOps::new(store.clone(), store, clock);
        Self {
            payment_requests,
            outbox_ops,
            ops_admin_keys: Arc::new(config.webhook.ops_admin_keys.clone()),
            metrics_token: config.metrics_token.as_deref().map(Arc::from),
            openapi_spec_path: PathBuf::from(&config.openapi_spec_path),
        }
    }
}
