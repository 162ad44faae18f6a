//! One tick of each background worker. Errors are logged with their code and
//! metadata; the loop carries on at the next tick.

use std::sync::Arc;
use std::time::Duration;

use chaintx::config::{AlertConfig, ReconcilerConfig, WebhookConfig};
use chaintx::ports::{AlertSink, WebhookOutboxReadModel};
use chaintx::{
    AlertMonitor, AppError, Clock, DispatchWebhookEventsCommand, DispatchWebhookEventsOutput,
    Dispatcher, ReconcilePaymentRequestsCommand, ReconcilePaymentRequestsOutput, Reconciler,
};
use tokio::sync::Mutex;

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

fn log_failure(worker: &str, e: &AppError) {
    tracing::error!(
        worker,
        code = %e.code,
        kind = e.kind.as_str(),
        metadata = %serde_json::Value::Object(e.metadata.clone()),
        "{}",
        e.message
    );
}

pub struct ReconcileJob {
    reconciler: Reconciler,
    clock: Arc<dyn Clock>,
    batch_size: i64,
    worker_id: String,
    lease_duration: Duration,
}

impl ReconcileJob {
    pub fn new(reconciler: Reconciler, clock: Arc<dyn Clock>, config: &ReconcilerConfig) -> Self {
        Self {
            reconciler,
            clock,
            batch_size: config.batch_size,
            worker_id: config.worker_id.clone(),
            lease_duration: config.lease_duration,
        }
    }

    pub async fn tick(&self) -> Option<ReconcilePaymentRequestsOutput> {
        let command = ReconcilePaymentRequestsCommand {
            now: self.clock.now_utc(),
            batch_size: self.batch_size,
            worker_id: self.worker_id.clone(),
            lease_duration: chrono_duration(self.lease_duration),
        };
        match self.reconciler.run_cycle(&command).await {
            Ok(out) => {
                if out.claimed > 0 {
                    tracing::info!(
                        claimed = out.claimed,
                        confirmed = out.confirmed,
                        detected = out.detected,
                        expired = out.expired,
                        skipped = out.skipped,
                        errors = out.errors,
                        "reconcile cycle finished"
                    );
                }
                Some(out)
            }
            Err(e) => {
                log_failure("reconciler", &e);
                None
            }
        }
    }
}

pub struct DispatchJob {
    dispatcher: Dispatcher,
    clock: Arc<dyn Clock>,
    template: DispatchWebhookEventsCommand,
}

impl DispatchJob {
    pub fn new(dispatcher: Dispatcher, clock: Arc<dyn Clock>, config: &WebhookConfig) -> Self {
        let template = DispatchWebhookEventsCommand {
            now: clock.now_utc(),
            batch_size: config.batch_size,
            worker_id: config.worker_id.clone(),
            lease_duration: chrono_duration(config.lease_duration),
            initial_backoff: chrono_duration(config.initial_backoff),
            max_backoff: chrono_duration(config.max_backoff),
            retry_jitter_bps: config.retry_jitter_bps,
            retry_budget: config.retry_budget,
        };
        Self {
            dispatcher,
            clock,
            template,
        }
    }

    pub async fn tick(&self) -> Option<DispatchWebhookEventsOutput> {
        let command = DispatchWebhookEventsCommand {
            now: self.clock.now_utc(),
            ..self.template.clone()
        };
        match self.dispatcher.run_cycle(&command).await {
            Ok(out) => {
                if out.claimed > 0 {
                    tracing::info!(
                        claimed = out.claimed,
                        sent = out.sent,
                        retried = out.retried,
                        failed = out.failed,
                        skipped = out.skipped,
                        errors = out.errors,
                        latency_ms = out.latency_ms,
                        "dispatch cycle finished"
                    );
                }
                Some(out)
            }
            Err(e) => {
                log_failure("webhook-dispatcher", &e);
                None
            }
        }
    }
}

pub struct AlertJob {
    monitor: Mutex<AlertMonitor>,
    read_model: Arc<dyn WebhookOutboxReadModel>,
    sink: Arc<dyn AlertSink>,
    clock: Arc<dyn Clock>,
}

impl AlertJob {
    pub fn new(
        config: &AlertConfig,
        read_model: Arc<dyn WebhookOutboxReadModel>,
        sink: Arc<dyn AlertSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            monitor: Mutex::new(AlertMonitor::from_config(config)),
            read_model,
            sink,
            clock,
        }
    }

    /// Number of alerts emitted this tick.
    pub async fn tick(&self) -> usize {
        let now = self.clock.now_utc();
        let overview = match self.read_model.get_overview(now).await {
            Ok(overview) => overview,
            Err(e) => {
                log_failure("webhook-alerts", &e);
                return 0;
            }
        };
        let alerts = self.monitor.lock().await.evaluate(now, &overview);
        for alert in &alerts {
            self.sink.emit(alert);
        }
        alerts.len()
    }
}
