use chaintx::alerts::AlertState;
use chaintx::ports::AlertSink;
use chaintx::WebhookAlert;

/// Emits alerts as structured log events: `warn` while a signal is breached,
/// `info` when it resolves.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn emit(&self, alert: &WebhookAlert) {
        let triggered_at = alert.triggered_at.to_rfc3339();
        match alert.state {
            AlertState::Resolved => tracing::info!(
                state = alert.state.as_str(),
                signal = alert.signal.as_str(),
                current = alert.current,
                threshold = alert.threshold,
                %triggered_at,
                cooldown_seconds = alert.cooldown.as_secs(),
                "webhook outbox alert resolved"
            ),
            AlertState::Triggered | AlertState::Ongoing => tracing::warn!(
                state = alert.state.as_str(),
                signal = alert.signal.as_str(),
                current = alert.current,
                threshold = alert.threshold,
                %triggered_at,
                cooldown_seconds = alert.cooldown.as_secs(),
                "webhook outbox alert"
            ),
        }
    }
}
