//! Webhook outbox dispatch: claim, deliver, then mark delivered, retry or
//! dead-letter. Leases are renewed while a delivery is in flight.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::MissedTickBehavior;

use crate::clock::Clock;
use crate::domain::{
    DispatchWebhookEventsCommand, DispatchWebhookEventsOutput, PendingWebhookOutboxEvent,
    SendWebhookEventInput,
};
use crate::error::{AppError, AppResult};
use crate::outbox::{
    effective_max_attempts, retry_backoff_with_jitter, send_error_message, status_error_message,
};
use crate::ports::{WebhookEventGateway, WebhookOutboxRepository};

const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(100);

pub struct Dispatcher {
    repository: Arc<dyn WebhookOutboxRepository>,
    gateway: Arc<dyn WebhookEventGateway>,
    clock: Arc<dyn Clock>,
}

fn invalid(code: &str, message: &str) -> AppError {
    AppError::validation(code, message)
}

fn validate(command: &DispatchWebhookEventsCommand) -> AppResult<()> {
    let zero = chrono::Duration::zero();
    if command.batch_size <= 0 {
        return Err(invalid(
            "dispatch_webhook_batch_size_invalid",
            "dispatch webhook batch size must be greater than zero",
        )
        .with("batch_size", command.batch_size));
    }
    if command.worker_id.trim().is_empty() {
        return Err(invalid(
            "dispatch_webhook_worker_id_invalid",
            "dispatch webhook worker id is required",
        ));
    }
    if command.lease_duration <= zero {
        return Err(invalid(
            "dispatch_webhook_lease_duration_invalid",
            "dispatch webhook lease duration must be greater than zero",
        ));
    }
    if command.initial_backoff <= zero {
        return Err(invalid(
            "dispatch_webhook_initial_backoff_invalid",
            "dispatch webhook initial backoff must be greater than zero",
        ));
    }
    if command.max_backoff < command.initial_backoff {
        return Err(invalid(
            "dispatch_webhook_max_backoff_invalid",
            "dispatch webhook max backoff must be greater than or equal to initial backoff",
        ));
    }
    if !(0..=10_000).contains(&command.retry_jitter_bps) {
        return Err(invalid(
            "dispatch_webhook_retry_jitter_bps_invalid",
            "dispatch webhook retry jitter bps must be between 0 and 10000",
        )
        .with("retry_jitter_bps", command.retry_jitter_bps));
    }
    if command.retry_budget < 0 {
        return Err(invalid(
            "dispatch_webhook_retry_budget_invalid",
            "dispatch webhook retry budget must be greater than or equal to zero",
        )
        .with("retry_budget", command.retry_budget));
    }
    Ok(())
}

/// A third of the lease, at least 100ms, always shorter than the lease.
pub fn heartbeat_interval(lease: Duration) -> AppResult<Duration> {
    let mut interval = lease / 3;
    if interval.is_zero() {
        interval = MIN_HEARTBEAT_INTERVAL;
    }
    if interval >= lease {
        interval = lease / 2;
    }
    if interval.is_zero() || interval >= lease {
        return Err(invalid(
            "dispatch_webhook_lease_heartbeat_interval_invalid",
            "dispatch webhook lease duration is too small for heartbeat interval",
        )
        .with("lease_ms", lease.as_millis() as u64));
    }
    Ok(interval)
}

fn to_std(d: chrono::Duration) -> Duration {
    d.to_std().unwrap_or_default()
}

impl Dispatcher {
    pub fn new(
        repository: Arc<dyn WebhookOutboxRepository>,
        gateway: Arc<dyn WebhookEventGateway>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repository,
            gateway,
            clock,
        }
    }

    pub async fn run_cycle(
        &self,
        command: &DispatchWebhookEventsCommand,
    ) -> AppResult<DispatchWebhookEventsOutput> {
        validate(command)?;
        let lease = to_std(command.lease_duration);
        let interval = heartbeat_interval(lease)?;
        let started = Instant::now();
        let now = command.now;
        let worker_id = command.worker_id.trim();

        let rows = self
            .repository
            .claim_pending_for_dispatch(
                now,
                command.batch_size,
                worker_id,
                now + command.lease_duration,
            )
            .await?;
        let mut output = DispatchWebhookEventsOutput {
            claimed: rows.len(),
            ..Default::default()
        };

        for row in &rows {
            if row.destination_url.trim().is_empty() {
                output.errors += 1;
                output.skipped += 1;
                tracing::warn!(event_id = %row.event_id, "webhook outbox row has no destination");
                continue;
            }
            let heartbeat_err = self
                .deliver(row, worker_id, command, lease, interval, &mut output)
                .await?;
            if let Some(e) = heartbeat_err {
                output.latency_ms = started.elapsed().as_millis() as i64;
                tracing::warn!(
                    event_id = %row.event_id,
                    code = %e.code,
                    sent = output.sent,
                    retried = output.retried,
                    failed = output.failed,
                    "webhook dispatch aborted"
                );
                return Err(e);
            }
        }
        output.latency_ms = started.elapsed().as_millis() as i64;
        Ok(output)
    }

    /// Deliver one row and record the outcome. Returns the heartbeat error,
    /// if any, after the outcome has been written.
    async fn deliver(
        &self,
        row: &PendingWebhookOutboxEvent,
        worker_id: &str,
        command: &DispatchWebhookEventsCommand,
        lease: Duration,
        interval: Duration,
        output: &mut DispatchWebhookEventsOutput,
    ) -> AppResult<Option<AppError>> {
        let now = command.now;
        let input = SendWebhookEventInput {
            event_id: row.event_id.clone(),
            event_type: row.event_type.clone(),
            delivery_attempt: (row.attempts + 1).max(1),
            destination_url: row.destination_url.trim().to_string(),
            payload: row.payload.clone(),
        };

        let send = self.gateway.send(&input);
        let heartbeat = self.heartbeat(row, worker_id, lease, interval);
        tokio::pin!(send);
        tokio::pin!(heartbeat);
        let (sent, heartbeat_err) = tokio::select! {
            result = &mut send => (result, None),
            err = &mut heartbeat => (send.await, Some(err)),
        };

        let delivered = matches!(&sent, Ok(out) if out.is_success());
        if delivered {
            if self.repository.mark_delivered(row.id, worker_id, now).await? {
                output.sent += 1;
                tracing::info!(
                    event_id = %row.event_id,
                    attempt = input.delivery_attempt,
                    "webhook delivered"
                );
            } else {
                output.skipped += 1;
            }
            return Ok(heartbeat_err);
        }

        output.errors += 1;
        let next_attempts = row.attempts + 1;
        let max_attempts = effective_max_attempts(row.max_attempts, command.retry_budget);
        let message = match &sent {
            Ok(out) => status_error_message(out.status_code, &out.body_preview),
            Err(e) => send_error_message(e),
        };

        if next_attempts >= max_attempts {
            if self
                .repository
                .mark_failed(row.id, worker_id, next_attempts, &message, now)
                .await?
            {
                output.failed += 1;
                tracing::warn!(
                    event_id = %row.event_id,
                    attempts = next_attempts,
                    error = %message,
                    "webhook moved to dead-letter queue"
                );
            } else {
                output.skipped += 1;
            }
            return Ok(heartbeat_err);
        }

        let backoff = retry_backoff_with_jitter(
            &row.event_id,
            row.id,
            next_attempts,
            to_std(command.initial_backoff),
            to_std(command.max_backoff),
            command.retry_jitter_bps,
        );
        let next_attempt_at =
            now + chrono::Duration::from_std(backoff).unwrap_or(command.max_backoff);
        if self
            .repository
            .mark_retry(row.id, worker_id, next_attempts, next_attempt_at, &message, now)
            .await?
        {
            output.retried += 1;
            tracing::info!(
                event_id = %row.event_id,
                attempts = next_attempts,
                backoff_ms = backoff.as_millis() as u64,
                error = %message,
                "webhook delivery scheduled for retry"
            );
        } else {
            output.skipped += 1;
        }
        Ok(heartbeat_err)
    }

    /// Renews immediately, then every `interval`. Only returns on failure.
    async fn heartbeat(
        &self,
        row: &PendingWebhookOutboxEvent,
        worker_id: &str,
        lease: Duration,
        interval: Duration,
    ) -> AppError {
        let lease = chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::MAX);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let until = self.clock.now_utc() + lease;
            match self.repository.renew_lease(row.id, worker_id, until).await {
                Ok(true) => {}
                Ok(false) => {
                    return AppError::internal(
                        "dispatch_webhook_lease_lost",
                        "webhook outbox lease ownership was lost during dispatch",
                    )
                    .with("event_id", row.event_id.clone())
                    .with("row_id", row.id)
                    .with("worker_id", worker_id);
                }
                Err(e) => {
                    return AppError::internal(
                        "dispatch_webhook_lease_renew_failed",
                        "failed to renew webhook outbox lease",
                    )
                    .with("event_id", row.event_id.clone())
                    .with("row_id", row.id)
                    .with("worker_id", worker_id)
                    .with("error", e.message);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn command() -> DispatchWebhookEventsCommand {
        DispatchWebhookEventsCommand {
            now: Utc::now(),
            batch_size: 10,
            worker_id: "dispatcher-1".into(),
            lease_duration: chrono::Duration::seconds(30),
            initial_backoff: chrono::Duration::seconds(5),
            max_backoff: chrono::Duration::seconds(300),
            retry_jitter_bps: 0,
            retry_budget: 0,
        }
    }

    #[test]
    fn command_bounds() {
        assert!(validate(&command()).is_ok());
        type Mutation = fn(&mut DispatchWebhookEventsCommand);
        let cases: [(Mutation, &str); 8] = [
            (|c| c.batch_size = 0, "dispatch_webhook_batch_size_invalid"),
            (|c| c.worker_id = " ".into(), "dispatch_webhook_worker_id_invalid"),
            (
                |c| c.lease_duration = chrono::Duration::zero(),
                "dispatch_webhook_lease_duration_invalid",
            ),
            (
                |c| c.initial_backoff = chrono::Duration::zero(),
                "dispatch_webhook_initial_backoff_invalid",
            ),
            (
                |c| c.max_backoff = chrono::Duration::seconds(1),
                "dispatch_webhook_max_backoff_invalid",
            ),
            (|c| c.retry_jitter_bps = 10_001, "dispatch_webhook_retry_jitter_bps_invalid"),
            (|c| c.retry_jitter_bps = -1, "dispatch_webhook_retry_jitter_bps_invalid"),
            (|c| c.retry_budget = -1, "dispatch_webhook_retry_budget_invalid"),
        ];
        for (mutate, code) in cases {
            let mut c = command();
            mutate(&mut c);
            assert_eq!(validate(&c).unwrap_err().code, code);
        }
    }

    #[test]
    fn heartbeat_interval_bounds() {
        assert_eq!(
            heartbeat_interval(Duration::from_secs(30)).unwrap(),
            Duration::from_secs(10)
        );
        assert_eq!(
            heartbeat_interval(Duration::from_nanos(2)).unwrap(),
            Duration::from_nanos(1)
        );
        assert_eq!(
            heartbeat_interval(Duration::from_nanos(1)).unwrap_err().code,
            "dispatch_webhook_lease_heartbeat_interval_invalid"
        );
    }
}
