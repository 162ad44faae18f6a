//! Operator actions on the webhook outbox.

use std::sync::Arc;

use crate::clock::Clock;
use crate::domain::{
    CancelWebhookOutboxEventOutput, DeliveryStatus, ListWebhookDlqEventsOutput,
    OutboxMutationResult, RequeueWebhookDlqEventOutput, WebhookOutboxOverview,
};
use crate::error::{AppError, AppResult};
use crate::outbox::manual_cancel_reason;
use crate::payment_requests::DEFAULT_PRINCIPAL_ID;
use crate::ports::{WebhookOutboxReadModel, WebhookOutboxRepository};

pub const DEFAULT_DLQ_LIMIT: i64 = 50;
pub const MAX_DLQ_LIMIT: i64 = 200;

#[derive(Clone)]
pub struct WebhookOutboxOps {
    repository: Arc<dyn WebhookOutboxRepository>,
    read_model: Arc<dyn WebhookOutboxReadModel>,
    clock: Arc<dyn Clock>,
}

fn require_event_id(event_id: &str) -> AppResult<&str> {
    let event_id = event_id.trim();
    if event_id.is_empty() {
        return Err(AppError::validation("invalid_request", "event_id is required")
            .with("field", "event_id"));
    }
    Ok(event_id)
}

/// `None` and `0` mean the default; anything else must be in `1..=200`.
pub fn resolve_dlq_limit(limit: Option<i64>) -> AppResult<i64> {
    let limit = match limit {
        None | Some(0) => DEFAULT_DLQ_LIMIT,
        Some(l) => l,
    };
    if !(1..=MAX_DLQ_LIMIT).contains(&limit) {
        return Err(AppError::validation("invalid_request", "limit must be between 1 and 200")
            .with("field", "limit"));
    }
    Ok(limit)
}

fn check_mutation(
    result: OutboxMutationResult,
    event_id: &str,
    conflict_code: &str,
    conflict_message: &str,
) -> AppResult<()> {
    if !result.found {
        return Err(AppError::not_found(
            "webhook_outbox_event_not_found",
            "webhook outbox event was not found",
        )
        .with("event_id", event_id));
    }
    if !result.updated {
        let status = result.current_status.map(|s| s.as_str()).unwrap_or_default();
        return Err(AppError::conflict(conflict_code, conflict_message)
            .with("event_id", event_id)
            .with("delivery_status", status));
    }
    Ok(())
}

impl WebhookOutboxOps {
    pub fn new(
        repository: Arc<dyn WebhookOutboxRepository>,
        read_model: Arc<dyn WebhookOutboxReadModel>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repository,
            read_model,
            clock,
        }
    }

    pub async fn overview(&self) -> AppResult<WebhookOutboxOverview> {
        self.read_model.get_overview(self.clock.now_utc()).await
    }

    pub async fn list_dlq(&self, limit: Option<i64>) -> AppResult<ListWebhookDlqEventsOutput> {
        let limit = resolve_dlq_limit(limit)?;
        Ok(ListWebhookDlqEventsOutput {
            events: self.read_model.list_dlq(limit).await?,
        })
    }

    pub async fn requeue(
        &self,
        event_id: &str,
        operator_id: &str,
    ) -> AppResult<RequeueWebhookDlqEventOutput> {
        let event_id = require_event_id(event_id)?;
        let operator_id = match operator_id.trim() {
            "" => DEFAULT_PRINCIPAL_ID,
            o => o,
        };
        let now = self.clock.now_utc();
        let result = self
            .repository
            .requeue_failed_by_event_id(event_id, operator_id, now)
            .await?;
        check_mutation(
            result,
            event_id,
            "webhook_outbox_event_not_requeueable",
            "webhook outbox event is not requeueable",
        )?;
        tracing::info!(event_id, operator_id, "webhook dead-letter event requeued");
        Ok(RequeueWebhookDlqEventOutput {
            event_id: event_id.to_string(),
            delivery_status: DeliveryStatus::Pending,
            updated_at: now,
        })
    }

    pub async fn cancel(
        &self,
        event_id: &str,
        reason: Option<&str>,
        operator_id: &str,
    ) -> AppResult<CancelWebhookOutboxEventOutput> {
        let event_id = require_event_id(event_id)?;
        let last_error = manual_cancel_reason(reason);
        let now = self.clock.now_utc();
        let result = self
            .repository
            .cancel_by_event_id(event_id, &last_error, now)
            .await?;
        check_mutation(
            result,
            event_id,
            "webhook_outbox_event_not_cancellable",
            "webhook outbox event is not cancellable",
        )?;
        tracing::info!(
            event_id,
            operator_id = match operator_id.trim() {
                "" => DEFAULT_PRINCIPAL_ID,
                o => o,
            },
            last_error = %last_error,
            "webhook outbox event cancelled"
        );
        Ok(CancelWebhookOutboxEventOutput {
            event_id: event_id.to_string(),
            delivery_status: DeliveryStatus::Failed,
            last_error,
            updated_at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dlq_limit_bounds() {
        assert_eq!(resolve_dlq_limit(None).unwrap(), 50);
        assert_eq!(resolve_dlq_limit(Some(0)).unwrap(), 50);
        assert_eq!(resolve_dlq_limit(Some(1)).unwrap(), 1);
        assert_eq!(resolve_dlq_limit(Some(200)).unwrap(), 200);
        assert_eq!(resolve_dlq_limit(Some(201)).unwrap_err().code, "invalid_request");
        assert_eq!(resolve_dlq_limit(Some(-1)).unwrap_err().code, "invalid_request");
    }

    #[test]
    fn mutation_results_map_to_errors() {
        let missing = OutboxMutationResult {
            found: false,
            updated: false,
            current_status: None,
        };
        let err = check_mutation(missing, "evt_1", "x", "y").unwrap_err();
        assert_eq!(err.code, "webhook_outbox_event_not_found");

        let delivered = OutboxMutationResult {
            found: true,
            updated: false,
            current_status: Some(DeliveryStatus::Delivered),
        };
        let err = check_mutation(
            delivered,
            "evt_1",
            "webhook_outbox_event_not_cancellable",
            "webhook outbox event is not cancellable",
        )
        .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Conflict);
        assert_eq!(err.metadata["delivery_status"], "delivered");
    }
}
