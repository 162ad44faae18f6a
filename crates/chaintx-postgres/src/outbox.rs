//! Webhook outbox claims, delivery bookkeeping and operator mutations.

use std::str::FromStr;

use async_trait::async_trait;
use chaintx::outbox::age_seconds;
use chaintx::ports::{WebhookOutboxReadModel, WebhookOutboxRepository};
use chaintx::{
    AppResult, DeliveryStatus, OutboxMutationResult, PendingWebhookOutboxEvent, WebhookDlqEvent,
    WebhookOutboxOverview,
};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{Postgres, Row, Transaction};

use crate::error::{QueryContext, StoreError};
use crate::rows::{self, DLQ_COLUMNS};
use crate::store::PgStore;

fn pending_event(row: &PgRow) -> Result<(DateTime<Utc>, PendingWebhookOutboxEvent), StoreError> {
    Ok((
        row.try_get("created_at")?,
        PendingWebhookOutboxEvent {
            id: row.try_get("id")?,
            event_id: row.try_get("event_id")?,
            event_type: row.try_get("event_type")?,
            destination_url: row.try_get("destination_url")?,
            payload: row.try_get("payload")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
        },
    ))
}

/// Lock the row by `event_id` and report its status, or `None` if absent.
async fn lock_by_event_id(
    tx: &mut Transaction<'_, Postgres>,
    event_id: &str,
) -> AppResult<Option<DeliveryStatus>> {
    let status: Option<String> = sqlx::query_scalar(
        "SELECT delivery_status FROM app.webhook_outbox_events WHERE event_id = $1 FOR UPDATE",
    )
    .bind(event_id)
    .fetch_optional(&mut **tx)
    .await
    .context("webhook_outbox_lookup_failed", "failed to lock webhook outbox event")?;
    status
        .map(|s| DeliveryStatus::from_str(&s))
        .transpose()
}

fn not_found() -> OutboxMutationResult {
    OutboxMutationResult {
        found: false,
        updated: false,
        current_status: None,
    }
}

fn unchanged(status: DeliveryStatus) -> OutboxMutationResult {
    OutboxMutationResult {
        found: true,
        updated: false,
        current_status: Some(status),
    }
}

fn changed(status: DeliveryStatus) -> OutboxMutationResult {
    OutboxMutationResult {
        found: true,
        updated: true,
        current_status: Some(status),
    }
}

#[async_trait]
impl WebhookOutboxRepository for PgStore {
    async fn claim_pending_for_dispatch(
        &self,
        now: DateTime<Utc>,
        limit: i64,
        lease_owner: &str,
        lease_until: DateTime<Utc>,
    ) -> AppResult<Vec<PendingWebhookOutboxEvent>> {
        let claimed = sqlx::query(
            r#"
            WITH candidates AS (
                SELECT id FROM app.webhook_outbox_events
                WHERE delivery_status = 'pending'
                  AND btrim(destination_url) <> ''
                  AND next_attempt_at <= $1
                  AND (lease_until IS NULL OR lease_until <= $1)
                ORDER BY created_at, id
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE app.webhook_outbox_events e
            SET lease_owner = $3, lease_until = $4, updated_at = $1
            FROM candidates c
            WHERE e.id = c.id
            RETURNING e.id, e.event_id, e.event_type, e.destination_url, e.payload,
                      e.attempts, e.max_attempts, e.created_at
            "#,
        )
        .bind(now)
        .bind(limit)
        .bind(lease_owner.trim())
        .bind(lease_until)
        .fetch_all(&self.pool)
        .await
        .context("webhook_outbox_claim_failed", "failed to claim webhook outbox events")?;

        let mut events = claimed
            .iter()
            .map(pending_event)
            .collect::<Result<Vec<_>, _>>()
            .context("webhook_outbox_claim_failed", "failed to decode claimed webhook events")?;
        events.sort_by(|(a_at, a), (b_at, b)| (a_at, a.id).cmp(&(b_at, b.id)));
        Ok(events.into_iter().map(|(_, e)| e).collect())
    }

    async fn renew_lease(
        &self,
        id: i64,
        lease_owner: &str,
        lease_until: DateTime<Utc>,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE app.webhook_outbox_events
            SET lease_until = $3
            WHERE id = $1 AND delivery_status = 'pending' AND lease_owner = $2
            "#,
        )
        .bind(id)
        .bind(lease_owner.trim())
        .bind(lease_until)
        .execute(&self.pool)
        .await
        .context("webhook_outbox_lease_renew_failed", "failed to renew webhook outbox lease")?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_delivered(
        &self,
        id: i64,
        lease_owner: &str,
        delivered_at: DateTime<Utc>,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE app.webhook_outbox_events
            SET delivery_status = 'delivered', delivered_at = $3, last_error = NULL,
                lease_owner = NULL, lease_until = NULL, updated_at = $3
            WHERE id = $1 AND delivery_status = 'pending'
              AND (lease_owner IS NULL OR lease_owner = $2)
            "#,
        )
        .bind(id)
        .bind(lease_owner.trim())
        .bind(delivered_at)
        .execute(&self.pool)
        .await
        .context("webhook_outbox_update_failed", "failed to mark webhook event delivered")?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_retry(
        &self,
        id: i64,
        lease_owner: &str,
        attempts: i32,
        next_attempt_at: DateTime<Utc>,
        last_error: &str,
        updated_at: DateTime<Utc>,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE app.webhook_outbox_events
            SET attempts = $3, next_attempt_at = $4, last_error = $5,
                lease_owner = NULL, lease_until = NULL, updated_at = $6
            WHERE id = $1 AND delivery_status = 'pending'
              AND (lease_owner IS NULL OR lease_owner = $2)
            "#,
        )
        .bind(id)
        .bind(lease_owner.trim())
        .bind(attempts)
        .bind(next_attempt_at)
        .bind(last_error.trim())
        .bind(updated_at)
        .execute(&self.pool)
        .await
        .context("webhook_outbox_update_failed", "failed to schedule webhook retry")?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_failed(
        &self,
        id: i64,
        lease_owner: &str,
        attempts: i32,
        last_error: &str,
        updated_at: DateTime<Utc>,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE app.webhook_outbox_events
            SET delivery_status = 'failed', attempts = $3, last_error = $4,
                lease_owner = NULL, lease_until = NULL, updated_at = $5
            WHERE id = $1 AND delivery_status = 'pending'
              AND (lease_owner IS NULL OR lease_owner = $2)
            "#,
        )
        .bind(id)
        .bind(lease_owner.trim())
        .bind(attempts)
        .bind(last_error.trim())
        .bind(updated_at)
        .execute(&self.pool)
        .await
        .context("webhook_outbox_update_failed", "failed to dead-letter webhook event")?;
        Ok(result.rows_affected() > 0)
    }

    async fn requeue_failed_by_event_id(
        &self,
        event_id: &str,
        operator_id: &str,
        now: DateTime<Utc>,
    ) -> AppResult<OutboxMutationResult> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("webhook_outbox_tx_begin_failed", "failed to start outbox transaction")?;
        let status = match lock_by_event_id(&mut tx, event_id).await? {
            None => return Ok(not_found()),
            Some(DeliveryStatus::Failed) => DeliveryStatus::Failed,
            Some(other) => return Ok(unchanged(other)),
        };
        sqlx::query(
            r#"
            UPDATE app.webhook_outbox_events
            SET delivery_status = 'pending', attempts = 0, next_attempt_at = $2,
                last_error = NULL, lease_owner = NULL, lease_until = NULL,
                delivered_at = NULL, updated_at = $2
            WHERE event_id = $1 AND delivery_status = $3
            "#,
        )
        .bind(event_id)
        .bind(now)
        .bind(status.as_str())
        .execute(&mut *tx)
        .await
        .context("webhook_outbox_update_failed", "failed to requeue webhook event")?;
        tx.commit()
            .await
            .context("webhook_outbox_tx_commit_failed", "failed to commit outbox transaction")?;
        tracing::debug!(event_id, operator_id, "outbox row requeued");
        Ok(changed(DeliveryStatus::Pending))
    }

    async fn cancel_by_event_id(
        &self,
        event_id: &str,
        last_error: &str,
        now: DateTime<Utc>,
    ) -> AppResult<OutboxMutationResult> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("webhook_outbox_tx_begin_failed", "failed to start outbox transaction")?;
        match lock_by_event_id(&mut tx, event_id).await? {
            None => return Ok(not_found()),
            Some(DeliveryStatus::Delivered) => return Ok(unchanged(DeliveryStatus::Delivered)),
            Some(_) => {}
        }
        sqlx::query(
            r#"
            UPDATE app.webhook_outbox_events
            SET delivery_status = 'failed', last_error = $2,
                lease_owner = NULL, lease_until = NULL, updated_at = $3
            WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .bind(last_error)
        .bind(now)
        .execute(&mut *tx)
        .await
        .context("webhook_outbox_update_failed", "failed to cancel webhook event")?;
        tx.commit()
            .await
            .context("webhook_outbox_tx_commit_failed", "failed to commit outbox transaction")?;
        Ok(changed(DeliveryStatus::Failed))
    }
}

#[async_trait]
impl WebhookOutboxReadModel for PgStore {
    async fn get_overview(&self, now: DateTime<Utc>) -> AppResult<WebhookOutboxOverview> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE delivery_status = 'pending') AS pending_count,
                COUNT(*) FILTER (
                    WHERE delivery_status = 'pending'
                      AND next_attempt_at <= $1
                      AND (lease_until IS NULL OR lease_until <= $1)
                ) AS pending_ready_count,
                COUNT(*) FILTER (WHERE delivery_status = 'pending' AND attempts > 0)
                    AS retrying_count,
                COUNT(*) FILTER (WHERE delivery_status = 'failed') AS failed_count,
                COUNT(*) FILTER (WHERE delivery_status = 'delivered') AS delivered_count,
                MIN(created_at) FILTER (WHERE delivery_status = 'pending')
                    AS oldest_pending_created_at
            FROM app.webhook_outbox_events
            "#,
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .context("webhook_outbox_overview_failed", "failed to load webhook outbox overview")?;

        let decode = |row: &PgRow| -> Result<WebhookOutboxOverview, StoreError> {
            let oldest: Option<DateTime<Utc>> = row.try_get("oldest_pending_created_at")?;
            Ok(WebhookOutboxOverview {
                pending_count: row.try_get("pending_count")?,
                pending_ready_count: row.try_get("pending_ready_count")?,
                retrying_count: row.try_get("retrying_count")?,
                failed_count: row.try_get("failed_count")?,
                delivered_count: row.try_get("delivered_count")?,
                oldest_pending_created_at: oldest,
                oldest_pending_age_seconds: oldest.map(|at| age_seconds(at, now)),
            })
        };
        decode(&row).context("webhook_outbox_overview_failed", "failed to decode webhook outbox overview")
    }

    async fn list_dlq(&self, limit: i64) -> AppResult<Vec<WebhookDlqEvent>> {
        let records = sqlx::query(&format!(
            "SELECT {DLQ_COLUMNS} FROM app.webhook_outbox_events \
             WHERE delivery_status = 'failed' \
             ORDER BY updated_at DESC, id DESC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("webhook_outbox_dlq_failed", "failed to list webhook dead-letter events")?;

        records
            .iter()
            .map(rows::dlq_event)
            .collect::<Result<Vec<_>, _>>()
            .context("webhook_outbox_dlq_failed", "failed to decode webhook dead-letter events")
    }
}
