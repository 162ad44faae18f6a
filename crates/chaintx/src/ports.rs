//! Storage, chain and delivery traits the use cases depend on.
//!
//! `chaintx-postgres` implements the storage traits over sqlx; the in-memory
//! store in [`crate::memory`] implements the same traits for tests and local
//! runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::alerts::WebhookAlert;
use crate::catalog::CatalogIntegrityRow;
use crate::domain::*;
use crate::error::AppResult;
use crate::wallet_sync::{WalletSyncCommand, WalletSyncOutcome};

#[async_trait]
pub trait AssetCatalogReadModel: Send + Sync {
    async fn list_enabled(&self) -> AppResult<Vec<AssetCatalogEntry>>;
}

/// Derives the address for a wallet slot. Called inside the create
/// transaction, after the wallet row is locked.
#[async_trait]
pub trait PaymentAddressAllocator: Send + Sync {
    async fn resolve(
        &self,
        input: &ResolvePaymentAddressInput,
    ) -> AppResult<ResolvePaymentAddressOutput>;
}

#[async_trait]
pub trait PaymentRequestRepository: Send + Sync {
    /// Idempotent create: replay, conflict or allocate-and-insert, atomically.
    async fn create(
        &self,
        command: &CreatePaymentRequestPersistenceCommand,
        allocator: &dyn PaymentAddressAllocator,
    ) -> AppResult<CreatePaymentRequestOutput>;
}

#[async_trait]
pub trait PaymentRequestReadModel: Send + Sync {
    async fn get_by_id(&self, id: &str) -> AppResult<Option<PaymentRequestResource>>;
}

#[async_trait]
pub trait ReconciliationRepository: Send + Sync {
    async fn claim_open_for_reconciliation(
        &self,
        now: DateTime<Utc>,
        limit: i64,
        lease_owner: &str,
        lease_until: DateTime<Utc>,
    ) -> AppResult<Vec<OpenPaymentRequest>>;

    /// Apply the transition iff the row is still in `current_status` and the
    /// lease is free or ours. Returns whether a row was updated.
    async fn transition_status_if_current(&self, command: &TransitionStatusCommand)
        -> AppResult<bool>;
}

#[async_trait]
pub trait WebhookOutboxRepository: Send + Sync {
    async fn claim_pending_for_dispatch(
        &self,
        now: DateTime<Utc>,
        limit: i64,
        lease_owner: &str,
        lease_until: DateTime<Utc>,
    ) -> AppResult<Vec<PendingWebhookOutboxEvent>>;

    async fn renew_lease(
        &self,
        id: i64,
        lease_owner: &str,
        lease_until: DateTime<Utc>,
    ) -> AppResult<bool>;

    async fn mark_delivered(
        &self,
        id: i64,
        lease_owner: &str,
        delivered_at: DateTime<Utc>,
    ) -> AppResult<bool>;

    async fn mark_retry(
        &self,
        id: i64,
        lease_owner: &str,
        attempts: i32,
        next_attempt_at: DateTime<Utc>,
        last_error: &str,
        updated_at: DateTime<Utc>,
    ) -> AppResult<bool>;

    async fn mark_failed(
        &self,
        id: i64,
        lease_owner: &str,
        attempts: i32,
        last_error: &str,
        updated_at: DateTime<Utc>,
    ) -> AppResult<bool>;

    async fn requeue_failed_by_event_id(
        &self,
        event_id: &str,
        operator_id: &str,
        now: DateTime<Utc>,
    ) -> AppResult<OutboxMutationResult>;

    async fn cancel_by_event_id(
        &self,
        event_id: &str,
        last_error: &str,
        now: DateTime<Utc>,
    ) -> AppResult<OutboxMutationResult>;
}

#[async_trait]
pub trait WebhookOutboxReadModel: Send + Sync {
    async fn get_overview(&self, now: DateTime<Utc>) -> AppResult<WebhookOutboxOverview>;

    /// Failed rows, newest first.
    async fn list_dlq(&self, limit: i64) -> AppResult<Vec<WebhookDlqEvent>>;
}

#[async_trait]
pub trait ChainObserverGateway: Send + Sync {
    async fn observe(
        &self,
        input: &ObservePaymentRequestInput,
    ) -> AppResult<ObservePaymentRequestOutput>;
}

#[async_trait]
pub trait WebhookEventGateway: Send + Sync {
    async fn send(&self, input: &SendWebhookEventInput) -> AppResult<SendWebhookEventOutput>;
}

#[async_trait]
pub trait PersistenceBootstrap: Send + Sync {
    async fn check_readiness(&self) -> AppResult<()>;
    async fn run_migrations(&self) -> AppResult<()>;
    /// Every enabled catalog row joined with its bound wallet account.
    async fn load_catalog_integrity_rows(&self) -> AppResult<Vec<CatalogIntegrityRow>>;
}

#[async_trait]
pub trait WalletAccountSyncRepository: Send + Sync {
    /// Distinct `(chain, network, keyset_id)` of enabled catalog rows.
    async fn list_sync_targets(&self) -> AppResult<Vec<KeysetTarget>>;

    /// Run one target's sync in a single transaction.
    async fn sync_target(&self, command: &WalletSyncCommand) -> AppResult<WalletSyncOutcome>;
}

/// Destination for webhook health alerts.
pub trait AlertSink: Send + Sync {
    fn emit(&self, alert: &WebhookAlert);
}
