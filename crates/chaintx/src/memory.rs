//! In-memory implementation of every storage port.
//!
//! Each operation runs under one lock, so it is atomic the way the SQL store's
//! transactions are. Creates additionally hold an async lock across the
//! allocator call, which plays the role of the wallet row lock.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::catalog::{CatalogIntegrityRow, CatalogWalletSnapshot};
use crate::domain::*;
use crate::error::{AppError, AppResult};
use crate::keys::DERIVATION_PATH_TEMPLATE;
use crate::outbox::{
    age_seconds, new_event_id, reconciliation_metadata_value, should_emit_status_changed,
    status_changed_payload,
};
use crate::payment_requests::{decode_response, encode_response, resource_for_read, resource_from_record};
use crate::ports::*;
use crate::wallet_sync::{plan_wallet_sync, WalletSyncCommand, WalletSyncOutcome};

pub const DEFAULT_MAX_ATTEMPTS: i32 = 8;

type IdempotencyKey = (String, String, String, String);

#[derive(Debug, Clone)]
struct CatalogRow {
    entry: AssetCatalogEntry,
    enabled: bool,
}

#[derive(Debug, Default)]
struct State {
    catalog: Vec<CatalogRow>,
    wallets: BTreeMap<String, WalletAccount>,
    requests: BTreeMap<String, PaymentRequestRecord>,
    idempotency: HashMap<IdempotencyKey, IdempotencyRecord>,
    outbox: Vec<WebhookOutboxEvent>,
    next_outbox_id: i64,
    sync_events: Vec<WalletAccountSyncEvent>,
}

impl State {
    fn outbox_by_event_id(&mut self, event_id: &str) -> Option<&mut WebhookOutboxEvent> {
        self.outbox.iter_mut().find(|e| e.event_id == event_id)
    }

    fn outbox_by_id(&mut self, id: i64) -> Option<&mut WebhookOutboxEvent> {
        self.outbox.iter_mut().find(|e| e.id == id)
    }

    fn wallets_for<'a>(
        &'a mut self,
        target: &'a KeysetTarget,
    ) -> impl Iterator<Item = &'a mut WalletAccount> + 'a {
        self.wallets.values_mut().filter(move |w| {
            w.chain == target.chain && w.network == target.network && w.keyset_id == target.keyset_id
        })
    }
}

fn idempotency_key(scope: &IdempotencyScope, key: &str) -> IdempotencyKey {
    (
        scope.principal_id.clone(),
        scope.http_method.clone(),
        scope.http_path.clone(),
        key.to_string(),
    )
}

fn idempotency_conflict(key: &str) -> AppError {
    AppError::conflict(
        "idempotency_key_conflict",
        "Idempotency key reused with different request payload",
    )
    .with("idempotency_key", key)
}

fn lease_is_free_or_mine(owner: &Option<String>, me: &str) -> bool {
    owner.as_deref().is_none_or(|o| o == me)
}

fn lease_is_free(until: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    until.is_none_or(|u| u <= now)
}

/// Process-local store for tests and single-node development runs.
#[derive(Debug)]
pub struct InMemoryStore {
    state: Mutex<State>,
    create_lock: tokio::sync::Mutex<()>,
    outbox_enabled: bool,
    max_attempts: i32,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_outbox_id: 1,
                ..Default::default()
            }),
            create_lock: tokio::sync::Mutex::new(()),
            outbox_enabled: true,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Whether status transitions enqueue webhook events, and the
    /// `max_attempts` stamped on new rows.
    pub fn with_outbox(mut self, enabled: bool, max_attempts: i32) -> Self {
        self.outbox_enabled = enabled;
        self.max_attempts = max_attempts;
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert_wallet_account(&self, account: WalletAccount) {
        self.lock().wallets.insert(account.id.clone(), account);
    }

    /// Add an enabled catalog row. `entry.wallet_account_id` is the binding.
    pub fn insert_catalog_entry(&self, entry: AssetCatalogEntry) {
        self.lock().catalog.push(CatalogRow {
            entry,
            enabled: true,
        });
    }

    pub fn set_catalog_enabled(&self, chain: &str, network: &str, asset: &str, enabled: bool) {
        for row in self.lock().catalog.iter_mut().filter(|r| {
            r.entry.chain == chain && r.entry.network == network && r.entry.asset == asset
        }) {
            row.enabled = enabled;
        }
    }

    /// Insert a raw outbox row and return its id.
    pub fn insert_outbox_event(&self, mut event: WebhookOutboxEvent) -> i64 {
        let mut state = self.lock();
        event.id = state.next_outbox_id;
        state.next_outbox_id += 1;
        let id = event.id;
        state.outbox.push(event);
        id
    }

    pub fn payment_request(&self, id: &str) -> Option<PaymentRequestRecord> {
        self.lock().requests.get(id).cloned()
    }

    /// Overwrite the reconcile lease on a request.
    pub fn set_reconcile_lease(&self, id: &str, owner: Option<&str>, until: Option<DateTime<Utc>>) {
        if let Some(record) = self.lock().requests.get_mut(id) {
            record.reconcile_lease_owner = owner.map(str::to_string);
            record.reconcile_lease_until = until;
        }
    }

    pub fn wallet_account(&self, id: &str) -> Option<WalletAccount> {
        self.lock().wallets.get(id).cloned()
    }

    pub fn wallet_accounts(&self) -> Vec<WalletAccount> {
        self.lock().wallets.values().cloned().collect()
    }

    pub fn catalog_entries(&self) -> Vec<AssetCatalogEntry> {
        self.lock().catalog.iter().map(|r| r.entry.clone()).collect()
    }

    pub fn outbox_events(&self) -> Vec<WebhookOutboxEvent> {
        self.lock().outbox.clone()
    }

    pub fn outbox_event(&self, event_id: &str) -> Option<WebhookOutboxEvent> {
        let mut state = self.lock();
        state.outbox_by_event_id(event_id).cloned()
    }

    pub fn sync_events(&self) -> Vec<WalletAccountSyncEvent> {
        self.lock().sync_events.clone()
    }

    /// Replay lookup used by create. `Ok(None)` means no record.
    fn replay(
        state: &State,
        command: &CreatePaymentRequestPersistenceCommand,
    ) -> AppResult<Option<CreatePaymentRequestOutput>> {
        let key = idempotency_key(&command.idempotency_scope, &command.idempotency_key);
        let Some(record) = state.idempotency.get(&key) else {
            return Ok(None);
        };
        if record.request_hash != command.request_hash {
            return Err(idempotency_conflict(&command.idempotency_key));
        }
        let resource = decode_response(&record.response_payload)
            .map_err(|e| e.with("resource_id", record.resource_id.clone()))?;
        Ok(Some(CreatePaymentRequestOutput {
            resource,
            response_body: record.response_payload.clone(),
            replayed: true,
        }))
    }
}

#[async_trait]
impl AssetCatalogReadModel for InMemoryStore {
    async fn list_enabled(&self) -> AppResult<Vec<AssetCatalogEntry>> {
        let mut entries: Vec<AssetCatalogEntry> = self
            .lock()
            .catalog
            .iter()
            .filter(|r| r.enabled)
            .map(|r| r.entry.clone())
            .collect();
        entries.sort_by(|a, b| {
            (&a.chain, &a.network, &a.asset).cmp(&(&b.chain, &b.network, &b.asset))
        });
        Ok(entries)
    }
}

#[async_trait]
impl PaymentRequestRepository for InMemoryStore {
    async fn create(
        &self,
        command: &CreatePaymentRequestPersistenceCommand,
        allocator: &dyn PaymentAddressAllocator,
    ) -> AppResult<CreatePaymentRequestOutput> {
        let _guard = self.create_lock.lock().await;
        let entry = &command.catalog_entry;

        let wallet = {
            let state = self.lock();
            if let Some(replayed) = Self::replay(&state, command)? {
                return Ok(replayed);
            }
            state
                .wallets
                .get(&entry.wallet_account_id)
                .cloned()
                .ok_or_else(|| {
                    AppError::internal("wallet_account_not_found", "wallet account mapping is invalid")
                        .with("wallet_account_id", entry.wallet_account_id.clone())
                })?
        };
        if !wallet.is_active {
            return Err(
                AppError::internal("wallet_account_inactive", "wallet account is inactive")
                    .with("wallet_account_id", wallet.id.clone()),
            );
        }
        if !wallet.chain.eq_ignore_ascii_case(&command.chain)
            || !wallet.network.eq_ignore_ascii_case(&command.network)
        {
            return Err(AppError::internal(
                "asset_catalog_wallet_mismatch",
                "asset catalog mapping does not match wallet account chain/network",
            )
            .with("wallet_account_id", wallet.id.clone())
            .with("wallet_chain", wallet.chain.clone())
            .with("wallet_network", wallet.network.clone())
            .with("request_chain", command.chain.clone())
            .with("request_network", command.network.clone()));
        }

        let allocation = allocator
            .resolve(&ResolvePaymentAddressInput {
                chain: command.chain.clone(),
                network: command.network.clone(),
                address_scheme: entry.address_scheme.clone(),
                keyset_id: wallet.keyset_id.clone(),
                derivation_path_template: wallet.derivation_path_template.clone(),
                derivation_index: wallet.next_index,
                chain_id: entry.chain_id,
            })
            .await?;

        let record = PaymentRequestRecord {
            id: command.resource_id.clone(),
            wallet_account_id: wallet.id.clone(),
            chain: command.chain.clone(),
            network: command.network.clone(),
            asset: command.asset.clone(),
            status: PaymentRequestStatus::Pending,
            expected_amount_minor: command.expected_amount_minor.clone(),
            address_canonical: allocation.address_canonical.clone(),
            address_scheme: entry.address_scheme.clone(),
            derivation_index: wallet.next_index,
            chain_id: entry.chain_id,
            token_standard: entry.token_standard.clone(),
            token_contract: entry.token_contract.clone(),
            token_decimals: entry.token_decimals,
            metadata: command.metadata.clone(),
            webhook_url: command.webhook_url.clone(),
            expires_at: command.expires_at,
            created_at: command.created_at,
            updated_at: command.created_at,
            reconcile_lease_owner: None,
            reconcile_lease_until: None,
        };
        let resource = resource_from_record(&record, allocation.address);
        let response_body = encode_response(&resource)?;

        let mut state = self.lock();
        if state.requests.contains_key(&record.id)
            || state.requests.values().any(|r| {
                (r.wallet_account_id == record.wallet_account_id
                    && r.derivation_index == record.derivation_index)
                    || (r.chain == record.chain
                        && r.network == record.network
                        && r.address_canonical == record.address_canonical)
            })
        {
            return Err(AppError::internal(
                "address_allocation_conflict",
                "payment request uniqueness constraint failed",
            )
            .with("wallet_account_id", record.wallet_account_id.clone())
            .with("derivation_index", record.derivation_index));
        }
        let key = idempotency_key(&command.idempotency_scope, &command.idempotency_key);
        if state.idempotency.contains_key(&key) {
            return Err(idempotency_conflict(&command.idempotency_key));
        }
        let stored = state
            .wallets
            .get_mut(&wallet.id)
            .filter(|w| w.next_index == wallet.next_index)
            .ok_or_else(|| {
                AppError::internal(
                    "wallet_account_index_conflict",
                    "wallet account index update conflict",
                )
                .with("wallet_account_id", wallet.id.clone())
            })?;
        stored.next_index += 1;
        stored.updated_at = command.created_at;

        state.idempotency.insert(
            key,
            IdempotencyRecord {
                scope: command.idempotency_scope.clone(),
                idempotency_key: command.idempotency_key.clone(),
                request_hash: command.request_hash.clone(),
                hash_algorithm: command.hash_algorithm.clone(),
                resource_id: record.id.clone(),
                response_payload: response_body.clone(),
                created_at: command.created_at,
                expires_at: command.idempotency_expires_at,
            },
        );
        state.requests.insert(record.id.clone(), record);
        Ok(CreatePaymentRequestOutput {
            resource,
            response_body,
            replayed: false,
        })
    }
}

#[async_trait]
impl PaymentRequestReadModel for InMemoryStore {
    async fn get_by_id(&self, id: &str) -> AppResult<Option<PaymentRequestResource>> {
        let record = self.lock().requests.get(id).cloned();
        record.as_ref().map(resource_for_read).transpose()
    }
}

#[async_trait]
impl ReconciliationRepository for InMemoryStore {
    async fn claim_open_for_reconciliation(
        &self,
        now: DateTime<Utc>,
        limit: i64,
        lease_owner: &str,
        lease_until: DateTime<Utc>,
    ) -> AppResult<Vec<OpenPaymentRequest>> {
        let mut state = self.lock();
        let mut candidates: Vec<&mut PaymentRequestRecord> = state
            .requests
            .values_mut()
            .filter(|r| r.status.is_open() && lease_is_free(r.reconcile_lease_until, now))
            .collect();
        candidates.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));

        Ok(candidates
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|r| {
                r.reconcile_lease_owner = Some(lease_owner.trim().to_string());
                r.reconcile_lease_until = Some(lease_until);
                OpenPaymentRequest {
                    id: r.id.clone(),
                    status: r.status,
                    chain: r.chain.clone(),
                    network: r.network.clone(),
                    asset: r.asset.clone(),
                    expected_amount_minor: r.expected_amount_minor.clone(),
                    address_canonical: r.address_canonical.clone(),
                    expires_at: r.expires_at,
                    chain_id: r.chain_id,
                    token_standard: r.token_standard.clone(),
                    token_contract: r.token_contract.clone(),
                    token_decimals: r.token_decimals,
                }
            })
            .collect())
    }

    async fn transition_status_if_current(
        &self,
        command: &TransitionStatusCommand,
    ) -> AppResult<bool> {
        let mut state = self.lock();
        let Some(record) = state.requests.get_mut(command.id.trim()) else {
            return Ok(false);
        };
        if record.status != command.current_status
            || !lease_is_free_or_mine(&record.reconcile_lease_owner, command.lease_owner.trim())
        {
            return Ok(false);
        }

        record.status = command.next_status;
        record.metadata.insert(
            "reconciliation".into(),
            reconciliation_metadata_value(&command.metadata),
        );
        record.updated_at = command.updated_at;
        record.reconcile_lease_owner = None;
        record.reconcile_lease_until = None;
        let record = record.clone();

        if should_emit_status_changed(
            self.outbox_enabled,
            command.current_status,
            command.next_status,
            &record.webhook_url,
        ) {
            let event_id = new_event_id();
            let payload = status_changed_payload(
                &event_id,
                &record,
                command.current_status,
                command.next_status,
                &command.metadata,
            );
            let id = state.next_outbox_id;
            state.next_outbox_id += 1;
            state.outbox.push(WebhookOutboxEvent {
                id,
                event_id,
                event_type: EVENT_TYPE_STATUS_CHANGED.to_string(),
                payment_request_id: record.id.clone(),
                destination_url: record.webhook_url.trim().to_string(),
                payload,
                delivery_status: DeliveryStatus::Pending,
                attempts: 0,
                max_attempts: self.max_attempts,
                next_attempt_at: command.updated_at,
                last_error: None,
                lease_owner: None,
                lease_until: None,
                delivered_at: None,
                created_at: command.updated_at,
                updated_at: command.updated_at,
            });
        }
        Ok(true)
    }
}

#[async_trait]
impl WebhookOutboxRepository for InMemoryStore {
    async fn claim_pending_for_dispatch(
        &self,
        now: DateTime<Utc>,
        limit: i64,
        lease_owner: &str,
        lease_until: DateTime<Utc>,
    ) -> AppResult<Vec<PendingWebhookOutboxEvent>> {
        let mut state = self.lock();
        let mut candidates: Vec<&mut WebhookOutboxEvent> = state
            .outbox
            .iter_mut()
            .filter(|e| {
                e.delivery_status == DeliveryStatus::Pending
                    && !e.destination_url.trim().is_empty()
                    && e.next_attempt_at <= now
                    && lease_is_free(e.lease_until, now)
            })
            .collect();
        candidates.sort_by_key(|e| (e.created_at, e.id));

        Ok(candidates
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|e| {
                e.lease_owner = Some(lease_owner.trim().to_string());
                e.lease_until = Some(lease_until);
                e.updated_at = now;
                PendingWebhookOutboxEvent {
                    id: e.id,
                    event_id: e.event_id.clone(),
                    event_type: e.event_type.clone(),
                    destination_url: e.destination_url.clone(),
                    payload: e.payload.clone(),
                    attempts: e.attempts,
                    max_attempts: e.max_attempts,
                }
            })
            .collect())
    }

    async fn renew_lease(
        &self,
        id: i64,
        lease_owner: &str,
        lease_until: DateTime<Utc>,
    ) -> AppResult<bool> {
        let mut state = self.lock();
        match state.outbox_by_id(id) {
            Some(e)
                if e.delivery_status == DeliveryStatus::Pending
                    && e.lease_owner.as_deref() == Some(lease_owner.trim()) =>
            {
                e.lease_until = Some(lease_until);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_delivered(
        &self,
        id: i64,
        lease_owner: &str,
        delivered_at: DateTime<Utc>,
    ) -> AppResult<bool> {
        let mut state = self.lock();
        let Some(e) = guarded_pending(&mut state, id, lease_owner) else {
            return Ok(false);
        };
        e.delivery_status = DeliveryStatus::Delivered;
        e.delivered_at = Some(delivered_at);
        e.last_error = None;
        e.lease_owner = None;
        e.lease_until = None;
        e.updated_at = delivered_at;
        Ok(true)
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
        let mut state = self.lock();
        let Some(e) = guarded_pending(&mut state, id, lease_owner) else {
            return Ok(false);
        };
        e.attempts = attempts;
        e.next_attempt_at = next_attempt_at;
        e.last_error = Some(last_error.trim().to_string());
        e.lease_owner = None;
        e.lease_until = None;
        e.updated_at = updated_at;
        Ok(true)
    }

    async fn mark_failed(
        &self,
        id: i64,
        lease_owner: &str,
        attempts: i32,
        last_error: &str,
        updated_at: DateTime<Utc>,
    ) -> AppResult<bool> {
        let mut state = self.lock();
        let Some(e) = guarded_pending(&mut state, id, lease_owner) else {
            return Ok(false);
        };
        e.delivery_status = DeliveryStatus::Failed;
        e.attempts = attempts;
        e.last_error = Some(last_error.trim().to_string());
        e.lease_owner = None;
        e.lease_until = None;
        e.updated_at = updated_at;
        Ok(true)
    }

    async fn requeue_failed_by_event_id(
        &self,
        event_id: &str,
        _operator_id: &str,
        now: DateTime<Utc>,
    ) -> AppResult<OutboxMutationResult> {
        let mut state = self.lock();
        let Some(e) = state.outbox_by_event_id(event_id) else {
            return Ok(OutboxMutationResult {
                found: false,
                updated: false,
                current_status: None,
            });
        };
        if e.delivery_status != DeliveryStatus::Failed {
            return Ok(OutboxMutationResult {
                found: true,
                updated: false,
                current_status: Some(e.delivery_status),
            });
        }
        e.delivery_status = DeliveryStatus::Pending;
        e.attempts = 0;
        e.next_attempt_at = now;
        e.last_error = None;
        e.lease_owner = None;
        e.lease_until = None;
        e.delivered_at = None;
        e.updated_at = now;
        Ok(OutboxMutationResult {
            found: true,
            updated: true,
            current_status: Some(DeliveryStatus::Pending),
        })
    }

    async fn cancel_by_event_id(
        &self,
        event_id: &str,
        last_error: &str,
        now: DateTime<Utc>,
    ) -> AppResult<OutboxMutationResult> {
        let mut state = self.lock();
        let Some(e) = state.outbox_by_event_id(event_id) else {
            return Ok(OutboxMutationResult {
                found: false,
                updated: false,
                current_status: None,
            });
        };
        if e.delivery_status == DeliveryStatus::Delivered {
            return Ok(OutboxMutationResult {
                found: true,
                updated: false,
                current_status: Some(e.delivery_status),
            });
        }
        e.delivery_status = DeliveryStatus::Failed;
        e.last_error = Some(last_error.to_string());
        e.lease_owner = None;
        e.lease_until = None;
        e.updated_at = now;
        Ok(OutboxMutationResult {
            found: true,
            updated: true,
            current_status: Some(DeliveryStatus::Failed),
        })
    }
}

fn guarded_pending<'a>(
    state: &'a mut State,
    id: i64,
    lease_owner: &str,
) -> Option<&'a mut WebhookOutboxEvent> {
    state.outbox_by_id(id).filter(|e| {
        e.delivery_status == DeliveryStatus::Pending
            && lease_is_free_or_mine(&e.lease_owner, lease_owner.trim())
    })
}

#[async_trait]
impl WebhookOutboxReadModel for InMemoryStore {
    async fn get_overview(&self, now: DateTime<Utc>) -> AppResult<WebhookOutboxOverview> {
        let state = self.lock();
        let mut overview = WebhookOutboxOverview {
            pending_count: 0,
            pending_ready_count: 0,
            retrying_count: 0,
            failed_count: 0,
            delivered_count: 0,
            oldest_pending_created_at: None,
            oldest_pending_age_seconds: None,
        };
        for e in &state.outbox {
            match e.delivery_status {
                DeliveryStatus::Pending => {
                    overview.pending_count += 1;
                    if e.next_attempt_at <= now && lease_is_free(e.lease_until, now) {
                        overview.pending_ready_count += 1;
                    }
                    if e.attempts > 0 {
                        overview.retrying_count += 1;
                    }
                    if overview
                        .oldest_pending_created_at
                        .is_none_or(|oldest| e.created_at < oldest)
                    {
                        overview.oldest_pending_created_at = Some(e.created_at);
                    }
                }
                DeliveryStatus::Failed => overview.failed_count += 1,
                DeliveryStatus::Delivered => overview.delivered_count += 1,
            }
        }
        overview.oldest_pending_age_seconds = overview
            .oldest_pending_created_at
            .map(|oldest| age_seconds(oldest, now));
        Ok(overview)
    }

    async fn list_dlq(&self, limit: i64) -> AppResult<Vec<WebhookDlqEvent>> {
        let state = self.lock();
        let mut failed: Vec<&WebhookOutboxEvent> = state
            .outbox
            .iter()
            .filter(|e| e.delivery_status == DeliveryStatus::Failed)
            .collect();
        failed.sort_by(|a, b| (b.updated_at, b.id).cmp(&(a.updated_at, a.id)));
        Ok(failed
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|e| WebhookDlqEvent {
                event_id: e.event_id.clone(),
                event_type: e.event_type.clone(),
                payment_request_id: e.payment_request_id.clone(),
                destination_url: e.destination_url.clone(),
                attempts: e.attempts,
                max_attempts: e.max_attempts,
                last_error: e.last_error.clone(),
                created_at: e.created_at,
                updated_at: e.updated_at,
                delivered_at: e.delivered_at,
            })
            .collect())
    }
}

#[async_trait]
impl PersistenceBootstrap for InMemoryStore {
    async fn check_readiness(&self) -> AppResult<()> {
        Ok(())
    }

    async fn run_migrations(&self) -> AppResult<()> {
        Ok(())
    }

    async fn load_catalog_integrity_rows(&self) -> AppResult<Vec<CatalogIntegrityRow>> {
        let state = self.lock();
        let mut rows: Vec<CatalogIntegrityRow> = state
            .catalog
            .iter()
            .filter(|r| r.enabled)
            .map(|r| {
                let e = &r.entry;
                CatalogIntegrityRow {
                    chain: e.chain.clone(),
                    network: e.network.clone(),
                    asset: e.asset.clone(),
                    wallet_account_id: e.wallet_account_id.clone(),
                    address_scheme: e.address_scheme.clone(),
                    default_expires_in_seconds: e.default_expires_in_seconds,
                    chain_id: e.chain_id,
                    token_standard: e.token_standard.clone(),
                    token_contract: e.token_contract.clone(),
                    token_decimals: e.token_decimals,
                    wallet: state.wallets.get(&e.wallet_account_id).map(|w| {
                        CatalogWalletSnapshot {
                            id: w.id.clone(),
                            chain: w.chain.clone(),
                            network: w.network.clone(),
                            keyset_id: Some(w.keyset_id.clone()),
                            derivation_path_template: Some(w.derivation_path_template.clone()),
                            next_index: Some(w.next_index),
                            is_active: w.is_active,
                        }
                    }),
                }
            })
            .collect();
        rows.sort_by(|a, b| (&a.chain, &a.network, &a.asset).cmp(&(&b.chain, &b.network, &b.asset)));
        Ok(rows)
    }
}

#[async_trait]
impl WalletAccountSyncRepository for InMemoryStore {
    async fn list_sync_targets(&self) -> AppResult<Vec<KeysetTarget>> {
        let state = self.lock();
        let targets: BTreeSet<KeysetTarget> = state
            .catalog
            .iter()
            .filter(|r| r.enabled)
            .filter_map(|r| {
                let wallet = state.wallets.get(&r.entry.wallet_account_id)?;
                Some(KeysetTarget {
                    chain: r.entry.chain.trim().to_ascii_lowercase(),
                    network: r.entry.network.trim().to_ascii_lowercase(),
                    keyset_id: wallet.keyset_id.trim().to_string(),
                })
            })
            .collect();
        Ok(targets.into_iter().collect())
    }

    async fn sync_target(&self, command: &WalletSyncCommand) -> AppResult<WalletSyncOutcome> {
        let target = &command.target;
        let now = command.now;
        let mut state = self.lock();

        // Checked up front so a failed sync leaves no partial writes.
        let bound_rows: Vec<usize> = state
            .catalog
            .iter()
            .enumerate()
            .filter(|(_, r)| {
                r.entry.chain == target.chain
                    && r.entry.network == target.network
                    && state
                        .wallets
                        .get(&r.entry.wallet_account_id)
                        .is_some_and(|w| w.keyset_id == target.keyset_id)
            })
            .map(|(i, _)| i)
            .collect();
        if bound_rows.is_empty() {
            return Err(AppError::internal(
                "invalid_configuration",
                "no asset catalog row found for wallet sync target",
            )
            .with("chain", target.chain.clone())
            .with("network", target.network.clone())
            .with("keyset_id", target.keyset_id.clone()));
        }

        let existing: Vec<WalletAccount> = state.wallets_for(target).map(|w| w.clone()).collect();
        let plan = plan_wallet_sync(command, &existing);
        for w in state
            .wallets_for(target)
            .filter(|w| w.is_active && w.id != plan.wallet_account_id)
        {
            w.is_active = false;
            w.updated_at = now;
        }
        if plan.create {
            state.wallets.insert(
                plan.wallet_account_id.clone(),
                WalletAccount {
                    id: plan.wallet_account_id.clone(),
                    chain: target.chain.clone(),
                    network: target.network.clone(),
                    keyset_id: target.keyset_id.clone(),
                    derivation_path_template: DERIVATION_PATH_TEMPLATE.to_string(),
                    next_index: 0,
                    is_active: true,
                    key_material_hash: command.active_hash.clone(),
                    key_material_hash_algo: command.key_material_hash_algo.clone(),
                    created_at: now,
                    updated_at: now,
                },
            );
        }
        let wallet_account_id = plan.wallet_account_id.clone();

        if let Some(w) = state.wallets.get_mut(&wallet_account_id) {
            w.derivation_path_template = DERIVATION_PATH_TEMPLATE.to_string();
            w.key_material_hash = command.active_hash.clone();
            w.key_material_hash_algo = command.key_material_hash_algo.clone();
            w.is_active = true;
            w.updated_at = now;
        }
        for i in bound_rows {
            state.catalog[i].entry.wallet_account_id = wallet_account_id.clone();
        }
        state.sync_events.push(WalletAccountSyncEvent {
            chain: target.chain.clone(),
            network: target.network.clone(),
            keyset_id: target.keyset_id.clone(),
            wallet_account_id: wallet_account_id.clone(),
            action: plan.action,
            match_source: plan.match_source,
            key_material_hash: command.active_hash.clone(),
            key_material_hash_algo: command.key_material_hash_algo.clone(),
            details: WalletSyncEventDetails {
                previous_active_wallet_account_id: plan.previous_active_wallet_account_id,
                selected_from: plan.selected_from,
                hash_prefix: command.hash_prefix(),
            },
            created_at: now,
        });

        Ok(WalletSyncOutcome {
            action: plan.action,
            match_source: plan.match_source,
            wallet_account_id,
            key_hash: command.active_hash.clone(),
        })
    }
}
