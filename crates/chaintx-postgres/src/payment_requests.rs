//! Payment request create, read and reconciliation.

use async_trait::async_trait;
use chaintx::outbox::{
    new_event_id, reconciliation_metadata_value, should_emit_status_changed, status_changed_payload,
};
use chaintx::payment_requests::{decode_response, encode_response, resource_for_read, resource_from_record};
use chaintx::ports::{
    PaymentAddressAllocator, PaymentRequestReadModel, PaymentRequestRepository,
    ReconciliationRepository,
};
use chaintx::{
    AppError, AppResult, CreatePaymentRequestOutput, CreatePaymentRequestPersistenceCommand,
    OpenPaymentRequest, PaymentRequestRecord, PaymentRequestResource, PaymentRequestStatus,
    ResolvePaymentAddressInput, TransitionStatusCommand, WalletAccount, EVENT_TYPE_STATUS_CHANGED,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{Postgres, Row, Transaction};

use crate::error::{QueryContext, StoreError};
use crate::rows::{self, PAYMENT_REQUEST_COLUMNS, WALLET_COLUMNS};
use crate::store::PgStore;

struct StoredIdempotency {
    request_hash: String,
    resource_id: String,
    response_payload: Vec<u8>,
}

impl StoredIdempotency {
    fn replay(self, command: &CreatePaymentRequestPersistenceCommand) -> AppResult<CreatePaymentRequestOutput> {
        if self.request_hash != command.request_hash {
            return Err(AppError::conflict(
                "idempotency_key_conflict",
                "Idempotency key reused with different request payload",
            )
            .with("idempotency_key", command.idempotency_key.clone()));
        }
        let resource = decode_response(&self.response_payload)
            .map_err(|e| e.with("resource_id", self.resource_id.clone()))?;
        Ok(CreatePaymentRequestOutput {
            resource,
            response_body: self.response_payload,
            replayed: true,
        })
    }
}

const IDEMPOTENCY_LOOKUP: &str = r#"
    SELECT request_hash, resource_id, response_payload
    FROM app.idempotency_records
    WHERE scope_principal = $1 AND scope_method = $2 AND scope_path = $3
      AND idempotency_key = $4
"#;

async fn find_idempotency<'e, E>(
    executor: E,
    command: &CreatePaymentRequestPersistenceCommand,
    for_update: bool,
) -> AppResult<Option<StoredIdempotency>>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let sql = if for_update {
        format!("{IDEMPOTENCY_LOOKUP} FOR UPDATE")
    } else {
        IDEMPOTENCY_LOOKUP.to_string()
    };
    let scope = &command.idempotency_scope;
    let row = sqlx::query(&sql)
        .bind(&scope.principal_id)
        .bind(&scope.http_method)
        .bind(&scope.http_path)
        .bind(&command.idempotency_key)
        .fetch_optional(executor)
        .await
        .context("idempotency_lookup_failed", "failed to load idempotency record")?;
    row.map(|r| -> Result<StoredIdempotency, StoreError> {
        Ok(StoredIdempotency {
            request_hash: r.try_get("request_hash")?,
            resource_id: r.try_get("resource_id")?,
            response_payload: r.try_get("response_payload")?,
        })
    })
    .transpose()
    .context("idempotency_lookup_failed", "failed to decode idempotency record")
}

async fn lock_wallet(
    tx: &mut Transaction<'_, Postgres>,
    wallet_account_id: &str,
) -> AppResult<WalletAccount> {
    let row = sqlx::query(&format!(
        "SELECT {WALLET_COLUMNS} FROM app.wallet_accounts WHERE id = $1 FOR UPDATE"
    ))
    .bind(wallet_account_id)
    .fetch_optional(&mut **tx)
    .await
    .context("wallet_account_lock_failed", "failed to lock wallet account")?;
    let Some(row) = row else {
        return Err(
            AppError::internal("wallet_account_not_found", "wallet account mapping is invalid")
                .with("wallet_account_id", wallet_account_id),
        );
    };
    rows::wallet_account(&row).context("wallet_account_lock_failed", "failed to decode wallet account")
}

async fn insert_payment_request(
    tx: &mut Transaction<'_, Postgres>,
    record: &PaymentRequestRecord,
) -> AppResult<()> {
    let result = sqlx::query(
        r#"
        INSERT INTO app.payment_requests (
            id, wallet_account_id, chain, network, asset, status, expected_amount_minor,
            address_canonical, address_scheme, derivation_index, chain_id, token_standard,
            token_contract, token_decimals, metadata, webhook_url, expires_at, created_at,
            updated_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                  $17, $18, $19)
        "#,
    )
    .bind(&record.id)
    .bind(&record.wallet_account_id)
    .bind(&record.chain)
    .bind(&record.network)
    .bind(&record.asset)
    .bind(record.status.as_str())
    .bind(&record.expected_amount_minor)
    .bind(&record.address_canonical)
    .bind(&record.address_scheme)
    .bind(record.derivation_index)
    .bind(record.chain_id)
    .bind(&record.token_standard)
    .bind(&record.token_contract)
    .bind(record.token_decimals)
    .bind(Value::Object(record.metadata.clone()))
    .bind(&record.webhook_url)
    .bind(record.expires_at)
    .bind(record.created_at)
    .bind(record.updated_at)
    .execute(&mut **tx)
    .await
    .map_err(StoreError::from);

    match result {
        Ok(_) => Ok(()),
        Err(e) if e.is_unique_violation() => Err(AppError::internal(
            "address_allocation_conflict",
            "payment request uniqueness constraint failed",
        )
        .with("wallet_account_id", record.wallet_account_id.clone())
        .with("derivation_index", record.derivation_index)
        .with("constraint", e.constraint_violated().unwrap_or_default().to_string())),
        Err(e) => Err(AppError::internal(
            "payment_request_insert_failed",
            "failed to insert payment request",
        )
        .with("error", e.to_string())),
    }
}

impl PgStore {
    /// Replay lookup outside the create transaction, used after losing an
    /// insert race on the idempotency key.
    async fn replay_after_race(
        &self,
        command: &CreatePaymentRequestPersistenceCommand,
    ) -> AppResult<CreatePaymentRequestOutput> {
        match find_idempotency(&self.pool, command, false).await? {
            Some(stored) => stored.replay(command),
            None => Err(AppError::conflict(
                "idempotency_key_conflict",
                "Idempotency key reused with different request payload",
            )
            .with("idempotency_key", command.idempotency_key.clone())),
        }
    }
}

#[async_trait]
impl PaymentRequestRepository for PgStore {
    async fn create(
        &self,
        command: &CreatePaymentRequestPersistenceCommand,
        allocator: &dyn PaymentAddressAllocator,
    ) -> AppResult<CreatePaymentRequestOutput> {
        let entry = &command.catalog_entry;
        let mut tx = self
            .pool
            .begin()
            .await
            .context("payment_request_tx_begin_failed", "failed to start payment request transaction")?;

        if let Some(stored) = find_idempotency(&mut *tx, command, true).await? {
            let output = stored.replay(command)?;
            tx.commit()
                .await
                .context("payment_request_tx_commit_failed", "failed to commit idempotency replay transaction")?;
            return Ok(output);
        }

        let wallet = lock_wallet(&mut tx, &entry.wallet_account_id).await?;
        if !wallet.is_active {
            return Err(
                AppError::internal("wallet_account_inactive", "wallet account is inactive")
                    .with("wallet_account_id", wallet.id),
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
        insert_payment_request(&mut tx, &record).await?;

        let resource = resource_from_record(&record, allocation.address);
        let response_body = encode_response(&resource)?;

        let scope = &command.idempotency_scope;
        let inserted = sqlx::query(
            r#"
            INSERT INTO app.idempotency_records (
                scope_principal, scope_method, scope_path, idempotency_key, request_hash,
                hash_algorithm, resource_id, response_payload, created_at, expires_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&scope.principal_id)
        .bind(&scope.http_method)
        .bind(&scope.http_path)
        .bind(&command.idempotency_key)
        .bind(&command.request_hash)
        .bind(&command.hash_algorithm)
        .bind(&record.id)
        .bind(&response_body)
        .bind(command.created_at)
        .bind(command.idempotency_expires_at)
        .execute(&mut *tx)
        .await
        .context("idempotency_insert_failed", "failed to insert idempotency record")?;
        if inserted.rows_affected() == 0 {
            tx.rollback()
                .await
                .context("payment_request_tx_rollback_failed", "failed to roll back payment request transaction")?;
            tracing::info!(
                idempotency_key = %command.idempotency_key,
                "lost idempotency insert race, replaying"
            );
            return self.replay_after_race(command).await;
        }

        let bumped = sqlx::query(
            r#"
            UPDATE app.wallet_accounts
            SET next_index = next_index + 1, updated_at = $3
            WHERE id = $1 AND next_index = $2
            "#,
        )
        .bind(&wallet.id)
        .bind(wallet.next_index)
        .bind(command.created_at)
        .execute(&mut *tx)
        .await
        .context("wallet_account_index_update_failed", "failed to advance wallet account index")?;
        if bumped.rows_affected() != 1 {
            return Err(AppError::internal(
                "wallet_account_index_conflict",
                "wallet account index update conflict",
            )
            .with("wallet_account_id", wallet.id));
        }

        tx.commit()
            .await
            .context("payment_request_tx_commit_failed", "failed to commit payment request transaction")?;
        Ok(CreatePaymentRequestOutput {
            resource,
            response_body,
            replayed: false,
        })
    }
}

#[async_trait]
impl PaymentRequestReadModel for PgStore {
    async fn get_by_id(&self, id: &str) -> AppResult<Option<PaymentRequestResource>> {
        let row = sqlx::query(&format!(
            "SELECT {PAYMENT_REQUEST_COLUMNS} FROM app.payment_requests WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("payment_request_query_failed", "failed to load payment request")?;
        let Some(row) = row else {
            return Ok(None);
        };
        let record = rows::payment_request(&row)
            .context("payment_request_query_failed", "failed to decode payment request")?;
        resource_for_read(&record).map(Some)
    }
}

fn open_request(row: &sqlx::postgres::PgRow) -> Result<(DateTime<Utc>, OpenPaymentRequest), StoreError> {
    Ok((
        row.try_get("created_at")?,
        OpenPaymentRequest {
            id: row.try_get("id")?,
            status: rows::payment_request_status(row)?,
            chain: row.try_get("chain")?,
            network: row.try_get("network")?,
            asset: row.try_get("asset")?,
            expected_amount_minor: row.try_get("expected_amount_minor")?,
            address_canonical: row.try_get("address_canonical")?,
            expires_at: row.try_get("expires_at")?,
            chain_id: row.try_get("chain_id")?,
            token_standard: row.try_get("token_standard")?,
            token_contract: row.try_get("token_contract")?,
            token_decimals: row.try_get("token_decimals")?,
        },
    ))
}

#[async_trait]
impl ReconciliationRepository for PgStore {
    async fn claim_open_for_reconciliation(
        &self,
        now: DateTime<Utc>,
        limit: i64,
        lease_owner: &str,
        lease_until: DateTime<Utc>,
    ) -> AppResult<Vec<OpenPaymentRequest>> {
        let claimed = sqlx::query(
            r#"
            WITH candidates AS (
                SELECT id FROM app.payment_requests
                WHERE status IN ('pending', 'detected')
                  AND (reconcile_lease_until IS NULL OR reconcile_lease_until <= $1)
                ORDER BY created_at, id
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE app.payment_requests pr
            SET reconcile_lease_owner = $3, reconcile_lease_until = $4
            FROM candidates c
            WHERE pr.id = c.id
            RETURNING pr.id, pr.status, pr.chain, pr.network, pr.asset, pr.expected_amount_minor,
                      pr.address_canonical, pr.expires_at, pr.chain_id, pr.token_standard,
                      pr.token_contract, pr.token_decimals, pr.created_at
            "#,
        )
        .bind(now)
        .bind(limit)
        .bind(lease_owner.trim())
        .bind(lease_until)
        .fetch_all(&self.pool)
        .await
        .context("reconcile_claim_failed", "failed to claim payment requests for reconciliation")?;

        let mut open = claimed
            .iter()
            .map(open_request)
            .collect::<Result<Vec<_>, _>>()
            .context("reconcile_claim_failed", "failed to decode claimed payment requests")?;
        open.sort_by(|(a_at, a), (b_at, b)| (a_at, &a.id).cmp(&(b_at, &b.id)));
        Ok(open.into_iter().map(|(_, r)| r).collect())
    }

    async fn transition_status_if_current(
        &self,
        command: &TransitionStatusCommand,
    ) -> AppResult<bool> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("reconcile_tx_begin_failed", "failed to start transition transaction")?;

        let row = sqlx::query(&format!(
            "SELECT {PAYMENT_REQUEST_COLUMNS} FROM app.payment_requests WHERE id = $1 FOR UPDATE"
        ))
        .bind(command.id.trim())
        .fetch_optional(&mut *tx)
        .await
        .context("reconcile_transition_failed", "failed to lock payment request")?;
        let Some(row) = row else {
            return Ok(false);
        };
        let mut record = rows::payment_request(&row)
            .context("reconcile_transition_failed", "failed to decode payment request")?;

        let lease_owner = command.lease_owner.trim();
        if record.status != command.current_status
            || record
                .reconcile_lease_owner
                .as_deref()
                .is_some_and(|owner| owner != lease_owner)
        {
            return Ok(false);
        }

        record.status = command.next_status;
        record.metadata.insert(
            "reconciliation".into(),
            reconciliation_metadata_value(&command.metadata),
        );
        record.updated_at = command.updated_at;
        sqlx::query(
            r#"
            UPDATE app.payment_requests
            SET status = $2, metadata = $3, updated_at = $4,
                reconcile_lease_owner = NULL, reconcile_lease_until = NULL
            WHERE id = $1
            "#,
        )
        .bind(&record.id)
        .bind(record.status.as_str())
        .bind(Value::Object(record.metadata.clone()))
        .bind(record.updated_at)
        .execute(&mut *tx)
        .await
        .context("reconcile_transition_failed", "failed to update payment request status")?;

        if should_emit_status_changed(
            self.outbox.enabled,
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
            sqlx::query(
                r#"
                INSERT INTO app.webhook_outbox_events (
                    event_id, event_type, payment_request_id, destination_url, payload,
                    delivery_status, attempts, max_attempts, next_attempt_at, created_at,
                    updated_at
                ) VALUES ($1, $2, $3, $4, $5, 'pending', 0, $6, $7, $7, $7)
                "#,
            )
            .bind(&event_id)
            .bind(EVENT_TYPE_STATUS_CHANGED)
            .bind(&record.id)
            .bind(record.webhook_url.trim())
            .bind(&payload)
            .bind(self.outbox.max_attempts)
            .bind(command.updated_at)
            .execute(&mut *tx)
            .await
            .context("webhook_outbox_insert_failed", "failed to enqueue webhook event")?;
        }

        tx.commit()
            .await
            .context("reconcile_tx_commit_failed", "failed to commit transition transaction")?;
        Ok(true)
    }
}
