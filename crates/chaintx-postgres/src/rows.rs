//! Row decoding. Queries select columns by name; these functions turn a
//! `PgRow` into the core's types.

use std::str::FromStr;

use chaintx::catalog::{CatalogIntegrityRow, CatalogWalletSnapshot};
use chaintx::{
    AssetCatalogEntry, DeliveryStatus, PaymentRequestRecord, PaymentRequestStatus, WalletAccount,
    WebhookDlqEvent,
};
use serde_json::{Map, Value};
use sqlx::postgres::PgRow;
use sqlx::Row;

use crate::error::StoreError;

pub(crate) const CATALOG_COLUMNS: &str = "chain, network, asset, minor_unit, decimals, \
    address_scheme, default_expires_in_seconds, chain_id, token_standard, token_contract, \
    token_decimals, wallet_account_id";

pub(crate) const PAYMENT_REQUEST_COLUMNS: &str = "id, wallet_account_id, chain, network, asset, \
    status, expected_amount_minor, address_canonical, address_scheme, derivation_index, chain_id, \
    token_standard, token_contract, token_decimals, metadata, webhook_url, expires_at, created_at, \
    updated_at, reconcile_lease_owner, reconcile_lease_until";

pub(crate) const WALLET_COLUMNS: &str = "id, chain, network, keyset_id, derivation_path_template, \
    next_index, is_active, key_material_hash, key_material_hash_algo, created_at, updated_at";

pub(crate) const DLQ_COLUMNS: &str = "event_id, event_type, payment_request_id, destination_url, \
    attempts, max_attempts, last_error, created_at, updated_at, delivered_at";

fn parse<T: FromStr>(column: &'static str, value: String) -> Result<T, StoreError> {
    value
        .parse()
        .map_err(|_| StoreError::InvalidColumn { column, value })
}

pub(crate) fn payment_request_status(row: &PgRow) -> Result<PaymentRequestStatus, StoreError> {
    parse("status", row.try_get("status")?)
}

pub(crate) fn delivery_status(row: &PgRow) -> Result<DeliveryStatus, StoreError> {
    parse("delivery_status", row.try_get("delivery_status")?)
}

pub(crate) fn catalog_entry(row: &PgRow) -> Result<AssetCatalogEntry, StoreError> {
    Ok(AssetCatalogEntry {
        chain: row.try_get("chain")?,
        network: row.try_get("network")?,
        asset: row.try_get("asset")?,
        minor_unit: row.try_get("minor_unit")?,
        decimals: row.try_get("decimals")?,
        address_scheme: row.try_get("address_scheme")?,
        default_expires_in_seconds: row.try_get("default_expires_in_seconds")?,
        chain_id: row.try_get("chain_id")?,
        token_standard: row.try_get("token_standard")?,
        token_contract: row.try_get("token_contract")?,
        token_decimals: row.try_get("token_decimals")?,
        wallet_account_id: row.try_get("wallet_account_id")?,
    })
}

fn json_object(column: &'static str, value: Value) -> Result<Map<String, Value>, StoreError> {
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => Err(StoreError::InvalidColumn {
            column,
            value: other.to_string(),
        }),
    }
}

pub(crate) fn payment_request(row: &PgRow) -> Result<PaymentRequestRecord, StoreError> {
    Ok(PaymentRequestRecord {
        id: row.try_get("id")?,
        wallet_account_id: row.try_get("wallet_account_id")?,
        chain: row.try_get("chain")?,
        network: row.try_get("network")?,
        asset: row.try_get("asset")?,
        status: payment_request_status(row)?,
        expected_amount_minor: row.try_get("expected_amount_minor")?,
        address_canonical: row.try_get("address_canonical")?,
        address_scheme: row.try_get("address_scheme")?,
        derivation_index: row.try_get("derivation_index")?,
        chain_id: row.try_get("chain_id")?,
        token_standard: row.try_get("token_standard")?,
        token_contract: row.try_get("token_contract")?,
        token_decimals: row.try_get("token_decimals")?,
        metadata: json_object("metadata", row.try_get("metadata")?)?,
        webhook_url: row.try_get("webhook_url")?,
        expires_at: row.try_get("expires_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        reconcile_lease_owner: row.try_get("reconcile_lease_owner")?,
        reconcile_lease_until: row.try_get("reconcile_lease_until")?,
    })
}

pub(crate) fn wallet_account(row: &PgRow) -> Result<WalletAccount, StoreError> {
    Ok(WalletAccount {
        id: row.try_get("id")?,
        chain: row.try_get("chain")?,
        network: row.try_get("network")?,
        keyset_id: row.try_get("keyset_id")?,
        derivation_path_template: row.try_get("derivation_path_template")?,
        next_index: row.try_get("next_index")?,
        is_active: row.try_get("is_active")?,
        key_material_hash: row.try_get("key_material_hash")?,
        key_material_hash_algo: row.try_get("key_material_hash_algo")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub(crate) fn dlq_event(row: &PgRow) -> Result<WebhookDlqEvent, StoreError> {
    Ok(WebhookDlqEvent {
        event_id: row.try_get("event_id")?,
        event_type: row.try_get("event_type")?,
        payment_request_id: row.try_get("payment_request_id")?,
        destination_url: row.try_get("destination_url")?,
        attempts: row.try_get("attempts")?,
        max_attempts: row.try_get("max_attempts")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        delivered_at: row.try_get("delivered_at")?,
    })
}

/// Catalog row LEFT JOINed with its wallet; wallet columns are prefixed `w_`.
pub(crate) fn catalog_integrity(row: &PgRow) -> Result<CatalogIntegrityRow, StoreError> {
    let wallet_id: Option<String> = row.try_get("w_id")?;
    let wallet = match wallet_id {
        Some(id) => Some(CatalogWalletSnapshot {
            id,
            chain: row.try_get("w_chain")?,
            network: row.try_get("w_network")?,
            keyset_id: row.try_get("w_keyset_id")?,
            derivation_path_template: row.try_get("w_derivation_path_template")?,
            next_index: row.try_get("w_next_index")?,
            is_active: row.try_get("w_is_active")?,
        }),
        None => None,
    };
    Ok(CatalogIntegrityRow {
        chain: row.try_get("chain")?,
        network: row.try_get("network")?,
        asset: row.try_get("asset")?,
        wallet_account_id: row.try_get("wallet_account_id")?,
        address_scheme: row.try_get("address_scheme")?,
        default_expires_in_seconds: row.try_get("default_expires_in_seconds")?,
        chain_id: row.try_get("chain_id")?,
        token_standard: row.try_get("token_standard")?,
        token_contract: row.try_get("token_contract")?,
        token_decimals: row.try_get("token_decimals")?,
        wallet,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_status_is_a_column_error() {
        let err = parse::<PaymentRequestStatus>("status", "settled".into()).unwrap_err();
        assert_eq!(err.to_string(), "invalid value in column status: settled");
    }

    #[test]
    fn metadata_must_be_an_object() {
        assert!(json_object("metadata", Value::Null).unwrap().is_empty());
        assert!(json_object("metadata", serde_json::json!([1])).is_err());
    }
}
