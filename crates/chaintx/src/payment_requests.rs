//! Payment request creation and reads.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};

use crate::address::format_for_response;
use crate::canonical_json;
use crate::clock::Clock;
use crate::domain::{
    AssetCatalogEntry, CreatePaymentRequestCommand, CreatePaymentRequestOutput,
    CreatePaymentRequestPersistenceCommand, IdempotencyScope, ListAssetsOutput,
    PaymentInstructions, PaymentRequestRecord, PaymentRequestResource, HASH_ALGORITHM_SHA256,
};
use crate::error::{AppError, AppResult};
use crate::ports::{
    AssetCatalogReadModel, PaymentAddressAllocator, PaymentRequestReadModel,
    PaymentRequestRepository,
};
use crate::validation::{
    clean_path, is_webhook_host_allowed, normalize_asset, normalize_chain,
    normalize_expected_amount_minor, normalize_metadata, normalize_network,
    normalize_webhook_url, resolve_expires_in_seconds,
};

pub const DEFAULT_PRINCIPAL_ID: &str = "anonymous";
pub const DEFAULT_HTTP_METHOD: &str = "POST";
pub const DEFAULT_HTTP_PATH: &str = "/v1/payment-requests";

const IDEMPOTENCY_TTL_BASELINE_DAYS: i64 = 7;
const IDEMPOTENCY_TTL_MINIMUM_HOURS: i64 = 24;

/// `prefix` followed by 24 random hex characters.
pub fn generate_id(prefix: &str) -> String {
    let bytes: [u8; 12] = rand::random();
    format!("{prefix}{}", hex::encode(bytes))
}

/// `max(created + 7d, request expiry, created + 24h)`.
pub fn idempotency_expiry(created_at: DateTime<Utc>, expires_at: DateTime<Utc>) -> DateTime<Utc> {
    let baseline = created_at + Duration::days(IDEMPOTENCY_TTL_BASELINE_DAYS);
    let minimum = created_at + Duration::hours(IDEMPOTENCY_TTL_MINIMUM_HOURS);
    baseline.max(expires_at).max(minimum)
}

pub fn normalize_idempotency_scope(scope: &IdempotencyScope) -> IdempotencyScope {
    let principal_id = match scope.principal_id.trim() {
        "" => DEFAULT_PRINCIPAL_ID.to_string(),
        p => p.to_string(),
    };
    let http_method = match scope.http_method.trim() {
        "" => DEFAULT_HTTP_METHOD.to_string(),
        m => m.to_ascii_uppercase(),
    };
    let http_path = match scope.http_path.trim() {
        "" => DEFAULT_HTTP_PATH.to_string(),
        p => clean_path(p),
    };
    IdempotencyScope {
        principal_id,
        http_method,
        http_path,
    }
}

/// Inputs that make two creates "the same request".
pub struct RequestHashInput<'a> {
    pub chain: &'a str,
    pub network: &'a str,
    pub asset: &'a str,
    pub expected_amount_minor: Option<&'a str>,
    pub expires_in_seconds: i64,
    pub metadata: &'a Map<String, Value>,
}

/// sha256 hex of the canonical JSON of the normalized request.
pub fn request_hash(input: &RequestHashInput<'_>) -> String {
    let mut payload = Map::new();
    payload.insert("chain".into(), input.chain.into());
    payload.insert("network".into(), input.network.into());
    payload.insert("asset".into(), input.asset.into());
    payload.insert("expires_in_seconds".into(), input.expires_in_seconds.into());
    if let Some(amount) = input.expected_amount_minor {
        payload.insert("expected_amount_minor".into(), amount.into());
    }
    if !input.metadata.is_empty() {
        payload.insert("metadata".into(), Value::Object(input.metadata.clone()));
    }
    canonical_json::sha256_hex(&canonical_json::to_vec(&Value::Object(payload)))
}

fn find_catalog_entry<'a>(
    entries: &'a [AssetCatalogEntry],
    chain: &str,
    network: &str,
    asset: &str,
) -> AppResult<&'a AssetCatalogEntry> {
    if let Some(entry) = entries
        .iter()
        .find(|e| e.chain == chain && e.network == network && e.asset.eq_ignore_ascii_case(asset))
    {
        return Ok(entry);
    }
    if !entries.iter().any(|e| e.chain == chain && e.network == network) {
        return Err(AppError::validation(
            "unsupported_network",
            "network is not supported for the selected chain",
        )
        .with("chain", chain)
        .with("network", network));
    }
    Err(AppError::validation(
        "unsupported_asset",
        "asset is not supported for the selected chain and network",
    )
    .with("chain", chain)
    .with("network", network)
    .with("asset", asset))
}

/// Public resource for a stored row. `address` is the response-formatted
/// address.
pub fn resource_from_record(record: &PaymentRequestRecord, address: String) -> PaymentRequestResource {
    PaymentRequestResource {
        id: record.id.clone(),
        status: record.status,
        chain: record.chain.clone(),
        network: record.network.clone(),
        asset: record.asset.clone(),
        expected_amount_minor: record.expected_amount_minor.clone(),
        expires_at: record.expires_at,
        created_at: record.created_at,
        payment_instructions: PaymentInstructions {
            address,
            address_scheme: record.address_scheme.clone(),
            derivation_index: record.derivation_index,
            chain_id: record.chain_id,
            token_standard: record.token_standard.clone(),
            token_contract: record.token_contract.clone(),
            token_decimals: record.token_decimals,
        },
    }
}

/// Read-side variant that formats the stored canonical address.
pub fn resource_for_read(record: &PaymentRequestRecord) -> AppResult<PaymentRequestResource> {
    let address = format_for_response(&record.chain, &record.address_canonical)?;
    Ok(resource_from_record(record, address))
}

/// Bytes stored in the idempotency record and returned on replay.
pub fn encode_response(resource: &PaymentRequestResource) -> AppResult<Vec<u8>> {
    Ok(serde_json::to_vec(resource)?)
}

/// Decode a stored replay payload.
pub fn decode_response(bytes: &[u8]) -> AppResult<PaymentRequestResource> {
    serde_json::from_slice(bytes).map_err(|e| {
        AppError::internal(
            "idempotency_payload_invalid",
            "stored idempotency response payload is invalid",
        )
        .with("error", e.to_string())
    })
}

/// Create, get and list-assets over the storage ports.
#[derive(Clone)]
pub struct PaymentRequestService {
    catalog: Arc<dyn AssetCatalogReadModel>,
    repository: Arc<dyn PaymentRequestRepository>,
    read_model: Arc<dyn PaymentRequestReadModel>,
    allocator: Arc<dyn PaymentAddressAllocator>,
    clock: Arc<dyn Clock>,
    webhook_allowlist: Vec<String>,
}

impl PaymentRequestService {
    pub fn new(
        catalog: Arc<dyn AssetCatalogReadModel>,
        repository: Arc<dyn PaymentRequestRepository>,
        read_model: Arc<dyn PaymentRequestReadModel>,
        allocator: Arc<dyn PaymentAddressAllocator>,
        clock: Arc<dyn Clock>,
        webhook_allowlist: Vec<String>,
    ) -> Self {
        Self {
            catalog,
            repository,
            read_model,
            allocator,
            clock,
            webhook_allowlist,
        }
    }

    pub async fn create(
        &self,
        command: &CreatePaymentRequestCommand,
    ) -> AppResult<CreatePaymentRequestOutput> {
        let chain = normalize_chain(&command.chain)?;
        let network = normalize_network(&command.network)?;
        let asset = normalize_asset(&command.asset)?;
        let (webhook_url, webhook_host) = normalize_webhook_url(&command.webhook_url)?;
        if !is_webhook_host_allowed(&webhook_host, &self.webhook_allowlist) {
            return Err(AppError::validation(
                "webhook_url_not_allowed",
                "webhook_url host is not allowed",
            )
            .with("host", webhook_host));
        }
        let expected_amount_minor = command
            .expected_amount_minor
            .as_deref()
            .map(normalize_expected_amount_minor)
            .transpose()?;
        let metadata = normalize_metadata(command.metadata.as_ref())?;

        let entries = self.catalog.list_enabled().await?;
        let entry = find_catalog_entry(&entries, &chain, &network, &asset)?;
        let expires_in_seconds =
            resolve_expires_in_seconds(command.expires_in_seconds, entry.default_expires_in_seconds)?;

        let idempotency_scope = normalize_idempotency_scope(&command.idempotency_scope);
        let idempotency_key = match command.idempotency_key.trim() {
            "" => generate_id("auto_idem_"),
            k => k.to_string(),
        };

        let created_at = self.clock.now_utc();
        let expires_at = created_at + Duration::seconds(expires_in_seconds);
        let hash = request_hash(&RequestHashInput {
            chain: &chain,
            network: &network,
            asset: &asset,
            expected_amount_minor: expected_amount_minor.as_deref(),
            expires_in_seconds,
            metadata: &metadata,
        });

        let persistence = CreatePaymentRequestPersistenceCommand {
            resource_id: generate_id("pr_"),
            idempotency_scope,
            idempotency_key,
            request_hash: hash,
            hash_algorithm: HASH_ALGORITHM_SHA256.to_string(),
            chain,
            network,
            asset,
            webhook_url,
            expected_amount_minor,
            metadata,
            expires_at,
            idempotency_expires_at: idempotency_expiry(created_at, expires_at),
            created_at,
            catalog_entry: entry.clone(),
        };
        let output = self
            .repository
            .create(&persistence, self.allocator.as_ref())
            .await?;
        if output.replayed {
            tracing::info!(
                id = %output.resource.id,
                principal = %persistence.idempotency_scope.principal_id,
                "payment request replayed"
            );
        } else {
            tracing::info!(
                id = %output.resource.id,
                chain = %output.resource.chain,
                network = %output.resource.network,
                asset = %output.resource.asset,
                derivation_index = output.resource.payment_instructions.derivation_index,
                "payment request created"
            );
        }
        Ok(output)
    }

    pub async fn get(&self, id: &str) -> AppResult<PaymentRequestResource> {
        let id = id.trim();
        if id.is_empty() {
            return Err(
                AppError::validation("invalid_request", "payment request id is required")
                    .with("field", "id"),
            );
        }
        self.read_model.get_by_id(id).await?.ok_or_else(|| {
            AppError::not_found("payment_request_not_found", "payment request was not found")
                .with("id", id)
        })
    }

    pub async fn list_assets(&self) -> AppResult<ListAssetsOutput> {
        Ok(ListAssetsOutput {
            assets: self.catalog.list_enabled().await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn generated_ids() {
        let id = generate_id("pr_");
        assert_eq!(id.len(), 27);
        assert!(id[3..].bytes().all(|b| b.is_ascii_hexdigit()));
        assert_ne!(generate_id("pr_"), id);
    }

    #[test]
    fn idempotency_ttl_policy() {
        let created = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(
            idempotency_expiry(created, created + Duration::hours(1)),
            created + Duration::days(7)
        );
        let long = created + Duration::days(30);
        assert_eq!(idempotency_expiry(created, long), long);
    }

    #[test]
    fn scope_defaults() {
        let scope = normalize_idempotency_scope(&IdempotencyScope::default());
        assert_eq!(scope.principal_id, "anonymous");
        assert_eq!(scope.http_method, "POST");
        assert_eq!(scope.http_path, "/v1/payment-requests");

        let scope = normalize_idempotency_scope(&IdempotencyScope {
            principal_id: " merchant-1 ".into(),
            http_method: "post".into(),
            http_path: "v1//payment-requests/".into(),
        });
        assert_eq!(scope.principal_id, "merchant-1");
        assert_eq!(scope.http_method, "POST");
        assert_eq!(scope.http_path, "/v1/payment-requests");
    }

    #[test]
    fn request_hash_is_order_independent_and_sensitive() {
        let mut a = Map::new();
        a.insert("x".into(), 1.into());
        a.insert("y".into(), "z".into());
        let mut b = Map::new();
        b.insert("y".into(), "z".into());
        b.insert("x".into(), 1.into());
        let input = |metadata| RequestHashInput {
            chain: "bitcoin",
            network: "regtest",
            asset: "BTC",
            expected_amount_minor: Some("100"),
            expires_in_seconds: 3600,
            metadata,
        };
        assert_eq!(request_hash(&input(&a)), request_hash(&input(&b)));

        let empty = Map::new();
        let mut other = input(&empty);
        let base = request_hash(&other);
        other.expected_amount_minor = Some("101");
        assert_ne!(request_hash(&other), base);
    }
}
