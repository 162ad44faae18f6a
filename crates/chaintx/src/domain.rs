//! Entities, statuses and the DTOs that cross port boundaries.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::AppError;

pub const EVENT_TYPE_STATUS_CHANGED: &str = "payment_request.status_changed";
pub const HASH_ALGORITHM_SHA256: &str = "sha256";
pub const KEY_HASH_ALGO_HMAC_SHA256: &str = "hmac-sha256";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentRequestStatus {
    Pending,
    Detected,
    Confirmed,
    Expired,
    Failed,
}

impl PaymentRequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Detected => "detected",
            Self::Confirmed => "confirmed",
            Self::Expired => "expired",
            Self::Failed => "failed",
        }
    }

    /// Open statuses are scanned by the reconciler.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Pending | Self::Detected)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_open()
    }

    /// Allowed lifecycle edges. A same-status refresh is always allowed for
    /// open statuses.
    pub fn can_transition_to(&self, next: PaymentRequestStatus) -> bool {
        use PaymentRequestStatus::*;
        match (self, next) {
            (Pending, Pending | Detected | Confirmed | Expired) => true,
            (Detected, Detected | Confirmed | Expired) => true,
            _ => false,
        }
    }

    /// Statuses whose entry produces an outbox event.
    pub fn emits_webhook(&self) -> bool {
        matches!(self, Self::Detected | Self::Confirmed | Self::Expired)
    }
}

impl fmt::Display for PaymentRequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentRequestStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "detected" => Ok(Self::Detected),
            "confirmed" => Ok(Self::Confirmed),
            "expired" => Ok(Self::Expired),
            "failed" => Ok(Self::Failed),
            other => Err(AppError::internal(
                "payment_request_status_invalid",
                "payment request status is invalid",
            )
            .with("status", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "delivered" => Ok(Self::Delivered),
            "failed" => Ok(Self::Failed),
            other => Err(AppError::internal(
                "webhook_delivery_status_invalid",
                "webhook delivery status is invalid",
            )
            .with("delivery_status", other)),
        }
    }
}

/// One enabled row of `app.asset_catalog`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetCatalogEntry {
    pub chain: String,
    pub network: String,
    pub asset: String,
    pub minor_unit: String,
    pub decimals: i32,
    pub address_scheme: String,
    pub default_expires_in_seconds: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_standard: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_contract: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_decimals: Option<i32>,
    #[serde(skip)]
    pub wallet_account_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListAssetsOutput {
    pub assets: Vec<AssetCatalogEntry>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WalletAccount {
    pub id: String,
    pub chain: String,
    pub network: String,
    pub keyset_id: String,
    pub derivation_path_template: String,
    pub next_index: i64,
    pub is_active: bool,
    pub key_material_hash: String,
    pub key_material_hash_algo: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdempotencyScope {
    pub principal_id: String,
    pub http_method: String,
    pub http_path: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreatePaymentRequestCommand {
    pub idempotency_scope: IdempotencyScope,
    pub idempotency_key: String,
    pub chain: String,
    pub network: String,
    pub asset: String,
    pub webhook_url: String,
    pub expected_amount_minor: Option<String>,
    pub expires_in_seconds: Option<i64>,
    pub metadata: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentInstructions {
    pub address: String,
    pub address_scheme: String,
    pub derivation_index: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_standard: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_contract: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_decimals: Option<i32>,
}

/// Public representation of a payment request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRequestResource {
    pub id: String,
    pub status: PaymentRequestStatus,
    pub chain: String,
    pub network: String,
    pub asset: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_amount_minor: Option<String>,
    #[serde(with = "rfc3339")]
    pub expires_at: DateTime<Utc>,
    #[serde(with = "rfc3339")]
    pub created_at: DateTime<Utc>,
    pub payment_instructions: PaymentInstructions,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreatePaymentRequestOutput {
    pub resource: PaymentRequestResource,
    /// Exact bytes returned to the caller; identical on replay.
    pub response_body: Vec<u8>,
    pub replayed: bool,
}

/// Everything the repository needs to run the create transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct CreatePaymentRequestPersistenceCommand {
    pub resource_id: String,
    pub idempotency_scope: IdempotencyScope,
    pub idempotency_key: String,
    pub request_hash: String,
    pub hash_algorithm: String,
    pub chain: String,
    pub network: String,
    pub asset: String,
    pub webhook_url: String,
    pub expected_amount_minor: Option<String>,
    pub metadata: Map<String, Value>,
    pub expires_at: DateTime<Utc>,
    pub idempotency_expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub catalog_entry: AssetCatalogEntry,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvePaymentAddressInput {
    pub chain: String,
    pub network: String,
    pub address_scheme: String,
    pub keyset_id: String,
    pub derivation_path_template: String,
    pub derivation_index: i64,
    pub chain_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvePaymentAddressOutput {
    pub address_canonical: String,
    pub address: String,
}

/// Stored payment request row.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentRequestRecord {
    pub id: String,
    pub wallet_account_id: String,
    pub chain: String,
    pub network: String,
    pub asset: String,
    pub status: PaymentRequestStatus,
    pub expected_amount_minor: Option<String>,
    pub address_canonical: String,
    pub address_scheme: String,
    pub derivation_index: i64,
    pub chain_id: Option<i64>,
    pub token_standard: Option<String>,
    pub token_contract: Option<String>,
    pub token_decimals: Option<i32>,
    pub metadata: Map<String, Value>,
    pub webhook_url: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub reconcile_lease_owner: Option<String>,
    pub reconcile_lease_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IdempotencyRecord {
    pub scope: IdempotencyScope,
    pub idempotency_key: String,
    pub request_hash: String,
    pub hash_algorithm: String,
    pub resource_id: String,
    pub response_payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

// Reconciliation

#[derive(Debug, Clone, PartialEq)]
pub struct ReconcilePaymentRequestsCommand {
    pub now: DateTime<Utc>,
    pub batch_size: i64,
    pub worker_id: String,
    pub lease_duration: chrono::Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcilePaymentRequestsOutput {
    pub claimed: usize,
    pub scanned: usize,
    pub confirmed: usize,
    pub detected: usize,
    pub expired: usize,
    pub skipped: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpenPaymentRequest {
    pub id: String,
    pub status: PaymentRequestStatus,
    pub chain: String,
    pub network: String,
    pub asset: String,
    pub expected_amount_minor: Option<String>,
    pub address_canonical: String,
    pub expires_at: DateTime<Utc>,
    pub chain_id: Option<i64>,
    pub token_standard: Option<String>,
    pub token_contract: Option<String>,
    pub token_decimals: Option<i32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObservePaymentRequestInput {
    pub request_id: String,
    pub chain: String,
    pub network: String,
    pub asset: String,
    pub expected_amount_minor: Option<String>,
    pub address_canonical: String,
    pub chain_id: Option<i64>,
    pub token_standard: Option<String>,
    pub token_contract: Option<String>,
    pub token_decimals: Option<i32>,
}

impl From<&OpenPaymentRequest> for ObservePaymentRequestInput {
    fn from(row: &OpenPaymentRequest) -> Self {
        Self {
            request_id: row.id.clone(),
            chain: row.chain.clone(),
            network: row.network.clone(),
            asset: row.asset.clone(),
            expected_amount_minor: row.expected_amount_minor.clone(),
            address_canonical: row.address_canonical.clone(),
            chain_id: row.chain_id,
            token_standard: row.token_standard.clone(),
            token_contract: row.token_contract.clone(),
            token_decimals: row.token_decimals,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObservePaymentRequestOutput {
    pub supported: bool,
    pub observed_amount_minor: String,
    pub detected: bool,
    pub confirmed: bool,
    pub source: String,
    pub details: Map<String, Value>,
}

impl ObservePaymentRequestOutput {
    pub fn unsupported() -> Self {
        Self::default()
    }
}

/// Merged under `metadata.reconciliation` on every transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconcileTransitionMetadata {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub observed_amount_minor: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub observation_source: String,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub observation_details: Map<String, Value>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub transition_reason: String,
    #[serde(with = "rfc3339")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransitionStatusCommand {
    pub id: String,
    pub current_status: PaymentRequestStatus,
    pub next_status: PaymentRequestStatus,
    pub lease_owner: String,
    pub updated_at: DateTime<Utc>,
    pub metadata: ReconcileTransitionMetadata,
}

// Webhook outbox

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchWebhookEventsCommand {
    pub now: DateTime<Utc>,
    pub batch_size: i64,
    pub worker_id: String,
    pub lease_duration: chrono::Duration,
    pub initial_backoff: chrono::Duration,
    pub max_backoff: chrono::Duration,
    pub retry_jitter_bps: i64,
    pub retry_budget: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchWebhookEventsOutput {
    pub claimed: usize,
    pub sent: usize,
    pub retried: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errors: usize,
    pub latency_ms: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingWebhookOutboxEvent {
    pub id: i64,
    pub event_id: String,
    pub event_type: String,
    pub destination_url: String,
    pub payload: Vec<u8>,
    pub attempts: i32,
    pub max_attempts: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SendWebhookEventInput {
    pub event_id: String,
    pub event_type: String,
    pub delivery_attempt: i32,
    pub destination_url: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendWebhookEventOutput {
    pub status_code: u16,
    /// Leading bytes of the response body, kept for `last_error`.
    pub body_preview: Vec<u8>,
}

impl SendWebhookEventOutput {
    pub fn is_success(&self) -> bool {
        (200..=299).contains(&self.status_code)
    }
}

/// Full outbox row, as held by the in-memory store and returned by lookups.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookOutboxEvent {
    pub id: i64,
    pub event_id: String,
    pub event_type: String,
    pub payment_request_id: String,
    pub destination_url: String,
    pub payload: Vec<u8>,
    pub delivery_status: DeliveryStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub lease_owner: Option<String>,
    pub lease_until: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookOutboxOverview {
    pub pending_count: i64,
    pub pending_ready_count: i64,
    pub retrying_count: i64,
    pub failed_count: i64,
    pub delivered_count: i64,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "rfc3339::option")]
    pub oldest_pending_created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oldest_pending_age_seconds: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookDlqEvent {
    pub event_id: String,
    pub event_type: String,
    pub payment_request_id: String,
    pub destination_url: String,
    pub attempts: i32,
    pub max_attempts: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(with = "rfc3339")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "rfc3339")]
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "rfc3339::option")]
    pub delivered_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListWebhookDlqEventsOutput {
    pub events: Vec<WebhookDlqEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequeueWebhookDlqEventOutput {
    pub event_id: String,
    pub delivery_status: DeliveryStatus,
    #[serde(with = "rfc3339")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelWebhookOutboxEventOutput {
    pub event_id: String,
    pub delivery_status: DeliveryStatus,
    pub last_error: String,
    #[serde(with = "rfc3339")]
    pub updated_at: DateTime<Utc>,
}

/// Result of a guarded outbox mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutboxMutationResult {
    pub found: bool,
    pub updated: bool,
    pub current_status: Option<DeliveryStatus>,
}

// Wallet account sync

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeysetTarget {
    pub chain: String,
    pub network: String,
    pub keyset_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletSyncAction {
    Reused,
    Reactivated,
    Rotated,
}

impl WalletSyncAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reused => "reused",
            Self::Reactivated => "reactivated",
            Self::Rotated => "rotated",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashMatchSource {
    Active,
    Legacy,
    Unhashed,
}

impl HashMatchSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Legacy => "legacy",
            Self::Unhashed => "unhashed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectedFrom {
    Active,
    Historical,
    New,
}

impl SelectedFrom {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Historical => "historical",
            Self::New => "new",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WalletSyncEventDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_active_wallet_account_id: Option<String>,
    pub selected_from: SelectedFrom,
    pub hash_prefix: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletAccountSyncEvent {
    pub chain: String,
    pub network: String,
    pub keyset_id: String,
    pub wallet_account_id: String,
    pub action: WalletSyncAction,
    pub match_source: HashMatchSource,
    pub key_material_hash: String,
    pub key_material_hash_algo: String,
    pub details: WalletSyncEventDetails,
    pub created_at: DateTime<Utc>,
}

/// RFC 3339 with seconds or sub-seconds as needed, always `Z`.
pub mod rfc3339 {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn format(ts: &DateTime<Utc>) -> String {
        ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
    }

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            ts: &Option<DateTime<Utc>>,
            s: S,
        ) -> Result<S::Ok, S::Error> {
            match ts {
                Some(t) => s.serialize_str(&format(t)),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            d: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            let raw = Option::<String>::deserialize(d)?;
            raw.map(|r| {
                DateTime::parse_from_rfc3339(&r)
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(serde::de::Error::custom)
            })
            .transpose()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn lifecycle_edges() {
        use PaymentRequestStatus::*;
        assert!(Pending.can_transition_to(Detected));
        assert!(Pending.can_transition_to(Confirmed));
        assert!(Pending.can_transition_to(Expired));
        assert!(Detected.can_transition_to(Confirmed));
        assert!(!Detected.can_transition_to(Pending));
        for terminal in [Confirmed, Expired, Failed] {
            assert!(terminal.is_terminal());
            for next in [Pending, Detected, Confirmed, Expired, Failed] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn status_parse_roundtrip_and_rejection() {
        assert_eq!(
            "detected".parse::<PaymentRequestStatus>().unwrap(),
            PaymentRequestStatus::Detected
        );
        let err = "paid".parse::<PaymentRequestStatus>().unwrap_err();
        assert_eq!(err.code, "payment_request_status_invalid");
    }

    #[test]
    fn resource_omits_absent_fields() {
        let ts = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let resource = PaymentRequestResource {
            id: "pr_1".into(),
            status: PaymentRequestStatus::Pending,
            chain: "bitcoin".into(),
            network: "regtest".into(),
            asset: "BTC".into(),
            expected_amount_minor: None,
            expires_at: ts,
            created_at: ts,
            payment_instructions: PaymentInstructions {
                address: "bcrt1q".into(),
                address_scheme: "bip84_p2wpkh".into(),
                derivation_index: 0,
                chain_id: None,
                token_standard: None,
                token_contract: None,
                token_decimals: None,
            },
        };
        let json = serde_json::to_value(&resource).unwrap();
        assert_eq!(json["expires_at"], "2026-01-02T03:04:05Z");
        assert!(json.get("expected_amount_minor").is_none());
        assert!(json["payment_instructions"].get("chain_id").is_none());
    }

    #[test]
    fn catalog_entry_hides_wallet_binding() {
        let entry = AssetCatalogEntry {
            chain: "ethereum".into(),
            network: "sepolia".into(),
            asset: "ETH".into(),
            minor_unit: "wei".into(),
            decimals: 18,
            address_scheme: "evm_bip44".into(),
            default_expires_in_seconds: 3600,
            chain_id: Some(11155111),
            token_standard: None,
            token_contract: None,
            token_decimals: None,
            wallet_account_id: "wa_secret".into(),
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(!json.contains("wa_secret"));
        assert!(json.contains("\"chain_id\":11155111"));
    }
}
