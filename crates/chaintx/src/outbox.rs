//! Webhook outbox helpers shared by the stores and the dispatcher: event
//! payload construction, retry scheduling and delivery error text.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::canonical_json;
use crate::domain::{
    rfc3339, PaymentRequestRecord, PaymentRequestStatus, ReconcileTransitionMetadata,
    EVENT_TYPE_STATUS_CHANGED,
};
use crate::error::AppError;

/// Response bodies quoted in `last_error` are cut to this many bytes.
pub const MAX_BODY_PREVIEW_BYTES: usize = 1024;

pub const MANUAL_CANCEL_PREFIX: &str = "manual_cancelled";

/// `evt_` followed by 32 random hex characters.
pub fn new_event_id() -> String {
    let bytes: [u8; 16] = rand::random();
    format!("evt_{}", hex::encode(bytes))
}

/// Whether a transition into `next` produces an outbox row.
pub fn should_emit_status_changed(
    outbox_enabled: bool,
    previous: PaymentRequestStatus,
    next: PaymentRequestStatus,
    webhook_url: &str,
) -> bool {
    outbox_enabled && previous != next && next.emits_webhook() && !webhook_url.trim().is_empty()
}

/// Canonical JSON body for `payment_request.status_changed`. Null and empty
/// fields are dropped.
pub fn status_changed_payload(
    event_id: &str,
    record: &PaymentRequestRecord,
    previous: PaymentRequestStatus,
    next: PaymentRequestStatus,
    metadata: &ReconcileTransitionMetadata,
) -> Vec<u8> {
    let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
    let body = json!({
        "event_id": event_id,
        "event_type": EVENT_TYPE_STATUS_CHANGED,
        "occurred_at": rfc3339::format(&metadata.updated_at),
        "data": {
            "payment_request": {
                "id": record.id,
                "chain": record.chain,
                "network": record.network,
                "asset": record.asset,
                "expected_amount_minor": record.expected_amount_minor,
                "address_canonical": record.address_canonical,
                "expires_at": rfc3339::format(&record.expires_at),
                "previous_status": previous.as_str(),
                "current_status": next.as_str(),
                "observed_amount_minor": non_empty(&metadata.observed_amount_minor),
                "observation_source": non_empty(&metadata.observation_source),
                "transition_reason": non_empty(&metadata.transition_reason),
            }
        }
    });
    canonical_json::to_vec(&canonical_json::strip_nulls(body))
}

/// `metadata.reconciliation` merged into the stored request metadata.
pub fn reconciliation_metadata_value(metadata: &ReconcileTransitionMetadata) -> Value {
    serde_json::to_value(metadata).unwrap_or(Value::Null)
}

/// `backoff(1) = initial`, doubling per attempt up to `max`.
pub fn retry_backoff(attempts: i32, initial: Duration, max: Duration) -> Duration {
    if attempts <= 1 {
        return initial.min(max);
    }
    let mut backoff = initial;
    for _ in 1..attempts {
        backoff = backoff.saturating_mul(2);
        if backoff >= max {
            return max;
        }
    }
    backoff
}

/// Deterministic offset in `[-jitter_bps, +jitter_bps]` from FNV-1a over
/// `event_id|row_id|attempt`.
pub fn jitter_offset_bps(event_id: &str, row_id: i64, attempt: i32, jitter_bps: i64) -> i64 {
    if jitter_bps <= 0 {
        return 0;
    }
    let span = (jitter_bps * 2 + 1) as u32;
    let key = format!("{}|{row_id}|{attempt}", event_id.trim());
    (fnv1a32(key.as_bytes()) % span) as i64 - jitter_bps
}

fn fnv1a32(bytes: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    bytes.iter().fold(OFFSET_BASIS, |hash, b| {
        (hash ^ u32::from(*b)).wrapping_mul(PRIME)
    })
}

/// Exponential backoff with deterministic jitter, capped at `max` and never
/// zero.
pub fn retry_backoff_with_jitter(
    event_id: &str,
    row_id: i64,
    attempts: i32,
    initial: Duration,
    max: Duration,
    jitter_bps: i64,
) -> Duration {
    let base = retry_backoff(attempts, initial, max);
    if jitter_bps <= 0 {
        return base;
    }
    let factor_bps = (10_000 + jitter_offset_bps(event_id, row_id, attempts, jitter_bps)).max(1);
    let nanos = (base.as_nanos() * factor_bps as u128 / 10_000).max(1);
    let jittered = Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX));
    jittered.min(max)
}

/// Row max, tightened to `retry_budget + 1` when a budget is set.
pub fn effective_max_attempts(row_max: i32, retry_budget: i64) -> i32 {
    if retry_budget <= 0 {
        return row_max;
    }
    let budget_cap = i32::try_from(retry_budget.saturating_add(1)).unwrap_or(i32::MAX);
    row_max.min(budget_cap)
}

/// `last_error` text for a non-2xx response.
pub fn status_error_message(status_code: u16, body_preview: &[u8]) -> String {
    let preview = truncate_preview(body_preview);
    if preview.trim().is_empty() {
        format!("webhook endpoint returned status {status_code}")
    } else {
        format!("webhook endpoint returned status {status_code}: {}", preview.trim())
    }
}

/// `last_error` text for a transport failure.
pub fn send_error_message(err: &AppError) -> String {
    if !err.message.trim().is_empty() {
        err.message.clone()
    } else if !err.code.trim().is_empty() {
        err.code.clone()
    } else {
        "webhook dispatch failed".to_string()
    }
}

/// Lossy UTF-8 of at most [`MAX_BODY_PREVIEW_BYTES`], cut on a char boundary.
pub fn truncate_preview(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    if text.len() <= MAX_BODY_PREVIEW_BYTES {
        return text.into_owned();
    }
    let mut end = MAX_BODY_PREVIEW_BYTES;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

pub fn manual_cancel_reason(reason: Option<&str>) -> String {
    match reason.map(str::trim).filter(|r| !r.is_empty()) {
        Some(r) => format!("{MANUAL_CANCEL_PREFIX}: {r}"),
        None => MANUAL_CANCEL_PREFIX.to_string(),
    }
}

/// Seconds between `created_at` and `now`, floored at zero.
pub fn age_seconds(created_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (now - created_at).num_seconds().max(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::Map;

    fn record() -> PaymentRequestRecord {
        let ts = Utc.with_ymd_and_hms(2026, 5, 1, 10, 0, 0).unwrap();
        PaymentRequestRecord {
            id: "pr_abc".into(),
            wallet_account_id: "wa_1".into(),
            chain: "bitcoin".into(),
            network: "regtest".into(),
            asset: "BTC".into(),
            status: PaymentRequestStatus::Pending,
            expected_amount_minor: None,
            address_canonical: "bcrt1qxyz".into(),
            address_scheme: "bip84_p2wpkh".into(),
            derivation_index: 3,
            chain_id: None,
            token_standard: None,
            token_contract: None,
            token_decimals: None,
            metadata: Map::new(),
            webhook_url: "https://hooks.example.com/x".into(),
            expires_at: ts + chrono::Duration::hours(1),
            created_at: ts,
            updated_at: ts,
            reconcile_lease_owner: None,
            reconcile_lease_until: None,
        }
    }

    #[test]
    fn payload_is_canonical_and_sparse() {
        let meta = ReconcileTransitionMetadata {
            observed_amount_minor: "1000".into(),
            observation_source: "btc_esplora".into(),
            observation_details: Map::new(),
            transition_reason: "payment_detected".into(),
            updated_at: Utc.with_ymd_and_hms(2026, 5, 1, 10, 5, 0).unwrap(),
        };
        let bytes = status_changed_payload(
            "evt_1",
            &record(),
            PaymentRequestStatus::Pending,
            PaymentRequestStatus::Detected,
            &meta,
        );
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with(r#"{"data":{"payment_request":{"address_canonical":"bcrt1qxyz""#));
        assert!(text.contains(r#""current_status":"detected""#));
        assert!(text.contains(r#""occurred_at":"2026-05-01T10:05:00Z""#));
        assert!(!text.contains("expected_amount_minor"));
        assert!(!text.contains(' '));
    }

    #[test]
    fn emission_rules() {
        use PaymentRequestStatus::*;
        assert!(should_emit_status_changed(true, Pending, Detected, "https://x"));
        assert!(!should_emit_status_changed(false, Pending, Detected, "https://x"));
        assert!(!should_emit_status_changed(true, Pending, Pending, "https://x"));
        assert!(!should_emit_status_changed(true, Pending, Confirmed, "  "));
    }

    #[test]
    fn backoff_doubles_to_cap() {
        let initial = Duration::from_secs(5);
        let max = Duration::from_secs(60);
        assert_eq!(retry_backoff(0, initial, max), initial);
        assert_eq!(retry_backoff(1, initial, max), initial);
        assert_eq!(retry_backoff(2, initial, max), Duration::from_secs(10));
        assert_eq!(retry_backoff(4, initial, max), Duration::from_secs(40));
        assert_eq!(retry_backoff(5, initial, max), max);
        assert_eq!(retry_backoff(40, initial, max), max);
    }

    #[test]
    fn jitter_is_deterministic_and_bounded() {
        let a = jitter_offset_bps("evt_1", 7, 2, 2_000);
        assert_eq!(a, jitter_offset_bps(" evt_1 ", 7, 2, 2_000));
        assert!((-2_000..=2_000).contains(&a));
        assert_eq!(jitter_offset_bps("evt_1", 7, 2, 0), 0);

        let initial = Duration::from_secs(10);
        let max = Duration::from_secs(300);
        let jittered = retry_backoff_with_jitter("evt_1", 7, 2, initial, max, 2_000);
        assert!(jittered >= Duration::from_secs(16) && jittered <= Duration::from_secs(24));
        assert_eq!(
            retry_backoff_with_jitter("evt_1", 7, 2, initial, max, 0),
            Duration::from_secs(20)
        );
        assert!(retry_backoff_with_jitter("evt_1", 7, 9, initial, max, 10_000) <= max);
    }

    #[test]
    fn fnv_matches_reference_vector() {
        assert_eq!(fnv1a32(b""), 0x811c_9dc5);
        assert_eq!(fnv1a32(b"a"), 0xe40c_292c);
    }

    #[test]
    fn retry_budget_caps_attempts() {
        assert_eq!(effective_max_attempts(8, 0), 8);
        assert_eq!(effective_max_attempts(8, 2), 3);
        assert_eq!(effective_max_attempts(3, 10), 3);
    }

    #[test]
    fn error_messages() {
        assert_eq!(status_error_message(500, b""), "webhook endpoint returned status 500");
        assert_eq!(
            status_error_message(422, b" nope "),
            "webhook endpoint returned status 422: nope"
        );
        let long = "é".repeat(800);
        assert!(truncate_preview(long.as_bytes()).len() <= MAX_BODY_PREVIEW_BYTES);
        assert_eq!(manual_cancel_reason(None), "manual_cancelled");
        assert_eq!(manual_cancel_reason(Some(" dup ")), "manual_cancelled: dup");
        let err = AppError::internal("webhook_send_failed", "");
        assert_eq!(send_error_message(&err), "webhook_send_failed");
    }
}
