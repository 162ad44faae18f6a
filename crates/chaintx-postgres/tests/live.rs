//! Runs against a real database when `CHAINTX_TEST_DATABASE_URL` is set;
//! otherwise every test returns early.

use std::collections::BTreeMap;
use std::sync::Arc;

use chaintx::ports::*;
use chaintx::wallet::DevtestAllocator;
use chaintx::*;
use chaintx_postgres::{OutboxSettings, PgStore};
use chrono::{Duration, Utc};

const REGTEST_TPUB: &str = "tpubDC2pzLGKv5DoHtRoYjJsbgESSzFqc3mtPzahMMqhH89bqqHot28MFUHkUECJrBGFb2KPQZUrApq4Ti6Y69S2K3snrsT8E5Zjt1GqTMj7xn5";
const REGTEST_INDEX0: &str = "bcrt1q7xfwy8t0z9xar2klctmdgm96kxvg9k8jn30qfg";

async fn store() -> Option<PgStore> {
    let url = std::env::var("CHAINTX_TEST_DATABASE_URL").ok()?;
    let store = PgStore::connect_lazy(&url)
        .unwrap()
        .with_outbox(OutboxSettings {
            enabled: true,
            max_attempts: 3,
        });
    store.check_readiness().await.unwrap();
    store.run_migrations().await.unwrap();
    Some(store)
}

/// Binds `bitcoin/regtest/BTC` to a fresh wallet under a run-unique keyset.
async fn seed(store: &PgStore) -> String {
    let keyset_id = format!("ks_{}", Utc::now().timestamp_micros());
    let wallet_id = format!("wa_{keyset_id}");
    sqlx::query(
        "INSERT INTO app.wallet_accounts (id, chain, network, keyset_id) \
         VALUES ($1, 'bitcoin', 'regtest', $2)",
    )
    .bind(&wallet_id)
    .bind(&keyset_id)
    .execute(store.pool())
    .await
    .unwrap();
    sqlx::query(
        "INSERT INTO app.asset_catalog (chain, network, asset, minor_unit, decimals, \
         address_scheme, default_expires_in_seconds, wallet_account_id) \
         VALUES ('bitcoin', 'regtest', 'BTC', 'sat', 8, 'bip84_p2wpkh', 3600, $1) \
         ON CONFLICT (chain, network, asset) DO UPDATE SET wallet_account_id = $1, enabled = TRUE",
    )
    .bind(&wallet_id)
    .execute(store.pool())
    .await
    .unwrap();
    keyset_id
}

fn service(store: &Arc<PgStore>, keyset_id: &str) -> PaymentRequestService {
    let keysets = BTreeMap::from([(keyset_id.to_string(), REGTEST_TPUB.to_string())]);
    PaymentRequestService::new(
        store.clone(),
        store.clone(),
        store.clone(),
        Arc::new(WalletAllocator::Devtest(DevtestAllocator::new(false, &keysets))),
        Arc::new(SystemClock),
        vec!["hooks.example.com".into()],
    )
}

fn create_command(principal: &str, key: &str) -> CreatePaymentRequestCommand {
    CreatePaymentRequestCommand {
        idempotency_scope: IdempotencyScope {
            principal_id: principal.into(),
            ..Default::default()
        },
        idempotency_key: key.into(),
        chain: "bitcoin".into(),
        network: "regtest".into(),
        asset: "BTC".into(),
        webhook_url: "https://hooks.example.com/pay".into(),
        expected_amount_minor: Some("1000".into()),
        expires_in_seconds: None,
        metadata: None,
    }
}

#[tokio::test]
async fn migrations_are_repeatable() {
    let Some(store) = store().await else { return };
    store.run_migrations().await.unwrap();
    assert!(store.load_catalog_integrity_rows().await.is_ok());
}

#[tokio::test]
async fn create_replays_and_transitions_feed_the_outbox() {
    let Some(store) = store().await else { return };
    let keyset_id = seed(&store).await;
    let store = Arc::new(store);
    let service = service(&store, &keyset_id);
    let principal = format!("merchant-{keyset_id}");

    let first = service.create(&create_command(&principal, "k1")).await.unwrap();
    assert!(!first.replayed);
    assert_eq!(first.resource.payment_instructions.derivation_index, 0);
    assert_eq!(first.resource.payment_instructions.address, REGTEST_INDEX0);

    let replay = service.create(&create_command(&principal, "k1")).await.unwrap();
    assert!(replay.replayed);
    assert_eq!(replay.response_body, first.response_body);

    let mut changed = create_command(&principal, "k1");
    changed.expected_amount_minor = Some("2000".into());
    let err = service.create(&changed).await.unwrap_err();
    assert_eq!(err.code, "idempotency_key_conflict");

    let second = service.create(&create_command(&principal, "k2")).await.unwrap();
    assert_eq!(second.resource.payment_instructions.derivation_index, 1);

    let now = Utc::now();
    let moved = store
        .transition_status_if_current(&TransitionStatusCommand {
            id: first.resource.id.clone(),
            current_status: PaymentRequestStatus::Pending,
            next_status: PaymentRequestStatus::Detected,
            lease_owner: "live-test".into(),
            updated_at: now,
            metadata: ReconcileTransitionMetadata {
                observed_amount_minor: "1000".into(),
                observation_source: "test".into(),
                observation_details: Default::default(),
                transition_reason: String::new(),
                updated_at: now,
            },
        })
        .await
        .unwrap();
    assert!(moved);

    let stored = store.get_by_id(&first.resource.id).await.unwrap().unwrap();
    assert_eq!(stored.status, PaymentRequestStatus::Detected);

    let claimed = store
        .claim_pending_for_dispatch(now + Duration::seconds(1), 100, "live-test", now + Duration::minutes(1))
        .await
        .unwrap();
    let event = claimed
        .iter()
        .find(|e| String::from_utf8_lossy(&e.payload).contains(&first.resource.id))
        .expect("status change event claimed");
    assert_eq!(event.max_attempts, 3);
    assert!(!store
        .mark_delivered(event.id, "live-test-other", now + Duration::seconds(2))
        .await
        .unwrap());
    assert!(store
        .mark_delivered(event.id, "live-test", now + Duration::seconds(2))
        .await
        .unwrap());
    assert!(!store
        .mark_delivered(event.id, "live-test", now + Duration::seconds(3))
        .await
        .unwrap());

    let cancel = store
        .cancel_by_event_id(&event.event_id, "manual_cancelled: too late", now)
        .await
        .unwrap();
    assert!(cancel.found);
    assert!(!cancel.updated);
    assert_eq!(cancel.current_status, Some(DeliveryStatus::Delivered));
}
