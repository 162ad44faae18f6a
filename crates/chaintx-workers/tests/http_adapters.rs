//! Adapters exercised against local actix servers standing in for the
//! merchant endpoint, an Esplora API and an EVM JSON-RPC node.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};
use chrono::{Duration, TimeZone, Utc};
use serde_json::{json, Value};

use chaintx::hmac::{verify_webhook_signature, webhook_signature_v1};
use chaintx::ports::{ChainObserverGateway, WebhookEventGateway};
use chaintx::threshold::ThresholdPolicy;
use chaintx::*;
use chaintx_workers::observers::{EsploraObserver, EvmObserver};
use chaintx_workers::webhook::*;
use chaintx_workers::ObserverRouter;

const SECRET: &str = "whsec_test";

#[derive(Debug, Clone)]
struct Captured {
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Captured {
    fn header(&self, name: &str) -> &str {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .unwrap_or_default()
    }
}

#[derive(Clone, Default)]
struct Receiver {
    captured: Arc<Mutex<Vec<Captured>>>,
    status: Arc<Mutex<u16>>,
}

async fn receive(req: HttpRequest, body: web::Bytes, state: web::Data<Receiver>) -> HttpResponse {
    let headers = req
        .headers()
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
        .collect();
    state.captured.lock().unwrap().push(Captured {
        headers,
        body: body.to_vec(),
    });
    let status = *state.status.lock().unwrap();
    let code = actix_web::http::StatusCode::from_u16(status).unwrap();
    if code.is_success() {
        HttpResponse::build(code).finish()
    } else {
        HttpResponse::build(code).body("receiver is unhappy")
    }
}

fn start_receiver(status: u16) -> (SocketAddr, Receiver) {
    let state = Receiver::default();
    *state.status.lock().unwrap() = status;
    let data = web::Data::new(state.clone());
    let server = HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .route("/hook", web::post().to(receive))
    })
    .workers(1)
    .bind(("127.0.0.1", 0))
    .unwrap();
    let addr = server.addrs()[0];
    actix_rt::spawn(server.run());
    (addr, state)
}

fn t0() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap()
}

fn gateway(clock: Arc<FixedClock>) -> HttpWebhookGateway {
    HttpWebhookGateway::new(http_client(DEFAULT_TIMEOUT).unwrap(), SECRET, clock)
}

#[actix_rt::test]
async fn deliveries_carry_verifiable_signatures() {
    let (addr, receiver) = start_receiver(204);
    let clock = Arc::new(FixedClock::new(t0()));
    let payload = br#"{"event_id":"evt_1","status":"confirmed"}"#.to_vec();

    let out = gateway(clock)
        .send(&SendWebhookEventInput {
            event_id: "evt_1".into(),
            event_type: EVENT_TYPE_STATUS_CHANGED.into(),
            delivery_attempt: 3,
            destination_url: format!("http://{addr}/hook"),
            payload: payload.clone(),
        })
        .await
        .unwrap();
    assert_eq!(out.status_code, 204);
    assert!(out.is_success());

    let captured = receiver.captured.lock().unwrap()[0].clone();
    assert_eq!(captured.body, payload);
    assert_eq!(captured.header("content-type"), "application/json");
    assert_eq!(captured.header("x-chaintx-event-id"), "evt_1");
    assert_eq!(captured.header("idempotency-key"), "evt_1");
    assert_eq!(captured.header("x-chaintx-delivery-attempt"), "3");
    assert_eq!(captured.header("x-chaintx-signature-version"), "v1");

    let ts: i64 = captured.header("x-chaintx-timestamp").parse().unwrap();
    assert_eq!(ts, t0().timestamp());
    assert!(verify_webhook_signature(
        SECRET.as_bytes(),
        ts,
        &captured.body,
        captured.header("x-chaintx-signature"),
    ));

    let nonce = captured.header("x-chaintx-nonce");
    assert_eq!(nonce.len(), 32);
    let expected_v1 = webhook_signature_v1(
        SECRET.as_bytes(),
        ts,
        nonce,
        "evt_1",
        EVENT_TYPE_STATUS_CHANGED,
        &captured.body,
    );
    assert_eq!(captured.header("x-chaintx-signature-v1"), expected_v1);
}

#[actix_rt::test]
async fn failed_delivery_is_retried_with_body_preview() {
    let (addr, receiver) = start_receiver(503);
    let clock = Arc::new(FixedClock::new(t0()));
    let store = Arc::new(InMemoryStore::new().with_outbox(true, 5));
    store.insert_outbox_event(WebhookOutboxEvent {
        id: 0,
        event_id: "evt_retry".into(),
        event_type: EVENT_TYPE_STATUS_CHANGED.into(),
        payment_request_id: "pr_1".into(),
        destination_url: format!("http://{addr}/hook"),
        payload: b"{}".to_vec(),
        delivery_status: DeliveryStatus::Pending,
        attempts: 0,
        max_attempts: 5,
        next_attempt_at: t0(),
        last_error: None,
        lease_owner: None,
        lease_until: None,
        delivered_at: None,
        created_at: t0(),
        updated_at: t0(),
    });

    let dispatcher = Dispatcher::new(store.clone(), Arc::new(gateway(clock.clone())), clock);
    let out = dispatcher
        .run_cycle(&DispatchWebhookEventsCommand {
            now: t0(),
            batch_size: 10,
            worker_id: "dispatcher-1".into(),
            lease_duration: Duration::seconds(30),
            initial_backoff: Duration::seconds(5),
            max_backoff: Duration::seconds(300),
            retry_jitter_bps: 0,
            retry_budget: 0,
        })
        .await
        .unwrap();
    assert_eq!(out.claimed, 1);
    assert_eq!(out.retried, 1);
    assert_eq!(receiver.captured.lock().unwrap().len(), 1);

    let row = store.outbox_event("evt_retry").unwrap();
    assert_eq!(row.delivery_status, DeliveryStatus::Pending);
    assert_eq!(row.attempts, 1);
    assert_eq!(row.next_attempt_at, t0() + Duration::seconds(5));
    assert_eq!(
        row.last_error.as_deref(),
        Some("webhook endpoint returned status 503: receiver is unhappy")
    );
    assert!(row.lease_owner.is_none());
}

#[actix_rt::test]
async fn unreachable_endpoint_is_a_send_error() {
    let clock = Arc::new(FixedClock::new(t0()));
    let err = gateway(clock)
        .send(&SendWebhookEventInput {
            event_id: "evt_x".into(),
            event_type: EVENT_TYPE_STATUS_CHANGED.into(),
            delivery_attempt: 1,
            destination_url: "http://127.0.0.1:9/hook".into(),
            payload: b"{}".to_vec(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code, "webhook_send_failed");
    assert!(err.message.starts_with("webhook request"));
}

// Esplora

fn start_esplora() -> SocketAddr {
    let server = HttpServer::new(|| {
        App::new()
            .route(
                "/address/{addr}",
                web::get().to(|| async {
                    HttpResponse::Ok().json(json!({
                        "chain_stats": {"funded_txo_sum": 1500},
                        "mempool_stats": {"funded_txo_sum": 500}
                    }))
                }),
            )
            .route(
                "/address/{addr}/utxo",
                web::get().to(|| async {
                    HttpResponse::Ok().json(json!([
                        {"txid": "aa", "vout": 0, "value": 1000,
                         "status": {"confirmed": true, "block_height": 95}},
                        {"txid": "bb", "vout": 0, "value": 500,
                         "status": {"confirmed": true, "block_height": 100}},
                        {"txid": "cc", "vout": 1, "value": 500,
                         "status": {"confirmed": false}}
                    ]))
                }),
            )
            .route(
                "/blocks/tip/height",
                web::get().to(|| async { HttpResponse::Ok().body("100") }),
            )
    })
    .workers(1)
    .bind(("127.0.0.1", 0))
    .unwrap();
    let addr = server.addrs()[0];
    actix_rt::spawn(server.run());
    addr
}

fn btc_input(expected: &str) -> ObservePaymentRequestInput {
    ObservePaymentRequestInput {
        request_id: "pr_btc".into(),
        chain: "bitcoin".into(),
        network: "regtest".into(),
        asset: "BTC".into(),
        expected_amount_minor: Some(expected.into()),
        address_canonical: "bcrt1q7xfwy8t0z9xar2klctmdgm96kxvg9k8jn30qfg".into(),
        chain_id: None,
        token_standard: None,
        token_contract: None,
        token_decimals: None,
    }
}

#[actix_rt::test]
async fn esplora_counts_only_deep_enough_utxos_as_confirmed() {
    let addr = start_esplora();
    let client = http_client(DEFAULT_TIMEOUT).unwrap();
    let observer = EsploraObserver::new(
        client,
        &format!("http://{addr}/"),
        3,
        ThresholdPolicy::new(10_000, 10_000),
    );
    let router = ObserverRouter::new(Some(observer), None);

    let out = router.observe(&btc_input("1500")).await.unwrap();
    assert!(out.supported);
    assert_eq!(out.source, "btc_esplora");
    assert_eq!(out.observed_amount_minor, "2000");
    assert!(out.detected);
    assert!(!out.confirmed);
    assert_eq!(out.details["confirmed_observed_minor"], json!("1000"));
    assert_eq!(out.details["latest_block_height"], json!(100));
    assert_eq!(out.details["min_confirmations"], json!(3));
    assert_eq!(out.details["required_confirmed_minor"], json!("1500"));

    let out = router.observe(&btc_input("1000")).await.unwrap();
    assert!(out.confirmed);
    assert!(!out.detected);
}

#[actix_rt::test]
async fn esplora_outage_is_a_chain_observation_failure() {
    let observer = EsploraObserver::new(
        http_client(DEFAULT_TIMEOUT).unwrap(),
        "http://127.0.0.1:9",
        1,
        ThresholdPolicy::new(0, 0),
    );
    let err = observer
        .observe(&btc_input("1"), alloy::primitives::U512::from(1u8))
        .await
        .unwrap_err();
    assert_eq!(err.code, "chain_observation_failed");
    assert_eq!(err.metadata["network"], json!("regtest"));
}

// EVM JSON-RPC

async fn rpc(body: web::Json<Value>) -> HttpResponse {
    let id = body["id"].clone();
    let params = &body["params"];
    let result = match body["method"].as_str().unwrap_or_default() {
        "eth_blockNumber" => json!("0x64"),
        "eth_getBalance" => match params[1].as_str() {
            Some("0x64") => json!("0x7d0"),
            _ => json!("0x3e8"),
        },
        "eth_call" => {
            let data = params[0]["data"].as_str().unwrap_or_default();
            if !data.starts_with("0x70a08231000000000000000000000000") {
                return HttpResponse::Ok().json(json!({
                    "jsonrpc": "2.0", "id": id,
                    "error": {"code": -32000, "message": "execution reverted"}
                }));
            }
            json!(format!("0x{:064x}", 5_000_000u64))
        }
        _ => Value::Null,
    };
    HttpResponse::Ok().json(json!({"jsonrpc": "2.0", "id": id, "result": result}))
}

fn start_rpc() -> SocketAddr {
    let server = HttpServer::new(|| App::new().route("/", web::post().to(rpc)))
        .workers(1)
        .bind(("127.0.0.1", 0))
        .unwrap();
    let addr = server.addrs()[0];
    actix_rt::spawn(server.run());
    addr
}

fn evm_input(expected: &str, token_contract: Option<&str>) -> ObservePaymentRequestInput {
    ObservePaymentRequestInput {
        request_id: "pr_evm".into(),
        chain: "ethereum".into(),
        network: "sepolia".into(),
        asset: if token_contract.is_some() { "USDT" } else { "ETH" }.into(),
        expected_amount_minor: Some(expected.into()),
        address_canonical: "0x61ed32e69db70c5abab0522d80e8f5db215965de".into(),
        chain_id: Some(11_155_111),
        token_standard: token_contract.map(|_| "erc20".to_string()),
        token_contract: token_contract.map(str::to_string),
        token_decimals: token_contract.map(|_| 6),
    }
}

fn evm_router(addr: SocketAddr, min_confirmations: i64) -> ObserverRouter {
    let urls = [("sepolia".to_string(), format!("http://{addr}/"))].into();
    let evm = EvmObserver::new(
        http_client(DEFAULT_TIMEOUT).unwrap(),
        &urls,
        min_confirmations,
        ThresholdPolicy::new(10_000, 10_000),
    );
    ObserverRouter::new(None, Some(evm))
}

#[actix_rt::test]
async fn native_balance_confirms_at_depth() {
    let addr = start_rpc();

    let out = evm_router(addr, 6).observe(&evm_input("2000", None)).await.unwrap();
    assert_eq!(out.source, "evm_rpc");
    assert_eq!(out.observed_amount_minor, "2000");
    assert_eq!(out.details["confirmed_observed_minor"], json!("1000"));
    assert!(out.detected);
    assert!(!out.confirmed);

    let out = evm_router(addr, 1).observe(&evm_input("2000", None)).await.unwrap();
    assert!(out.confirmed);
}

#[actix_rt::test]
async fn erc20_balance_uses_balance_of() {
    let addr = start_rpc();
    let out = evm_router(addr, 1)
        .observe(&evm_input(
            "5000000",
            Some("0xdac17f958d2ee523a2206206994597c13d831ec7"),
        ))
        .await
        .unwrap();
    assert!(out.supported);
    assert!(out.confirmed);
    assert_eq!(out.observed_amount_minor, "5000000");

    let mut token_without_contract = evm_input("1", None);
    token_without_contract.token_standard = Some("erc20".into());
    let out = evm_router(addr, 1).observe(&token_without_contract).await.unwrap();
    assert!(!out.supported);
}
