//! Signed HTTP delivery of outbox events.
//!
//! The stored payload bytes are posted unchanged. Receivers verify
//! `X-ChainTx-Signature` (HMAC-SHA256 over `timestamp.body`) or the v1
//! signature, which also binds the nonce, event id and event type.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chaintx::hmac::{webhook_signature, webhook_signature_v1};
use chaintx::outbox::MAX_BODY_PREVIEW_BYTES;
use chaintx::ports::WebhookEventGateway;
use chaintx::{AppError, AppResult, Clock, SendWebhookEventInput, SendWebhookEventOutput};

pub const HEADER_EVENT_ID: &str = "X-ChainTx-Event-Id";
pub const HEADER_EVENT_TYPE: &str = "X-ChainTx-Event-Type";
pub const HEADER_DELIVERY_ATTEMPT: &str = "X-ChainTx-Delivery-Attempt";
pub const HEADER_TIMESTAMP: &str = "X-ChainTx-Timestamp";
pub const HEADER_NONCE: &str = "X-ChainTx-Nonce";
pub const HEADER_SIGNATURE: &str = "X-ChainTx-Signature";
pub const HEADER_SIGNATURE_VERSION: &str = "X-ChainTx-Signature-Version";
pub const HEADER_SIGNATURE_V1: &str = "X-ChainTx-Signature-V1";
pub const HEADER_IDEMPOTENCY_KEY: &str = "Idempotency-Key";

pub const SIGNATURE_VERSION: &str = "v1";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Client for outbound calls: bounded timeout, redirects never followed.
pub fn http_client(timeout: Duration) -> AppResult<reqwest::Client> {
    let timeout = if timeout.is_zero() {
        DEFAULT_TIMEOUT
    } else {
        timeout
    };
    reqwest::Client::builder()
        .timeout(timeout)
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| {
            AppError::internal("http_client_build_failed", "failed to build HTTP client")
                .with("error", e.to_string())
        })
}

fn new_nonce() -> String {
    let bytes: [u8; 16] = rand::random();
    hex::encode(bytes)
}

pub struct HttpWebhookGateway {
    client: reqwest::Client,
    secret: Vec<u8>,
    clock: Arc<dyn Clock>,
}

impl HttpWebhookGateway {
    pub fn new(client: reqwest::Client, secret: &str, clock: Arc<dyn Clock>) -> Self {
        Self {
            client,
            secret: secret.as_bytes().to_vec(),
            clock,
        }
    }
}

impl std::fmt::Debug for HttpWebhookGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpWebhookGateway")
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

#[async_trait]
impl WebhookEventGateway for HttpWebhookGateway {
    async fn send(&self, input: &SendWebhookEventInput) -> AppResult<SendWebhookEventOutput> {
        let url = input.destination_url.trim();
        if url.is_empty() {
            return Err(AppError::validation(
                "webhook_destination_missing",
                "webhook destination url is required",
            ));
        }
        let timestamp = self.clock.now_utc().timestamp();
        let nonce = new_nonce();
        let signature = webhook_signature(&self.secret, timestamp, &input.payload);
        let signature_v1 = webhook_signature_v1(
            &self.secret,
            timestamp,
            &nonce,
            &input.event_id,
            &input.event_type,
            &input.payload,
        );

        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .header(HEADER_EVENT_ID, input.event_id.as_str())
            .header(HEADER_IDEMPOTENCY_KEY, input.event_id.as_str())
            .header(HEADER_EVENT_TYPE, input.event_type.as_str())
            .header(HEADER_DELIVERY_ATTEMPT, input.delivery_attempt.to_string())
            .header(HEADER_TIMESTAMP, timestamp.to_string())
            .header(HEADER_NONCE, nonce.as_str())
            .header(HEADER_SIGNATURE, signature)
            .header(HEADER_SIGNATURE_VERSION, SIGNATURE_VERSION)
            .header(HEADER_SIGNATURE_V1, signature_v1)
            .body(input.payload.clone())
            .send()
            .await
            .map_err(|e| {
                let reason = if e.is_timeout() {
                    "webhook request timed out"
                } else {
                    "webhook request failed"
                };
                tracing::debug!(event_id = %input.event_id, error = %e, "{reason}");
                AppError::internal("webhook_send_failed", format!("{reason}: {e}"))
                    .with("event_id", input.event_id.clone())
            })?;

        let status_code = response.status().as_u16();
        let body_preview = if response.status().is_success() {
            Vec::new()
        } else {
            let mut body = response.bytes().await.map(|b| b.to_vec()).unwrap_or_default();
            body.truncate(MAX_BODY_PREVIEW_BYTES);
            body
        };
        tracing::debug!(event_id = %input.event_id, status_code, "webhook response received");
        Ok(SendWebhookEventOutput {
            status_code,
            body_preview,
        })
    }
}
