use std::time::Instant;

use actix_web::http::header;
use actix_web::{web, HttpRequest, HttpResponse};
use chaintx::payment_requests::{DEFAULT_HTTP_METHOD, DEFAULT_HTTP_PATH};
use chaintx::{AppError, CreatePaymentRequestCommand, ErrorKind, IdempotencyScope};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::auth::principal_id;
use crate::error::ApiError;
use crate::metrics;
use crate::state::AppState;

pub const HEADER_IDEMPOTENCY_KEY: &str = "Idempotency-Key";
pub const HEADER_IDEMPOTENCY_REPLAYED: &str = "X-Idempotency-Replayed";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreatePaymentRequestBody {
    pub chain: String,
    pub network: String,
    pub asset: String,
    #[serde(default)]
    pub webhook_url: String,
    #[serde(default)]
    pub expected_amount_minor: Option<String>,
    #[serde(default)]
    pub expires_in_seconds: Option<i64>,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
}

fn parse_body(body: &[u8]) -> Result<CreatePaymentRequestBody, ApiError> {
    let parsed: CreatePaymentRequestBody = serde_json::from_slice(body).map_err(|e| {
        ApiError::App(
            AppError::validation("invalid_request", "request body must be valid JSON")
                .with("error", e.to_string()),
        )
    })?;
    if parsed.webhook_url.trim().is_empty() {
        return Err(ApiError::App(
            AppError::validation("invalid_request", "webhook_url is required")
                .with("field", "webhook_url"),
        ));
    }
    Ok(parsed)
}

fn header_value(req: &HttpRequest, name: &str) -> String {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .unwrap_or_default()
}

/// POST /v1/payment-requests
pub async fn create_payment_request(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Bytes,
) -> Result<HttpResponse, ApiError> {
    let started = Instant::now();
    let result = create(&req, &state, &body).await;
    let label = match &result {
        Ok((_, true)) => "replayed",
        Ok((_, false)) => "created",
        Err(_) => "rejected",
    };
    metrics::PAYMENT_REQUESTS.with_label_values(&[label]).inc();
    metrics::CREATE_LATENCY
        .with_label_values(&[label])
        .observe(started.elapsed().as_secs_f64());
    result.map(|(response, _)| response)
}

async fn create(
    req: &HttpRequest,
    state: &AppState,
    body: &[u8],
) -> Result<(HttpResponse, bool), ApiError> {
    let payload = parse_body(body)?;
    let command = CreatePaymentRequestCommand {
        idempotency_scope: IdempotencyScope {
            principal_id: principal_id(req),
            http_method: DEFAULT_HTTP_METHOD.to_string(),
            http_path: DEFAULT_HTTP_PATH.to_string(),
        },
        idempotency_key: header_value(req, HEADER_IDEMPOTENCY_KEY),
        chain: payload.chain,
        network: payload.network,
        asset: payload.asset,
        webhook_url: payload.webhook_url,
        expected_amount_minor: payload.expected_amount_minor,
        expires_in_seconds: payload.expires_in_seconds,
        metadata: payload.metadata,
    };

    let output = state.payment_requests.create(&command).await.map_err(|e| {
        if e.kind != ErrorKind::Internal {
            tracing::info!(code = %e.code, "payment request rejected: {}", e.message);
        }
        ApiError::App(e)
    })?;

    let mut response = if output.replayed {
        HttpResponse::Ok()
    } else {
        HttpResponse::Created()
    };
    response.insert_header((
        header::LOCATION,
        format!("{DEFAULT_HTTP_PATH}/{}", output.resource.id),
    ));
    if output.replayed {
        response.insert_header((HEADER_IDEMPOTENCY_REPLAYED, "true"));
    }
    let response = response
        .content_type("application/json")
        .body(output.response_body);
    Ok((response, output.replayed))
}

/// GET /v1/payment-requests/{id}
pub async fn get_payment_request(
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let resource = state.payment_requests.get(&path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(resource))
}

/// GET /v1/assets
pub async fn list_assets(state: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    Ok(HttpResponse::Ok().json(state.payment_requests.list_assets().await?))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/v1/payment-requests", web::post().to(create_payment_request))
        .route("/v1/payment-requests/{id}", web::get().to(get_payment_request))
        .route("/v1/assets", web::get().to(list_assets));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_fields_are_rejected() {
        let err = parse_body(
            br#"{"chain":"bitcoin","network":"regtest","asset":"BTC","webhook_url":"https://h","extra":1}"#,
        )
        .unwrap_err();
        let ApiError::App(e) = err else {
            panic!("expected app error")
        };
        assert_eq!(e.code, "invalid_request");
        assert!(e.metadata["error"].as_str().unwrap().contains("extra"));
    }

    #[test]
    fn webhook_url_is_required() {
        let err = parse_body(br#"{"chain":"bitcoin","network":"regtest","asset":"BTC"}"#)
            .unwrap_err();
        let ApiError::App(e) = err else {
            panic!("expected app error")
        };
        assert_eq!(e.metadata["field"], "webhook_url");
    }

    #[test]
    fn optional_fields_parse() {
        let body = parse_body(
            br#"{"chain":"ethereum","network":"sepolia","asset":"ETH","webhook_url":"https://h",
                "expected_amount_minor":"10","expires_in_seconds":600,"metadata":{"order":"o-1"}}"#,
        )
        .unwrap();
        assert_eq!(body.expected_amount_minor.as_deref(), Some("10"));
        assert_eq!(body.expires_in_seconds, Some(600));
        assert_eq!(body.metadata.unwrap()["order"], "o-1");
    }
}
